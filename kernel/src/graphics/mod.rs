//! Framebuffer contract.
//!
//! The kernel does not draw: it records the bootloader's framebuffer
//! geometry, resolves its physical base so `fb_map` can hand the pixels to
//! userland (write-combining), and keeps the console cell metrics that
//! `term_size`/`term_scale` report for non-redirected processes.

use spin::Mutex;

/// Console font cell geometry at scale 1.
const FONT_CELL_W: u64 = 8;
const FONT_CELL_H: u64 = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct Framebuffer {
    pub width: u64,
    pub height: u64,
    /// Bytes per scanline.
    pub pitch: u64,
    pub bpp: u64,
    pub phys_base: u64,
}

#[derive(Debug, Clone, Copy)]
struct ConsoleMetrics {
    scale_x: u64,
    scale_y: u64,
}

static FRAMEBUFFER: Mutex<Option<Framebuffer>> = Mutex::new(None);
static CONSOLE: Mutex<ConsoleMetrics> = Mutex::new(ConsoleMetrics {
    scale_x: 1,
    scale_y: 1,
});

/// Record the framebuffer handed over by the bootloader.
pub fn init(fb: Framebuffer) {
    log::info!(target: "graphics",
        "framebuffer {}x{} pitch={} bpp={} phys={:#x}",
        fb.width, fb.height, fb.pitch, fb.bpp, fb.phys_base);
    *FRAMEBUFFER.lock() = Some(fb);
}

pub fn framebuffer() -> Option<Framebuffer> {
    *FRAMEBUFFER.lock()
}

/// Console (rows, cols) at the current font scale.
pub fn console_dimensions() -> (u64, u64) {
    let fb = framebuffer().unwrap_or_default();
    let m = *CONSOLE.lock();
    let cols = fb.width / (FONT_CELL_W * m.scale_x.max(1));
    let rows = fb.height / (FONT_CELL_H * m.scale_y.max(1));
    (rows, cols)
}

pub fn font_scale() -> (u64, u64) {
    let m = *CONSOLE.lock();
    (m.scale_x, m.scale_y)
}

pub fn set_font_scale(scale_x: u64, scale_y: u64) {
    let mut m = CONSOLE.lock();
    m.scale_x = scale_x.max(1);
    m.scale_y = scale_y.max(1);
}
