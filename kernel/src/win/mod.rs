//! Kernel-resident window server.
//!
//! Eight fixed slots. A window owns a run of physical pixel pages (32 bpp
//! BGRA) mapped into its creator from creation; the compositor process may
//! additionally map the same pages into its own space (at most one such
//! mapping per window). Events flow compositor → owner through a small
//! per-window circular queue that drops on overflow.

extern crate alloc;

use alloc::vec::Vec;

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::{frame_allocator, page_table, pages_for, FRAME_SIZE},
    syscall::abi::{copy_cstr, WinEvent, WinInfo, WIN_EVENT_SCALE},
};

pub const MAX_WINDOWS: usize = 8;
pub const MAX_EVENTS: usize = 64;
/// Upper bound on pixel pages per window (2048 × 1024 @ 32 bpp = 8 MiB).
pub const MAX_PIXEL_PAGES: usize = 2048;

/// Fixed-capacity event queue; overflow drops the incoming event.
#[derive(Debug, Clone)]
pub struct EventQueue {
    events: [WinEvent; MAX_EVENTS],
    head: usize,
    tail: usize,
}

impl EventQueue {
    const fn new() -> Self {
        Self {
            events: [WinEvent {
                kind: 0,
                a: 0,
                b: 0,
                c: 0,
            }; MAX_EVENTS],
            head: 0,
            tail: 0,
        }
    }

    pub fn push(&mut self, event: WinEvent) -> bool {
        let next_head = (self.head + 1) % MAX_EVENTS;
        if next_head == self.tail {
            return false; // full: drop
        }
        self.events[self.head] = event;
        self.head = next_head;
        true
    }

    pub fn pop(&mut self) -> Option<WinEvent> {
        if self.head == self.tail {
            return None;
        }
        let ev = self.events[self.tail];
        self.tail = (self.tail + 1) % MAX_EVENTS;
        Some(ev)
    }
}

struct WindowSlot {
    used: bool,
    owner_pid: i32,
    title: [u8; 64],
    width: i32,
    height: i32,
    pixel_pages: Vec<u64>,
    /// VA of the pixel run in the owner's space.
    owner_va: u64,
    /// VA in the compositor's space; 0 = not mapped.
    desktop_va: u64,
    /// Pid that performed the compositor mapping.
    desktop_pid: i32,
    events: EventQueue,
    dirty: bool,
}

impl WindowSlot {
    const fn empty() -> Self {
        Self {
            used: false,
            owner_pid: -1,
            title: [0; 64],
            width: 0,
            height: 0,
            pixel_pages: Vec::new(),
            owner_va: 0,
            desktop_va: 0,
            desktop_pid: 0,
            events: EventQueue::new(),
            dirty: false,
        }
    }
}

struct WindowServer {
    slots: [WindowSlot; MAX_WINDOWS],
    ui_scale: i32,
}

static SERVER: Mutex<WindowServer> = Mutex::new(WindowServer {
    slots: [
        WindowSlot::empty(),
        WindowSlot::empty(),
        WindowSlot::empty(),
        WindowSlot::empty(),
        WindowSlot::empty(),
        WindowSlot::empty(),
        WindowSlot::empty(),
        WindowSlot::empty(),
    ],
    ui_scale: 1,
});

/// Pixel pages needed for a w×h 32 bpp window, or an error for dimensions
/// the server refuses.
pub fn pages_for_dimensions(w: i32, h: i32) -> KernelResult<usize> {
    if w <= 0 || h <= 0 {
        return Err(KernelError::InvalidArgument { name: "dimensions" });
    }
    let pages = pages_for(w as u64 * h as u64 * 4);
    if pages > MAX_PIXEL_PAGES {
        return Err(KernelError::InvalidArgument { name: "dimensions" });
    }
    Ok(pages)
}

/// Allocate a pixel run and map it consecutively into `pml4` at `base_va`.
/// On failure every page allocated so far is released.
fn map_pixel_run(pml4: u64, base_va: u64, pages: usize) -> KernelResult<Vec<u64>> {
    let mut phys_pages = Vec::with_capacity(pages);
    for i in 0..pages {
        let page = match frame_allocator::allocate_zeroed() {
            Ok(p) => p,
            Err(e) => {
                for &p in &phys_pages {
                    frame_allocator::free(p, 1);
                }
                return Err(e);
            }
        };
        if let Err(e) = page_table::map_user(pml4, page, base_va + (i * FRAME_SIZE) as u64) {
            frame_allocator::free(page, 1);
            for &p in &phys_pages {
                frame_allocator::free(p, 1);
            }
            return Err(e);
        }
        phys_pages.push(page);
    }
    Ok(phys_pages)
}

/// Create a window for `owner_pid`, mapping the pixel buffer into the
/// owner's space at its heap bump. Returns (window id, pixel VA, bytes the
/// owner's heap bump advanced).
pub fn create(
    owner_pid: i32,
    owner_pml4: u64,
    title: &str,
    w: i32,
    h: i32,
    heap_next: u64,
) -> KernelResult<(i32, u64, u64)> {
    let pages = pages_for_dimensions(w, h)?;

    let mut server = SERVER.lock();
    let idx = server
        .slots
        .iter()
        .position(|s| !s.used)
        .ok_or(KernelError::NoFreeSlot { resource: "window" })?;

    let phys_pages = map_pixel_run(owner_pml4, heap_next, pages)?;

    let slot = &mut server.slots[idx];
    *slot = WindowSlot::empty();
    slot.used = true;
    slot.owner_pid = owner_pid;
    copy_cstr(&mut slot.title, title);
    slot.width = w;
    slot.height = h;
    slot.pixel_pages = phys_pages;
    slot.owner_va = heap_next;

    log::info!(target: "winserver",
        "created window {} ({}x{}) for pid {}", idx, w, h, owner_pid);
    Ok((idx as i32, heap_next, (pages * FRAME_SIZE) as u64))
}

fn checked_slot(
    server: &mut WindowServer,
    window_id: i32,
    caller_pid: Option<i32>,
) -> KernelResult<&mut WindowSlot> {
    if window_id < 0 || window_id as usize >= MAX_WINDOWS {
        return Err(KernelError::InvalidArgument { name: "window_id" });
    }
    let slot = &mut server.slots[window_id as usize];
    if !slot.used {
        return Err(KernelError::NotFound { resource: "window" });
    }
    if let Some(pid) = caller_pid {
        if slot.owner_pid != pid {
            return Err(KernelError::InvalidArgument { name: "window_id" });
        }
    }
    Ok(slot)
}

/// Owner-only: mark the slot unused. Pixel pages stay with the owner's
/// address space and return to the pool when it exits.
pub fn destroy(window_id: i32, caller_pid: i32) -> KernelResult<()> {
    let mut server = SERVER.lock();
    let slot = checked_slot(&mut server, window_id, Some(caller_pid))?;
    slot.used = false;
    slot.pixel_pages = Vec::new();
    Ok(())
}

/// Owner-only: flag new content for the compositor.
pub fn present(window_id: i32, caller_pid: i32) -> KernelResult<()> {
    let mut server = SERVER.lock();
    let slot = checked_slot(&mut server, window_id, Some(caller_pid))?;
    slot.dirty = true;
    Ok(())
}

/// Owner-only: pop one queued event. Returns None when the queue is empty.
pub fn poll(window_id: i32, caller_pid: i32) -> KernelResult<Option<WinEvent>> {
    let mut server = SERVER.lock();
    let slot = checked_slot(&mut server, window_id, Some(caller_pid))?;
    Ok(slot.events.pop())
}

/// Snapshot all active windows' metadata, atomically clearing dirty bits.
pub fn enumerate(out: &mut [WinInfo]) -> usize {
    let mut server = SERVER.lock();
    let mut count = 0;
    for (i, slot) in server.slots.iter_mut().enumerate() {
        if !slot.used || count >= out.len() {
            continue;
        }
        let info = &mut out[count];
        info.id = i as i32;
        info.owner_pid = slot.owner_pid;
        info.title = slot.title;
        info.width = slot.width;
        info.height = slot.height;
        info.dirty = slot.dirty as i32;
        slot.dirty = false;
        count += 1;
    }
    count
}

/// Compositor call: map the window's pixel pages into `caller_pml4` at the
/// caller's heap bump. Returns (pixel VA, heap advance); the advance is 0
/// when an existing mapping was reused.
pub fn map(
    window_id: i32,
    caller_pid: i32,
    caller_pml4: u64,
    heap_next: u64,
) -> KernelResult<(u64, u64)> {
    let mut server = SERVER.lock();
    let slot = checked_slot(&mut server, window_id, None)?;

    if slot.desktop_pid == caller_pid && slot.desktop_va != 0 {
        return Ok((slot.desktop_va, 0));
    }

    for (i, &page) in slot.pixel_pages.iter().enumerate() {
        page_table::map_user(caller_pml4, page, heap_next + (i * FRAME_SIZE) as u64)?;
    }
    slot.desktop_va = heap_next;
    slot.desktop_pid = caller_pid;
    Ok((heap_next, (slot.pixel_pages.len() * FRAME_SIZE) as u64))
}

/// Compositor call: queue an event for the owner. Full queue drops.
pub fn send_event(window_id: i32, event: WinEvent) -> KernelResult<()> {
    let mut server = SERVER.lock();
    let slot = checked_slot(&mut server, window_id, None)?;
    slot.events.push(event);
    Ok(())
}

/// Owner-only resize: allocates a fresh pixel run at the owner's heap bump
/// and releases the old one. Any compositor mapping is invalidated (the
/// compositor re-maps after its next enumerate). Returns (new VA, heap
/// advance).
pub fn resize(
    window_id: i32,
    caller_pid: i32,
    owner_pml4: u64,
    new_w: i32,
    new_h: i32,
    heap_next: u64,
) -> KernelResult<(u64, u64)> {
    let pages = pages_for_dimensions(new_w, new_h)?;

    let mut server = SERVER.lock();
    let slot = checked_slot(&mut server, window_id, Some(caller_pid))?;
    if new_w == slot.width && new_h == slot.height {
        return Ok((slot.owner_va, 0));
    }

    let new_pages = map_pixel_run(owner_pml4, heap_next, pages)?;

    // Drop the compositor's view of the old pages before they go back to
    // the pool.
    if slot.desktop_va != 0 && slot.desktop_pid != 0 {
        let desktop_pml4 = crate::sched::with_process(slot.desktop_pid, |p| p.pml4_phys);
        if let Some(pml4) = desktop_pml4 {
            for i in 0..slot.pixel_pages.len() {
                page_table::unmap_user(pml4, slot.desktop_va + (i * FRAME_SIZE) as u64);
            }
        }
    }
    for (i, &page) in slot.pixel_pages.iter().enumerate() {
        page_table::unmap_user(owner_pml4, slot.owner_va + (i * FRAME_SIZE) as u64);
        frame_allocator::free(page, 1);
    }

    slot.width = new_w;
    slot.height = new_h;
    slot.pixel_pages = new_pages;
    slot.owner_va = heap_next;
    slot.desktop_va = 0;
    slot.desktop_pid = 0;
    Ok((heap_next, (pages * FRAME_SIZE) as u64))
}

/// Set the global UI scale (clamped to 0..=2) and broadcast a scale event
/// to every active window.
pub fn set_scale(scale: i32) -> i32 {
    let clamped = scale.clamp(0, 2);
    let mut server = SERVER.lock();
    server.ui_scale = clamped;
    let event = WinEvent {
        kind: WIN_EVENT_SCALE,
        a: clamped,
        b: 0,
        c: 0,
    };
    for slot in server.slots.iter_mut().filter(|s| s.used) {
        slot.events.push(event);
    }
    clamped
}

pub fn get_scale() -> i32 {
    SERVER.lock().ui_scale
}

/// Process-death hook. For every window the pid owns: unmap its pixel
/// pages from the compositor (eliminating dangling access) and free the
/// slot; the pages themselves return to the pool via the owner's address-
/// space teardown. Windows the pid had mapped *as* compositor are
/// detached too, so the teardown of its user half cannot free pages still
/// owned by someone else's window.
pub fn cleanup_process(pid: i32) {
    let mut server = SERVER.lock();
    for (i, slot) in server.slots.iter_mut().enumerate() {
        if !slot.used {
            continue;
        }
        if slot.owner_pid == pid {
            if slot.desktop_va != 0 && slot.desktop_pid != 0 {
                let desktop_pml4 = crate::sched::with_process(slot.desktop_pid, |p| p.pml4_phys);
                if let Some(pml4) = desktop_pml4 {
                    for p in 0..slot.pixel_pages.len() {
                        page_table::unmap_user(pml4, slot.desktop_va + (p * FRAME_SIZE) as u64);
                    }
                }
            }
            log::info!(target: "winserver", "cleaned up window {} of dead pid {}", i, pid);
            *slot = WindowSlot::empty();
        } else if slot.desktop_pid == pid {
            // The dying process was the compositor for this window; the
            // owner keeps the pages.
            slot.desktop_va = 0;
            slot.desktop_pid = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_counts_follow_pixel_math() {
        assert_eq!(pages_for_dimensions(200, 150).unwrap(), 30); // 120000 bytes
        assert_eq!(pages_for_dimensions(1, 1).unwrap(), 1);
        assert_eq!(pages_for_dimensions(1024, 1024).unwrap(), 1024);
    }

    #[test]
    fn invalid_dimensions_are_rejected() {
        assert!(pages_for_dimensions(0, 100).is_err());
        assert!(pages_for_dimensions(100, -5).is_err());
        // 2049 * 1024 * 4 bytes needs 2049 pages > MAX_PIXEL_PAGES.
        assert!(pages_for_dimensions(2049, 1024).is_err());
    }

    #[test]
    fn event_queue_is_fifo_and_drops_on_overflow() {
        let mut q = EventQueue::new();
        for i in 0..(MAX_EVENTS as i32 + 10) {
            q.push(WinEvent {
                kind: 1,
                a: i,
                b: 0,
                c: 0,
            });
        }
        // Capacity is MAX_EVENTS - 1 (one slot distinguishes full/empty);
        // everything beyond was dropped, order preserved.
        for i in 0..(MAX_EVENTS as i32 - 1) {
            assert_eq!(q.pop().unwrap().a, i);
        }
        assert!(q.pop().is_none());
    }
}
