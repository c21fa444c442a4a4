//! HID boot keyboard and mouse report processing.
//!
//! The xHCI driver hands each interrupt-IN payload to one of the two
//! processors here, selected by interface protocol. Keyboard reports are
//! diffed against the previous report to synthesize press/release events;
//! mouse reports are decoded through a layout that defaults to the boot
//! protocol and can be refined from the device's report descriptor.

use spin::Mutex;

use crate::{drivers::input, syscall::abi::KeyEvent};

// Modifier bits of byte 0 in a boot keyboard report.
const MOD_LCTRL: u8 = 0x01;
const MOD_LSHIFT: u8 = 0x02;
const MOD_LALT: u8 = 0x04;
const MOD_RCTRL: u8 = 0x10;
const MOD_RSHIFT: u8 = 0x20;
const MOD_RALT: u8 = 0x40;

#[derive(Debug, Clone, Copy, Default)]
struct KeyboardState {
    registered_slot: Option<u8>,
    prev_modifiers: u8,
    prev_keys: [u8; 6],
}

static KEYBOARD: Mutex<KeyboardState> = Mutex::new(KeyboardState {
    registered_slot: None,
    prev_modifiers: 0,
    prev_keys: [0; 6],
});

/// Byte layout of a mouse report. Boot protocol by default; refined by
/// [`parse_mouse_report_descriptor`] for report-protocol devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseLayout {
    pub buttons_byte: usize,
    pub x_byte: usize,
    pub y_byte: usize,
    pub wheel_byte: Option<usize>,
    /// Leading report-ID byte present in every report.
    pub has_report_id: bool,
}

impl MouseLayout {
    pub const BOOT: Self = Self {
        buttons_byte: 0,
        x_byte: 1,
        y_byte: 2,
        wheel_byte: Some(3),
        has_report_id: false,
    };
}

struct MouseState {
    registered_slot: Option<u8>,
    layout: MouseLayout,
}

static MOUSE: Mutex<MouseState> = Mutex::new(MouseState {
    registered_slot: None,
    layout: MouseLayout::BOOT,
});

pub fn register_keyboard(slot: u8) {
    let mut kb = KEYBOARD.lock();
    kb.registered_slot = Some(slot);
    kb.prev_modifiers = 0;
    kb.prev_keys = [0; 6];
}

pub fn register_mouse(slot: u8) {
    MOUSE.lock().registered_slot = Some(slot);
}

/// HID usage id → (unshifted, shifted) ASCII. Zero means no printable
/// mapping (the scancode still goes through).
fn usage_to_ascii(usage: u8) -> (u8, u8) {
    match usage {
        0x04..=0x1D => {
            let c = b'a' + (usage - 0x04);
            (c, c.to_ascii_uppercase())
        }
        0x1E..=0x26 => {
            let digits = b"1234567890";
            let shifted = b"!@#$%^&*()";
            (digits[(usage - 0x1E) as usize], shifted[(usage - 0x1E) as usize])
        }
        0x27 => (b'0', b')'),
        0x28 => (b'\n', b'\n'),
        0x29 => (0x1B, 0x1B), // escape
        0x2A => (0x08, 0x08), // backspace
        0x2B => (b'\t', b'\t'),
        0x2C => (b' ', b' '),
        0x2D => (b'-', b'_'),
        0x2E => (b'=', b'+'),
        0x2F => (b'[', b'{'),
        0x30 => (b']', b'}'),
        0x31 => (b'\\', b'|'),
        0x33 => (b';', b':'),
        0x34 => (b'\'', b'"'),
        0x35 => (b'`', b'~'),
        0x36 => (b',', b'<'),
        0x37 => (b'.', b'>'),
        0x38 => (b'/', b'?'),
        _ => (0, 0),
    }
}

fn key_event(usage: u8, pressed: bool, modifiers: u8) -> KeyEvent {
    let shift = modifiers & (MOD_LSHIFT | MOD_RSHIFT) != 0;
    let (plain, shifted) = usage_to_ascii(usage);
    KeyEvent {
        scancode: usage,
        ascii: if shift { shifted } else { plain },
        pressed: pressed as u8,
        shift: shift as u8,
        ctrl: (modifiers & (MOD_LCTRL | MOD_RCTRL) != 0) as u8,
        alt: (modifiers & (MOD_LALT | MOD_RALT) != 0) as u8,
    }
}

/// Boot keyboard report: [modifiers, reserved, key1..key6]. Diff against
/// the previous report; every newly present usage is a press, every
/// vanished one a release.
pub fn process_keyboard_report(report: &[u8]) {
    if report.len() < 8 {
        return;
    }
    let modifiers = report[0];
    let keys: [u8; 6] = report[2..8].try_into().unwrap_or([0; 6]);

    let (prev_keys, _prev_mods) = {
        let kb = KEYBOARD.lock();
        (kb.prev_keys, kb.prev_modifiers)
    };

    for &usage in keys.iter().filter(|&&u| u != 0) {
        if !prev_keys.contains(&usage) {
            input::push_key(key_event(usage, true, modifiers));
        }
    }
    for &usage in prev_keys.iter().filter(|&&u| u != 0) {
        if !keys.contains(&usage) {
            input::push_key(key_event(usage, false, modifiers));
        }
    }

    let mut kb = KEYBOARD.lock();
    kb.prev_keys = keys;
    kb.prev_modifiers = modifiers;
}

/// Decode one mouse report through the active layout.
pub fn process_mouse_report(report: &[u8]) {
    let layout = MOUSE.lock().layout;
    let base = layout.has_report_id as usize;

    let get = |byte: usize| report.get(base + byte).copied();
    let (Some(buttons), Some(dx), Some(dy)) = (
        get(layout.buttons_byte),
        get(layout.x_byte),
        get(layout.y_byte),
    ) else {
        return;
    };
    let wheel = layout
        .wheel_byte
        .and_then(get)
        .map(|w| w as i8 as i32)
        .unwrap_or(0);

    input::on_mouse_report(
        dx as i8 as i32,
        dy as i8 as i32,
        wheel,
        (buttons & 0x07) as u32,
    );
}

/// Minimal HID report-descriptor walk for report-protocol mice: track the
/// global report size/count and local usages, and assign byte offsets of
/// the button block, X, Y and Wheel fields as Input items are closed.
/// Only 8-bit axis fields are honored; anything stranger keeps the boot
/// layout.
pub fn parse_mouse_report_descriptor(desc: &[u8]) {
    const USAGE_X: u32 = 0x30;
    const USAGE_Y: u32 = 0x31;
    const USAGE_WHEEL: u32 = 0x38;
    const PAGE_BUTTON: u32 = 0x09;

    let mut layout = MouseLayout {
        buttons_byte: 0,
        x_byte: 1,
        y_byte: 2,
        wheel_byte: None,
        has_report_id: false,
    };
    let mut found_any = false;

    let mut bit_offset: usize = 0;
    let mut report_size: u32 = 0;
    let mut report_count: u32 = 0;
    let mut usage_page: u32 = 0;
    let mut usages: [u32; 8] = [0; 8];
    let mut usage_count: usize = 0;

    let mut i = 0;
    while i < desc.len() {
        let prefix = desc[i];
        let size = match prefix & 0x03 {
            3 => 4,
            s => s as usize,
        };
        i += 1;
        if i + size > desc.len() {
            break;
        }
        let mut data: u32 = 0;
        for (j, &b) in desc[i..i + size].iter().enumerate() {
            data |= (b as u32) << (8 * j);
        }
        i += size;

        match prefix & 0xFC {
            0x04 => usage_page = data,       // Usage Page (global)
            0x74 => report_size = data,      // Report Size (global)
            0x94 => report_count = data,     // Report Count (global)
            0x84 => {
                // Report ID (global): every report gains a leading byte.
                layout.has_report_id = true;
            }
            0x08 => {
                // Usage (local)
                if usage_count < usages.len() {
                    usages[usage_count] = data;
                    usage_count += 1;
                }
            }
            0x80 => {
                // Input item: close the pending fields.
                let field_bits = (report_size * report_count) as usize;
                if usage_page == PAGE_BUTTON {
                    layout.buttons_byte = bit_offset / 8;
                    found_any = true;
                } else if report_size == 8 {
                    for (n, &usage) in usages[..usage_count].iter().enumerate() {
                        let byte = bit_offset / 8 + n;
                        match usage {
                            USAGE_X => {
                                layout.x_byte = byte;
                                found_any = true;
                            }
                            USAGE_Y => {
                                layout.y_byte = byte;
                                found_any = true;
                            }
                            USAGE_WHEEL => {
                                layout.wheel_byte = Some(byte);
                                found_any = true;
                            }
                            _ => {}
                        }
                    }
                }
                bit_offset += field_bits;
                usage_count = 0;
            }
            0xC0 => break, // End Collection at the top level is enough
            _ => {
                // Other items (collections, logical min/max) don't move
                // report fields.
                if prefix & 0xFC == 0xA0 {
                    // Collection: locals reset.
                    usage_count = 0;
                }
            }
        }
    }

    if found_any {
        log::info!(target: "usb",
            "mouse layout: buttons@{} x@{} y@{} wheel@{:?} report-id={}",
            layout.buttons_byte, layout.x_byte, layout.y_byte,
            layout.wheel_byte, layout.has_report_id);
        MOUSE.lock().layout = layout;
    }
}

/// Forget registered devices (hot-unplug path).
pub fn unregister_slot(slot: u8) {
    let mut kb = KEYBOARD.lock();
    if kb.registered_slot == Some(slot) {
        kb.registered_slot = None;
    }
    drop(kb);
    let mut mouse = MOUSE.lock();
    if mouse.registered_slot == Some(slot) {
        mouse.registered_slot = None;
        mouse.layout = MouseLayout::BOOT;
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use super::*;
    use crate::drivers::input::testutil;

    fn drain_keys() -> Vec<KeyEvent> {
        let mut out = Vec::new();
        while let Some(ev) = input::pop_key() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn keyboard_reports_diff_into_press_and_release_events() {
        let _guard = testutil::lock();
        register_keyboard(1);
        drain_keys();

        // 'a' down.
        process_keyboard_report(&[0, 0, 0x04, 0, 0, 0, 0, 0]);
        // 'a' still down, 'b' down too.
        process_keyboard_report(&[0, 0, 0x04, 0x05, 0, 0, 0, 0]);
        // Everything released.
        process_keyboard_report(&[0, 0, 0, 0, 0, 0, 0, 0]);

        let events = drain_keys();
        assert_eq!(events.len(), 4);
        assert_eq!((events[0].scancode, events[0].pressed, events[0].ascii), (0x04, 1, b'a'));
        assert_eq!((events[1].scancode, events[1].pressed, events[1].ascii), (0x05, 1, b'b'));
        // Release order follows the previous report's slots.
        assert_eq!(events[2].pressed, 0);
        assert_eq!(events[3].pressed, 0);
    }

    #[test]
    fn shift_produces_shifted_ascii_and_flags() {
        let _guard = testutil::lock();
        register_keyboard(1);
        drain_keys();
        process_keyboard_report(&[MOD_LSHIFT, 0, 0x04, 0, 0, 0, 0, 0]);
        let events = drain_keys();
        assert_eq!(events[0].ascii, b'A');
        assert_eq!(events[0].shift, 1);
        assert_eq!(events[0].ctrl, 0);

        process_keyboard_report(&[MOD_RCTRL, 0, 0x06, 0x04, 0, 0, 0, 0]);
        let events = drain_keys();
        // 'a' was released (it is absent from the new report) and 'c'
        // pressed, both with ctrl set.
        assert!(events.iter().all(|e| e.ctrl == 1));
    }

    #[test]
    fn boot_mouse_reports_decode_with_sign_extension() {
        let _guard = testutil::lock();
        MOUSE.lock().layout = MouseLayout::BOOT;
        input::set_mouse_bounds(1000, 1000);
        // Park the cursor mid-range so negative motion is observable.
        input::on_mouse_report(500, 500, 0, 0);
        let before = input::mouse_state();

        process_mouse_report(&[0x01, 0x05, 0xFB, 0x01]); // dx=+5 dy=-5 wheel=+1
        let after = input::mouse_state();
        assert_eq!(after.x - before.x, 5);
        assert_eq!(after.y - before.y, -5);
        assert_eq!(after.buttons, 1);
    }

    #[test]
    fn report_descriptor_overrides_the_boot_layout() {
        let _guard = testutil::lock();
        // Buttons (3 bits + 5 pad), then X/Y/Wheel as 8-bit fields, with a
        // report ID.
        let desc: &[u8] = &[
            0x05, 0x01, // Usage Page (Generic Desktop)
            0x09, 0x02, // Usage (Mouse)
            0xA1, 0x01, // Collection (Application)
            0x85, 0x02, //   Report ID (2)
            0x05, 0x09, //   Usage Page (Button)
            0x75, 0x01, //   Report Size (1)
            0x95, 0x03, //   Report Count (3)
            0x81, 0x02, //   Input (Data,Var,Abs)
            0x75, 0x05, //   Report Size (5)
            0x95, 0x01, //   Report Count (1)
            0x81, 0x03, //   Input (Const) padding
            0x05, 0x01, //   Usage Page (Generic Desktop)
            0x09, 0x30, //   Usage (X)
            0x09, 0x31, //   Usage (Y)
            0x09, 0x38, //   Usage (Wheel)
            0x75, 0x08, //   Report Size (8)
            0x95, 0x03, //   Report Count (3)
            0x81, 0x06, //   Input (Data,Var,Rel)
            0xC0, // End Collection
        ];
        parse_mouse_report_descriptor(desc);
        let layout = MOUSE.lock().layout;
        assert_eq!(layout.buttons_byte, 0);
        assert_eq!(layout.x_byte, 1);
        assert_eq!(layout.y_byte, 2);
        assert_eq!(layout.wheel_byte, Some(3));
        assert!(layout.has_report_id);
        // Restore for other tests.
        MOUSE.lock().layout = MouseLayout::BOOT;
    }
}
