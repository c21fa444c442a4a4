//! Central input state: one keyboard event queue and one mouse state,
//! fed by the USB HID drivers and drained by the input syscalls. Events
//! keep their arrival order; no source priority.

use spin::Mutex;

use crate::{ipc::KeyQueue, syscall::abi::{KeyEvent, MouseState}};

static KEY_QUEUE: Mutex<KeyQueue> = Mutex::new(KeyQueue::new());

#[derive(Debug, Clone, Copy)]
struct Mouse {
    x: i32,
    y: i32,
    scroll: i32,
    buttons: u32,
    max_x: i32,
    max_y: i32,
}

static MOUSE: Mutex<Mouse> = Mutex::new(Mouse {
    x: 0,
    y: 0,
    scroll: 0,
    buttons: 0,
    max_x: i32::MAX,
    max_y: i32::MAX,
});

pub fn push_key(event: KeyEvent) {
    KEY_QUEUE.lock().push(event);
}

pub fn pop_key() -> Option<KeyEvent> {
    KEY_QUEUE.lock().pop()
}

pub fn is_key_available() -> bool {
    !KEY_QUEUE.lock().is_empty()
}

/// Relative mouse movement from a HID report.
pub fn on_mouse_report(dx: i32, dy: i32, wheel: i32, buttons: u32) {
    let mut m = MOUSE.lock();
    m.x = (m.x + dx).clamp(0, m.max_x);
    m.y = (m.y + dy).clamp(0, m.max_y);
    m.scroll += wheel;
    m.buttons = buttons;
}

/// Cursor clamp rectangle, set by the compositor for its screen size.
pub fn set_mouse_bounds(max_x: i32, max_y: i32) {
    let mut m = MOUSE.lock();
    m.max_x = max_x.max(0);
    m.max_y = max_y.max(0);
    m.x = m.x.clamp(0, m.max_x);
    m.y = m.y.clamp(0, m.max_y);
}

/// Snapshot for the `mouse_state` syscall. Reading consumes the
/// accumulated scroll delta.
pub fn mouse_state() -> MouseState {
    let mut m = MOUSE.lock();
    let state = MouseState {
        x: m.x,
        y: m.y,
        scroll_delta: m.scroll,
        buttons: m.buttons,
    };
    m.scroll = 0;
    state
}

#[cfg(test)]
pub mod testutil {
    //! The key queue and mouse state are process-wide; tests touching them
    //! serialize on this lock.

    use spin::{Mutex, MutexGuard};

    static INPUT_TEST_LOCK: Mutex<()> = Mutex::new(());

    pub fn lock() -> MutexGuard<'static, ()> {
        INPUT_TEST_LOCK.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_motion_clamps_to_bounds_and_scroll_drains() {
        let _guard = testutil::lock();
        set_mouse_bounds(100, 50);
        // Re-zero position deterministically.
        on_mouse_report(-1000, -1000, 0, 0);
        assert_eq!((mouse_state().x, mouse_state().y), (0, 0));

        on_mouse_report(30, 70, 2, 1);
        let s = mouse_state();
        assert_eq!(s.x, 30);
        assert_eq!(s.y, 50); // clamped
        assert_eq!(s.scroll_delta, 2);
        assert_eq!(s.buttons, 1);
        // Scroll was consumed by the read.
        assert_eq!(mouse_state().scroll_delta, 0);
    }
}
