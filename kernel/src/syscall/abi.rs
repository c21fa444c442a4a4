//! Userland ABI types.
//!
//! Packed little-endian structs shared with user programs. Layouts are
//! frozen: userland binaries are built against these exact offsets.

/// Key event delivered by `get_key` and injected by `childio_writekey`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyEvent {
    pub scancode: u8,
    pub ascii: u8,
    pub pressed: u8,
    pub shift: u8,
    pub ctrl: u8,
    pub alt: u8,
}

impl KeyEvent {
    pub const ZERO: Self = Self {
        scancode: 0,
        ascii: 0,
        pressed: 0,
        shift: 0,
        ctrl: 0,
        alt: 0,
    };
}

/// Filled by `get_info`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SysInfo {
    pub os_name: [u8; 32],
    pub os_version: [u8; 32],
    pub api_version: u32,
    pub max_processes: u32,
}

/// Filled by `fb_info`; `user_addr` stays 0 until `fb_map`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FbInfo {
    pub width: u64,
    pub height: u64,
    pub pitch: u64,
    pub bpp: u64,
    pub user_addr: u64,
}

/// Network configuration; all IPv4 fields are network byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetCfg {
    pub ip_address: u32,
    pub subnet_mask: u32,
    pub gateway: u32,
    pub mac_address: [u8; 6],
    pub _pad: [u8; 2],
    pub dns_server: u32,
}

/// Filled by `get_time`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Window metadata snapshot returned by `win_enum`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WinInfo {
    pub id: i32,
    pub owner_pid: i32,
    pub title: [u8; 64],
    pub width: i32,
    pub height: i32,
    pub dirty: i32,
}

impl Default for WinInfo {
    fn default() -> Self {
        Self {
            id: -1,
            owner_pid: -1,
            title: [0; 64],
            width: 0,
            height: 0,
            dirty: 0,
        }
    }
}

/// Window event. `kind` selects the meaning of the payload words:
/// 1 = key (scancode, ascii, pressed), 2 = mouse (x, y, buttons),
/// 3 = focus (gained), 4 = ui scale (scale).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WinEvent {
    pub kind: u32,
    pub a: i32,
    pub b: i32,
    pub c: i32,
}

pub const WIN_EVENT_KEY: u32 = 1;
pub const WIN_EVENT_MOUSE: u32 = 2;
pub const WIN_EVENT_FOCUS: u32 = 3;
pub const WIN_EVENT_SCALE: u32 = 4;

/// Out-parameter of `win_create`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WinCreateResult {
    pub id: i64,
    pub pixel_va: u64,
}

/// One row of `proclist`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProcInfo {
    pub pid: i32,
    pub parent_pid: i32,
    pub state: u8,
    pub _pad: [u8; 3],
    pub name: [u8; 64],
    pub heap_used: u64,
}

/// One row of `devlist`. Categories: 0 = CPU, 1 = interrupt controller,
/// 2 = timer, 3 = legacy input, 4 = USB, 5 = network, 6 = display, 7 = PCI.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DevInfo {
    pub category: u8,
    pub _pad: [u8; 3],
    pub name: [u8; 48],
    pub detail: [u8; 48],
}

impl DevInfo {
    pub fn new(category: u8, name: &str, detail: &str) -> Self {
        let mut info = Self {
            category,
            _pad: [0; 3],
            name: [0; 48],
            detail: [0; 48],
        };
        copy_cstr(&mut info.name, name);
        copy_cstr(&mut info.detail, detail);
        info
    }
}

/// Filled by `mouse_state`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MouseState {
    pub x: i32,
    pub y: i32,
    pub scroll_delta: i32,
    pub buttons: u32,
}

/// Copy `src` into a fixed zero-terminated byte array, truncating.
pub fn copy_cstr(dst: &mut [u8], src: &str) {
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    dst[n] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn abi_sizes_are_frozen() {
        assert_eq!(size_of::<KeyEvent>(), 6);
        assert_eq!(size_of::<SysInfo>(), 72);
        assert_eq!(size_of::<FbInfo>(), 40);
        assert_eq!(size_of::<NetCfg>(), 24);
        assert_eq!(size_of::<DateTime>(), 8);
        assert_eq!(size_of::<WinEvent>(), 16);
        assert_eq!(size_of::<WinCreateResult>(), 16);
        assert_eq!(size_of::<MouseState>(), 16);
        assert_eq!(size_of::<DevInfo>(), 100);
    }

    #[test]
    fn copy_cstr_truncates_and_terminates() {
        let mut buf = [0xAAu8; 8];
        copy_cstr(&mut buf, "longer than eight");
        assert_eq!(buf[7], 0);
        assert_eq!(&buf[..7], b"longer ");

        let mut buf2 = [0xAAu8; 8];
        copy_cstr(&mut buf2, "ok");
        assert_eq!(&buf2[..3], b"ok\0");
    }
}
