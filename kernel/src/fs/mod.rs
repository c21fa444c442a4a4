//! Virtual file system.
//!
//! Drive-qualified paths (`0:/init.elf`). Drive 0's root is the read-only
//! TAR ramdisk; `create`/`write` target a bounded in-memory overlay whose
//! contents are lost on reset. Handles index a fixed table; `read` and
//! `write` take explicit offsets, so a handle carries no cursor.

pub mod ramdisk;

extern crate alloc;

use alloc::{string::String, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Open-handle table capacity.
const MAX_HANDLES: usize = 64;
/// Writable overlay bounds.
const MAX_OVERLAY_FILES: usize = 64;
const MAX_OVERLAY_FILE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileId {
    Ramdisk(usize),
    Overlay(usize),
}

struct OverlayFile {
    name: String,
    data: Vec<u8>,
}

static RAMDISK: Mutex<Vec<ramdisk::TarEntry<'static>>> = Mutex::new(Vec::new());
static OVERLAY: Mutex<Vec<OverlayFile>> = Mutex::new(Vec::new());
static HANDLES: Mutex<[Option<FileId>; MAX_HANDLES]> = Mutex::new([None; MAX_HANDLES]);

/// Mount the boot ramdisk image. The slice must stay valid forever (it
/// lives in bootloader-reserved memory).
pub fn init(image: &'static [u8]) {
    let entries = ramdisk::parse(image);
    log::info!(target: "vfs", "ramdisk mounted: {} files", entries.len());
    *RAMDISK.lock() = entries;
}

/// Split a drive-qualified path. Only drive 0 exists.
fn parse_path(path: &str) -> KernelResult<&str> {
    let rest = path
        .strip_prefix("0:/")
        .or_else(|| path.strip_prefix("0:"))
        .ok_or(KernelError::InvalidArgument { name: "path" })?;
    Ok(rest.trim_start_matches('/'))
}

fn lookup(name: &str) -> Option<FileId> {
    if let Some(idx) = OVERLAY.lock().iter().position(|f| f.name == name) {
        return Some(FileId::Overlay(idx));
    }
    RAMDISK
        .lock()
        .iter()
        .position(|e| e.name == name)
        .map(FileId::Ramdisk)
}

fn alloc_handle(id: FileId) -> KernelResult<i32> {
    let mut handles = HANDLES.lock();
    let slot = handles
        .iter()
        .position(|h| h.is_none())
        .ok_or(KernelError::NoFreeSlot { resource: "handle" })?;
    handles[slot] = Some(id);
    Ok(slot as i32)
}

fn handle_id(handle: i32) -> KernelResult<FileId> {
    if handle < 0 || handle as usize >= MAX_HANDLES {
        return Err(KernelError::InvalidArgument { name: "handle" });
    }
    HANDLES.lock()[handle as usize].ok_or(KernelError::InvalidArgument { name: "handle" })
}

/// Open an existing file. Returns a handle.
pub fn open(path: &str) -> KernelResult<i32> {
    let name = parse_path(path)?;
    let id = lookup(name).ok_or(KernelError::NotFound { resource: "file" })?;
    alloc_handle(id)
}

/// Read up to `buf.len()` bytes at `offset`. Short reads at EOF.
pub fn read(handle: i32, buf: &mut [u8], offset: u64) -> KernelResult<usize> {
    let id = handle_id(handle)?;
    match id {
        FileId::Ramdisk(idx) => {
            let ramdisk = RAMDISK.lock();
            let data = ramdisk
                .get(idx)
                .ok_or(KernelError::NotFound { resource: "file" })?
                .data;
            Ok(copy_at(data, buf, offset))
        }
        FileId::Overlay(idx) => {
            let overlay = OVERLAY.lock();
            let data = &overlay
                .get(idx)
                .ok_or(KernelError::NotFound { resource: "file" })?
                .data;
            Ok(copy_at(data, buf, offset))
        }
    }
}

fn copy_at(data: &[u8], buf: &mut [u8], offset: u64) -> usize {
    let offset = offset as usize;
    if offset >= data.len() {
        return 0;
    }
    let n = buf.len().min(data.len() - offset);
    buf[..n].copy_from_slice(&data[offset..offset + n]);
    n
}

pub fn get_size(handle: i32) -> KernelResult<u64> {
    let id = handle_id(handle)?;
    match id {
        FileId::Ramdisk(idx) => Ok(RAMDISK
            .lock()
            .get(idx)
            .ok_or(KernelError::NotFound { resource: "file" })?
            .data
            .len() as u64),
        FileId::Overlay(idx) => Ok(OVERLAY
            .lock()
            .get(idx)
            .ok_or(KernelError::NotFound { resource: "file" })?
            .data
            .len() as u64),
    }
}

pub fn close(handle: i32) {
    if handle >= 0 && (handle as usize) < MAX_HANDLES {
        HANDLES.lock()[handle as usize] = None;
    }
}

/// List file names under a drive root (the namespace is flat).
pub fn read_dir(path: &str, max: usize) -> KernelResult<Vec<String>> {
    parse_path(path)?;
    let mut names: Vec<String> = RAMDISK
        .lock()
        .iter()
        .map(|e| e.name.clone())
        .collect();
    names.extend(OVERLAY.lock().iter().map(|f| f.name.clone()));
    names.truncate(max);
    Ok(names)
}

/// Create (or truncate) a file in the writable overlay. Returns a handle.
pub fn create(path: &str) -> KernelResult<i32> {
    let name = parse_path(path)?;
    if name.is_empty() {
        return Err(KernelError::InvalidArgument { name: "path" });
    }
    let mut overlay = OVERLAY.lock();
    if let Some(idx) = overlay.iter().position(|f| f.name == name) {
        overlay[idx].data.clear();
        drop(overlay);
        return alloc_handle(FileId::Overlay(idx));
    }
    if overlay.len() >= MAX_OVERLAY_FILES {
        return Err(KernelError::NoFreeSlot { resource: "overlay" });
    }
    overlay.push(OverlayFile {
        name: String::from(name),
        data: Vec::new(),
    });
    let idx = overlay.len() - 1;
    drop(overlay);
    alloc_handle(FileId::Overlay(idx))
}

/// Write into an overlay file at `offset`, growing it as needed up to the
/// per-file bound. Ramdisk files are read-only.
pub fn write(handle: i32, data: &[u8], offset: u64) -> KernelResult<usize> {
    let id = handle_id(handle)?;
    let idx = match id {
        FileId::Overlay(idx) => idx,
        FileId::Ramdisk(_) => {
            return Err(KernelError::InvalidState {
                expected: "writable file",
                actual: "read-only ramdisk",
            })
        }
    };
    let mut overlay = OVERLAY.lock();
    let file = overlay
        .get_mut(idx)
        .ok_or(KernelError::NotFound { resource: "file" })?;
    let end = offset as usize + data.len();
    if end > MAX_OVERLAY_FILE_SIZE {
        return Err(KernelError::OutOfMemory);
    }
    if end > file.data.len() {
        file.data.resize(end, 0);
    }
    file.data[offset as usize..end].copy_from_slice(data);
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    /// Single scenario: the VFS statics are process-wide, so the whole
    /// surface is exercised in one sequence.
    #[test]
    fn vfs_lifecycle() {
        let image: &'static [u8] = Box::leak(
            ramdisk::testutil::tar_with(&[("init.elf", b"fake elf"), ("motd.txt", b"hi")])
                .into_boxed_slice(),
        );
        init(image);

        // Path discipline.
        assert!(open("init.elf").is_err());
        assert!(open("1:/init.elf").is_err());
        assert!(open("0:/nope").is_err());

        // Ramdisk read path.
        let h = open("0:/init.elf").unwrap();
        assert_eq!(get_size(h).unwrap(), 8);
        let mut buf = [0u8; 16];
        assert_eq!(read(h, &mut buf, 0).unwrap(), 8);
        assert_eq!(&buf[..8], b"fake elf");
        assert_eq!(read(h, &mut buf, 5).unwrap(), 3);
        assert_eq!(&buf[..3], b"elf");
        assert_eq!(read(h, &mut buf, 100).unwrap(), 0);
        assert!(write(h, b"x", 0).is_err());
        close(h);

        // Overlay create/write/read-back.
        let w = create("0:/notes.txt").unwrap();
        assert_eq!(write(w, b"hello", 0).unwrap(), 5);
        assert_eq!(write(w, b"!!", 5).unwrap(), 2);
        assert_eq!(get_size(w).unwrap(), 7);
        let mut out = [0u8; 8];
        let n = read(w, &mut out, 0).unwrap();
        assert_eq!(&out[..n], b"hello!!");

        // Sparse write zero-fills the gap.
        let s = create("0:/sparse.bin").unwrap();
        assert_eq!(write(s, b"z", 4).unwrap(), 1);
        let mut sp = [0xFFu8; 5];
        assert_eq!(read(s, &mut sp, 0).unwrap(), 5);
        assert_eq!(&sp, b"\0\0\0\0z");

        // Directory listing sees both layers.
        let names = read_dir("0:/", 16).unwrap();
        assert!(names.iter().any(|n| n == "init.elf"));
        assert!(names.iter().any(|n| n == "notes.txt"));

        // Handle table rejects stale and bogus handles.
        close(w);
        assert!(read(w, &mut out, 0).is_err());
        assert!(read(-1, &mut out, 0).is_err());
        assert!(read(9999, &mut out, 0).is_err());
    }
}
