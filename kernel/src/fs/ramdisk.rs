//! TAR-backed read-only ramdisk.
//!
//! The bootloader hands the kernel a ustar archive; this module parses it
//! into a flat file list. Regular files only — the archive is built flat,
//! so directory entries are skipped rather than modeled.

extern crate alloc;

use alloc::{string::String, vec::Vec};

/// TAR block size; every header and data region is a multiple of this.
const BLOCK_SIZE: usize = 512;

const NAME_OFF: usize = 0;
const NAME_LEN: usize = 100;
const SIZE_OFF: usize = 124;
const SIZE_LEN: usize = 12;
const TYPE_OFF: usize = 156;
const MAGIC_OFF: usize = 257;

/// One file in the archive. Data borrows from the bootloader-provided
/// image, which stays mapped for the kernel's lifetime.
pub struct TarEntry<'a> {
    pub name: String,
    pub data: &'a [u8],
}

/// Parse a null-terminated ASCII string from a fixed-size TAR field.
fn parse_str(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    core::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// Parse an octal ASCII number from a TAR field.
fn parse_octal(buf: &[u8]) -> usize {
    let s = parse_str(buf).trim();
    if s.is_empty() {
        return 0;
    }
    usize::from_str_radix(s, 8).unwrap_or(0)
}

fn is_zero_block(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Strip leading `./` and `/` so archive members match VFS lookups.
fn normalize(name: &str) -> &str {
    name.trim_start_matches("./").trim_start_matches('/')
}

/// Walk the archive and collect its regular files.
pub fn parse(image: &[u8]) -> Vec<TarEntry<'_>> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset + BLOCK_SIZE <= image.len() {
        let header = &image[offset..offset + BLOCK_SIZE];
        if is_zero_block(header) {
            break;
        }

        let name = parse_str(&header[NAME_OFF..NAME_OFF + NAME_LEN]);
        let size = parse_octal(&header[SIZE_OFF..SIZE_OFF + SIZE_LEN]);
        let typeflag = header[TYPE_OFF];
        let magic_ok = &header[MAGIC_OFF..MAGIC_OFF + 5] == b"ustar";

        let data_start = offset + BLOCK_SIZE;
        let data_end = data_start + size;
        if data_end > image.len() {
            log::warn!(target: "ramdisk", "truncated entry '{}', stopping", name);
            break;
        }

        if magic_ok && (typeflag == b'0' || typeflag == 0) && !name.is_empty() {
            entries.push(TarEntry {
                name: String::from(normalize(name)),
                data: &image[data_start..data_end],
            });
        }

        offset = data_start + size.next_multiple_of(BLOCK_SIZE);
    }

    entries
}

#[cfg(test)]
pub mod testutil {
    //! Builds minimal ustar archives for tests.

    extern crate alloc;
    use alloc::vec::Vec;

    pub fn tar_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, data) in files {
            let mut header = [0u8; 512];
            header[..name.len()].copy_from_slice(name.as_bytes());
            let size = alloc::format!("{:011o}\0", data.len());
            header[124..124 + 12].copy_from_slice(size.as_bytes());
            header[156] = b'0';
            header[257..262].copy_from_slice(b"ustar");
            header[263..265].copy_from_slice(b"00");
            out.extend_from_slice(&header);
            out.extend_from_slice(data);
            let pad = data.len().next_multiple_of(512) - data.len();
            out.extend(core::iter::repeat(0u8).take(pad));
        }
        out.extend(core::iter::repeat(0u8).take(1024));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_regular_files_with_sizes() {
        let image = testutil::tar_with(&[
            ("init.elf", b"\x7fELF and so on"),
            ("./motd.txt", b"welcome to the machine"),
        ]);
        let entries = parse(&image);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "init.elf");
        assert_eq!(entries[0].data, b"\x7fELF and so on");
        assert_eq!(entries[1].name, "motd.txt");
        assert_eq!(entries[1].data.len(), 22);
    }

    #[test]
    fn stops_at_zero_block_and_rejects_garbage() {
        let entries = parse(&[0u8; 2048]);
        assert!(entries.is_empty());

        // Non-ustar magic is skipped.
        let mut bogus = testutil::tar_with(&[("x", b"y")]);
        bogus[257] = b'X';
        assert!(parse(&bogus).is_empty());
    }

    #[test]
    fn truncated_archive_does_not_panic() {
        let mut image = testutil::tar_with(&[("a.bin", &[1u8; 600])]);
        image.truncate(700); // header + partial data
        assert!(parse(&image).is_empty());
    }
}
