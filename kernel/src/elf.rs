//! ELF64 loader for user programs.
//!
//! Reads the whole file into a kernel buffer, validates the header, then
//! maps zeroed user pages for every PT_LOAD segment and copies the file
//! bytes that overlap each page. Returns the entry point.

extern crate alloc;

use alloc::vec;

use crate::{
    error::{KernelError, KernelResult},
    fs,
    mm::{frame_allocator, hhdm, page_table, FRAME_SIZE},
};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;
pub const PT_LOAD: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub ident: [u8; 16],
    pub elf_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

/// Validate magic, class, endianness, type and machine; returns the header.
pub fn validate_header(data: &[u8]) -> KernelResult<Elf64Header> {
    if data.len() < core::mem::size_of::<Elf64Header>() {
        return Err(KernelError::MalformedImage {
            reason: "file smaller than ELF header",
        });
    }
    // SAFETY: length checked; Elf64Header is plain old data and read
    // unaligned from the byte buffer.
    let header = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };

    if header.ident[0..4] != ELF_MAGIC {
        return Err(KernelError::MalformedImage {
            reason: "bad ELF magic",
        });
    }
    if header.ident[4] != ELF_CLASS_64 {
        return Err(KernelError::MalformedImage {
            reason: "not ELFCLASS64",
        });
    }
    if header.ident[5] != ELF_DATA_2LSB {
        return Err(KernelError::MalformedImage {
            reason: "not little-endian",
        });
    }
    if header.elf_type != ET_EXEC {
        return Err(KernelError::MalformedImage {
            reason: "not ET_EXEC",
        });
    }
    if header.machine != EM_X86_64 {
        return Err(KernelError::MalformedImage {
            reason: "not x86_64",
        });
    }
    Ok(header)
}

/// Read program header `i`.
pub fn program_header(data: &[u8], header: &Elf64Header, i: u16) -> KernelResult<Elf64ProgramHeader> {
    let off = header.phoff as usize + i as usize * header.phentsize as usize;
    if off + core::mem::size_of::<Elf64ProgramHeader>() > data.len() {
        return Err(KernelError::MalformedImage {
            reason: "program header out of bounds",
        });
    }
    // SAFETY: bounds checked above; plain-old-data unaligned read.
    Ok(unsafe { core::ptr::read_unaligned(data.as_ptr().add(off) as *const Elf64ProgramHeader) })
}

/// Intersection of one mapped page with a segment's file data, as
/// (offset within page, offset within file, byte count).
pub fn page_file_overlap(
    page_va: u64,
    seg_vaddr: u64,
    seg_offset: u64,
    seg_filesz: u64,
) -> Option<(usize, u64, usize)> {
    let page_end = page_va + FRAME_SIZE as u64;
    let file_start = seg_vaddr;
    let file_end = seg_vaddr + seg_filesz;

    let copy_start = page_va.max(file_start);
    let copy_end = page_end.min(file_end);
    if copy_start >= copy_end {
        return None;
    }
    Some((
        (copy_start - page_va) as usize,
        copy_start - seg_vaddr + seg_offset,
        (copy_end - copy_start) as usize,
    ))
}

/// Load `path` into the address space named by `pml4_phys`; returns the
/// entry point. Pages already mapped on failure stay in the PML4 and are
/// reclaimed by the caller's `free_user_half`.
pub fn load(path: &str, pml4_phys: u64) -> KernelResult<u64> {
    let handle = fs::open(path)?;
    let size = fs::get_size(handle)?;
    if (size as usize) < core::mem::size_of::<Elf64Header>() {
        fs::close(handle);
        return Err(KernelError::MalformedImage {
            reason: "file too small",
        });
    }

    let mut file = vec![0u8; size as usize];
    let read = fs::read(handle, &mut file, 0)?;
    fs::close(handle);
    if read != size as usize {
        return Err(KernelError::MalformedImage {
            reason: "short read",
        });
    }

    let header = validate_header(&file)?;

    for i in 0..header.phnum {
        let phdr = program_header(&file, &header, i)?;
        if phdr.p_type != PT_LOAD || phdr.memsz == 0 {
            continue;
        }
        if phdr.offset + phdr.filesz > size {
            return Err(KernelError::MalformedImage {
                reason: "segment exceeds file",
            });
        }

        let seg_base = phdr.vaddr & !(FRAME_SIZE as u64 - 1);
        let seg_end = (phdr.vaddr + phdr.memsz).next_multiple_of(FRAME_SIZE as u64);
        let num_pages = ((seg_end - seg_base) / FRAME_SIZE as u64) as usize;

        for p in 0..num_pages {
            let page_va = seg_base + (p * FRAME_SIZE) as u64;
            let phys = frame_allocator::allocate_zeroed()?;
            page_table::map_user(pml4_phys, phys, page_va)?;

            if let Some((dst_off, src_off, count)) =
                page_file_overlap(page_va, phdr.vaddr, phdr.offset, phdr.filesz)
            {
                // SAFETY: freshly allocated frame behind the direct map;
                // source range bounds-checked against the file above.
                unsafe {
                    let dst = (hhdm::phys_to_virt(phys) as *mut u8).add(dst_off);
                    dst.copy_from_nonoverlapping(file.as_ptr().add(src_off as usize), count);
                }
            }
        }
    }

    log::info!(target: "elf", "loaded {} entry={:#x}", path, header.entry);
    Ok(header.entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn minimal_header() -> Vec<u8> {
        let mut h = [0u8; 64];
        h[0..4].copy_from_slice(&ELF_MAGIC);
        h[4] = 2; // ELFCLASS64
        h[5] = 1; // little-endian
        h[16] = 2; // ET_EXEC
        h[18] = 0x3E; // EM_X86_64
        h[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // entry
        h.to_vec()
    }

    #[test]
    fn accepts_a_wellformed_header() {
        let h = validate_header(&minimal_header()).unwrap();
        assert_eq!(h.entry, 0x40_1000);
        assert_eq!(h.machine, 0x3E);
    }

    #[test]
    fn rejects_each_validation_failure() {
        let mut bad_magic = minimal_header();
        bad_magic[0] = 0x00;
        assert!(validate_header(&bad_magic).is_err());

        let mut bad_class = minimal_header();
        bad_class[4] = 1; // 32-bit
        assert!(validate_header(&bad_class).is_err());

        let mut bad_endian = minimal_header();
        bad_endian[5] = 2;
        assert!(validate_header(&bad_endian).is_err());

        let mut bad_type = minimal_header();
        bad_type[16] = 3; // ET_DYN
        assert!(validate_header(&bad_type).is_err());

        let mut bad_machine = minimal_header();
        bad_machine[18] = 0x28; // aarch64
        assert!(validate_header(&bad_machine).is_err());

        assert!(validate_header(&[0u8; 10]).is_err());
    }

    #[test]
    fn overlap_clips_to_page_and_file_bounds() {
        // Segment: vaddr 0x1800, filesz 0x1000, offset 0x200.
        // Page at 0x1000: file bytes start mid-page.
        let (dst, src, n) = page_file_overlap(0x1000, 0x1800, 0x200, 0x1000).unwrap();
        assert_eq!((dst, src, n), (0x800, 0x200, 0x800));

        // Page at 0x2000: fully inside the segment's file data.
        let (dst, src, n) = page_file_overlap(0x2000, 0x1800, 0x200, 0x1000).unwrap();
        assert_eq!((dst, src, n), (0, 0xA00, 0x800));

        // Page at 0x3000: past file data (BSS only) — nothing to copy.
        assert!(page_file_overlap(0x3000, 0x1800, 0x200, 0x1000).is_none());

        // Zero filesz segment copies nothing anywhere.
        assert!(page_file_overlap(0x1000, 0x1000, 0, 0).is_none());
    }
}
