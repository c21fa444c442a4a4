//! Page Attribute Table setup.
//!
//! Reprograms PAT entry 1 (selected by a PTE with PWT=1, PCD=0) from
//! write-through to write-combining, so `map_user_wc` produces WC mappings
//! for the framebuffer.

use x86_64::registers::model_specific::Msr;

const IA32_PAT: u32 = 0x277;
const PAT_WRITE_COMBINING: u64 = 0x01;

pub fn init() {
    let mut msr = Msr::new(IA32_PAT);
    // SAFETY: IA32_PAT is a valid architectural MSR; only entry 1 changes
    // and no mapping created before this point uses PWT.
    unsafe {
        let pat = msr.read();
        msr.write((pat & !0xFF00) | (PAT_WRITE_COMBINING << 8));
    }
}
