//! Physical frame allocator.
//!
//! A bitmap allocator over 4 KiB frames. One bit per frame, set = in use.
//! Every frame is either free in the bitmap or owned by exactly one kernel
//! object (process page table, ring buffer, DMA ring, pixel run); the
//! allocator itself never hands out a frame twice.

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::hhdm,
};

/// Size of a physical frame (4 KiB).
pub const FRAME_SIZE: usize = 4096;

/// Bitmap allocator state. Pure bookkeeping over a borrowed bitmap so the
/// accounting laws are testable without hardware.
pub struct BitmapFrameAllocator {
    bitmap: &'static mut [u8],
    frame_count: usize,
    free_frames: usize,
    /// Scan hint: first index that may be free.
    next: usize,
}

impl BitmapFrameAllocator {
    /// Create an allocator covering `frame_count` frames, all initially
    /// marked in use. Usable ranges are released with [`Self::free_range`].
    pub fn new(bitmap: &'static mut [u8], frame_count: usize) -> Self {
        debug_assert!(bitmap.len() * 8 >= frame_count);
        for b in bitmap.iter_mut() {
            *b = 0xFF;
        }
        Self {
            bitmap,
            frame_count,
            free_frames: 0,
            next: 0,
        }
    }

    #[inline]
    fn is_used(&self, frame: usize) -> bool {
        self.bitmap[frame / 8] & (1 << (frame % 8)) != 0
    }

    #[inline]
    fn set_used(&mut self, frame: usize) {
        self.bitmap[frame / 8] |= 1 << (frame % 8);
    }

    #[inline]
    fn set_free(&mut self, frame: usize) {
        self.bitmap[frame / 8] &= !(1 << (frame % 8));
    }

    /// Mark `[start, start + count)` free. Used during init for usable
    /// memory regions.
    pub fn free_range(&mut self, start: usize, count: usize) {
        for frame in start..(start + count).min(self.frame_count) {
            if self.is_used(frame) {
                self.set_free(frame);
                self.free_frames += 1;
            }
        }
        if start < self.next {
            self.next = start;
        }
    }

    /// Mark `[start, start + count)` used without accounting them as
    /// allocations (bitmap storage, kernel image, MMIO holes).
    pub fn reserve_range(&mut self, start: usize, count: usize) {
        for frame in start..(start + count).min(self.frame_count) {
            if !self.is_used(frame) {
                self.set_used(frame);
                self.free_frames -= 1;
            }
        }
    }

    /// Allocate one frame; returns its frame number.
    pub fn allocate(&mut self) -> Option<usize> {
        let mut idx = self.next;
        for _ in 0..self.frame_count {
            if idx >= self.frame_count {
                idx = 0;
            }
            if !self.is_used(idx) {
                self.set_used(idx);
                self.free_frames -= 1;
                self.next = idx + 1;
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    /// Allocate `count` physically consecutive frames; returns the first
    /// frame number of the run.
    pub fn allocate_contiguous(&mut self, count: usize) -> Option<usize> {
        if count == 0 || count > self.frame_count {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for frame in 0..self.frame_count {
            if self.is_used(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set_used(f);
                }
                self.free_frames -= count;
                return Some(run_start);
            }
        }
        None
    }

    /// Return frames to the pool. Out-of-range frames (MMIO, framebuffer)
    /// are ignored, so freeing a user half that aliases device memory is
    /// harmless.
    pub fn free(&mut self, start: usize, count: usize) {
        for frame in start..start + count {
            if frame >= self.frame_count {
                continue;
            }
            if self.is_used(frame) {
                self.set_free(frame);
                self.free_frames += 1;
            } else {
                log::warn!(target: "pfa", "double free of frame {:#x}", frame);
            }
        }
        if start < self.next {
            self.next = start;
        }
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn total_frames(&self) -> usize {
        self.frame_count
    }
}

static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

/// Install the global allocator instance. Boot hands over a bitmap carved
/// out of usable RAM; tests install their own instance via [`reset_with`].
pub fn install(allocator: BitmapFrameAllocator) {
    *FRAME_ALLOCATOR.lock() = Some(allocator);
    log::info!(target: "pfa",
        "frame allocator ready: {} free frames ({} MiB)",
        free_frames(),
        free_frames() * FRAME_SIZE / (1024 * 1024));
}

/// Replace the global instance (test teardown/bring-up).
#[cfg(test)]
pub fn reset_with(allocator: BitmapFrameAllocator) {
    *FRAME_ALLOCATOR.lock() = Some(allocator);
}

fn with<R>(f: impl FnOnce(&mut BitmapFrameAllocator) -> R) -> KernelResult<R> {
    let mut guard = FRAME_ALLOCATOR.lock();
    match guard.as_mut() {
        Some(a) => Ok(f(a)),
        None => Err(KernelError::InvalidState {
            expected: "frame allocator installed",
            actual: "uninitialized",
        }),
    }
}

/// Allocate one cleared frame; returns its physical address.
pub fn allocate_zeroed() -> KernelResult<u64> {
    let frame = with(|a| a.allocate())?.ok_or(KernelError::OutOfMemory)?;
    let phys = (frame * FRAME_SIZE) as u64;
    zero_frame(phys);
    Ok(phys)
}

/// Allocate `count` cleared, physically consecutive frames; returns the
/// physical address of the first.
pub fn allocate_contiguous(count: usize) -> KernelResult<u64> {
    let frame = with(|a| a.allocate_contiguous(count))?.ok_or(KernelError::OutOfMemory)?;
    let phys = (frame * FRAME_SIZE) as u64;
    for i in 0..count {
        zero_frame(phys + (i * FRAME_SIZE) as u64);
    }
    Ok(phys)
}

/// Return a frame run to the pool.
pub fn free(phys: u64, count: usize) {
    let frame = phys as usize / FRAME_SIZE;
    with(|a| a.free(frame, count)).ok();
}

pub fn free_frames() -> usize {
    with(|a| a.free_frames()).unwrap_or(0)
}

pub fn total_frames() -> usize {
    with(|a| a.total_frames()).unwrap_or(0)
}

fn zero_frame(phys: u64) {
    let virt = hhdm::phys_to_virt(phys) as *mut u8;
    // SAFETY: the frame was just handed out by the allocator and is covered
    // by the direct map; nobody else references it yet.
    unsafe {
        core::ptr::write_bytes(virt, 0, FRAME_SIZE);
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::{boxed::Box, vec};

    use super::*;

    fn fresh(frames: usize) -> BitmapFrameAllocator {
        let bitmap = Box::leak(vec![0u8; frames.div_ceil(8)].into_boxed_slice());
        let mut a = BitmapFrameAllocator::new(bitmap, frames);
        a.free_range(0, frames);
        a
    }

    #[test]
    fn allocate_and_free_is_balanced() {
        let mut a = fresh(64);
        assert_eq!(a.free_frames(), 64);
        let f1 = a.allocate().unwrap();
        let f2 = a.allocate().unwrap();
        assert_ne!(f1, f2);
        assert_eq!(a.free_frames(), 62);
        a.free(f1, 1);
        a.free(f2, 1);
        assert_eq!(a.free_frames(), 64);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut a = fresh(4);
        for _ in 0..4 {
            assert!(a.allocate().is_some());
        }
        assert!(a.allocate().is_none());
        assert_eq!(a.free_frames(), 0);
    }

    #[test]
    fn contiguous_run_is_consecutive_and_freeable_as_a_run() {
        let mut a = fresh(32);
        // Fragment: take every other frame among the first eight.
        let f0 = a.allocate().unwrap();
        let _f1 = a.allocate().unwrap();
        a.free(f0, 1);
        let run = a.allocate_contiguous(8).unwrap();
        for f in run..run + 8 {
            assert!(a.is_used(f));
        }
        a.free(run, 8);
        assert_eq!(a.free_frames(), 31);
    }

    #[test]
    fn contiguous_respects_fragmentation() {
        let mut a = fresh(8);
        // Occupy frame 3 so no 6-frame run exists.
        a.reserve_range(3, 1);
        assert!(a.allocate_contiguous(6).is_none());
        assert!(a.allocate_contiguous(4).is_some());
    }

    #[test]
    fn out_of_range_free_is_ignored() {
        let mut a = fresh(8);
        let before = a.free_frames();
        a.free(1000, 4);
        assert_eq!(a.free_frames(), before);
    }

    #[test]
    fn reserve_range_excludes_frames_from_allocation() {
        let mut a = fresh(8);
        a.reserve_range(0, 8);
        assert!(a.allocate().is_none());
    }
}
