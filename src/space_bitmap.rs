use core::fmt;
use memmap2::MmapMut;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::header::HeapObjectHeader;
use crate::utils::round_up;

const BITS_PER_INTPTR: usize = size_of::<usize>() * 8;

/// One bit per `ALIGN`-aligned address over a contiguous heap range.
pub struct SpaceBitmap<const ALIGN: usize> {
    mem_map: Option<MmapMut>,
    bitmap_begin: *mut AtomicUsize,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
    name: &'static str,
}

unsafe impl<const ALIGN: usize> Send for SpaceBitmap<ALIGN> {}
unsafe impl<const ALIGN: usize> Sync for SpaceBitmap<ALIGN> {}

impl<const ALIGN: usize> SpaceBitmap<ALIGN> {
    pub const fn empty() -> Self {
        Self {
            mem_map: None,
            bitmap_begin: core::ptr::null_mut(),
            bitmap_size: 0,
            heap_begin: 0,
            heap_limit: 0,
            name: "",
        }
    }

    pub fn create(name: &'static str, heap_begin: *mut u8, heap_capacity: usize) -> Self {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity as u64);
        let mut mem_map = MmapMut::map_anon(bitmap_size).expect("failed to map bitmap");
        let bitmap_begin = mem_map.as_mut_ptr();
        Self {
            mem_map: Some(mem_map),
            bitmap_begin: bitmap_begin.cast(),
            bitmap_size,
            heap_begin: heap_begin as usize,
            heap_limit: heap_begin as usize + heap_capacity,
            name,
        }
    }

    pub fn compute_bitmap_size(capacity: u64) -> usize {
        let bytes_covered_per_word = (ALIGN * BITS_PER_INTPTR) as u64;
        ((round_up(capacity, bytes_covered_per_word) / bytes_covered_per_word)
            * size_of::<usize>() as u64) as usize
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.bitmap_begin.is_null()
    }

    #[inline]
    pub fn get_name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }

    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    #[inline]
    pub fn has_address(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        addr >= self.heap_begin && addr < self.heap_limit
    }

    #[inline]
    const fn offset_to_index(offset: usize) -> usize {
        offset / ALIGN / BITS_PER_INTPTR
    }

    #[inline]
    const fn index_to_offset(index: usize) -> usize {
        index * ALIGN * BITS_PER_INTPTR
    }

    #[inline]
    const fn offset_bit_index(offset: usize) -> usize {
        (offset / ALIGN) % BITS_PER_INTPTR
    }

    #[inline]
    const fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicUsize {
        debug_assert!(
            index < self.bitmap_size / size_of::<usize>(),
            "bitmap index {} out of range ({})",
            index,
            self.bitmap_size
        );
        unsafe { &*self.bitmap_begin.add(index) }
    }

    #[inline]
    pub fn test(&self, obj: *const u8) -> bool {
        debug_assert!(self.has_address(obj), "invalid object address {:p}", obj);
        let offset = (obj as usize).wrapping_sub(self.heap_begin);
        (self.word(Self::offset_to_index(offset)).load(Ordering::Relaxed)
            & Self::offset_to_mask(offset))
            != 0
    }

    #[inline]
    fn modify<const SET_BIT: bool>(&self, obj: *const u8) -> bool {
        debug_assert!(self.has_address(obj), "invalid object address {:p}", obj);
        let offset = (obj as usize).wrapping_sub(self.heap_begin);
        let mask = Self::offset_to_mask(offset);
        let word = self.word(Self::offset_to_index(offset));
        let old = word.load(Ordering::Relaxed);
        if SET_BIT {
            if (old & mask) == 0 {
                word.store(old | mask, Ordering::Relaxed);
            }
        } else {
            word.store(old & !mask, Ordering::Relaxed);
        }
        (old & mask) != 0
    }

    /// Non-atomic set; single-writer contexts only. Returns the previous bit.
    #[inline(always)]
    pub fn set(&self, obj: *const u8) -> bool {
        self.modify::<true>(obj)
    }

    /// Non-atomic clear; returns the previous bit.
    #[inline(always)]
    pub fn clear(&self, obj: *const u8) -> bool {
        self.modify::<false>(obj)
    }

    /// Atomic test-and-set used when mutators and the collector race to mark.
    /// Returns true if the bit was already set.
    #[inline]
    pub fn atomic_test_and_set(&self, obj: *const u8) -> bool {
        debug_assert!(self.has_address(obj), "invalid object address {:p}", obj);
        let offset = (obj as usize).wrapping_sub(self.heap_begin);
        let mask = Self::offset_to_mask(offset);
        let word = self.word(Self::offset_to_index(offset));
        let mut old = word.load(Ordering::Relaxed);
        loop {
            if (old & mask) != 0 {
                return true;
            }
            match word.compare_exchange_weak(old, old | mask, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return false,
                Err(w) => old = w,
            }
        }
    }

    pub fn clear_all(&self) {
        if !self.is_null() {
            unsafe {
                core::ptr::write_bytes(self.bitmap_begin.cast::<u8>(), 0, self.bitmap_size);
            }
        }
    }

    /// Visit every set bit in `[visit_begin, visit_end)`, word at a time.
    /// Bits may be flipped concurrently; each word is loaded once and its set
    /// bits visited from the snapshot.
    pub fn visit_marked_range(
        &self,
        visit_begin: *const u8,
        visit_end: *const u8,
        mut visitor: impl FnMut(*mut HeapObjectHeader),
    ) {
        let offset_start = visit_begin as usize - self.heap_begin;
        let offset_end = visit_end as usize - self.heap_begin;

        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end);
        let bit_start = Self::offset_bit_index(offset_start);
        let bit_end = Self::offset_bit_index(offset_end);

        let mut left_edge = self.word(index_start).load(Ordering::Relaxed);
        left_edge &= !((1usize << bit_start) - 1);

        let mut right_edge;
        if index_start < index_end {
            if left_edge != 0 {
                let ptr_base = Self::index_to_offset(index_start) + self.heap_begin;
                while left_edge != 0 {
                    let shift = left_edge.trailing_zeros() as usize;
                    visitor((ptr_base + shift * ALIGN) as *mut HeapObjectHeader);
                    left_edge ^= 1 << shift;
                }
            }
            for i in index_start + 1..index_end {
                let mut w = self.word(i).load(Ordering::Relaxed);
                if w != 0 {
                    let ptr_base = Self::index_to_offset(i) + self.heap_begin;
                    while w != 0 {
                        let shift = w.trailing_zeros() as usize;
                        visitor((ptr_base + shift * ALIGN) as *mut HeapObjectHeader);
                        w ^= 1 << shift;
                    }
                }
            }
            if bit_end == 0 {
                right_edge = 0;
            } else {
                right_edge = self.word(index_end).load(Ordering::Relaxed);
            }
        } else {
            right_edge = left_edge;
        }

        right_edge &= (1usize << bit_end).wrapping_sub(1);
        if right_edge != 0 {
            let ptr_base = Self::index_to_offset(index_end) + self.heap_begin;
            while right_edge != 0 {
                let shift = right_edge.trailing_zeros() as usize;
                visitor((ptr_base + shift * ALIGN) as *mut HeapObjectHeader);
                right_edge ^= 1 << shift;
            }
        }
    }

    /// Walk objects live in `live` but absent from `mark` over
    /// `[sweep_begin, sweep_end)`; the callback receives batches of dead
    /// object pointers.
    pub fn sweep_walk(
        live: &Self,
        mark: &Self,
        sweep_begin: *const u8,
        sweep_end: *const u8,
        mut callback: impl FnMut(&[*mut HeapObjectHeader]),
    ) {
        if sweep_begin == sweep_end {
            return;
        }
        debug_assert_eq!(live.heap_begin, mark.heap_begin);

        const BUFFER_SIZE: usize = 256;
        let mut buffer: [*mut HeapObjectHeader; BUFFER_SIZE] = [core::ptr::null_mut(); BUFFER_SIZE];
        let mut count = 0usize;

        let offset_start = sweep_begin as usize - live.heap_begin;
        let offset_end = sweep_end as usize - 1 - live.heap_begin;
        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end);

        for i in index_start..=index_end {
            let mut garbage = live.word(i).load(Ordering::Relaxed)
                & !mark.word(i).load(Ordering::Relaxed);
            if garbage != 0 {
                let ptr_base = Self::index_to_offset(i) + live.heap_begin;
                while garbage != 0 {
                    let shift = garbage.trailing_zeros() as usize;
                    let obj = (ptr_base + shift * ALIGN) as *mut HeapObjectHeader;
                    if (obj as usize) < sweep_end as usize {
                        buffer[count] = obj;
                        count += 1;
                        if count == BUFFER_SIZE {
                            callback(&buffer[..count]);
                            count = 0;
                        }
                    }
                    garbage ^= 1 << shift;
                }
            }
        }
        if count != 0 {
            callback(&buffer[..count]);
        }
    }
}

impl<const ALIGN: usize> fmt::Debug for SpaceBitmap<ALIGN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpaceBitmap[{} {:p}-{:p}]",
            self.name, self.heap_begin as *const u8, self.heap_limit as *const u8
        )
    }
}

/// Large objects get one bit per page-sized chunk; precise alignment is not
/// needed since each large allocation starts a chunk.
pub const LARGE_OBJECT_ALIGN: usize = 4096;

pub type ContinuousSpaceBitmap = SpaceBitmap<{ crate::header::MIN_ALLOCATION }>;
pub type LargeObjectBitmap = SpaceBitmap<LARGE_OBJECT_ALIGN>;

/// Routes an address to the mark bitmap of the space covering it.
pub struct HeapBitmap {
    continuous_bitmaps: Vec<*mut ContinuousSpaceBitmap>,
    large_object_bitmaps: Vec<*mut LargeObjectBitmap>,
}

unsafe impl Send for HeapBitmap {}
unsafe impl Sync for HeapBitmap {}

impl HeapBitmap {
    pub fn new() -> Self {
        Self {
            continuous_bitmaps: Vec::new(),
            large_object_bitmaps: Vec::new(),
        }
    }

    pub fn add_continuous_space_bitmap(&mut self, bitmap: *mut ContinuousSpaceBitmap) {
        self.continuous_bitmaps.push(bitmap);
    }

    pub fn add_large_object_bitmap(&mut self, bitmap: *mut LargeObjectBitmap) {
        self.large_object_bitmaps.push(bitmap);
    }

    #[inline]
    pub fn continuous_space_bitmap(&self, obj: *const u8) -> *mut ContinuousSpaceBitmap {
        for &bitmap in self.continuous_bitmaps.iter() {
            unsafe {
                if (*bitmap).has_address(obj) {
                    return bitmap;
                }
            }
        }
        core::ptr::null_mut()
    }

    #[inline]
    pub fn large_object_bitmap(&self, obj: *const u8) -> *mut LargeObjectBitmap {
        for &bitmap in self.large_object_bitmaps.iter() {
            unsafe {
                if (*bitmap).has_address(obj) {
                    return bitmap;
                }
            }
        }
        core::ptr::null_mut()
    }
}

impl Default for HeapBitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_test_clear() {
        let base = 0x10000000 as *mut u8;
        let bitmap = ContinuousSpaceBitmap::create("test-bitmap", base, 1 << 20);
        let obj = unsafe { base.add(128) };
        assert!(!bitmap.test(obj));
        assert!(!bitmap.set(obj));
        assert!(bitmap.test(obj));
        assert!(bitmap.set(obj));
        assert!(bitmap.clear(obj));
        assert!(!bitmap.test(obj));
    }

    #[test]
    fn atomic_test_and_set_reports_prior_state() {
        let base = 0x10000000 as *mut u8;
        let bitmap = ContinuousSpaceBitmap::create("test-bitmap", base, 1 << 20);
        let obj = unsafe { base.add(4096) };
        assert!(!bitmap.atomic_test_and_set(obj));
        assert!(bitmap.atomic_test_and_set(obj));
    }

    #[test]
    fn visit_marked_range_finds_everything() {
        let base = 0x10000000 as *mut u8;
        let bitmap = ContinuousSpaceBitmap::create("test-bitmap", base, 1 << 20);
        let offsets = [0usize, 8, 64, 504, 512, 4096, 65536 - 8];
        for &off in offsets.iter() {
            bitmap.set(unsafe { base.add(off) });
        }
        let mut seen = Vec::new();
        bitmap.visit_marked_range(base, unsafe { base.add(65536) }, |obj| {
            seen.push(obj as usize - base as usize);
        });
        assert_eq!(seen, offsets);
    }

    #[test]
    fn sweep_walk_reports_dead_only() {
        let base = 0x10000000 as *mut u8;
        let live = ContinuousSpaceBitmap::create("live", base, 1 << 20);
        let mark = ContinuousSpaceBitmap::create("mark", base, 1 << 20);
        for &off in [0usize, 8, 16, 1024].iter() {
            live.set(unsafe { base.add(off) });
        }
        mark.set(unsafe { base.add(8) });
        let mut dead = Vec::new();
        ContinuousSpaceBitmap::sweep_walk(&live, &mark, base, unsafe { base.add(4096) }, |ptrs| {
            dead.extend(ptrs.iter().map(|p| *p as usize - base as usize));
        });
        assert_eq!(dead, vec![0, 16, 1024]);
    }
}
