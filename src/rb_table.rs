use std::sync::atomic::{AtomicU8, Ordering};

use crate::region_space::{REGION_SHIFT, REGION_SIZE};
use crate::utils::mmap::Mmap;

/// One byte per region consulted by table-lookup read barriers: a set byte
/// means references into that region must take the barrier slow path. The
/// granularity must match the region space region size; both constants come
/// from `region_space` so they cannot drift apart.
pub struct ReadBarrierTable {
    mem: Mmap,
    heap_begin: usize,
    heap_limit: usize,
}

unsafe impl Send for ReadBarrierTable {}
unsafe impl Sync for ReadBarrierTable {}

const _GRANULARITY_MATCHES_REGION_SIZE: [(); REGION_SIZE] = [(); 1 << REGION_SHIFT];

impl ReadBarrierTable {
    pub fn new(heap_begin: *mut u8, heap_capacity: usize) -> Self {
        debug_assert!(heap_capacity % REGION_SIZE == 0);
        Self {
            mem: Mmap::new((heap_capacity >> REGION_SHIFT).max(1)),
            heap_begin: heap_begin as usize,
            heap_limit: heap_begin as usize + heap_capacity,
        }
    }

    #[inline]
    fn entry(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < self.mem.size());
        unsafe { &*self.mem.start().add(index).cast::<AtomicU8>() }
    }

    #[inline]
    fn index_of(&self, addr: usize) -> usize {
        (addr - self.heap_begin) >> REGION_SHIFT
    }

    #[inline]
    pub fn covers(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        addr >= self.heap_begin && addr < self.heap_limit
    }

    /// Mutator fast path: does a reference to `addr` need the slow path?
    #[inline]
    pub fn is_set(&self, addr: *const u8) -> bool {
        self.covers(addr) && self.entry(self.index_of(addr as usize)).load(Ordering::Relaxed) != 0
    }

    pub fn set_region(&self, region_begin: *const u8) {
        debug_assert!(self.covers(region_begin));
        self.entry(self.index_of(region_begin as usize))
            .store(1, Ordering::Relaxed);
    }

    pub fn clear_region(&self, region_begin: *const u8) {
        debug_assert!(self.covers(region_begin));
        self.entry(self.index_of(region_begin as usize))
            .store(0, Ordering::Relaxed);
    }

    pub fn clear_all(&self) {
        unsafe {
            core::ptr::write_bytes(self.mem.start(), 0, self.mem.size());
        }
    }

    pub fn is_all_cleared(&self) -> bool {
        (0..self.mem.size()).all(|i| self.entry(i).load(Ordering::Relaxed) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_granular_set_and_clear() {
        let base = 0x80000000 as *mut u8;
        let table = ReadBarrierTable::new(base, 8 * REGION_SIZE);
        let second_region = unsafe { base.add(REGION_SIZE) };
        table.set_region(second_region);
        assert!(table.is_set(unsafe { second_region.add(REGION_SIZE - 1) }));
        assert!(!table.is_set(base));
        assert!(!table.is_set(unsafe { base.add(2 * REGION_SIZE) }));
        table.clear_region(second_region);
        assert!(table.is_all_cleared());
    }
}
