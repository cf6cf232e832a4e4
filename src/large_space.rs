use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex as Lock;
use std::cell::UnsafeCell;
use std::collections::BTreeMap;

use crate::header::HeapObjectHeader;
use crate::space_bitmap::{LargeObjectBitmap, LARGE_OBJECT_ALIGN};
use crate::utils::align_up;
use crate::utils::mmap::Mmap;

/// Space for objects too big for the segregated non-moving space but routed
/// away from the region space. Allocations are page-run granular over one
/// reserved mapping so the coarse large-object bitmaps cover the whole range.
/// Objects here never move.
pub struct LargeObjectSpace {
    mem_map: Mmap,
    begin: *mut u8,
    limit: *mut u8,
    lock: Lock,
    inner: UnsafeCell<FreeRuns>,
    live_bitmap: LargeObjectBitmap,
    mark_bitmap: LargeObjectBitmap,
}

struct FreeRuns {
    /// offset-in-pages -> run length in pages, coalesced on free.
    free: BTreeMap<usize, usize>,
    /// offset-in-pages -> allocated run length in pages.
    allocated: ahash::AHashMap<usize, usize>,
    num_bytes_allocated: usize,
    num_objects_allocated: usize,
}

unsafe impl Send for LargeObjectSpace {}
unsafe impl Sync for LargeObjectSpace {}

impl LargeObjectSpace {
    pub fn new(capacity: usize) -> Self {
        let capacity = align_up(capacity, LARGE_OBJECT_ALIGN);
        let mem_map = Mmap::new(capacity + LARGE_OBJECT_ALIGN);
        let begin = mem_map.aligned(LARGE_OBJECT_ALIGN);
        let limit = unsafe { begin.add(capacity) };
        let mut free = BTreeMap::new();
        free.insert(0, capacity / LARGE_OBJECT_ALIGN);
        Self {
            begin,
            limit,
            live_bitmap: LargeObjectBitmap::create("large object live bitmap", begin, capacity),
            mark_bitmap: LargeObjectBitmap::create("large object mark bitmap", begin, capacity),
            mem_map,
            lock: Lock::INIT,
            inner: UnsafeCell::new(FreeRuns {
                free,
                allocated: ahash::AHashMap::default(),
                num_bytes_allocated: 0,
                num_objects_allocated: 0,
            }),
        }
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    #[inline]
    pub fn has_address(&self, obj: *const u8) -> bool {
        (obj as usize) >= (self.begin as usize) && (obj as usize) < (self.limit as usize)
    }

    pub fn live_bitmap(&self) -> &LargeObjectBitmap {
        &self.live_bitmap
    }

    pub fn mark_bitmap(&self) -> &LargeObjectBitmap {
        &self.mark_bitmap
    }

    pub fn bytes_allocated(&self) -> usize {
        self.lock.lock();
        let n = unsafe { (*self.inner.get()).num_bytes_allocated };
        unsafe { self.lock.unlock() };
        n
    }

    pub fn objects_allocated(&self) -> usize {
        self.lock.lock();
        let n = unsafe { (*self.inner.get()).num_objects_allocated };
        unsafe { self.lock.unlock() };
        n
    }

    /// First-fit page-run allocation.
    pub fn alloc(&self, num_bytes: usize, bytes_allocated: &mut usize) -> *mut u8 {
        let pages = align_up(num_bytes, LARGE_OBJECT_ALIGN) / LARGE_OBJECT_ALIGN;
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let fit = inner
            .free
            .iter()
            .find(|(_, &len)| len >= pages)
            .map(|(&off, &len)| (off, len));
        let result = match fit {
            Some((off, len)) => {
                inner.free.remove(&off);
                if len > pages {
                    inner.free.insert(off + pages, len - pages);
                }
                inner.allocated.insert(off, pages);
                inner.num_bytes_allocated += pages * LARGE_OBJECT_ALIGN;
                inner.num_objects_allocated += 1;
                *bytes_allocated = pages * LARGE_OBJECT_ALIGN;
                unsafe { self.begin.add(off * LARGE_OBJECT_ALIGN) }
            }
            None => core::ptr::null_mut(),
        };
        unsafe { self.lock.unlock() };
        result
    }

    /// Free a run; coalesces with free neighbors. Returns the freed bytes.
    pub fn free(&self, ptr: *mut u8) -> usize {
        debug_assert!(self.has_address(ptr));
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let off = (ptr as usize - self.begin as usize) / LARGE_OBJECT_ALIGN;
        let pages = match inner.allocated.remove(&off) {
            Some(p) => p,
            None => {
                unsafe { self.lock.unlock() };
                panic!("freeing unallocated large object {:p}", ptr);
            }
        };
        inner.num_bytes_allocated -= pages * LARGE_OBJECT_ALIGN;
        inner.num_objects_allocated -= 1;
        let mut start = off;
        let mut len = pages;
        if let Some((&prev_off, &prev_len)) = inner.free.range(..off).next_back() {
            if prev_off + prev_len == off {
                inner.free.remove(&prev_off);
                start = prev_off;
                len += prev_len;
            }
        }
        if let Some(&next_len) = inner.free.get(&(off + pages)) {
            inner.free.remove(&(off + pages));
            len += next_len;
        }
        inner.free.insert(start, len);
        self.mem_map.dontneed(ptr, pages * LARGE_OBJECT_ALIGN);
        unsafe { self.lock.unlock() };
        pages * LARGE_OBJECT_ALIGN
    }

    pub fn swap_bitmaps(&mut self) {
        core::mem::swap(&mut self.live_bitmap, &mut self.mark_bitmap);
    }

    /// Free objects live but unmarked; runs finalizers. Returns (bytes,
    /// objects) freed.
    pub fn sweep(&self) -> (usize, usize) {
        let mut freed_bytes = 0;
        let mut freed_objects = 0;
        let mut dead = Vec::new();
        LargeObjectBitmap::sweep_walk(
            &self.live_bitmap,
            &self.mark_bitmap,
            self.begin,
            self.limit,
            |ptrs| dead.extend_from_slice(ptrs),
        );
        for obj in dead {
            unsafe {
                if (*obj).needs_finalize() {
                    (*obj).get_dyn().finalize();
                }
            }
            self.live_bitmap.clear(obj as *const u8);
            freed_bytes += self.free(obj as *mut u8);
            freed_objects += 1;
        }
        (freed_bytes, freed_objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_page_run_granular() {
        let space = LargeObjectSpace::new(1024 * 1024);
        let mut ba = 0;
        let a = space.alloc(5000, &mut ba);
        assert!(!a.is_null());
        assert_eq!(ba, 2 * LARGE_OBJECT_ALIGN);
        assert_eq!(a as usize % LARGE_OBJECT_ALIGN, 0);
        assert_eq!(space.bytes_allocated(), 2 * LARGE_OBJECT_ALIGN);
    }

    #[test]
    fn free_coalesces_neighbors() {
        let space = LargeObjectSpace::new(1024 * 1024);
        let mut ba = 0;
        let a = space.alloc(LARGE_OBJECT_ALIGN, &mut ba);
        let b = space.alloc(LARGE_OBJECT_ALIGN, &mut ba);
        let c = space.alloc(LARGE_OBJECT_ALIGN, &mut ba);
        assert!(!c.is_null());
        space.free(a);
        space.free(c);
        space.free(b);
        assert_eq!(space.bytes_allocated(), 0);
        // The whole capacity is one run again.
        let mut big = 0;
        let d = space.alloc(1024 * 1024, &mut big);
        assert!(!d.is_null());
        assert_eq!(d, a);
    }
}
