use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex as Lock;
use rosalloc::{
    dedicated_full_run,
    defs::{PageReleaseMode, DEFAULT_PAGE_RELEASE_THRESHOLD, NUM_THREAD_LOCAL_SIZE_BRACKETS, PAGE_SIZE},
    Rosalloc, Run,
};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::header::HeapObjectHeader;
use crate::space_bitmap::ContinuousSpaceBitmap;
use crate::utils::align_up;
use crate::utils::mmap::Mmap;

/// Free-list space objects are copied into when the region space and the
/// skipped-block pool are both exhausted. Objects here never move; liveness is
/// tracked in the live/mark bitmap pair and reclaimed by sweeping.
pub struct NonMovingSpace {
    mem_map: Mmap,
    begin: *mut u8,
    end: AtomicUsize,
    limit: *mut u8,
    rosalloc: *mut Rosalloc,
    lock: Lock,
    // Shared run set; every allocation happens under `lock`.
    runs: UnsafeCell<[*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS]>,
    live_bitmap: ContinuousSpaceBitmap,
    mark_bitmap: ContinuousSpaceBitmap,
}

unsafe impl Send for NonMovingSpace {}
unsafe impl Sync for NonMovingSpace {}

impl NonMovingSpace {
    pub fn new(initial_size: usize, capacity: usize) -> Self {
        let starting_size = PAGE_SIZE;
        let initial_size = align_up(initial_size.max(starting_size), PAGE_SIZE);
        let capacity = align_up(capacity.max(initial_size), PAGE_SIZE);
        let mem_map = Mmap::new(capacity);
        let begin = mem_map.start();
        let rosalloc = unsafe {
            let rosalloc = Rosalloc::new(
                begin,
                starting_size,
                capacity,
                PageReleaseMode::SizeAndEnd,
                DEFAULT_PAGE_RELEASE_THRESHOLD,
            );
            (*rosalloc).set_footprint_limit(initial_size);
            rosalloc
        };
        let live_bitmap = ContinuousSpaceBitmap::create("non moving space live bitmap", begin, capacity);
        let mark_bitmap = ContinuousSpaceBitmap::create("non moving space mark bitmap", begin, capacity);
        Self {
            begin,
            end: AtomicUsize::new(begin as usize + starting_size),
            limit: unsafe { begin.add(capacity) },
            mem_map,
            rosalloc,
            lock: Lock::INIT,
            runs: UnsafeCell::new([dedicated_full_run(); NUM_THREAD_LOCAL_SIZE_BRACKETS]),
            live_bitmap,
            mark_bitmap,
        }
    }

    /// Hook the allocator's growth callback up once the space has its final
    /// address (it lives inside the heap allocation).
    pub unsafe fn install_morecore(&self) {
        (*self.rosalloc).set_morecore(morecore, self as *const Self as *mut u8);
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.end.load(Ordering::Relaxed) as *mut u8
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.limit as usize - self.begin as usize
    }

    #[inline]
    pub fn has_address(&self, obj: *const u8) -> bool {
        (obj as usize) >= (self.begin as usize) && (obj as usize) < (self.limit as usize)
    }

    pub fn live_bitmap(&self) -> &ContinuousSpaceBitmap {
        &self.live_bitmap
    }

    pub fn mark_bitmap(&self) -> &ContinuousSpaceBitmap {
        &self.mark_bitmap
    }

    /// Thread-safe allocation; grows the footprint up to capacity on demand.
    pub fn alloc(&self, num_bytes: usize, bytes_allocated: &mut usize) -> *mut u8 {
        let mut usable_size = 0;
        let mut bytes_tl_bulk_allocated = 0;
        unsafe {
            self.lock.lock();
            let runs = &mut *self.runs.get();
            let mut ptr = (*self.rosalloc).alloc::<true>(
                runs,
                num_bytes,
                bytes_allocated,
                &mut usable_size,
                &mut bytes_tl_bulk_allocated,
            );
            if ptr.is_null() {
                // Grow towards the capacity, then pin the footprint back down
                // to what is actually used.
                (*self.rosalloc).set_footprint_limit(self.capacity());
                ptr = (*self.rosalloc).alloc::<true>(
                    runs,
                    num_bytes,
                    bytes_allocated,
                    &mut usable_size,
                    &mut bytes_tl_bulk_allocated,
                );
                let footprint = (*self.rosalloc).footprint();
                (*self.rosalloc).set_footprint_limit(footprint);
            }
            self.lock.unlock();
            ptr
        }
    }

    /// Free one chunk; returns the reclaimed byte count.
    pub fn free(&self, ptr: *mut u8) -> usize {
        unsafe {
            self.lock.lock();
            let freed = (*self.rosalloc).bulk_free(&[ptr]);
            self.lock.unlock();
            freed
        }
    }

    pub(crate) unsafe fn morecore(&self, increment: isize) {
        let original_end = self.end.load(Ordering::Relaxed);
        if increment != 0 {
            let new_end = (original_end as isize + increment) as usize;
            if increment > 0 {
                self.mem_map.commit(original_end as *mut u8, increment as usize);
            } else {
                self.mem_map.decommit(new_end as *mut u8, (-increment) as usize);
            }
            self.end.store(new_end, Ordering::Relaxed);
        }
    }

    pub fn swap_bitmaps(&mut self) {
        core::mem::swap(&mut self.live_bitmap, &mut self.mark_bitmap);
    }

    /// Free objects present in the live bitmap but absent from the mark
    /// bitmap. Runs dead objects' finalizers. Returns (bytes, objects) freed.
    pub fn sweep(&self) -> (usize, usize) {
        let mut freed_bytes = 0;
        let mut freed_objects = 0;
        ContinuousSpaceBitmap::sweep_walk(
            &self.live_bitmap,
            &self.mark_bitmap,
            self.begin,
            self.end(),
            |dead| {
                let mut ptrs: [*mut u8; 256] = [core::ptr::null_mut(); 256];
                for (i, &obj) in dead.iter().enumerate() {
                    unsafe {
                        if (*obj).needs_finalize() {
                            (*obj).get_dyn().finalize();
                        }
                    }
                    self.live_bitmap.clear(obj as *const u8);
                    ptrs[i] = obj as *mut u8;
                }
                freed_objects += dead.len();
                unsafe {
                    self.lock.lock();
                    freed_bytes += (*self.rosalloc).bulk_free(&ptrs[..dead.len()]);
                    self.lock.unlock();
                }
            },
        );
        (freed_bytes, freed_objects)
    }
}

extern "C" fn morecore(_rosalloc: *mut Rosalloc, increment: isize, data: *mut u8) {
    unsafe {
        let space = &*data.cast::<NonMovingSpace>();
        space.morecore(increment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trip() {
        let space = NonMovingSpace::new(PAGE_SIZE, 4 * 1024 * 1024);
        unsafe { space.install_morecore() };
        let mut ba = 0;
        let p = space.alloc(64, &mut ba);
        assert!(!p.is_null());
        assert!(ba >= 64);
        assert!(space.has_address(p));
        assert!(space.free(p) > 0);
    }

    #[test]
    fn grows_past_initial_footprint() {
        let space = NonMovingSpace::new(PAGE_SIZE, 4 * 1024 * 1024);
        unsafe { space.install_morecore() };
        let mut total = 0;
        let mut ba = 0;
        while total < 1024 * 1024 {
            let p = space.alloc(4096, &mut ba);
            assert!(!p.is_null());
            total += ba;
        }
    }
}
