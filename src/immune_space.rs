use std::sync::atomic::{AtomicUsize, Ordering};

use crate::header::HeapObjectHeader;
use crate::space_bitmap::ContinuousSpaceBitmap;
use crate::utils::mmap::Mmap;

/// Bump-allocated space whose objects are never moved or reclaimed by a
/// cycle (boot objects, shared pre-built state). The collector scans it, and
/// may temporarily gray objects here, but never copies out of it.
pub struct ImmuneSpace {
    mem_map: Mmap,
    begin: *mut u8,
    cursor: AtomicUsize,
    limit: *mut u8,
    live_bitmap: ContinuousSpaceBitmap,
}

unsafe impl Send for ImmuneSpace {}
unsafe impl Sync for ImmuneSpace {}

impl ImmuneSpace {
    pub fn new(capacity: usize) -> Self {
        let mem_map = Mmap::new(capacity);
        let begin = mem_map.start();
        Self {
            begin,
            cursor: AtomicUsize::new(begin as usize),
            limit: unsafe { begin.add(capacity) },
            live_bitmap: ContinuousSpaceBitmap::create("immune space live bitmap", begin, capacity),
            mem_map,
        }
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.cursor.load(Ordering::Relaxed) as *mut u8
    }

    #[inline]
    pub fn limit(&self) -> *mut u8 {
        self.limit
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

    pub fn alloc(&self, num_bytes: usize) -> *mut u8 {
        debug_assert!(num_bytes % crate::header::MIN_ALLOCATION == 0);
        let old = self.cursor.fetch_add(num_bytes, Ordering::SeqCst);
        if old + num_bytes > self.limit as usize {
            self.cursor.fetch_sub(num_bytes, Ordering::SeqCst);
            return core::ptr::null_mut();
        }
        self.live_bitmap.set(old as *const u8);
        old as *mut u8
    }
}

/// The set of spaces exempt from collection this cycle, with a cached
/// enclosing range for the hot containment test.
pub struct ImmuneSpaces {
    spaces: im::Vector<*mut ImmuneSpace>,
    largest_begin: usize,
    largest_end: usize,
}

unsafe impl Send for ImmuneSpaces {}
unsafe impl Sync for ImmuneSpaces {}

impl ImmuneSpaces {
    pub fn new() -> Self {
        Self {
            spaces: im::Vector::new(),
            largest_begin: usize::MAX,
            largest_end: 0,
        }
    }

    pub fn add_space(&mut self, space: *mut ImmuneSpace) {
        unsafe {
            self.largest_begin = self.largest_begin.min((*space).begin() as usize);
            self.largest_end = self.largest_end.max((*space).limit() as usize);
        }
        self.spaces.push_back(space);
    }

    pub fn spaces(&self) -> impl Iterator<Item = *mut ImmuneSpace> + '_ {
        self.spaces.iter().copied()
    }

    #[inline]
    pub fn contains_object(&self, obj: *const HeapObjectHeader) -> bool {
        let addr = obj as usize;
        if addr < self.largest_begin || addr >= self.largest_end {
            return false;
        }
        self.spaces
            .iter()
            .any(|&s| unsafe { (*s).has_address(obj.cast()) })
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }
}

impl Default for ImmuneSpaces {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation_sets_live_bits() {
        let space = ImmuneSpace::new(1024 * 1024);
        let a = space.alloc(64);
        let b = space.alloc(64);
        assert_eq!(b as usize, a as usize + 64);
        assert!(space.live_bitmap().test(a));
        assert!(space.live_bitmap().test(b));
        let mut seen = 0;
        space
            .live_bitmap()
            .visit_marked_range(space.begin(), space.end(), |_| seen += 1);
        assert_eq!(seen, 2);
    }

    #[test]
    fn containment_uses_enclosing_range() {
        let mut space = ImmuneSpace::new(4096 * 16);
        let mut set = ImmuneSpaces::new();
        set.add_space(&mut space);
        let obj = space.alloc(32) as *const HeapObjectHeader;
        assert!(set.contains_object(obj));
        assert!(!set.contains_object(0x10 as *const HeapObjectHeader));
    }
}
