use atomic::Atomic;
use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex as Lock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::header::{HeapObjectHeader, MIN_ALLOCATION};
use crate::rb_table::ReadBarrierTable;
use crate::utils::mmap::Mmap;

pub const REGION_SHIFT: usize = 20;
pub const REGION_SIZE: usize = 1 << REGION_SHIFT;
pub const ALIGNMENT: usize = MIN_ALLOCATION;

/// A non-newly-allocated region with a live estimate below this percentage of
/// its allocated bytes is evacuated; denser regions are scanned in place.
pub const EVACUATE_LIVE_PERCENT: usize = 75;

/// Sentinel for "no live estimate yet".
pub const LIVE_BYTES_UNKNOWN: usize = usize::MAX;

const NO_REGION: usize = usize::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RegionState {
    Free = 0,
    Allocated,
    Large,
    LargeTail,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RegionType {
    None = 0,
    ToSpace,
    FromSpace,
    UnevacFromSpace,
}

pub struct Region {
    idx: usize,
    begin: *mut u8,
    end: *mut u8,
    top: AtomicUsize,
    state: Atomic<RegionState>,
    rtype: Atomic<RegionType>,
    objects_allocated: AtomicUsize,
    /// Exact byte size of the object starting a `Large` region run.
    large_bytes: AtomicUsize,
    /// Live-byte estimate accumulated while the region was scanned in place.
    live_bytes: AtomicUsize,
    /// Claimed by a mutator since the last completed cycle.
    is_newly_allocated: Atomic<bool>,
}

impl Region {
    fn init(&mut self, idx: usize, begin: *mut u8, end: *mut u8) {
        self.idx = idx;
        self.begin = begin;
        self.end = end;
        self.top = AtomicUsize::new(begin as usize);
        self.state = Atomic::new(RegionState::Free);
        self.rtype = Atomic::new(RegionType::None);
        self.objects_allocated = AtomicUsize::new(0);
        self.large_bytes = AtomicUsize::new(0);
        self.live_bytes = AtomicUsize::new(LIVE_BYTES_UNKNOWN);
        self.is_newly_allocated = Atomic::new(false);
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.idx
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.end
    }

    #[inline]
    pub fn top(&self) -> *mut u8 {
        (self.top.load(Ordering::Relaxed).min(self.end as usize)) as *mut u8
    }

    #[inline]
    pub fn state(&self) -> RegionState {
        self.state.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn region_type(&self) -> RegionType {
        self.rtype.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state() == RegionState::Free
    }

    #[inline]
    pub fn is_newly_allocated(&self) -> bool {
        self.is_newly_allocated.load(Ordering::Relaxed)
    }

    /// Bump allocation inside the region. Returns null when the region is
    /// exhausted.
    #[inline]
    fn alloc(&self, num_bytes: usize) -> *mut u8 {
        debug_assert!(num_bytes % ALIGNMENT == 0);
        let old = self.top.fetch_add(num_bytes, Ordering::SeqCst);
        if old + num_bytes > self.end as usize {
            self.top.fetch_sub(num_bytes, Ordering::SeqCst);
            return core::ptr::null_mut();
        }
        old as *mut u8
    }

    pub fn bytes_allocated(&self) -> usize {
        match self.state() {
            RegionState::Free => 0,
            RegionState::Allocated => self.top() as usize - self.begin as usize,
            RegionState::Large => self.large_bytes.load(Ordering::Relaxed),
            RegionState::LargeTail => 0,
        }
    }

    pub fn objects_allocated_count(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn add_live_bytes(&self, bytes: usize) {
        debug_assert!(self.region_type() == RegionType::UnevacFromSpace);
        debug_assert!(self.live_bytes() != LIVE_BYTES_UNKNOWN);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn unfree(&self, state: RegionState) {
        debug_assert!(self.is_free());
        self.state.store(state, Ordering::Relaxed);
        self.rtype.store(RegionType::ToSpace, Ordering::Relaxed);
    }

    fn set_newly_allocated(&self) {
        self.is_newly_allocated.store(true, Ordering::Relaxed);
    }

    fn set_as_from_space(&self) {
        self.rtype.store(RegionType::FromSpace, Ordering::Relaxed);
        self.live_bytes
            .store(LIVE_BYTES_UNKNOWN, Ordering::Relaxed);
    }

    fn set_as_unevac_from_space(&self) {
        self.rtype
            .store(RegionType::UnevacFromSpace, Ordering::Relaxed);
        // Live bytes start accumulating from zero for this cycle.
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    fn set_unevac_from_space_as_to_space(&self) {
        debug_assert!(self.region_type() == RegionType::UnevacFromSpace);
        self.rtype.store(RegionType::ToSpace, Ordering::Relaxed);
    }

    /// Evacuation policy. Newly allocated regions are assumed mostly dead;
    /// regions without a live estimate are assumed dense and scanned in
    /// place; estimated regions evacuate below the live threshold. Large
    /// regions evacuate only when fully dead.
    fn should_be_evacuated(&self) -> bool {
        debug_assert!(matches!(
            self.state(),
            RegionState::Allocated | RegionState::Large
        ));
        if self.is_newly_allocated() {
            return true;
        }
        let live = self.live_bytes();
        if live == LIVE_BYTES_UNKNOWN {
            return false;
        }
        match self.state() {
            RegionState::Allocated => live * 100 < EVACUATE_LIVE_PERCENT * self.bytes_allocated(),
            RegionState::Large => live == 0,
            _ => unreachable!(),
        }
    }

    fn clear(&self, mem_map: &Mmap) {
        mem_map.dontneed(self.begin, self.end as usize - self.begin as usize);
        self.top.store(self.begin as usize, Ordering::Relaxed);
        self.state.store(RegionState::Free, Ordering::Relaxed);
        self.rtype.store(RegionType::None, Ordering::Relaxed);
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.large_bytes.store(0, Ordering::Relaxed);
        self.live_bytes
            .store(LIVE_BYTES_UNKNOWN, Ordering::Relaxed);
        self.is_newly_allocated.store(false, Ordering::Relaxed);
    }

    /// Walk objects laid out in this region. Zero words (dead TLAB tails) are
    /// skipped a granule at a time; everything else is a valid header.
    pub fn walk(&self, mut visitor: impl FnMut(*mut HeapObjectHeader)) {
        match self.state() {
            RegionState::Free | RegionState::LargeTail => {}
            RegionState::Large => {
                visitor(self.begin.cast());
            }
            RegionState::Allocated => {
                let mut cursor = self.begin as usize;
                let top = self.top() as usize;
                while cursor < top {
                    let obj = cursor as *mut HeapObjectHeader;
                    unsafe {
                        if (*obj).vtable() == 0 {
                            cursor += ALIGNMENT;
                            continue;
                        }
                        visitor(obj);
                        cursor += (*obj).object_size();
                    }
                }
            }
        }
    }
}

/// Fixed-size-region allocator. Regions are lazily claimed with a CAS under
/// the region lock; object allocation inside a region is a fetch-add bump.
/// Region roles change only at phase boundaries, for all regions at once,
/// while the world is stopped.
pub struct RegionSpace {
    mem_map: Mmap,
    begin: *mut u8,
    limit: *mut u8,
    num_regions: usize,
    regions: Box<[Region]>,
    region_lock: Lock,
    /// Region currently bump-allocated by mutators.
    current_region: AtomicUsize,
    /// Region currently bump-allocated by the collector for evacuations.
    evac_region: AtomicUsize,
    num_non_free_regions: AtomicUsize,
}

unsafe impl Send for RegionSpace {}
unsafe impl Sync for RegionSpace {}

impl RegionSpace {
    pub fn new(capacity: usize) -> Self {
        let capacity = crate::utils::align_up(capacity, REGION_SIZE);
        let mem_map = Mmap::new(capacity + REGION_SIZE);
        let begin = mem_map.aligned(REGION_SIZE);
        let num_regions = capacity / REGION_SIZE;
        let mut regions = Vec::with_capacity(num_regions);
        for _ in 0..num_regions {
            regions.push(Region {
                idx: 0,
                begin: core::ptr::null_mut(),
                end: core::ptr::null_mut(),
                top: AtomicUsize::new(0),
                state: Atomic::new(RegionState::Free),
                rtype: Atomic::new(RegionType::None),
                objects_allocated: AtomicUsize::new(0),
                large_bytes: AtomicUsize::new(0),
                live_bytes: AtomicUsize::new(LIVE_BYTES_UNKNOWN),
                is_newly_allocated: Atomic::new(false),
            });
        }
        let mut regions = regions.into_boxed_slice();
        for (i, r) in regions.iter_mut().enumerate() {
            let rbegin = unsafe { begin.add(i * REGION_SIZE) };
            r.init(i, rbegin, unsafe { rbegin.add(REGION_SIZE) });
        }
        let limit = unsafe { begin.add(capacity) };
        Self {
            mem_map,
            begin,
            limit,
            num_regions,
            regions,
            region_lock: Lock::INIT,
            current_region: AtomicUsize::new(NO_REGION),
            evac_region: AtomicUsize::new(NO_REGION),
            num_non_free_regions: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.begin
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
    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    #[inline]
    pub fn has_address(&self, obj: *const u8) -> bool {
        (obj as usize) >= (self.begin as usize) && (obj as usize) < (self.limit as usize)
    }

    #[inline]
    fn region_index_of(&self, obj: *const u8) -> usize {
        debug_assert!(self.has_address(obj));
        (obj as usize - self.begin as usize) >> REGION_SHIFT
    }

    #[inline]
    pub fn region_at(&self, obj: *const u8) -> &Region {
        &self.regions[self.region_index_of(obj)]
    }

    #[inline]
    pub fn region_type(&self, obj: *const u8) -> RegionType {
        if !self.has_address(obj) {
            return RegionType::None;
        }
        self.region_at(obj).region_type()
    }

    #[inline]
    pub fn is_in_from_space(&self, obj: *const u8) -> bool {
        self.has_address(obj) && self.region_at(obj).region_type() == RegionType::FromSpace
    }

    #[inline]
    pub fn is_in_unevac_from_space(&self, obj: *const u8) -> bool {
        self.has_address(obj) && self.region_at(obj).region_type() == RegionType::UnevacFromSpace
    }

    #[inline]
    pub fn is_in_to_space(&self, obj: *const u8) -> bool {
        self.has_address(obj) && self.region_at(obj).region_type() == RegionType::ToSpace
    }

    #[inline]
    pub fn is_in_newly_allocated_region(&self, obj: *const u8) -> bool {
        self.has_address(obj) && self.region_at(obj).is_newly_allocated()
    }

    /// Bump-pointer allocation. `for_evac` routes through the collector's
    /// evacuation region and skips the newly-allocated tag.
    #[inline]
    pub fn alloc_nonvirtual(
        &self,
        num_bytes: usize,
        bytes_allocated: &mut usize,
        for_evac: bool,
    ) -> *mut u8 {
        debug_assert!(num_bytes % ALIGNMENT == 0);
        if num_bytes > REGION_SIZE {
            return self.alloc_large(num_bytes, bytes_allocated, for_evac);
        }
        let cursor = if for_evac {
            &self.evac_region
        } else {
            &self.current_region
        };
        loop {
            let idx = cursor.load(Ordering::Acquire);
            if idx != NO_REGION {
                let r = &self.regions[idx];
                let addr = r.alloc(num_bytes);
                if !addr.is_null() {
                    r.objects_allocated.fetch_add(1, Ordering::Relaxed);
                    *bytes_allocated = num_bytes;
                    return addr;
                }
            }
            if !self.refill_allocation_region(cursor, idx, for_evac) {
                return core::ptr::null_mut();
            }
        }
    }

    #[cold]
    fn refill_allocation_region(&self, cursor: &AtomicUsize, seen: usize, for_evac: bool) -> bool {
        self.region_lock.lock();
        // Another thread may have installed a fresh region already.
        if cursor.load(Ordering::Acquire) != seen {
            unsafe { self.region_lock.unlock() };
            return true;
        }
        for r in self.regions.iter() {
            if r.is_free() {
                r.unfree(RegionState::Allocated);
                if !for_evac {
                    r.set_newly_allocated();
                }
                self.num_non_free_regions.fetch_add(1, Ordering::Relaxed);
                cursor.store(r.idx, Ordering::Release);
                unsafe { self.region_lock.unlock() };
                return true;
            }
        }
        unsafe { self.region_lock.unlock() };
        false
    }

    /// Allocate an object spanning whole regions. The head region records the
    /// exact byte size; tail regions are walk-skipped.
    fn alloc_large(&self, num_bytes: usize, bytes_allocated: &mut usize, for_evac: bool) -> *mut u8 {
        let num_regs = (num_bytes + REGION_SIZE - 1) / REGION_SIZE;
        self.region_lock.lock();
        let mut run_start = None;
        let mut run_len = 0;
        for (i, r) in self.regions.iter().enumerate() {
            if r.is_free() {
                if run_len == 0 {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == num_regs {
                    break;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        if run_len < num_regs {
            unsafe { self.region_lock.unlock() };
            return core::ptr::null_mut();
        }
        let first = run_start.unwrap();
        for i in first..first + num_regs {
            let r = &self.regions[i];
            r.unfree(if i == first {
                RegionState::Large
            } else {
                RegionState::LargeTail
            });
            if !for_evac {
                r.set_newly_allocated();
            }
            r.top.store(r.end as usize, Ordering::Relaxed);
        }
        let head = &self.regions[first];
        head.large_bytes.store(num_bytes, Ordering::Relaxed);
        head.objects_allocated.store(1, Ordering::Relaxed);
        self.num_non_free_regions
            .fetch_add(num_regs, Ordering::Relaxed);
        unsafe { self.region_lock.unlock() };
        *bytes_allocated = num_regs * REGION_SIZE;
        head.begin
    }

    /// Free a large-object region run immediately (lost copy race or large
    /// sweep).
    pub fn free_large(&self, large_obj: *mut u8, bytes_allocated: usize) {
        debug_assert!(self.has_address(large_obj));
        debug_assert!(bytes_allocated % REGION_SIZE == 0);
        self.region_lock.lock();
        let first = self.region_index_of(large_obj);
        debug_assert_eq!(self.regions[first].state(), RegionState::Large);
        let num_regs = bytes_allocated / REGION_SIZE;
        for i in first..first + num_regs {
            debug_assert!(if i == first {
                self.regions[i].state() == RegionState::Large
            } else {
                self.regions[i].state() == RegionState::LargeTail
            });
            self.regions[i].clear(&self.mem_map);
        }
        self.num_non_free_regions
            .fetch_sub(num_regs, Ordering::Relaxed);
        unsafe { self.region_lock.unlock() };
    }

    /// Carve a thread-local allocation buffer out of the mutator allocation
    /// region. Objects allocated inside it are accounted at revoke time.
    pub fn alloc_tlab(&self, size: usize) -> *mut u8 {
        debug_assert!(size % ALIGNMENT == 0 && size <= REGION_SIZE);
        loop {
            let idx = self.current_region.load(Ordering::Acquire);
            if idx != NO_REGION {
                let addr = self.regions[idx].alloc(size);
                if !addr.is_null() {
                    return addr;
                }
            }
            if !self.refill_allocation_region(&self.current_region, idx, false) {
                return core::ptr::null_mut();
            }
        }
    }

    /// Return a revoked TLAB's object count to its region and make the unused
    /// tail walkable.
    pub fn revoke_thread_local_buffer(
        &self,
        tlab_start: *mut u8,
        tlab_cursor: *mut u8,
        tlab_end: *mut u8,
        objects_allocated: usize,
    ) {
        if tlab_start.is_null() {
            return;
        }
        debug_assert!(self.has_address(tlab_start));
        let r = self.region_at(tlab_start);
        r.objects_allocated
            .fetch_add(objects_allocated, Ordering::SeqCst);
        if !tlab_cursor.is_null() && tlab_cursor < tlab_end {
            // Zero-fill the unused tail so region walks can skip it.
            unsafe {
                core::ptr::write_bytes(tlab_cursor, 0, tlab_end as usize - tlab_cursor as usize);
            }
        }
    }

    /// Re-role every allocated region for a new cycle and flip the read
    /// barrier table in lockstep. Runs inside the stop-the-world flip with
    /// every mutator stopped at a safepoint.
    pub fn set_from_space(&self, rb_table: &ReadBarrierTable, force_evacuate_all: bool) {
        self.region_lock.lock();
        self.current_region.store(NO_REGION, Ordering::Release);
        self.evac_region.store(NO_REGION, Ordering::Release);
        let mut prev_large_evacuated = false;
        for r in self.regions.iter() {
            match r.state() {
                RegionState::Free => {
                    rb_table.clear_region(r.begin);
                }
                RegionState::Allocated | RegionState::Large => {
                    debug_assert_eq!(r.region_type(), RegionType::ToSpace);
                    let should_evacuate = force_evacuate_all || r.should_be_evacuated();
                    if should_evacuate {
                        r.set_as_from_space();
                    } else {
                        r.set_as_unevac_from_space();
                    }
                    if r.state() == RegionState::Large {
                        prev_large_evacuated = should_evacuate;
                    }
                    rb_table.set_region(r.begin);
                }
                RegionState::LargeTail => {
                    if prev_large_evacuated {
                        r.set_as_from_space();
                    } else {
                        r.set_as_unevac_from_space();
                    }
                    rb_table.set_region(r.begin);
                }
            }
        }
        unsafe { self.region_lock.unlock() };
    }

    /// Reclaim every from-space region and fold unevacuated regions back into
    /// to-space. Returns (freed bytes, freed objects) of the cleared regions.
    pub fn clear_from_space(&self) -> (usize, usize) {
        self.region_lock.lock();
        let mut freed_bytes = 0;
        let mut freed_objects = 0;
        let mut freed_regions = 0;
        for r in self.regions.iter() {
            match r.region_type() {
                RegionType::FromSpace => {
                    freed_bytes += r.bytes_allocated();
                    freed_objects += r.objects_allocated_count();
                    freed_regions += 1;
                    r.clear(&self.mem_map);
                }
                RegionType::UnevacFromSpace => {
                    r.set_unevac_from_space_as_to_space();
                    r.is_newly_allocated.store(false, Ordering::Relaxed);
                }
                RegionType::ToSpace => {
                    // Allocated during the cycle; stays, and stays "new" for
                    // the next evacuation decision.
                }
                RegionType::None => {}
            }
        }
        self.num_non_free_regions
            .fetch_sub(freed_regions, Ordering::Relaxed);
        unsafe { self.region_lock.unlock() };
        (freed_bytes, freed_objects)
    }

    pub fn add_live_bytes(&self, obj: *const u8, bytes: usize) {
        self.region_at(obj).add_live_bytes(bytes);
    }

    fn sum_over(&self, rtype: RegionType, f: impl Fn(&Region) -> usize) -> usize {
        self.regions
            .iter()
            .filter(|r| r.region_type() == rtype)
            .map(f)
            .sum()
    }

    pub fn bytes_allocated_in_from_space(&self) -> usize {
        self.sum_over(RegionType::FromSpace, |r| r.bytes_allocated())
    }

    pub fn objects_allocated_in_from_space(&self) -> usize {
        self.sum_over(RegionType::FromSpace, |r| r.objects_allocated_count())
    }

    pub fn bytes_allocated_in_unevac_from_space(&self) -> usize {
        self.sum_over(RegionType::UnevacFromSpace, |r| r.bytes_allocated())
    }

    pub fn objects_allocated_in_unevac_from_space(&self) -> usize {
        self.sum_over(RegionType::UnevacFromSpace, |r| r.objects_allocated_count())
    }

    pub fn bytes_allocated(&self) -> usize {
        self.regions.iter().map(|r| r.bytes_allocated()).sum()
    }

    pub fn objects_allocated(&self) -> usize {
        self.regions
            .iter()
            .map(|r| r.objects_allocated_count())
            .sum()
    }

    pub fn from_space_size(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.region_type() == RegionType::FromSpace)
            .count()
            * REGION_SIZE
    }

    pub fn unevac_from_space_size(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.region_type() == RegionType::UnevacFromSpace)
            .count()
            * REGION_SIZE
    }

    pub fn to_space_size(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.region_type() == RegionType::ToSpace)
            .count()
            * REGION_SIZE
    }

    pub fn non_free_region_count(&self) -> usize {
        self.num_non_free_regions.load(Ordering::Relaxed)
    }

    /// Record an object allocated outside the bump path (skipped-block
    /// reuse).
    pub fn record_alloc(&self, obj: *const u8) {
        self.region_at(obj)
            .objects_allocated
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Walk every object of every region whose type matches `rtype`.
    pub fn walk_regions(
        &self,
        rtype: RegionType,
        mut visitor: impl FnMut(*mut HeapObjectHeader),
    ) {
        for r in self.regions.iter() {
            if r.region_type() == rtype {
                r.walk(&mut visitor);
            }
        }
    }

    pub fn assert_all_region_live_bytes_zero_or_cleared(&self) {
        for r in self.regions.iter() {
            let live = r.live_bytes();
            debug_assert!(
                live == 0 || live == LIVE_BYTES_UNKNOWN,
                "region {} carries stale live bytes {}",
                r.idx,
                live
            );
        }
    }

    pub fn dump_non_free_regions(&self, out: &mut dyn std::fmt::Write) {
        for r in self.regions.iter() {
            if !r.is_free() {
                let _ = writeln!(
                    out,
                    "region {}: {:p}-{:p} state={:?} type={:?} bytes={} objects={} live={} new={}",
                    r.idx,
                    r.begin,
                    r.end,
                    r.state(),
                    r.region_type(),
                    r.bytes_allocated(),
                    r.objects_allocated_count(),
                    if r.live_bytes() == LIVE_BYTES_UNKNOWN {
                        -1isize as usize
                    } else {
                        r.live_bytes()
                    },
                    r.is_newly_allocated(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> RegionSpace {
        RegionSpace::new(8 * REGION_SIZE)
    }

    #[test]
    fn bump_allocation_claims_regions_lazily() {
        let space = space();
        assert_eq!(space.non_free_region_count(), 0);
        let mut ba = 0;
        let a = space.alloc_nonvirtual(64, &mut ba, false);
        assert!(!a.is_null());
        assert_eq!(ba, 64);
        assert_eq!(space.non_free_region_count(), 1);
        let b = space.alloc_nonvirtual(64, &mut ba, false);
        assert_eq!(b as usize, a as usize + 64);
        assert!(space.is_in_to_space(a));
        assert!(space.region_at(a).is_newly_allocated());
        assert_eq!(space.region_at(a).objects_allocated_count(), 2);
    }

    #[test]
    fn large_allocation_spans_regions_and_frees() {
        let space = space();
        let mut ba = 0;
        let big = space.alloc_nonvirtual(REGION_SIZE + REGION_SIZE / 2, &mut ba, false);
        assert!(!big.is_null());
        assert_eq!(ba, 2 * REGION_SIZE);
        assert_eq!(space.region_at(big).state(), RegionState::Large);
        assert_eq!(space.non_free_region_count(), 2);
        space.free_large(big, ba);
        assert_eq!(space.non_free_region_count(), 0);
    }

    #[test]
    fn force_evacuate_all_makes_everything_from_space() {
        let space = space();
        let rb = ReadBarrierTable::new(space.begin(), space.capacity());
        let mut ba = 0;
        let a = space.alloc_nonvirtual(64, &mut ba, false);
        space.set_from_space(&rb, true);
        assert!(space.is_in_from_space(a));
        assert_eq!(space.unevac_from_space_size(), 0);
        assert!(rb.is_set(a));
        let (freed_bytes, freed_objects) = space.clear_from_space();
        assert_eq!(freed_objects, 1);
        assert_eq!(freed_bytes, 64);
        assert!(space.region_at(a).is_free());
    }

    #[test]
    fn dense_estimated_regions_stay_unevacuated() {
        let space = space();
        let rb = ReadBarrierTable::new(space.begin(), space.capacity());
        let mut ba = 0;
        // Claimed by the collector: no newly-allocated tag, no live estimate.
        let a = space.alloc_nonvirtual(128, &mut ba, true);
        assert!(!space.region_at(a).is_newly_allocated());
        space.set_from_space(&rb, false);
        assert!(space.is_in_unevac_from_space(a));
        // In-place marking accumulates the live estimate for the next cycle.
        space.add_live_bytes(a, 128);
        let (freed_bytes, _) = space.clear_from_space();
        assert_eq!(freed_bytes, 0);
        assert!(space.is_in_to_space(a));
        assert_eq!(space.region_at(a).live_bytes(), 128);
    }

    #[test]
    fn newly_allocated_regions_are_evacuated() {
        let space = space();
        let rb = ReadBarrierTable::new(space.begin(), space.capacity());
        let mut ba = 0;
        let a = space.alloc_nonvirtual(64, &mut ba, false);
        space.set_from_space(&rb, false);
        assert!(space.is_in_from_space(a));
    }
}
