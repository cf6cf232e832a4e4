use atomic::Atomic;
use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::Mutex;
use std::cell::{Cell, UnsafeCell};
use std::collections::BTreeMap;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::api::{
    int_array_byte_size, min_object_size, reference_referent_slot, small_type_id, vtable_of, Array,
    Visitor,
};
use crate::header::{HeapObjectHeader, LockWord, GC_GRAY, GC_WHITE};
use crate::heap::{GcCause, Heap, HeapParams};
use crate::mutator::{current_mutator, CheckpointClosure, Mutator};
use crate::object_stack::ObjectStack;
use crate::read_barrier::ReadBarrierPolicy;
use crate::region_space::{RegionType, ALIGNMENT, REGION_SIZE};
use crate::space_bitmap::ContinuousSpaceBitmap;
use crate::statistics::{GcStats, Histogram};
use crate::utils::align_usize;

const VERBOSE: bool = false;

/// Entries of the gc mark stack before the first growth.
const GC_MARK_STACK_CAPACITY: usize = 256 * 1024;
/// Entries of one pooled thread-local mark stack.
const TL_MARK_STACK_CAPACITY: usize = 512;
const MARK_STACK_POOL_SIZE: usize = 32;

/// How dirty a card must be for the immune gray pass. Aged cards are rescanned
/// every cycle: an immune object that was ever mutated keeps getting grayed,
/// which keeps its out-references visible without a remembered set.
const IMMUNE_GRAY_MIN_CARD_AGE: u8 = crate::card_table::CARD_AGED;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
enum MarkStackMode {
    Off = 0,
    /// Mutators push to their own stacks, the collector to the gc stack.
    ThreadLocal,
    /// Every push goes to the gc stack under the mark stack lock.
    Shared,
    /// Only the collector touches the gc stack; no locking.
    GcExclusive,
}

struct MarkStackPools {
    pooled: Vec<Box<ObjectStack>>,
    revoked: Vec<Box<ObjectStack>>,
    /// Non-moving objects that lost the gray-to-white race after a failed
    /// bitmap claim; whitened at the end of marking.
    false_gray: Vec<*mut HeapObjectHeader>,
}

/// Concurrent copying collector. One cycle evacuates live objects out of the
/// from-space regions chosen at the flip pause while mutators keep running
/// behind their read barriers, then reclaims the from-space wholesale.
pub struct ConcurrentCopying<RB: ReadBarrierPolicy + 'static> {
    heap: Cell<*mut Heap<RB>>,

    is_active: AtomicBool,
    is_marking: AtomicBool,
    weak_ref_access_enabled: AtomicBool,
    mark_stack_mode: Atomic<MarkStackMode>,
    is_mark_stack_push_disallowed: AtomicU32,

    gc_mark_stack: UnsafeCell<ObjectStack>,
    mark_stack_pools: Mutex<MarkStackPools>,
    pub(crate) gc_barrier: crate::checkpoint::GcBarrier,

    /// Marks for objects scanned in place in unevacuated from-space regions.
    /// Lives only for the cycle.
    region_space_bitmap: AtomicPtr<ContinuousSpaceBitmap>,

    /// To-space blocks abandoned after a lost forwarding race, keyed by size.
    skipped_blocks: Mutex<BTreeMap<usize, Vec<*mut u8>>>,

    immune_gray_stack: Mutex<Vec<*mut HeapObjectHeader>>,
    updated_all_immune_objects: AtomicBool,
    /// Whether the collector itself grays immune objects it marks. Written
    /// and read only by the collector thread between pauses; mutators key off
    /// `updated_all_immune_objects` instead.
    gc_grays_immune_objects: Cell<bool>,

    force_evacuate_all: Cell<bool>,
    clear_soft_references: Cell<bool>,
    is_asserting_to_space_invariant: Cell<bool>,

    bytes_moved: AtomicU64,
    objects_moved: AtomicU64,
    to_space_bytes_skipped: AtomicU64,
    to_space_objects_skipped: AtomicU64,
    from_space_bytes_at_first_pause: Cell<usize>,
    from_space_objects_at_first_pause: Cell<usize>,
    live_stack_freeze_size: Cell<usize>,
    cycle_freed_bytes: Cell<u64>,
    cycle_freed_objects: Cell<u64>,

    measure_read_barrier_slow_path: bool,
    rb_slow_path_ns: AtomicU64,
    rb_slow_path_count: AtomicU64,
    rb_slow_path_count_gc: AtomicU64,
    rb_slow_path_count_total: AtomicU64,
    rb_slow_path_count_gc_total: AtomicU64,
    rb_slow_path_time_histogram: Mutex<Histogram>,
    pause_histogram: Mutex<Histogram>,

    pub(crate) stats: GcStats,
}

unsafe impl<RB: ReadBarrierPolicy> Send for ConcurrentCopying<RB> {}
unsafe impl<RB: ReadBarrierPolicy> Sync for ConcurrentCopying<RB> {}

impl<RB: ReadBarrierPolicy> ConcurrentCopying<RB> {
    pub fn new(params: HeapParams) -> Self {
        let mut pooled = Vec::with_capacity(MARK_STACK_POOL_SIZE);
        for _ in 0..MARK_STACK_POOL_SIZE {
            pooled.push(Box::new(ObjectStack::new(
                "thread local mark stack",
                TL_MARK_STACK_CAPACITY,
            )));
        }
        Self {
            heap: Cell::new(null_mut()),
            is_active: AtomicBool::new(false),
            is_marking: AtomicBool::new(false),
            weak_ref_access_enabled: AtomicBool::new(true),
            mark_stack_mode: Atomic::new(MarkStackMode::Off),
            is_mark_stack_push_disallowed: AtomicU32::new(0),
            gc_mark_stack: UnsafeCell::new(ObjectStack::new(
                "concurrent copying gc mark stack",
                GC_MARK_STACK_CAPACITY,
            )),
            mark_stack_pools: Mutex::new(MarkStackPools {
                pooled,
                revoked: Vec::new(),
                false_gray: Vec::new(),
            }),
            gc_barrier: crate::checkpoint::GcBarrier::new(),
            region_space_bitmap: AtomicPtr::new(null_mut()),
            skipped_blocks: Mutex::new(BTreeMap::new()),
            immune_gray_stack: Mutex::new(Vec::new()),
            updated_all_immune_objects: AtomicBool::new(false),
            gc_grays_immune_objects: Cell::new(false),
            force_evacuate_all: Cell::new(false),
            clear_soft_references: Cell::new(false),
            is_asserting_to_space_invariant: Cell::new(false),
            bytes_moved: AtomicU64::new(0),
            objects_moved: AtomicU64::new(0),
            to_space_bytes_skipped: AtomicU64::new(0),
            to_space_objects_skipped: AtomicU64::new(0),
            from_space_bytes_at_first_pause: Cell::new(0),
            from_space_objects_at_first_pause: Cell::new(0),
            live_stack_freeze_size: Cell::new(0),
            cycle_freed_bytes: Cell::new(0),
            cycle_freed_objects: Cell::new(0),
            measure_read_barrier_slow_path: params.measure_read_barrier_slow_path,
            rb_slow_path_ns: AtomicU64::new(0),
            rb_slow_path_count: AtomicU64::new(0),
            rb_slow_path_count_gc: AtomicU64::new(0),
            rb_slow_path_count_total: AtomicU64::new(0),
            rb_slow_path_count_gc_total: AtomicU64::new(0),
            rb_slow_path_time_histogram: Mutex::new(Histogram::new(
                "mutator time in read barrier slow path",
            )),
            pause_histogram: Mutex::new(Histogram::new("gc pause")),
            stats: GcStats::new(),
        }
    }

    pub(crate) fn bind_heap(&self, heap: *mut Heap<RB>) {
        self.heap.set(heap);
    }

    #[inline]
    fn heap(&self) -> &Heap<RB> {
        unsafe { &*self.heap.get() }
    }

    #[inline]
    pub fn is_marking(&self) -> bool {
        self.is_marking.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn weak_ref_access_enabled(&self) -> bool {
        self.weak_ref_access_enabled.load(Ordering::Relaxed)
    }

    #[inline]
    fn region_space_bitmap(&self) -> &ContinuousSpaceBitmap {
        let bitmap = self.region_space_bitmap.load(Ordering::Acquire);
        debug_assert!(!bitmap.is_null());
        unsafe { &*bitmap }
    }

    // ==================================================================
    // Phases
    // ==================================================================

    pub(crate) fn run_phases(&self, cause: GcCause, clear_soft: bool) {
        let heap = self.heap();
        assert!(!self.is_active());
        self.is_active.store(true, Ordering::Relaxed);
        {
            heap.mutator_lock.lock_shared();
            self.initialize_phase(cause, clear_soft);
            unsafe { heap.mutator_lock.unlock_shared() };
        }
        self.flip_thread_roots();
        {
            heap.mutator_lock.lock_shared();
            self.marking_phase();
            unsafe { heap.mutator_lock.unlock_shared() };
        }
        if heap.params.verify_no_from_space_refs {
            self.with_pause(|cc| {
                cc.check_empty_mark_stack();
                if VERBOSE {
                    eprintln!("verifying no from-space refs");
                }
                cc.verify_no_from_space_references();
                cc.check_empty_mark_stack();
            });
        }
        {
            heap.mutator_lock.lock_shared();
            self.reclaim_phase();
            unsafe { heap.mutator_lock.unlock_shared() };
        }
        self.finish_phase();
        assert!(self.is_active());
        self.is_active.store(false, Ordering::Relaxed);
    }

    fn initialize_phase(&self, cause: GcCause, clear_soft: bool) {
        let heap = self.heap();
        if VERBOSE {
            eprintln!(
                "gc initialize: region space {:p}-{:p}",
                heap.region_space.begin(),
                heap.region_space.limit()
            );
        }
        self.check_empty_mark_stack();
        debug_assert!(self.mark_stack_pools.lock().false_gray.is_empty());

        if self.measure_read_barrier_slow_path {
            self.rb_slow_path_ns.store(0, Ordering::Relaxed);
            self.rb_slow_path_count.store(0, Ordering::Relaxed);
            self.rb_slow_path_count_gc.store(0, Ordering::Relaxed);
        }

        self.bytes_moved.store(0, Ordering::Relaxed);
        self.objects_moved.store(0, Ordering::Relaxed);
        self.to_space_bytes_skipped.store(0, Ordering::Relaxed);
        self.to_space_objects_skipped.store(0, Ordering::Relaxed);
        self.cycle_freed_bytes.set(0);
        self.cycle_freed_objects.set(0);

        let force = matches!(cause, GcCause::Explicit | GcCause::ForNativeAlloc) || clear_soft;
        self.force_evacuate_all.set(force);
        self.clear_soft_references.set(clear_soft);

        if RB::USE_BAKER {
            self.updated_all_immune_objects.store(false, Ordering::Relaxed);
            // The flip pause may gray dirty immune objects.
            self.gc_grays_immune_objects.set(true);
            debug_assert!(self.immune_gray_stack.lock().is_empty());
        }

        // Bind the per-cycle bitmap for in-place marks in unevacuated
        // regions.
        let bitmap = Box::new(ContinuousSpaceBitmap::create(
            "concurrent copying region space bitmap",
            heap.region_space.begin(),
            heap.region_space.capacity(),
        ));
        let old = self
            .region_space_bitmap
            .swap(Box::into_raw(bitmap), Ordering::Release);
        debug_assert!(old.is_null());
        if VERBOSE {
            eprintln!("gc initialize done, force_evacuate_all={}", force);
        }
    }

    /// The short stop-the-world window: re-role every region, swap the
    /// allocation stacks, raise the marking flags, flip every thread's roots
    /// to to-space and gray the dirty immune objects.
    fn flip_thread_roots(&self) {
        let heap = self.heap();
        self.with_pause(|cc| {
            heap.region_space
                .set_from_space(&heap.rb_table, cc.force_evacuate_all.get());
            heap.swap_stacks();
            cc.live_stack_freeze_size.set(heap.live_stack().size());
            cc.from_space_bytes_at_first_pause
                .set(heap.region_space.bytes_allocated());
            cc.from_space_objects_at_first_pause
                .set(heap.region_space.objects_allocated());
            cc.is_marking.store(true, Ordering::Relaxed);
            cc.mark_stack_mode
                .store(MarkStackMode::ThreadLocal, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            #[cfg(debug_assertions)]
            heap.region_space.assert_all_region_live_bytes_zero_or_cleared();

            {
                let threads = heap.thread_list.lock();
                for &thread in threads.iter() {
                    unsafe {
                        let t = &*thread;
                        t.is_gc_marking.store(true, Ordering::SeqCst);
                        let (start, cursor, end, objects) = t.tlab();
                        heap.region_space
                            .revoke_thread_local_buffer(start, cursor, end, objects);
                        t.reset_tlab();
                        let mut visitor = MarkingVisitor { cc };
                        t.shadow_stack().walk(|root| root.trace(&mut visitor));
                    }
                }
            }
            {
                let roots = heap.global_roots.lock();
                for &slot in roots.iter() {
                    unsafe {
                        let ref_ = (*slot).load(Ordering::Relaxed);
                        if !ref_.is_null() {
                            (*slot).store(cc.mark(ref_), Ordering::Relaxed);
                        }
                    }
                }
            }
            if RB::USE_BAKER {
                cc.gray_all_dirty_immune_objects();
            }
            cc.is_asserting_to_space_invariant.set(true);
        });
        if VERBOSE {
            eprintln!("gc end of flip_thread_roots");
        }
    }

    /// Gray every immune object on a dirty (or previously dirtied) card so
    /// the concurrent scan updates its out-references. Runs inside the pause.
    fn gray_all_dirty_immune_objects(&self) {
        let heap = self.heap();
        for space in heap.immune_spaces.spaces() {
            unsafe {
                let space = &*space;
                heap.card_table.scan(
                    space.live_bitmap(),
                    space.begin(),
                    space.end(),
                    IMMUNE_GRAY_MIN_CARD_AGE,
                    |obj| {
                        (*obj).set_rb_state(GC_GRAY);
                    },
                );
            }
        }
    }

    fn marking_phase(&self) {
        let heap = self.heap();
        if VERBOSE {
            eprintln!("gc marking phase");
        }
        assert!(self.weak_ref_access_enabled());

        // Update immune-space fields without graying the scanned objects, so
        // clean immune pages stay clean.
        if RB::USE_BAKER {
            self.gc_grays_immune_objects.set(false);
        }
        for space in heap.immune_spaces.spaces() {
            unsafe {
                let space = &*space;
                space
                    .live_bitmap()
                    .visit_marked_range(space.begin(), space.end(), |obj| {
                        if RB::USE_BAKER {
                            if (*obj).rb_state() == GC_GRAY {
                                self.scan_immune_object(obj);
                                let ok = (*obj).atomic_set_rb_state(GC_GRAY, GC_WHITE);
                                assert!(ok, "immune object lost its gray state mid-scan");
                            }
                        } else {
                            self.scan_immune_object(obj);
                        }
                    });
            }
        }
        if RB::USE_BAKER {
            // Publish the field updates before mutators may skip graying, then
            // quiesce threads mid-barrier and whiten what they grayed.
            self.updated_all_immune_objects.store(true, Ordering::Release);
            self.issue_empty_checkpoint();
            let mut stack = self.immune_gray_stack.lock();
            if VERBOSE {
                eprintln!("immune gray stack size={}", stack.len());
            }
            for &obj in stack.iter() {
                unsafe {
                    // Already white if the scan loop got to it first.
                    if (*obj).rb_state() == GC_GRAY {
                        let ok = (*obj).atomic_set_rb_state(GC_GRAY, GC_WHITE);
                        debug_assert!(ok);
                    }
                }
            }
            stack.clear();
        }

        // Concurrent (non-thread) roots.
        {
            let roots = heap.global_roots.lock();
            for &slot in roots.iter() {
                unsafe {
                    let ref_ = (*slot).load(Ordering::Relaxed);
                    if !ref_.is_null() {
                        (*slot).store(self.mark(ref_), Ordering::Relaxed);
                    }
                }
            }
        }

        // Drain in thread-local mode: this marks most of the graph while weak
        // accesses (and hence new gray sources) are still possible.
        self.process_mark_stack();
        // Revoke thread-local stacks and shut off weak-ref access in one
        // checkpoint, then converge again.
        self.switch_to_shared_mark_stack_mode();
        self.process_mark_stack();
        self.check_empty_mark_stack();
        // From here only the collector can produce marks.
        self.switch_to_gc_exclusive_mark_stack_mode();
        self.check_empty_mark_stack();
        if VERBOSE {
            eprintln!("process references");
        }
        heap.reference_processor
            .process_references(self, self.clear_soft_references.get());
        self.check_empty_mark_stack();
        if VERBOSE {
            eprintln!("sweep system weaks");
        }
        heap.system_weaks.sweep(self);
        self.process_mark_stack();
        self.check_empty_mark_stack();
        self.reenable_weak_ref_access();
        self.disable_marking();
        if RB::USE_BAKER {
            self.process_false_gray_stack();
        }
        self.check_empty_mark_stack();
        assert!(self.weak_ref_access_enabled());
        if VERBOSE {
            eprintln!("gc end of marking phase");
        }
    }

    fn reclaim_phase(&self) {
        let heap = self.heap();
        if VERBOSE {
            eprintln!("gc reclaim phase");
        }
        {
            self.is_asserting_to_space_invariant.set(false);
            fence(Ordering::SeqCst);
            self.issue_empty_checkpoint();
            self.is_mark_stack_push_disallowed.store(0, Ordering::SeqCst);
            if RB::USE_BAKER {
                self.updated_all_immune_objects.store(false, Ordering::SeqCst);
            }
            self.check_empty_mark_stack();
        }

        {
            let from_bytes = heap.region_space.bytes_allocated_in_from_space();
            let from_objects = heap.region_space.objects_allocated_in_from_space();
            let unevac_bytes = heap.region_space.bytes_allocated_in_unevac_from_space();
            let unevac_objects = heap.region_space.objects_allocated_in_unevac_from_space();
            let to_bytes = self.bytes_moved.load(Ordering::SeqCst);
            let to_objects = self.objects_moved.load(Ordering::SeqCst);
            debug_assert_eq!(
                self.from_space_objects_at_first_pause.get(),
                from_objects + unevac_objects
            );
            debug_assert_eq!(
                self.from_space_bytes_at_first_pause.get(),
                from_bytes + unevac_bytes
            );
            assert!(to_objects as usize <= from_objects);
            assert!(to_bytes as usize <= from_bytes);
            let freed_bytes = from_bytes as u64 - to_bytes;
            let freed_objects = from_objects as u64 - to_objects;
            if VERBOSE {
                eprintln!(
                    "record free: from_bytes={} from_objects={} to_bytes={} to_objects={} freed_bytes={} freed_objects={}",
                    from_bytes, from_objects, to_bytes, to_objects, freed_bytes, freed_objects
                );
            }
            self.cycle_freed_bytes.set(freed_bytes);
            self.cycle_freed_objects.set(freed_objects);
            let (cleared_bytes, _cleared_objects) = heap.region_space.clear_from_space();
            debug_assert_eq!(cleared_bytes, from_bytes);
            heap.num_bytes_allocated
                .fetch_sub(freed_bytes as usize, Ordering::Relaxed);
        }

        {
            // Objects allocated before the flip live on the (frozen) live
            // stack; mark them so the sweep only frees what was provably
            // unreachable.
            assert!(self.live_stack_freeze_size.get() >= heap.live_stack().size());
            heap.mark_alloc_stack_as_live(heap.live_stack());
            heap.live_stack().reset();
            self.check_empty_mark_stack();

            let (nm_bytes, nm_objects) = heap.non_moving_space.sweep();
            let (los_bytes, los_objects) = heap.large_object_space.sweep();
            self.cycle_freed_bytes
                .set(self.cycle_freed_bytes.get() + (nm_bytes + los_bytes) as u64);
            self.cycle_freed_objects
                .set(self.cycle_freed_objects.get() + (nm_objects + los_objects) as u64);
            heap.num_bytes_allocated
                .fetch_sub(nm_bytes + los_bytes, Ordering::Relaxed);
            unsafe {
                let heap_mut = &mut *self.heap.get();
                heap_mut.non_moving_space.swap_bitmaps();
                heap_mut.large_object_space.swap_bitmaps();
            }
        }

        // Drop the per-cycle region bitmap.
        let bitmap = self.region_space_bitmap.swap(null_mut(), Ordering::Release);
        debug_assert!(!bitmap.is_null());
        unsafe { drop(Box::from_raw(bitmap)) };

        self.check_empty_mark_stack();
        if VERBOSE {
            eprintln!("gc end of reclaim phase");
        }
    }

    fn finish_phase(&self) {
        let heap = self.heap();
        {
            let pools = self.mark_stack_pools.lock();
            assert_eq!(pools.pooled.len(), MARK_STACK_POOL_SIZE);
            assert!(pools.revoked.is_empty());
        }
        heap.reference_processor.assert_queues_empty();
        self.skipped_blocks.lock().clear();
        // The mark bitmaps hold the pre-cycle live sets after the swap; clear
        // them for the next cycle.
        heap.non_moving_space.mark_bitmap().clear_all();
        heap.large_object_space.mark_bitmap().clear_all();

        if self.measure_read_barrier_slow_path {
            let ns = self.rb_slow_path_ns.load(Ordering::Relaxed);
            if ns != 0 {
                self.rb_slow_path_time_histogram.lock().add(ns);
            }
            self.rb_slow_path_count_total
                .fetch_add(self.rb_slow_path_count.load(Ordering::Relaxed), Ordering::Relaxed);
            self.rb_slow_path_count_gc_total.fetch_add(
                self.rb_slow_path_count_gc.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
        }

        self.stats.record_cycle(
            self.bytes_moved.load(Ordering::Relaxed),
            self.objects_moved.load(Ordering::Relaxed),
            self.cycle_freed_bytes.get(),
            self.cycle_freed_objects.get(),
        );
        if VERBOSE || heap.params.verbose {
            let mut out = String::new();
            self.stats.dump(&mut out);
            eprint!("{}", out);
        }
    }

    fn with_pause(&self, f: impl FnOnce(&Self)) {
        let heap = self.heap();
        let start = Instant::now();
        heap.safepoint.begin_pause();
        heap.mutator_lock.lock_exclusive();
        f(self);
        unsafe { heap.mutator_lock.unlock_exclusive() };
        heap.safepoint.end_pause();
        let ns = start.elapsed().as_nanos() as u64;
        self.stats.last_pause_ns.store(ns, Ordering::Relaxed);
        self.pause_histogram.lock().add(ns);
    }

    // ==================================================================
    // Checkpoints and the weak-ref access gate
    // ==================================================================

    fn issue_checkpoint(&self, closure: &dyn CheckpointClosure<RB>) {
        let heap = self.heap();
        self.gc_barrier.init();
        let count = heap.run_checkpoint(closure);
        if count == 0 {
            return;
        }
        // Release the mutator lock while waiting so a mutator blocked on it
        // cannot deadlock the collector.
        unsafe { heap.mutator_lock.unlock_shared() };
        self.gc_barrier.wait_for(count);
        heap.mutator_lock.lock_shared();
    }

    /// Pure quiescence marker: every thread has passed a safepoint once this
    /// returns.
    fn issue_empty_checkpoint(&self) {
        struct EmptyCheckpoint<'a, RB: ReadBarrierPolicy + 'static> {
            cc: &'a ConcurrentCopying<RB>,
        }
        impl<RB: ReadBarrierPolicy> CheckpointClosure<RB> for EmptyCheckpoint<'_, RB> {
            fn run(&self, _thread: &Mutator<RB>) {
                self.cc.gc_barrier.pass();
            }
        }
        self.issue_checkpoint(&EmptyCheckpoint { cc: self });
    }

    fn switch_to_shared_mark_stack_mode(&self) {
        debug_assert!(current_mutator::<RB>().is_null());
        let before = self.mark_stack_mode.load(Ordering::Relaxed);
        assert_eq!(before, MarkStackMode::ThreadLocal);
        self.mark_stack_mode
            .store(MarkStackMode::Shared, Ordering::Relaxed);
        assert!(self.weak_ref_access_enabled.load(Ordering::Relaxed));
        self.weak_ref_access_enabled.store(false, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        // Revoke and process the thread-local stacks one final time, turning
        // off each thread's weak-ref access in the same checkpoint.
        self.process_thread_local_mark_stacks(true);
        if VERBOSE {
            eprintln!("switched to shared mark stack mode, weak ref access disabled");
        }
    }

    fn switch_to_gc_exclusive_mark_stack_mode(&self) {
        debug_assert!(current_mutator::<RB>().is_null());
        let before = self.mark_stack_mode.load(Ordering::Relaxed);
        assert_eq!(before, MarkStackMode::Shared);
        self.mark_stack_mode
            .store(MarkStackMode::GcExclusive, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        if VERBOSE {
            eprintln!("switched to gc exclusive mark stack mode");
        }
    }

    fn reenable_weak_ref_access(&self) {
        let heap = self.heap();
        if VERBOSE {
            eprintln!("reenable weak ref access");
        }
        // For threads attaching from now on.
        self.weak_ref_access_enabled.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        {
            let threads = heap.thread_list.lock();
            for &thread in threads.iter() {
                unsafe {
                    (*thread).weak_ref_access_enabled.store(true, Ordering::SeqCst);
                }
            }
        }
        let _guard = heap.weak_access_lock.lock();
        heap.weak_access_cond.notify_all();
    }

    fn disable_marking(&self) {
        let heap = self.heap();
        self.is_marking.store(false, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        struct DisableMarkingCheckpoint<'a, RB: ReadBarrierPolicy + 'static> {
            cc: &'a ConcurrentCopying<RB>,
        }
        impl<RB: ReadBarrierPolicy> CheckpointClosure<RB> for DisableMarkingCheckpoint<'_, RB> {
            fn run(&self, thread: &Mutator<RB>) {
                // A thread that just attached may already observe false; fine.
                thread.is_gc_marking.store(false, Ordering::SeqCst);
                self.cc.gc_barrier.pass();
            }
        }
        self.issue_checkpoint(&DisableMarkingCheckpoint { cc: self });
        if RB::USE_TABLE_LOOKUP {
            heap.rb_table.clear_all();
            debug_assert!(heap.rb_table.is_all_cleared());
        }
        self.is_mark_stack_push_disallowed.store(1, Ordering::SeqCst);
        self.mark_stack_mode
            .store(MarkStackMode::Off, Ordering::SeqCst);
    }

    fn push_onto_false_gray_stack(&self, obj: *mut HeapObjectHeader) {
        debug_assert!(RB::USE_BAKER);
        self.mark_stack_pools.lock().false_gray.push(obj);
    }

    fn process_false_gray_stack(&self) {
        debug_assert!(RB::USE_BAKER);
        // Objects here lost the bitmap race after a successful whitening CAS
        // by the winner; turn them back white.
        let false_gray = core::mem::take(&mut self.mark_stack_pools.lock().false_gray);
        for obj in false_gray {
            unsafe {
                debug_assert!(!self.is_marked(obj).is_null());
                if (*obj).rb_state() == GC_GRAY {
                    let ok = (*obj).atomic_set_rb_state(GC_GRAY, GC_WHITE);
                    debug_assert!(ok);
                }
            }
        }
    }

    // ==================================================================
    // Mark stack pipeline
    // ==================================================================

    pub(crate) fn push_onto_mark_stack(&self, to_ref: *mut HeapObjectHeader) {
        assert_eq!(
            self.is_mark_stack_push_disallowed.load(Ordering::SeqCst),
            0,
            "mark stack push after marking completed: {:p}",
            to_ref
        );
        let mode = self.mark_stack_mode.load(Ordering::Relaxed);
        match mode {
            MarkStackMode::ThreadLocal => {
                let mutator = current_mutator::<RB>();
                if mutator.is_null() {
                    // The collector pushes straight to the gc mark stack.
                    unsafe {
                        if (*self.gc_mark_stack.get()).is_full() {
                            self.expand_gc_mark_stack();
                        }
                        let ok = (*self.gc_mark_stack.get()).push_back(to_ref);
                        debug_assert!(ok);
                    }
                } else {
                    unsafe { self.push_onto_thread_local_mark_stack(&*mutator, to_ref) };
                }
            }
            MarkStackMode::Shared => {
                let _pools = self.mark_stack_pools.lock();
                unsafe {
                    if (*self.gc_mark_stack.get()).is_full() {
                        self.expand_gc_mark_stack();
                    }
                    let ok = (*self.gc_mark_stack.get()).push_back(to_ref);
                    debug_assert!(ok);
                }
            }
            MarkStackMode::GcExclusive => {
                assert!(
                    current_mutator::<RB>().is_null(),
                    "only the collector may push in the gc exclusive mode"
                );
                unsafe {
                    if (*self.gc_mark_stack.get()).is_full() {
                        self.expand_gc_mark_stack();
                    }
                    let ok = (*self.gc_mark_stack.get()).push_back(to_ref);
                    debug_assert!(ok);
                }
            }
            MarkStackMode::Off => {
                panic!("mark stack push while marking is off: {:p}", to_ref);
            }
        }
    }

    fn push_onto_thread_local_mark_stack(
        &self,
        mutator: &Mutator<RB>,
        to_ref: *mut HeapObjectHeader,
    ) {
        let tl = mutator.tl_mark_stack.get();
        let full = !tl.is_null() && unsafe { (*tl).is_full() };
        if tl.is_null() || full {
            let mut pools = self.mark_stack_pools.lock();
            let new_stack = pools.pooled.pop().unwrap_or_else(|| {
                Box::new(ObjectStack::new(
                    "thread local mark stack",
                    TL_MARK_STACK_CAPACITY,
                ))
            });
            debug_assert!(new_stack.is_empty());
            let ok = new_stack.push_back(to_ref);
            debug_assert!(ok);
            if !tl.is_null() {
                // Retire the full stack for the collector to drain.
                pools.revoked.push(unsafe { Box::from_raw(tl) });
            }
            mutator.tl_mark_stack.set(Box::into_raw(new_stack));
        } else {
            let ok = unsafe { (*tl).push_back(to_ref) };
            debug_assert!(ok);
        }
    }

    /// Mutator detach path: hand the thread's stack to the collector.
    pub(crate) fn revoke_mark_stack(&self, stack: *mut ObjectStack) {
        let mut pools = self.mark_stack_pools.lock();
        pools.revoked.push(unsafe { Box::from_raw(stack) });
    }

    #[cold]
    fn expand_gc_mark_stack(&self) {
        unsafe {
            let stack = &mut *self.gc_mark_stack.get();
            debug_assert!(stack.is_full());
            let new_capacity = stack.capacity() * 2;
            stack.resize(new_capacity);
            debug_assert!(!stack.is_full());
        }
    }

    /// Run a checkpoint that revokes every thread-local mark stack (and
    /// optionally turns off weak-ref access), then drain all the revoked
    /// stacks. Returns how many refs were processed.
    fn process_thread_local_mark_stacks(&self, disable_weak_ref_access: bool) -> usize {
        struct RevokeThreadLocalMarkStackCheckpoint<'a, RB: ReadBarrierPolicy + 'static> {
            cc: &'a ConcurrentCopying<RB>,
            disable_weak_ref_access: bool,
        }
        impl<RB: ReadBarrierPolicy> CheckpointClosure<RB>
            for RevokeThreadLocalMarkStackCheckpoint<'_, RB>
        {
            fn run(&self, thread: &Mutator<RB>) {
                let tl = thread.tl_mark_stack.get();
                if !tl.is_null() {
                    self.cc.revoke_mark_stack(tl);
                    thread.tl_mark_stack.set(null_mut());
                }
                if self.disable_weak_ref_access {
                    thread.weak_ref_access_enabled.store(false, Ordering::SeqCst);
                }
                self.cc.gc_barrier.pass();
            }
        }
        self.issue_checkpoint(&RevokeThreadLocalMarkStackCheckpoint {
            cc: self,
            disable_weak_ref_access,
        });

        let mut count = 0;
        loop {
            let stacks = core::mem::take(&mut self.mark_stack_pools.lock().revoked);
            if stacks.is_empty() {
                break;
            }
            for stack in stacks {
                while let Some(to_ref) = stack.pop_back() {
                    self.process_mark_stack_ref(to_ref);
                    count += 1;
                }
                let mut pools = self.mark_stack_pools.lock();
                if pools.pooled.len() < MARK_STACK_POOL_SIZE {
                    stack.reset();
                    pools.pooled.push(stack);
                }
            }
        }
        count
    }

    /// Drain until the active stack is observed empty twice in a row, which
    /// tolerates the races inherent to the thread-local mode.
    pub(crate) fn process_mark_stack(&self) {
        if VERBOSE {
            eprintln!("process mark stack");
        }
        let mut empty_prev = false;
        loop {
            let empty = self.process_mark_stack_once();
            if empty_prev && empty {
                break;
            }
            empty_prev = empty;
        }
    }

    fn process_mark_stack_once(&self) -> bool {
        debug_assert!(current_mutator::<RB>().is_null());
        let mode = self.mark_stack_mode.load(Ordering::Relaxed);
        let mut count = 0;
        match mode {
            MarkStackMode::ThreadLocal => {
                count += self.process_thread_local_mark_stacks(false);
                unsafe {
                    while let Some(to_ref) = (*self.gc_mark_stack.get()).pop_back() {
                        self.process_mark_stack_ref(to_ref);
                        count += 1;
                    }
                }
            }
            MarkStackMode::Shared => {
                debug_assert!(self.mark_stack_pools.lock().revoked.is_empty());
                loop {
                    let refs: Vec<_> = {
                        let _pools = self.mark_stack_pools.lock();
                        let stack = unsafe { &*self.gc_mark_stack.get() };
                        if stack.is_empty() {
                            break;
                        }
                        let refs = stack.as_slice().to_vec();
                        stack.reset();
                        refs
                    };
                    for to_ref in refs {
                        self.process_mark_stack_ref(to_ref);
                        count += 1;
                    }
                }
            }
            MarkStackMode::GcExclusive | MarkStackMode::Off => {
                debug_assert!(self.mark_stack_pools.lock().revoked.is_empty());
                unsafe {
                    while let Some(to_ref) = (*self.gc_mark_stack.get()).pop_back() {
                        self.process_mark_stack_ref(to_ref);
                        count += 1;
                    }
                }
            }
        }
        count == 0
    }

    fn process_mark_stack_ref(&self, to_ref: *mut HeapObjectHeader) {
        let heap = self.heap();
        debug_assert!(!heap.region_space.is_in_from_space(to_ref.cast()));
        if RB::USE_BAKER {
            debug_assert_eq!(
                unsafe { (*to_ref).rb_state() },
                GC_GRAY,
                "mark stack entry must be gray {}",
                self.dump_object(to_ref)
            );
        }
        self.scan(to_ref);
        if RB::USE_BAKER {
            // A reference object whose referent has not been reached yet
            // stays gray, so the referent load keeps taking the barrier until
            // reference processing resolves it.
            let keep_gray = unsafe {
                (*to_ref).is_reference() && {
                    let referent = *reference_referent_slot(to_ref);
                    !referent.is_null() && self.is_marked(referent).is_null()
                }
            };
            if !keep_gray {
                let ok = unsafe { (*to_ref).atomic_set_rb_state(GC_GRAY, GC_WHITE) };
                debug_assert!(ok, "must succeed as the scan won the race");
            }
        }
        if heap.region_space.is_in_unevac_from_space(to_ref.cast()) {
            debug_assert!(self.region_space_bitmap().test(to_ref.cast()));
            let alloc_size = align_usize(unsafe { (*to_ref).object_size() }, ALIGNMENT);
            heap.region_space.add_live_bytes(to_ref.cast(), alloc_size);
        }
    }

    fn check_empty_mark_stack(&self) {
        let mode = self.mark_stack_mode.load(Ordering::Relaxed);
        if mode == MarkStackMode::ThreadLocal {
            // Quiesce the thread-local stacks first.
            struct RevokeOnly<'a, RB: ReadBarrierPolicy + 'static> {
                cc: &'a ConcurrentCopying<RB>,
            }
            impl<RB: ReadBarrierPolicy> CheckpointClosure<RB> for RevokeOnly<'_, RB> {
                fn run(&self, thread: &Mutator<RB>) {
                    let tl = thread.tl_mark_stack.get();
                    if !tl.is_null() {
                        self.cc.revoke_mark_stack(tl);
                        thread.tl_mark_stack.set(null_mut());
                    }
                    self.cc.gc_barrier.pass();
                }
            }
            self.issue_checkpoint(&RevokeOnly { cc: self });
            let pools = self.mark_stack_pools.lock();
            if !pools.revoked.is_empty() {
                for stack in pools.revoked.iter() {
                    for &obj in stack.as_slice() {
                        eprintln!("on mark queue: {}", self.dump_object(obj));
                    }
                }
                panic!("mark stack is not empty");
            }
        } else {
            let pools = self.mark_stack_pools.lock();
            assert!(unsafe { (*self.gc_mark_stack.get()).is_empty() });
            assert!(pools.revoked.is_empty());
        }
    }

    // ==================================================================
    // Marking and the copy/forward engine
    // ==================================================================

    /// Universal entry for both the read barrier and field scanning: returns
    /// the forwarded (or in-place marked) version of `from_ref`.
    pub(crate) fn mark(&self, from_ref: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
        if from_ref.is_null() {
            return from_ref;
        }
        let heap = self.heap();
        match heap.region_space.region_type(from_ref.cast()) {
            RegionType::ToSpace => from_ref,
            RegionType::FromSpace => unsafe {
                let fwd = (*from_ref).forwarding_address();
                if !fwd.is_null() {
                    fwd
                } else {
                    self.copy(from_ref)
                }
            },
            RegionType::UnevacFromSpace => {
                if !self.region_space_bitmap().atomic_test_and_set(from_ref.cast()) {
                    // Newly marked in place.
                    if RB::USE_BAKER {
                        let ok = unsafe { (*from_ref).atomic_set_rb_state(GC_WHITE, GC_GRAY) };
                        debug_assert!(ok, "bitmap winner must win the gray race");
                    }
                    self.push_onto_mark_stack(from_ref);
                }
                from_ref
            }
            RegionType::None => {
                if heap.immune_spaces.contains_object(from_ref) {
                    self.mark_immune(from_ref)
                } else {
                    self.mark_non_moving(from_ref)
                }
            }
        }
    }

    fn mark_immune(&self, ref_: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
        if RB::USE_BAKER && !self.updated_all_immune_objects.load(Ordering::Acquire) {
            // While immune fields may still be stale, gray the object so its
            // loads keep hitting the barrier; the collector whitens it after
            // the immune scan has been published.
            let on_gc_thread = current_mutator::<RB>().is_null();
            if on_gc_thread && !self.gc_grays_immune_objects.get() {
                return ref_;
            }
            if unsafe { (*ref_).atomic_set_rb_state(GC_WHITE, GC_GRAY) } {
                self.immune_gray_stack.lock().push(ref_);
            }
        }
        ref_
    }

    fn mark_non_moving(&self, ref_: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
        let heap = self.heap();
        debug_assert!(!heap.region_space.has_address(ref_.cast()));
        debug_assert!(!heap.immune_spaces.contains_object(ref_));
        let is_los = !heap.non_moving_space.has_address(ref_.cast());
        if is_los {
            assert!(
                heap.large_object_space.has_address(ref_.cast()),
                "marked reference outside every space: {}",
                self.dump_object(ref_)
            );
        }

        let already_marked = if is_los {
            heap.large_object_space.mark_bitmap().test(ref_.cast())
        } else {
            heap.non_moving_space.mark_bitmap().test(ref_.cast())
        };
        if already_marked {
            if RB::USE_BAKER {
                debug_assert!(unsafe { (*ref_).rb_state() } <= GC_GRAY);
            }
            return ref_;
        }

        if heap.is_on_alloc_stack(ref_) {
            // Allocated since the flip: live by construction, stays white.
            if RB::USE_BAKER {
                debug_assert_eq!(unsafe { (*ref_).rb_state() }, GC_WHITE);
            }
            return ref_;
        }

        // Reduce the false-gray window by re-testing the bitmap before the
        // color CAS.
        if RB::USE_BAKER {
            let marked = if is_los {
                heap.large_object_space.mark_bitmap().test(ref_.cast())
            } else {
                heap.non_moving_space.mark_bitmap().test(ref_.cast())
            };
            if marked {
                return ref_;
            }
        }
        let cas_success = RB::USE_BAKER && unsafe { (*ref_).atomic_set_rb_state(GC_WHITE, GC_GRAY) };
        let lost_bitmap_race = if is_los {
            heap.large_object_space.mark_bitmap().atomic_test_and_set(ref_.cast())
        } else {
            heap.non_moving_space.mark_bitmap().atomic_test_and_set(ref_.cast())
        };
        if lost_bitmap_race {
            if RB::USE_BAKER && cas_success && unsafe { (*ref_).rb_state() } == GC_GRAY {
                // We grayed it but someone else owns the mark; let the end of
                // marking whiten it.
                self.push_onto_false_gray_stack(ref_);
            }
        } else {
            if RB::USE_BAKER {
                debug_assert_eq!(unsafe { (*ref_).rb_state() }, GC_GRAY);
            }
            self.push_onto_mark_stack(ref_);
        }
        ref_
    }

    /// Evacuate `from_ref` into to-space (or its fallbacks) and install the
    /// forwarding pointer. Exactly one caller wins the lock-word CAS; losers
    /// recycle their copy and adopt the winner's.
    unsafe fn copy(&self, from_ref: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
        let heap = self.heap();
        debug_assert!(heap.region_space.is_in_from_space(from_ref.cast()));
        // Reading the size from a from-space object is fine: the body stays
        // intact until the regions are cleared.
        let obj_size = (*from_ref).object_size();
        let alloc_size = align_usize(obj_size, ALIGNMENT);

        let mut region_bytes_allocated = 0usize;
        let mut to: *mut u8 =
            heap.region_space
                .alloc_nonvirtual(alloc_size, &mut region_bytes_allocated, true);
        let mut bytes_allocated = region_bytes_allocated;
        let mut fall_back_to_non_moving = false;
        if to.is_null() {
            // To-space exhausted; reuse a block lost to an earlier race.
            to = self.allocate_in_skipped_block(alloc_size);
            if !to.is_null() {
                bytes_allocated = alloc_size;
                heap.region_space.record_alloc(to);
            } else {
                fall_back_to_non_moving = true;
                if VERBOSE {
                    eprintln!(
                        "out of memory in the to-space; falling back to non-moving, skipped_bytes={} skipped_objects={}",
                        self.to_space_bytes_skipped.load(Ordering::SeqCst),
                        self.to_space_objects_skipped.load(Ordering::SeqCst)
                    );
                }
                let mut nm_bytes_allocated = 0usize;
                to = heap.non_moving_space.alloc(alloc_size, &mut nm_bytes_allocated);
                assert!(!to.is_null(), "fall-back non-moving space allocation failed");
                bytes_allocated = nm_bytes_allocated;
                let already = heap.non_moving_space.mark_bitmap().atomic_test_and_set(to);
                assert!(!already, "fresh non-moving copy already marked");
            }
        }
        debug_assert!(!to.is_null());
        let to_ref = to.cast::<HeapObjectHeader>();

        // Attempt to install the forwarding pointer; the lock word CAS can
        // fail both to racing copiers and to hash/monitor installation.
        loop {
            core::ptr::copy_nonoverlapping(from_ref.cast::<u8>(), to, obj_size);

            let old_lock_word = (*to_ref).lock_word();
            if old_lock_word.is_forwarding_address() {
                // Lost the race. Turn the dead copy into a walkable dummy
                // object and keep the memory for reuse.
                self.fill_with_dummy_object(to, bytes_allocated);
                if !fall_back_to_non_moving {
                    debug_assert!(heap.region_space.is_in_to_space(to));
                    if bytes_allocated > REGION_SIZE {
                        heap.region_space.free_large(to, bytes_allocated);
                    } else {
                        self.to_space_bytes_skipped
                            .fetch_add(bytes_allocated as u64, Ordering::SeqCst);
                        self.to_space_objects_skipped.fetch_add(1, Ordering::SeqCst);
                        self.skipped_blocks
                            .lock()
                            .entry(bytes_allocated)
                            .or_default()
                            .push(to);
                    }
                } else {
                    debug_assert!(heap.non_moving_space.has_address(to));
                    let was_marked = heap.non_moving_space.mark_bitmap().clear(to);
                    debug_assert!(was_marked);
                    heap.non_moving_space.free(to);
                }
                let winner = old_lock_word.forwarding_address() as *mut HeapObjectHeader;
                assert!(!winner.is_null());
                assert!(winner != to_ref);
                debug_assert!(
                    heap.region_space.is_in_to_space(winner.cast())
                        || heap.non_moving_space.has_address(winner.cast())
                );
                debug_assert!(!(*winner).lock_word().is_forwarding_address());
                return winner;
            }

            // The gray bit goes on before the forwarding pointer becomes
            // visible, otherwise a mutator could see a white to-space object
            // with unscanned fields.
            if RB::USE_BAKER {
                (*to_ref).set_rb_state(GC_GRAY);
            }

            let new_lock_word = LockWord::from_forwarding_address(to_ref as usize);
            if (*from_ref).cas_lock_word_weak(old_lock_word, new_lock_word) {
                self.objects_moved.fetch_add(1, Ordering::SeqCst);
                self.bytes_moved
                    .fetch_add(alloc_size as u64, Ordering::SeqCst);
                if RB::USE_BAKER {
                    debug_assert_eq!((*to_ref).rb_state(), GC_GRAY);
                }
                debug_assert_eq!((*from_ref).forwarding_address(), to_ref);
                debug_assert!(!(*to_ref).lock_word().is_forwarding_address());
                self.push_onto_mark_stack(to_ref);
                return to_ref;
            }
            // CAS failed: either the forwarding pointer appeared (handled at
            // the top of the loop) or the lock word changed under us; retry.
        }
    }

    /// Reuse a to-space block lost to a CAS race. The remainder of an
    /// oversized block must itself be able to hold a dummy object.
    fn allocate_in_skipped_block(&self, alloc_size: usize) -> *mut u8 {
        debug_assert!(alloc_size % ALIGNMENT == 0);
        let min_object = min_object_size();
        let (addr, byte_size) = {
            let mut map = self.skipped_blocks.lock();
            let candidate = map.range(alloc_size..).next().map(|(&size, _)| size);
            let chosen = match candidate {
                None => return null_mut(),
                Some(size) if size > alloc_size && size < alloc_size + min_object => {
                    // The remainder would be too small for a dummy object;
                    // look for a strictly larger block.
                    match map
                        .range(alloc_size + min_object..)
                        .next()
                        .map(|(&size, _)| size)
                    {
                        None => return null_mut(),
                        Some(size) => size,
                    }
                }
                Some(size) => size,
            };
            let blocks = map.get_mut(&chosen).unwrap();
            let addr = blocks.pop().unwrap();
            if blocks.is_empty() {
                map.remove(&chosen);
            }
            (addr, chosen)
        };
        debug_assert!(byte_size >= alloc_size);
        debug_assert!(self.heap().region_space.is_in_to_space(addr));
        if VERBOSE {
            eprintln!("reusing skipped bytes: {:p}, {}", addr, byte_size);
        }
        unsafe {
            core::ptr::write_bytes(addr, 0, byte_size);
        }
        if byte_size > alloc_size {
            debug_assert!(byte_size - alloc_size >= min_object);
            // Fill outside the lock: the dummy fill itself must be free to
            // recurse into marking.
            unsafe {
                self.fill_with_dummy_object(addr.add(alloc_size), byte_size - alloc_size);
            }
            self.skipped_blocks
                .lock()
                .entry(byte_size - alloc_size)
                .or_default()
                .push(unsafe { addr.add(alloc_size) });
        }
        addr
    }

    /// Write a valid dead object over `[addr, addr + byte_size)` so the
    /// region stays walkable: an int array body, or a bare unit-typed header
    /// when the hole is too small for an array.
    unsafe fn fill_with_dummy_object(&self, addr: *mut u8, byte_size: usize) {
        debug_assert!(byte_size % ALIGNMENT == 0);
        debug_assert!(byte_size >= min_object_size());
        core::ptr::write_bytes(addr, 0, byte_size);
        let hdr = addr.cast::<HeapObjectHeader>();
        if byte_size < int_array_byte_size(0) {
            debug_assert_eq!(byte_size, min_object_size());
            hdr.write(HeapObjectHeader::new(vtable_of::<()>(), small_type_id::<()>()));
            (*hdr).set_size(byte_size);
        } else {
            let length = (byte_size - int_array_byte_size(0)) / core::mem::size_of::<i32>();
            hdr.write(HeapObjectHeader::new(
                vtable_of::<Array<i32>>(),
                small_type_id::<Array<i32>>(),
            ));
            (*hdr).set_size(byte_size);
            ((*hdr).data() as *mut Array<i32>).write(Array::uninit(length));
            debug_assert_eq!((*hdr).object_size(), byte_size);
        }
    }

    fn scan_immune_object(&self, obj: *mut HeapObjectHeader) {
        debug_assert!(self.heap().immune_spaces.contains_object(obj));
        self.scan(obj);
    }

    /// Visit every reference field of `to_ref` through [`Self::mark`],
    /// forwarding the slots in place.
    fn scan(&self, to_ref: *mut HeapObjectHeader) {
        let mut visitor = MarkingVisitor { cc: self };
        unsafe {
            (*to_ref).get_dyn().trace(&mut visitor);
            if (*to_ref).is_reference() {
                self.heap()
                    .reference_processor
                    .delay_reference_referent(to_ref, self);
            }
        }
    }

    // ==================================================================
    // Queries used by the reference processor, sweeps and barriers
    // ==================================================================

    /// Liveness query that never copies: returns the forwarded address when
    /// one exists, the object itself when it is live in place, or null.
    pub(crate) fn is_marked(&self, from_ref: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
        debug_assert!(!from_ref.is_null());
        let heap = self.heap();
        match heap.region_space.region_type(from_ref.cast()) {
            RegionType::ToSpace => from_ref,
            RegionType::FromSpace => unsafe { (*from_ref).forwarding_address() },
            RegionType::UnevacFromSpace => {
                if self.region_space_bitmap().test(from_ref.cast()) {
                    from_ref
                } else {
                    null_mut()
                }
            }
            RegionType::None => {
                if heap.immune_spaces.contains_object(from_ref) {
                    return from_ref;
                }
                let marked = if heap.non_moving_space.has_address(from_ref.cast()) {
                    heap.non_moving_space.mark_bitmap().test(from_ref.cast())
                } else if heap.large_object_space.has_address(from_ref.cast()) {
                    heap.large_object_space.mark_bitmap().test(from_ref.cast())
                } else {
                    panic!("liveness query outside every space: {:p}", from_ref);
                };
                if marked || heap.is_on_alloc_stack(from_ref) {
                    from_ref
                } else {
                    null_mut()
                }
            }
        }
    }

    /// Destructively forward `*slot` if a copy exists; returns liveness.
    pub(crate) fn is_marked_heap_reference(&self, slot: *mut *mut HeapObjectHeader) -> bool {
        let from_ref = unsafe { *slot };
        if from_ref.is_null() {
            return false;
        }
        let to_ref = self.is_marked(from_ref);
        if to_ref.is_null() {
            return false;
        }
        if to_ref != from_ref {
            fence(Ordering::Release);
            unsafe { *slot = to_ref };
            fence(Ordering::SeqCst);
        }
        true
    }

    /// Read barrier slow path entry; optionally measured.
    pub(crate) fn mark_from_read_barrier(
        &self,
        from_ref: *mut HeapObjectHeader,
    ) -> *mut HeapObjectHeader {
        if !self.measure_read_barrier_slow_path {
            return self.mark(from_ref);
        }
        if current_mutator::<RB>().is_null() {
            self.rb_slow_path_count_gc.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rb_slow_path_count.fetch_add(1, Ordering::Relaxed);
        }
        let start = Instant::now();
        let ret = self.mark(from_ref);
        self.rb_slow_path_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        ret
    }

    // ==================================================================
    // Verification
    // ==================================================================

    /// Paused debug sweep asserting that nothing reachable still points into
    /// from-space and that no scanned object stayed gray.
    fn verify_no_from_space_references(&self) {
        let heap = self.heap();
        debug_assert!(current_mutator::<RB>().is_null());
        {
            let threads = heap.thread_list.lock();
            for &thread in threads.iter() {
                unsafe {
                    let mut visitor = VerifyVisitor { cc: self };
                    (*thread)
                        .shadow_stack()
                        .walk(|root| root.trace(&mut visitor));
                }
            }
        }
        {
            let roots = heap.global_roots.lock();
            for &slot in roots.iter() {
                unsafe {
                    let ref_ = (*slot).load(Ordering::Relaxed);
                    if !ref_.is_null() {
                        self.verify_ref(ref_);
                    }
                }
            }
        }
        heap.region_space
            .walk_regions(RegionType::ToSpace, |obj| self.verify_object(obj));
        let rb_bitmap = self.region_space_bitmap();
        heap.region_space.walk_regions(RegionType::UnevacFromSpace, |obj| {
            if rb_bitmap.test(obj.cast()) {
                self.verify_object(obj);
            }
        });
        heap.non_moving_space.mark_bitmap().visit_marked_range(
            heap.non_moving_space.begin(),
            heap.non_moving_space.end(),
            |obj| self.verify_object(obj),
        );
        for space in heap.immune_spaces.spaces() {
            unsafe {
                let space = &*space;
                space
                    .live_bitmap()
                    .visit_marked_range(space.begin(), space.end(), |obj| self.verify_object(obj));
            }
        }
        for &obj in heap.allocation_stack().as_slice() {
            self.verify_object(obj);
        }
    }

    fn verify_object(&self, obj: *mut HeapObjectHeader) {
        if RB::USE_BAKER {
            assert_ne!(
                unsafe { (*obj).rb_state() },
                GC_GRAY,
                "object left gray after marking: {}",
                self.dump_object(obj)
            );
        }
        let mut visitor = VerifyVisitor { cc: self };
        unsafe { (*obj).get_dyn().trace(&mut visitor) };
    }

    fn verify_ref(&self, ref_: *mut HeapObjectHeader) {
        assert!(
            !self.heap().region_space.is_in_from_space(ref_.cast()),
            "from-space reference survived marking: {}",
            self.dump_object(ref_)
        );
    }

    fn dump_object(&self, obj: *mut HeapObjectHeader) -> String {
        use std::fmt::Write;
        let heap = self.heap();
        let mut out = String::new();
        let _ = write!(
            out,
            "{:p} region_type={:?} lock_word={:#x}",
            obj,
            heap.region_space.region_type(obj.cast()),
            unsafe { (*obj).lock_word().as_u64() },
        );
        if RB::USE_BAKER {
            let _ = write!(out, " rb_state={}", unsafe { (*obj).rb_state() });
        }
        let _ = writeln!(out);
        heap.region_space.dump_non_free_regions(&mut out);
        out
    }

    pub(crate) fn dump_performance_info(&self, out: &mut String) {
        use std::fmt::Write;
        self.stats.dump(out);
        {
            let pauses = self.pause_histogram.lock();
            if pauses.sample_size() > 0 {
                pauses.dump(out);
            }
        }
        if self.measure_read_barrier_slow_path {
            let histogram = self.rb_slow_path_time_histogram.lock();
            if histogram.sample_size() > 0 {
                histogram.dump(out);
            }
            let total = self.rb_slow_path_count_total.load(Ordering::Relaxed);
            let total_gc = self.rb_slow_path_count_gc_total.load(Ordering::Relaxed);
            if total > 0 {
                let _ = writeln!(out, "slow path count {}", total);
            }
            if total_gc > 0 {
                let _ = writeln!(out, "gc slow path count {}", total_gc);
            }
        }
    }

    pub(crate) fn to_space_bytes_skipped(&self) -> u64 {
        self.to_space_bytes_skipped.load(Ordering::SeqCst)
    }

    pub(crate) fn to_space_objects_skipped(&self) -> u64 {
        self.to_space_objects_skipped.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn test_recycle_block(&self, addr: *mut u8, byte_size: usize) {
        self.skipped_blocks
            .lock()
            .entry(byte_size)
            .or_default()
            .push(addr);
    }

    #[cfg(test)]
    pub(crate) fn test_allocate_in_skipped_block(&self, alloc_size: usize) -> *mut u8 {
        self.allocate_in_skipped_block(alloc_size)
    }

    #[cfg(test)]
    pub(crate) fn test_fill_with_dummy_object(&self, addr: *mut u8, byte_size: usize) {
        unsafe { self.fill_with_dummy_object(addr, byte_size) }
    }

    #[cfg(test)]
    pub(crate) fn test_clear_skipped_blocks(&self) {
        self.skipped_blocks.lock().clear();
    }
}

/// Marks and forwards every visited slot; used for thread roots at the flip
/// and for field scans.
struct MarkingVisitor<'a, RB: ReadBarrierPolicy + 'static> {
    cc: &'a ConcurrentCopying<RB>,
}

impl<RB: ReadBarrierPolicy> Visitor for MarkingVisitor<'_, RB> {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        let ref_ = root.as_ptr();
        let to_ref = self.cc.mark(ref_);
        if to_ref != ref_ {
            debug_assert!(!to_ref.is_null());
            *root = unsafe { NonNull::new_unchecked(to_ref) };
        }
    }
}

struct VerifyVisitor<'a, RB: ReadBarrierPolicy + 'static> {
    cc: &'a ConcurrentCopying<RB>,
}

impl<RB: ReadBarrierPolicy> Visitor for VerifyVisitor<'_, RB> {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        self.cc.verify_ref(root.as_ptr());
    }
}
