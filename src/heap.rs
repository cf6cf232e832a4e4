#[allow(unused_imports)]
use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::RawRwLock;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::api::{small_type_id, vtable_of, Collectable, Gc};
use crate::card_table::CardTable;
use crate::checkpoint::CollectionBarrier;
use crate::concurrent_copying::ConcurrentCopying;
use crate::header::{HeapObjectHeader, MIN_ALLOCATION};
use crate::immune_space::{ImmuneSpace, ImmuneSpaces};
use crate::large_space::LargeObjectSpace;
use crate::mutator::{CheckpointClosure, Mutator, MutatorRef, ThreadState};
use crate::nonmoving_space::NonMovingSpace;
use crate::object_stack::ObjectStack;
use crate::read_barrier::ReadBarrierPolicy;
use crate::rb_table::ReadBarrierTable;
use crate::reference_processor::{ReferenceProcessor, SystemWeakHandle, SystemWeakRegistry};
use crate::region_space::RegionSpace;
use crate::safepoint::GlobalSafepoint;
use crate::utils::align_usize;

/// Why a cycle was started. Explicit and native-pressure cycles evacuate
/// every region; background and allocation-failure cycles follow the
/// per-region live estimate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcCause {
    Background,
    Explicit,
    ForAllocFailure,
    ForNativeAlloc,
}

pub(crate) enum GcTask {
    Collect { cause: GcCause, clear_soft: bool },
    Shutdown,
}

#[derive(Clone, Copy)]
pub struct HeapParams {
    pub region_space_capacity: usize,
    pub non_moving_capacity: usize,
    pub large_space_capacity: usize,
    pub immune_space_capacity: usize,
    /// Allocations above this (but at most one region) go to the large
    /// object space.
    pub large_object_threshold: usize,
    pub allocation_stack_capacity: usize,
    /// Request a concurrent cycle once this many bytes are allocated.
    pub background_gc_watermark: usize,
    pub verbose: bool,
    pub measure_read_barrier_slow_path: bool,
    /// Run the paused no-from-space-references sweep after marking.
    pub verify_no_from_space_refs: bool,
}

impl Default for HeapParams {
    fn default() -> Self {
        Self {
            region_space_capacity: 64 * 1024 * 1024,
            non_moving_capacity: 16 * 1024 * 1024,
            large_space_capacity: 32 * 1024 * 1024,
            immune_space_capacity: 8 * 1024 * 1024,
            large_object_threshold: 128 * 1024,
            allocation_stack_capacity: 512 * 1024,
            background_gc_watermark: 48 * 1024 * 1024,
            verbose: false,
            measure_read_barrier_slow_path: false,
            verify_no_from_space_refs: cfg!(debug_assertions),
        }
    }
}

/// Process-wide heap state: every space, the barrier tables, the mutator
/// registry and the collector with its dedicated thread. Created by
/// [`instantiate_heap`]; torn down when the last mutator detaches.
pub struct Heap<RB: ReadBarrierPolicy + 'static> {
    pub(crate) params: HeapParams,

    pub(crate) region_space: RegionSpace,
    pub(crate) non_moving_space: NonMovingSpace,
    pub(crate) large_object_space: LargeObjectSpace,
    pub(crate) boot_image_space: ImmuneSpace,
    pub(crate) immune_spaces: ImmuneSpaces,

    pub(crate) card_table: CardTable,
    pub(crate) rb_table: ReadBarrierTable,

    allocation_stack: UnsafeCell<ObjectStack>,
    live_stack: UnsafeCell<ObjectStack>,

    /// "May the world run": mutators hold it shared while executing managed
    /// code, the collector holds it shared during concurrent phases and
    /// exclusively during the flip and verification pauses.
    pub(crate) mutator_lock: RawRwLock,
    pub(crate) safepoint: GlobalSafepoint,
    pub(crate) thread_list: Mutex<Vec<*mut Mutator<RB>>>,

    pub(crate) collection_barrier: CollectionBarrier,
    pub(crate) weak_access_lock: Mutex<()>,
    pub(crate) weak_access_cond: Condvar,

    pub(crate) reference_processor: ReferenceProcessor,
    pub(crate) system_weaks: SystemWeakRegistry,
    pub(crate) global_roots: Mutex<Vec<*mut AtomicPtr<HeapObjectHeader>>>,

    pub(crate) collector: ConcurrentCopying<RB>,
    pub(crate) num_bytes_allocated: AtomicUsize,

    gc_request_snd: flume::Sender<GcTask>,
    collector_thread: UnsafeCell<Option<std::thread::JoinHandle<()>>>,
}

unsafe impl<RB: ReadBarrierPolicy> Send for Heap<RB> {}
unsafe impl<RB: ReadBarrierPolicy> Sync for Heap<RB> {}

struct HeapPtr<RB: ReadBarrierPolicy + 'static>(*mut Heap<RB>);
unsafe impl<RB: ReadBarrierPolicy> Send for HeapPtr<RB> {}

/// Create a heap and attach the calling thread as its first mutator.
pub fn instantiate_heap<RB: ReadBarrierPolicy>(params: HeapParams) -> MutatorRef<RB> {
    let (gc_request_snd, gc_request_rcv) = flume::unbounded();

    let region_space = RegionSpace::new(params.region_space_capacity);
    let rb_table = ReadBarrierTable::new(region_space.begin(), region_space.capacity());
    let boot_image_space = ImmuneSpace::new(params.immune_space_capacity);
    let card_table = CardTable::new(boot_image_space.begin(), boot_image_space.capacity());

    let heap: Arc<UnsafeCell<Heap<RB>>> = Arc::new(UnsafeCell::new(Heap {
        region_space,
        non_moving_space: NonMovingSpace::new(1024 * 1024, params.non_moving_capacity),
        large_object_space: LargeObjectSpace::new(params.large_space_capacity),
        boot_image_space,
        immune_spaces: ImmuneSpaces::new(),
        card_table,
        rb_table,
        allocation_stack: UnsafeCell::new(ObjectStack::new(
            "allocation stack",
            params.allocation_stack_capacity,
        )),
        live_stack: UnsafeCell::new(ObjectStack::new(
            "live stack",
            params.allocation_stack_capacity,
        )),
        mutator_lock: RawRwLock::INIT,
        safepoint: GlobalSafepoint::new(),
        thread_list: Mutex::new(Vec::new()),
        collection_barrier: CollectionBarrier::new(),
        weak_access_lock: Mutex::new(()),
        weak_access_cond: Condvar::new(),
        reference_processor: ReferenceProcessor::new(),
        system_weaks: SystemWeakRegistry::new(),
        global_roots: Mutex::new(Vec::new()),
        collector: ConcurrentCopying::new(params),
        num_bytes_allocated: AtomicUsize::new(0),
        gc_request_snd,
        collector_thread: UnsafeCell::new(None),
        params,
    }));

    unsafe {
        let h = heap.get();
        (*h).non_moving_space.install_morecore();
        let boot = &mut (*h).boot_image_space as *mut ImmuneSpace;
        (*h).immune_spaces.add_space(boot);
        (*h).collector.bind_heap(h);

        let ptr = HeapPtr(h);
        let handle = std::thread::Builder::new()
            .name("quasar collector".into())
            .spawn(move || {
                let heap = ptr;
                collector_loop(heap.0, gc_request_rcv);
            })
            .expect("failed to spawn the collector thread");
        *(*h).collector_thread.get() = Some(handle);
    }

    let mut mutator = MutatorRef::new(Mutator::new(
        heap,
        Arc::new(crate::mutator::JoinDataInternal::new()),
    ));
    mutator.attach();
    mutator
}

fn collector_loop<RB: ReadBarrierPolicy>(heap: *mut Heap<RB>, rcv: flume::Receiver<GcTask>) {
    loop {
        match rcv.recv() {
            Ok(GcTask::Collect { cause, clear_soft }) => unsafe {
                (*heap).collector.run_phases(cause, clear_soft);
                (*heap).collection_barrier.notify_cycle_finished();
            },
            Ok(GcTask::Shutdown) | Err(_) => break,
        }
    }
}

impl<RB: ReadBarrierPolicy> Heap<RB> {
    #[inline]
    pub(crate) fn allocation_stack(&self) -> &ObjectStack {
        unsafe { &*self.allocation_stack.get() }
    }

    #[inline]
    pub(crate) fn live_stack(&self) -> &ObjectStack {
        unsafe { &*self.live_stack.get() }
    }

    /// Swap the allocation and live stacks. Only inside the flip pause.
    pub(crate) fn swap_stacks(&self) {
        unsafe {
            core::mem::swap(&mut *self.allocation_stack.get(), &mut *self.live_stack.get());
        }
    }

    #[inline]
    pub(crate) fn is_on_alloc_stack(&self, obj: *const HeapObjectHeader) -> bool {
        std::sync::atomic::fence(Ordering::Acquire);
        self.allocation_stack().contains(obj)
    }

    /// Mark every object recorded on `stack` live in its space bitmap, so the
    /// following sweep only frees objects that existed at the flip and were
    /// never reached.
    pub(crate) fn mark_alloc_stack_as_live(&self, stack: &ObjectStack) {
        for &obj in stack.as_slice() {
            let addr = obj as *const u8;
            if self.non_moving_space.has_address(addr) {
                self.non_moving_space.live_bitmap().set(addr);
            } else if self.large_object_space.has_address(addr) {
                self.large_object_space.live_bitmap().set(addr);
            }
            // Region and immune space objects are tracked by their region or
            // never reclaimed.
        }
    }

    /// Run `closure` on every mutator: queued for running threads (they pass
    /// the collector's barrier at their next safepoint), executed on the spot
    /// on behalf of threads in a safe region. Returns the number of threads
    /// that ran or will run it.
    pub(crate) fn run_checkpoint(&self, closure: &dyn CheckpointClosure<RB>) -> usize {
        use parking_lot::lock_api::RawMutex as _;
        let threads = self.thread_list.lock();
        let mut count = 0;
        for &thread in threads.iter() {
            unsafe {
                let t = &*thread;
                t.checkpoint_lock.lock();
                if t.state.load(Ordering::Acquire) == ThreadState::Unsafe {
                    t.pending_checkpoint.set(Some(closure as *const _));
                    t.has_pending_checkpoint.store(true, Ordering::Release);
                } else {
                    closure.run(t);
                }
                count += 1;
                t.checkpoint_lock.unlock();
            }
        }
        count
    }

    pub(crate) fn send_gc_request(&self, cause: GcCause, clear_soft: bool) {
        let _ = self.gc_request_snd.send(GcTask::Collect { cause, clear_soft });
    }

    pub(crate) fn should_trigger_background_gc(&self) -> bool {
        self.num_bytes_allocated.load(Ordering::Relaxed) >= self.params.background_gc_watermark
            && !self.collection_barrier.was_gc_requested()
            && !self.collector.is_active()
    }

    pub(crate) fn request_background_gc(&self) {
        if self.collection_barrier.request_gc() {
            self.send_gc_request(GcCause::Background, false);
        }
    }

    pub(crate) fn maybe_shutdown_collector(&self) {
        if self.safepoint.mutator_count() != 0 {
            return;
        }
        let _ = self.gc_request_snd.send(GcTask::Shutdown);
        unsafe {
            if let Some(handle) = (*self.collector_thread.get()).take() {
                let _ = handle.join();
            }
        }
    }

    /// Allocate an object in the immune boot space. Never moved, never
    /// reclaimed; scanned (and possibly temporarily grayed) by cycles.
    pub(crate) fn allocate_immune<T: Collectable + Sized + 'static>(&self, value: T) -> Gc<T> {
        let size = align_usize(
            value.allocation_size() + core::mem::size_of::<HeapObjectHeader>(),
            MIN_ALLOCATION,
        );
        let mem = self.boot_image_space.alloc(size);
        if mem.is_null() {
            crate::mutator::oom_abort();
        }
        unsafe {
            let hdr = mem.cast::<HeapObjectHeader>();
            hdr.write(HeapObjectHeader::new(vtable_of::<T>(), small_type_id::<T>()));
            (*hdr).set_size(size);
            ((*hdr).data() as *mut T).write(value);
            Gc::from_header(hdr)
        }
    }
}

/// A registered process-wide strong root. The slot is visited by every
/// cycle's root pass; reads go through the barrier while marking is on.
pub struct GlobalRoot<T: Collectable + ?Sized, RB: ReadBarrierPolicy + 'static> {
    slot: *mut AtomicPtr<HeapObjectHeader>,
    heap: Arc<UnsafeCell<Heap<RB>>>,
    marker: PhantomData<T>,
}

unsafe impl<T: Collectable + ?Sized, RB: ReadBarrierPolicy> Send for GlobalRoot<T, RB> {}
unsafe impl<T: Collectable + ?Sized, RB: ReadBarrierPolicy> Sync for GlobalRoot<T, RB> {}

impl<T: Collectable + ?Sized, RB: ReadBarrierPolicy> GlobalRoot<T, RB> {
    pub fn get(&self, mutator: &Mutator<RB>) -> Gc<T> {
        unsafe {
            let ref_ = (*self.slot).load(Ordering::Acquire);
            if mutator.is_gc_marking.load(Ordering::Relaxed) {
                let heap = &*self.heap.get();
                let to = heap.collector.mark_from_read_barrier(ref_);
                (*self.slot).store(to, Ordering::Release);
                return Gc::from_header(to);
            }
            Gc::from_header(ref_)
        }
    }
}

impl<T: Collectable + ?Sized, RB: ReadBarrierPolicy> Drop for GlobalRoot<T, RB> {
    fn drop(&mut self) {
        unsafe {
            let heap = &*self.heap.get();
            let mut roots = heap.global_roots.lock();
            roots.retain(|&s| s != self.slot);
            drop(Box::from_raw(self.slot));
        }
    }
}

impl<RB: ReadBarrierPolicy> Mutator<RB> {
    /// Allocate into the immune boot space.
    pub fn allocate_immune<T: Collectable + Sized + 'static>(&self, value: T) -> Gc<T> {
        self.heap_ref().allocate_immune(value)
    }

    /// Register a process-wide strong root holding `obj`.
    pub fn new_global_root<T: Collectable + Sized + 'static>(
        &self,
        obj: Gc<T>,
    ) -> GlobalRoot<T, RB> {
        let slot = Box::into_raw(Box::new(AtomicPtr::new(obj.base.as_ptr())));
        self.heap_ref().global_roots.lock().push(slot);
        GlobalRoot {
            slot,
            heap: self.heap.clone(),
            marker: PhantomData,
        }
    }

    /// Register a system-weak entry (an intern-table style slot).
    pub fn register_system_weak<T: Collectable + Sized + 'static>(
        &self,
        obj: Gc<T>,
    ) -> SystemWeakHandle {
        self.heap_ref().system_weaks.register(obj.base.as_ptr())
    }

    /// Look up a system-weak entry. Blocks while weak-ref access is
    /// disabled; returns None once the entry has been swept.
    pub fn get_system_weak<T: Collectable + Sized + 'static>(
        &self,
        handle: SystemWeakHandle,
    ) -> Option<Gc<T>> {
        self.safepoint();
        if !self.weak_ref_access_enabled.load(Ordering::Acquire) {
            self.block_for_weak_ref_access();
        }
        let heap = self.heap_ref();
        let obj = heap.system_weaks.get(handle)?;
        if self.is_gc_marking.load(Ordering::Relaxed) {
            let to = heap.collector.mark_from_read_barrier(obj);
            return Some(Gc::from_header(to));
        }
        Some(Gc::from_header(obj))
    }

    /// Collector statistics line (cycles, moved and freed totals).
    pub fn dump_gc_stats(&self) -> String {
        let mut out = String::new();
        self.heap_ref().collector.dump_performance_info(&mut out);
        out
    }

    pub fn gc_stats(&self) -> &crate::statistics::GcStats {
        &self.heap_ref().collector.stats
    }

    /// To-space bytes abandoned to lost copy races over the last cycle.
    pub fn to_space_bytes_skipped(&self) -> u64 {
        self.heap_ref().collector.to_space_bytes_skipped()
    }

    pub fn to_space_objects_skipped(&self) -> u64 {
        self.heap_ref().collector.to_space_objects_skipped()
    }
}
