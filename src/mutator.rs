use atomic::Atomic;
use parking_lot::lock_api::{RawMutex as RawMutexApi, RawRwLock as RawRwLockApi};
use parking_lot::RawMutex as Lock;
use parking_lot::{Condvar, Mutex};
use std::{
    cell::{Cell, UnsafeCell},
    mem::size_of,
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use crate::api::{small_type_id, vtable_of, Collectable, Gc, Weak, WeakRef};
use crate::header::{HeapObjectHeader, MIN_ALLOCATION};
use crate::heap::{GcCause, Heap};
use crate::object_stack::ObjectStack;
use crate::read_barrier::ReadBarrierPolicy;
use crate::region_space::REGION_SIZE;
use crate::shadow_stack::ShadowStack;
use crate::utils::align_usize;

/// Size of the buffer a mutator carves out of the current to-space region.
pub const TLAB_SIZE: usize = 32 * 1024;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing managed code; holds the mutator lock shared.
    Unsafe = 0,
    /// Parked at a safepoint waiting out a pause.
    Waiting = 1,
    /// In native code or blocked; the collector may act on its behalf.
    Safe = 2,
}

impl ThreadState {
    pub fn safe_for_safepoint(self) -> bool {
        matches!(self, Self::Waiting | Self::Safe)
    }
}

/// Work the collector asks every mutator to run at its next safepoint.
pub trait CheckpointClosure<RB: ReadBarrierPolicy> {
    fn run(&self, thread: &Mutator<RB>);
}

thread_local! {
    static CURRENT_MUTATOR: Cell<*mut u8> = Cell::new(null_mut());
}

/// Mutator of the current thread, or null on non-mutator threads (the
/// collector thread in particular).
#[inline]
pub(crate) fn current_mutator<RB: ReadBarrierPolicy>() -> *mut Mutator<RB> {
    CURRENT_MUTATOR.with(|c| c.get()) as *mut Mutator<RB>
}

pub struct Mutator<RB: ReadBarrierPolicy + 'static> {
    pub(crate) heap: Arc<UnsafeCell<Heap<RB>>>,

    pub(crate) state: Atomic<ThreadState>,
    /// Serializes checkpoint delivery with this thread's state transitions.
    pub(crate) checkpoint_lock: Lock,
    pub(crate) pending_checkpoint: Cell<Option<*const dyn CheckpointClosure<RB>>>,
    pub(crate) has_pending_checkpoint: AtomicBool,

    pub(crate) is_gc_marking: AtomicBool,
    pub(crate) weak_ref_access_enabled: AtomicBool,
    pub(crate) tl_mark_stack: Cell<*mut ObjectStack>,

    tlab_start: Cell<*mut u8>,
    tlab_cursor: Cell<*mut u8>,
    tlab_end: Cell<*mut u8>,
    tlab_objects: Cell<usize>,

    shadow_stack: ShadowStack,
    join_data: Arc<JoinDataInternal>,
    rc: Cell<u32>,
}

unsafe impl<RB: ReadBarrierPolicy> Send for Mutator<RB> {}
unsafe impl<RB: ReadBarrierPolicy> Sync for Mutator<RB> {}

impl<RB: ReadBarrierPolicy> Mutator<RB> {
    pub(crate) fn new(heap: Arc<UnsafeCell<Heap<RB>>>, join_data: Arc<JoinDataInternal>) -> Self {
        Self {
            heap,
            state: Atomic::new(ThreadState::Safe),
            checkpoint_lock: Lock::INIT,
            pending_checkpoint: Cell::new(None),
            has_pending_checkpoint: AtomicBool::new(false),
            is_gc_marking: AtomicBool::new(false),
            weak_ref_access_enabled: AtomicBool::new(true),
            tl_mark_stack: Cell::new(null_mut()),
            tlab_start: Cell::new(null_mut()),
            tlab_cursor: Cell::new(null_mut()),
            tlab_end: Cell::new(null_mut()),
            tlab_objects: Cell::new(0),
            shadow_stack: ShadowStack::new(),
            join_data,
            rc: Cell::new(1),
        }
    }

    #[inline]
    pub(crate) fn heap_ref(&self) -> &Heap<RB> {
        unsafe { &*self.heap.get() }
    }

    pub fn shadow_stack(&self) -> &'static ShadowStack {
        unsafe { std::mem::transmute(&self.shadow_stack) }
    }

    pub(crate) fn tlab(&self) -> (*mut u8, *mut u8, *mut u8, usize) {
        (
            self.tlab_start.get(),
            self.tlab_cursor.get(),
            self.tlab_end.get(),
            self.tlab_objects.get(),
        )
    }

    pub(crate) fn reset_tlab(&self) {
        self.tlab_start.set(null_mut());
        self.tlab_cursor.set(null_mut());
        self.tlab_end.set(null_mut());
        self.tlab_objects.set(0);
    }

    /// Attach this mutator to the heap from its own thread. Acquires the
    /// shared hold on the mutator lock that represents "running managed
    /// code".
    pub(crate) fn attach(&mut self) {
        let heap = self.heap_ref();
        heap.mutator_lock.lock_shared();
        {
            let mut threads = heap.thread_list.lock();
            threads.push(self as *mut Self);
        }
        heap.safepoint.n_mutators.fetch_add(1, Ordering::SeqCst);
        // A thread attaching mid-cycle starts with the collector's view of
        // the world.
        self.is_gc_marking
            .store(heap.collector.is_marking(), Ordering::SeqCst);
        self.weak_ref_access_enabled
            .store(heap.collector.weak_ref_access_enabled(), Ordering::SeqCst);
        self.state.store(ThreadState::Unsafe, Ordering::Release);
        CURRENT_MUTATOR.with(|c| c.set(self as *mut Self as *mut u8));
    }

    pub(crate) fn detach(&mut self) {
        let heap = self.heap_ref();
        // Flush per-thread collector state before disappearing from the
        // thread list.
        self.checkpoint_lock.lock();
        self.run_pending_checkpoint_locked();
        let tl_mark_stack = self.tl_mark_stack.get();
        if !tl_mark_stack.is_null() {
            heap.collector.revoke_mark_stack(tl_mark_stack);
            self.tl_mark_stack.set(null_mut());
        }
        unsafe { self.checkpoint_lock.unlock() };
        heap.region_space.revoke_thread_local_buffer(
            self.tlab_start.get(),
            self.tlab_cursor.get(),
            self.tlab_end.get(),
            self.tlab_objects.get(),
        );
        self.reset_tlab();
        {
            let mut threads = heap.thread_list.lock();
            let me = self as *mut Self;
            threads.retain(|&t| t != me);
        }
        heap.safepoint.n_mutators.fetch_sub(1, Ordering::SeqCst);
        self.state.store(ThreadState::Safe, Ordering::Release);
        unsafe { heap.mutator_lock.unlock_shared() };
        CURRENT_MUTATOR.with(|c| c.set(null_mut()));
    }

    #[inline]
    fn run_pending_checkpoint_locked(&self) {
        if let Some(closure) = self.pending_checkpoint.take() {
            self.has_pending_checkpoint.store(false, Ordering::Release);
            unsafe { (*closure).run(self) };
        }
    }

    /// Safepoint poll: runs pending checkpoints, then parks for the duration
    /// of a pause if one is starting. Mutator loops and allocation paths call
    /// this.
    #[inline(always)]
    pub fn safepoint(&self) {
        if self.has_pending_checkpoint.load(Ordering::Acquire) {
            self.run_checkpoint_slow();
        }
        if self.heap_ref().safepoint.is_gc_running() {
            self.park_at_safepoint();
        }
    }

    #[cold]
    #[inline(never)]
    fn run_checkpoint_slow(&self) {
        self.checkpoint_lock.lock();
        self.run_pending_checkpoint_locked();
        unsafe { self.checkpoint_lock.unlock() };
    }

    #[cold]
    #[inline(never)]
    fn park_at_safepoint(&self) {
        let heap = self.heap_ref();
        self.checkpoint_lock.lock();
        self.state.store(ThreadState::Waiting, Ordering::Release);
        unsafe { self.checkpoint_lock.unlock() };
        unsafe { heap.mutator_lock.unlock_shared() };
        heap.safepoint.wait_gc();
        heap.mutator_lock.lock_shared();
        self.checkpoint_lock.lock();
        self.run_pending_checkpoint_locked();
        self.state.store(ThreadState::Unsafe, Ordering::Release);
        unsafe { self.checkpoint_lock.unlock() };
    }

    /// Enter a GC-safe region (native call, blocking wait). While the guard
    /// lives, the collector may pause and run checkpoints on this thread's
    /// behalf.
    pub fn enter_safe(&self) -> SafeRegion<'_, RB> {
        let heap = self.heap_ref();
        self.checkpoint_lock.lock();
        self.run_pending_checkpoint_locked();
        self.state.store(ThreadState::Safe, Ordering::Release);
        unsafe { self.checkpoint_lock.unlock() };
        unsafe { heap.mutator_lock.unlock_shared() };
        SafeRegion { mutator: self }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate `T` on the GC heap. Objects above the large-object threshold
    /// land in the dedicated large space; anything bigger than a region spans
    /// whole regions in the region space.
    ///
    /// The slow path may run a collection: interior references of `value` are
    /// rooted across it, but any *other* unrooted handle held by the caller
    /// is not.
    #[inline(always)]
    pub fn allocate<T: Collectable + Sized + 'static>(&self, value: T) -> Gc<T> {
        let size = align_usize(
            value.allocation_size() + size_of::<HeapObjectHeader>(),
            MIN_ALLOCATION,
        );
        let threshold = self.heap_ref().params.large_object_threshold;
        if size > threshold && size <= REGION_SIZE {
            return self.allocate_large(value, size);
        }
        let cursor = self.tlab_cursor.get();
        if size <= TLAB_SIZE && !cursor.is_null() {
            unsafe {
                let new_cursor = cursor.add(size);
                if new_cursor <= self.tlab_end.get() {
                    self.tlab_cursor.set(new_cursor);
                    self.tlab_objects.set(self.tlab_objects.get() + 1);
                    let gc = self.finish_alloc(cursor, value, size, false);
                    return self.register_allocation(gc);
                }
            }
        }
        self.allocate_slow(value, size)
    }

    #[cold]
    fn allocate_slow<T: Collectable + Sized + 'static>(&self, value: T, size: usize) -> Gc<T> {
        let heap = self.heap_ref();
        // Keep the value's interior references alive and forwarded across
        // safepoints and emergency collections.
        let stack = self.shadow_stack();
        letroot!(rooted = stack, Some(value));
        self.safepoint();
        if heap.should_trigger_background_gc() {
            heap.request_background_gc();
        }
        for _ in 0..3 {
            if size > TLAB_SIZE {
                // Too big for a buffer: straight bump allocation, spanning
                // regions when the object outgrows one.
                let mut bytes_allocated = 0;
                let mem = heap
                    .region_space
                    .alloc_nonvirtual(size, &mut bytes_allocated, false);
                if !mem.is_null() {
                    heap.num_bytes_allocated
                        .fetch_add(bytes_allocated, Ordering::Relaxed);
                    let gc = unsafe {
                        self.finish_alloc(mem, rooted.take().unwrap(), size, size > REGION_SIZE)
                    };
                    return self.register_allocation(gc);
                }
            } else if self.refill_tlab(size) {
                let cursor = self.tlab_cursor.get();
                unsafe {
                    self.tlab_cursor.set(cursor.add(size));
                    self.tlab_objects.set(self.tlab_objects.get() + 1);
                    let gc = self.finish_alloc(cursor, rooted.take().unwrap(), size, false);
                    return self.register_allocation(gc);
                }
            }
            self.request_gc_and_wait(GcCause::ForAllocFailure, false);
        }
        oom_abort();
    }

    fn refill_tlab(&self, min_size: usize) -> bool {
        let heap = self.heap_ref();
        heap.region_space.revoke_thread_local_buffer(
            self.tlab_start.get(),
            self.tlab_cursor.get(),
            self.tlab_end.get(),
            self.tlab_objects.get(),
        );
        self.reset_tlab();
        let tlab_size = TLAB_SIZE.max(min_size);
        let start = heap.region_space.alloc_tlab(tlab_size);
        if start.is_null() {
            return false;
        }
        heap.num_bytes_allocated
            .fetch_add(tlab_size, Ordering::Relaxed);
        self.tlab_start.set(start);
        self.tlab_cursor.set(start);
        self.tlab_end.set(unsafe { start.add(tlab_size) });
        true
    }

    #[cold]
    fn allocate_large<T: Collectable + Sized + 'static>(&self, value: T, size: usize) -> Gc<T> {
        let heap = self.heap_ref();
        let stack = self.shadow_stack();
        letroot!(rooted = stack, Some(value));
        self.safepoint();
        for _ in 0..3 {
            let mut bytes_allocated = 0;
            let mem = heap.large_object_space.alloc(size, &mut bytes_allocated);
            if !mem.is_null() {
                heap.num_bytes_allocated
                    .fetch_add(bytes_allocated, Ordering::Relaxed);
                let gc = unsafe { self.finish_alloc(mem, rooted.take().unwrap(), size, true) };
                return self.register_allocation(gc);
            }
            self.request_gc_and_wait(GcCause::ForAllocFailure, false);
        }
        oom_abort();
    }

    /// Allocate directly in the non-moving space.
    pub fn allocate_nonmoving<T: Collectable + Sized + 'static>(&self, value: T) -> Gc<T> {
        let size = align_usize(
            value.allocation_size() + size_of::<HeapObjectHeader>(),
            MIN_ALLOCATION,
        );
        let heap = self.heap_ref();
        let stack = self.shadow_stack();
        letroot!(rooted = stack, Some(value));
        self.safepoint();
        for _ in 0..3 {
            let mut bytes_allocated = 0;
            let mem = heap.non_moving_space.alloc(size, &mut bytes_allocated);
            if !mem.is_null() {
                heap.num_bytes_allocated
                    .fetch_add(bytes_allocated, Ordering::Relaxed);
                let gc = unsafe { self.finish_alloc(mem, rooted.take().unwrap(), size, false) };
                return self.register_allocation(gc);
            }
            self.request_gc_and_wait(GcCause::ForAllocFailure, false);
        }
        oom_abort();
    }

    /// # Safety
    /// `mem` points at `size` writable bytes owned by this allocation.
    unsafe fn finish_alloc<T: Collectable + Sized + 'static>(
        &self,
        mem: *mut u8,
        value: T,
        size: usize,
        large: bool,
    ) -> Gc<T> {
        let hdr = mem.cast::<HeapObjectHeader>();
        hdr.write(HeapObjectHeader::new(vtable_of::<T>(), small_type_id::<T>()));
        if large {
            (*hdr).set_large();
        } else {
            (*hdr).set_size(size);
        }
        if core::mem::needs_drop::<T>() {
            (*hdr).set_needs_finalize();
        }
        ((*hdr).data() as *mut T).write(value);
        Gc {
            base: NonNull::new_unchecked(hdr),
            marker: Default::default(),
        }
    }

    /// Record a fresh allocation on the allocation stack, keeping the handle
    /// rooted if recording has to wait for a collection.
    fn register_allocation<T: Collectable + Sized + 'static>(&self, gc: Gc<T>) -> Gc<T> {
        let heap = self.heap_ref();
        if heap.allocation_stack().atomic_push_back(gc.base.as_ptr()) {
            return gc;
        }
        let stack = self.shadow_stack();
        letroot!(rooted = stack, Some(gc));
        self.request_gc_and_wait(GcCause::ForAllocFailure, false);
        let gc = rooted.take().unwrap();
        if !heap.allocation_stack().atomic_push_back(gc.base.as_ptr()) {
            panic!("allocation stack overflow after collection");
        }
        gc
    }

    /// Allocate a weak reference to `target`.
    pub fn allocate_weak<T: Collectable + Sized + 'static>(&self, target: Gc<T>) -> Weak<T> {
        let weak = self.allocate(WeakRef::new(target, false));
        weak.header().set_is_reference();
        weak
    }

    /// Allocate a soft reference: the referent survives collection unless the
    /// cycle was asked to clear soft references.
    pub fn allocate_soft<T: Collectable + Sized + 'static>(&self, target: Gc<T>) -> Weak<T> {
        let weak = self.allocate(WeakRef::new(target, true));
        weak.header().set_is_reference();
        weak
    }

    /// Read a weak referent. Blocks while the collector has weak-ref access
    /// disabled; during marking the referent is kept alive for this cycle.
    pub fn weak_get<T: Collectable + Sized + 'static>(&self, weak: Weak<T>) -> Option<Gc<T>> {
        if !self.weak_ref_access_enabled.load(Ordering::Acquire) {
            self.block_for_weak_ref_access();
        }
        unsafe {
            let slot = weak.referent_slot();
            let referent = *slot;
            if referent.is_null() {
                return None;
            }
            if self.is_gc_marking.load(Ordering::Relaxed) {
                let to = self.heap_ref().collector.mark_from_read_barrier(referent);
                *slot = to;
                return Some(Gc::from_header(to));
            }
            Some(Gc::from_header(referent))
        }
    }

    #[cold]
    pub(crate) fn block_for_weak_ref_access(&self) {
        let heap = self.heap_ref();
        let safe = self.enter_safe();
        {
            let mut guard = heap.weak_access_lock.lock();
            while !self.weak_ref_access_enabled.load(Ordering::Acquire) {
                heap.weak_access_cond.wait(&mut guard);
            }
        }
        drop(safe);
    }

    // ------------------------------------------------------------------
    // Barriers
    // ------------------------------------------------------------------

    /// Read barrier on a reference-field load: `holder` is the object the
    /// field lives in, the returned handle is safe to use and store. Baker
    /// style takes the slow path when the holder is still gray; table-lookup
    /// style when the loaded address lies in a region flagged by the table.
    #[inline(always)]
    pub fn load<U: Collectable + ?Sized, T: Collectable + ?Sized>(
        &self,
        holder: Gc<U>,
        field: &crate::api::Field<T>,
    ) -> Gc<T> {
        if !self.is_gc_marking.load(Ordering::Relaxed) {
            return field.to_gc();
        }
        if RB::USE_BAKER {
            // The color check comes first: a white holder (acquire) implies
            // the field updates of its scan are visible, so the plain load
            // below cannot observe a stale from-space value.
            let gray = holder.header().rb_state_acquire() == crate::header::GC_GRAY;
            let ref_ = field.to_gc();
            if gray {
                return self.load_slow(ref_);
            }
            ref_
        } else {
            let ref_ = field.to_gc();
            if self.heap_ref().rb_table.is_set(ref_.base.as_ptr().cast()) {
                return self.load_slow(ref_);
            }
            ref_
        }
    }

    #[inline(never)]
    fn load_slow<T: Collectable + ?Sized>(&self, ref_: Gc<T>) -> Gc<T> {
        let to = self
            .heap_ref()
            .collector
            .mark_from_read_barrier(ref_.base.as_ptr());
        Gc::from_header(to)
    }

    /// Identity hash, installed into the lock word on first use. Stable
    /// across moves: the copy carries the installed word, and an install
    /// racing a forwarding-pointer CAS simply retries on the winner.
    pub fn identity_hash<T: Collectable + ?Sized>(&self, obj: Gc<T>) -> u32 {
        let mut hdr = obj.base.as_ptr();
        loop {
            unsafe {
                let lw = (*hdr).lock_word();
                match lw.state() {
                    crate::header::LockState::Hash => return lw.hash(),
                    crate::header::LockState::Forwarded => {
                        hdr = lw.forwarding_address() as *mut HeapObjectHeader;
                    }
                    _ => {
                        let hash = ((hdr as usize >> 3) as u32).wrapping_mul(0x9e37_79b9) | 1;
                        let _ = (*hdr).install_hash(hash);
                    }
                }
            }
        }
    }

    /// Write barrier: after storing a reference into `holder`, dirty its
    /// card so immune-space mutations are rescanned.
    #[inline]
    pub fn write_barrier<T: Collectable + ?Sized>(&self, holder: Gc<T>) {
        self.heap_ref()
            .card_table
            .mark_card(holder.base.as_ptr().cast());
    }

    // ------------------------------------------------------------------
    // Collection requests
    // ------------------------------------------------------------------

    /// Run a full collection cycle and wait for it. Explicit requests
    /// evacuate every region.
    pub fn collect_garbage(&self) {
        self.request_gc_and_wait(GcCause::Explicit, false);
    }

    /// Explicit collection that also clears soft references.
    pub fn collect_garbage_clearing_soft_refs(&self) {
        self.request_gc_and_wait(GcCause::Explicit, true);
    }

    pub(crate) fn request_gc_and_wait(&self, cause: GcCause, clear_soft: bool) {
        let heap = self.heap_ref();
        let seen = heap.collection_barrier.cycles_completed();
        heap.send_gc_request(cause, clear_soft);
        let safe = self.enter_safe();
        heap.collection_barrier.await_collection(seen);
        drop(safe);
    }

    /// Spawn a new mutator thread attached to the same heap.
    pub fn spawn_mutator<F>(&self, closure: F) -> JoinData
    where
        F: FnOnce(MutatorRef<RB>) + Send + 'static,
    {
        let heap = self.heap.clone();
        let join_data = JoinData::new();
        let internal = join_data.internal.clone();
        let wrapper = HeapArc { heap };
        std::thread::spawn(move || {
            let HeapArc { heap } = wrapper;
            let mut mutator = MutatorRef::new(Mutator::new(heap, internal));
            mutator.attach();
            closure(mutator.clone());
            drop(mutator);
        });
        join_data
    }
}

struct HeapArc<RB: ReadBarrierPolicy + 'static> {
    heap: Arc<UnsafeCell<Heap<RB>>>,
}
unsafe impl<RB: ReadBarrierPolicy> Send for HeapArc<RB> {}

/// Guard for a GC-safe region; restores the running state (and the shared
/// mutator-lock hold) on drop.
pub struct SafeRegion<'a, RB: ReadBarrierPolicy + 'static> {
    mutator: &'a Mutator<RB>,
}

impl<RB: ReadBarrierPolicy> Drop for SafeRegion<'_, RB> {
    fn drop(&mut self) {
        let heap = self.mutator.heap_ref();
        heap.mutator_lock.lock_shared();
        self.mutator.checkpoint_lock.lock();
        self.mutator.run_pending_checkpoint_locked();
        self.mutator
            .state
            .store(ThreadState::Unsafe, Ordering::Release);
        unsafe { self.mutator.checkpoint_lock.unlock() };
    }
}

pub(crate) struct JoinDataInternal {
    running: Mutex<bool>,
    cv_stopped: Condvar,
}

impl JoinDataInternal {
    pub(crate) fn new() -> Self {
        Self {
            running: Mutex::new(true),
            cv_stopped: Condvar::new(),
        }
    }

    fn stop(&self) {
        let mut running = self.running.lock();
        *running = false;
        self.cv_stopped.notify_all();
    }
}

pub struct JoinData {
    pub(crate) internal: Arc<JoinDataInternal>,
}

impl JoinData {
    pub(crate) fn new() -> Self {
        Self {
            internal: Arc::new(JoinDataInternal::new()),
        }
    }

    /// Wait for the spawned mutator to finish, staying GC-safe meanwhile.
    pub fn join<RB: ReadBarrierPolicy>(self, mutator: &Mutator<RB>) {
        let safe = mutator.enter_safe();
        let mut running = self.internal.running.lock();
        while *running {
            self.internal.cv_stopped.wait(&mut running);
        }
        drop(running);
        drop(safe);
    }
}

/// Reference-counted handle to a mutator; the mutator detaches from the heap
/// when the last handle drops.
pub struct MutatorRef<RB: ReadBarrierPolicy + 'static> {
    mutator: NonNull<Mutator<RB>>,
}

impl<RB: ReadBarrierPolicy> MutatorRef<RB> {
    pub fn new(mutator: Mutator<RB>) -> Self {
        Self {
            mutator: unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(mutator))) },
        }
    }
}

impl<RB: ReadBarrierPolicy> Deref for MutatorRef<RB> {
    type Target = Mutator<RB>;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutator.as_ptr() }
    }
}

impl<RB: ReadBarrierPolicy> DerefMut for MutatorRef<RB> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutator.as_ptr() }
    }
}

impl<RB: ReadBarrierPolicy> Clone for MutatorRef<RB> {
    fn clone(&self) -> Self {
        unsafe {
            let rc = (*self.mutator.as_ptr()).rc.get();
            (*self.mutator.as_ptr()).rc.set(rc + 1);
        }
        Self {
            mutator: self.mutator,
        }
    }
}

impl<RB: ReadBarrierPolicy> Drop for MutatorRef<RB> {
    fn drop(&mut self) {
        unsafe {
            let mutator = self.mutator.as_ptr();
            let rc = (*mutator).rc.get() - 1;
            (*mutator).rc.set(rc);
            if rc == 0 {
                (*mutator).detach();
                (*mutator).join_data.stop();
                (*mutator).heap_ref().maybe_shutdown_collector();
                drop(Box::from_raw(mutator));
            }
        }
    }
}

unsafe impl<RB: ReadBarrierPolicy> Send for MutatorRef<RB> {}

#[cold]
pub fn oom_abort() -> ! {
    eprintln!("OutOfMemory");
    std::process::abort();
}
