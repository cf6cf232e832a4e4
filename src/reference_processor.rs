use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::api::{reference_is_soft, reference_referent_slot};
use crate::concurrent_copying::ConcurrentCopying;
use crate::header::{HeapObjectHeader, GC_GRAY, GC_WHITE};
use crate::read_barrier::ReadBarrierPolicy;

struct RefQueues {
    soft: Vec<*mut HeapObjectHeader>,
    weak: Vec<*mut HeapObjectHeader>,
}

/// Collects reference objects whose referents were still unmarked when the
/// reference was scanned, and resolves them once marking has converged (in
/// the gc-exclusive mark stack mode, so no locking is needed around the mark
/// stack itself).
pub struct ReferenceProcessor {
    queues: Mutex<RefQueues>,
}

unsafe impl Send for ReferenceProcessor {}
unsafe impl Sync for ReferenceProcessor {}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(RefQueues {
                soft: Vec::new(),
                weak: Vec::new(),
            }),
        }
    }

    /// Called from the field scan when `reference` is a reference object. If
    /// the referent is already live the field is forwarded on the spot;
    /// otherwise the reference is queued for the processing pass.
    pub fn delay_reference_referent<RB: ReadBarrierPolicy>(
        &self,
        reference: *mut HeapObjectHeader,
        collector: &ConcurrentCopying<RB>,
    ) {
        unsafe {
            let slot = reference_referent_slot(reference);
            let referent = *slot;
            if referent.is_null() {
                return;
            }
            let marked = collector.is_marked(referent);
            if !marked.is_null() {
                *slot = marked;
                return;
            }
            let mut queues = self.queues.lock();
            if reference_is_soft(reference) {
                queues.soft.push(reference);
            } else {
                queues.weak.push(reference);
            }
        }
    }

    /// Resolve queued references: soft referents are preserved (marked)
    /// unless `clear_soft` is set, then weak (and cleared-soft) referents are
    /// forwarded if they were reached, or cleared. Every processed reference
    /// object is whitened so no gray objects outlive the marking phase.
    pub fn process_references<RB: ReadBarrierPolicy>(
        &self,
        collector: &ConcurrentCopying<RB>,
        clear_soft: bool,
    ) {
        let (soft, mut weak) = {
            let mut queues = self.queues.lock();
            (
                core::mem::take(&mut queues.soft),
                core::mem::take(&mut queues.weak),
            )
        };

        if clear_soft {
            weak.extend_from_slice(&soft);
        } else {
            for &reference in soft.iter() {
                unsafe {
                    let slot = reference_referent_slot(reference);
                    let referent = *slot;
                    if !referent.is_null() {
                        *slot = collector.mark(referent);
                    }
                }
                self.whiten::<RB>(reference);
            }
            // Preserving soft referents may have discovered new objects.
            collector.process_mark_stack();
        }

        for &reference in weak.iter() {
            unsafe {
                let slot = reference_referent_slot(reference);
                let referent = *slot;
                if !referent.is_null() {
                    let marked = collector.is_marked(referent);
                    *slot = marked; // null when the referent died
                }
            }
            self.whiten::<RB>(reference);
        }
        collector.process_mark_stack();
    }

    /// A processed reference no longer needs its referent load to take the
    /// barrier slow path.
    fn whiten<RB: ReadBarrierPolicy>(&self, reference: *mut HeapObjectHeader) {
        if RB::USE_BAKER {
            unsafe {
                if (*reference).rb_state() == GC_GRAY {
                    let ok = (*reference).atomic_set_rb_state(GC_GRAY, GC_WHITE);
                    debug_assert!(ok);
                }
            }
        }
    }

    pub fn assert_queues_empty(&self) {
        let queues = self.queues.lock();
        assert!(queues.soft.is_empty() && queues.weak.is_empty());
    }
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide weak handles (interned entries, caches). Entries are swept by
/// the collector after reference processing: live entries are forwarded to
/// their to-space address, dead entries removed.
pub struct SystemWeakRegistry {
    entries: Mutex<ahash::AHashMap<u64, *mut HeapObjectHeader>>,
    next_id: AtomicU64,
}

unsafe impl Send for SystemWeakRegistry {}
unsafe impl Sync for SystemWeakRegistry {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SystemWeakHandle(u64);

impl SystemWeakRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(ahash::AHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, obj: *mut HeapObjectHeader) -> SystemWeakHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, obj);
        SystemWeakHandle(id)
    }

    /// Raw lookup; callers gate on weak-ref access before calling.
    pub fn get(&self, handle: SystemWeakHandle) -> Option<*mut HeapObjectHeader> {
        self.entries.lock().get(&handle.0).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sweep<RB: ReadBarrierPolicy>(&self, collector: &ConcurrentCopying<RB>) {
        let mut entries = self.entries.lock();
        entries.retain(|_, slot| {
            let to = collector.is_marked(*slot);
            if to.is_null() {
                false
            } else {
                *slot = to;
                true
            }
        });
    }
}

impl Default for SystemWeakRegistry {
    fn default() -> Self {
        Self::new()
    }
}
