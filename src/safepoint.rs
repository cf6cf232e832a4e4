use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Stop-the-world rendezvous. The collector raises `gc_running`; every
/// mutator parks at its next safepoint poll, releasing its shared hold on the
/// mutator lock, and spins until the pause ends. The collector's exclusive
/// acquisition of the mutator lock is what actually waits for stragglers.
pub struct GlobalSafepoint {
    pub(crate) gc_running: AtomicU32,
    pub(crate) n_mutators: AtomicUsize,
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            gc_running: AtomicU32::new(0),
            n_mutators: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn is_gc_running(&self) -> bool {
        self.gc_running.load(Ordering::Relaxed) != 0
    }

    pub fn begin_pause(&self) {
        debug_assert!(!self.is_gc_running());
        self.gc_running.store(1, Ordering::SeqCst);
    }

    pub fn end_pause(&self) {
        debug_assert!(self.is_gc_running());
        self.gc_running.store(0, Ordering::SeqCst);
    }

    /// Mutator side: spin until the pause is over.
    #[inline]
    pub fn wait_gc(&self) {
        while self.gc_running.load(Ordering::Relaxed) != 0
            || self.gc_running.load(Ordering::Acquire) != 0
        {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    pub fn mutator_count(&self) -> usize {
        self.n_mutators.load(Ordering::Relaxed)
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}
