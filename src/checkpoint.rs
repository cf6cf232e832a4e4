use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};

/// Count-up barrier the collector waits on while mutators run a checkpoint
/// closure. Each mutator passes once; the collector blocks until the pass
/// count reaches the number of threads that were told to run the closure.
pub struct GcBarrier {
    count: Mutex<usize>,
    cond: Condvar,
}

impl GcBarrier {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn init(&self) {
        *self.count.lock() = 0;
    }

    /// Called by a mutator (or the collector acting on a suspended mutator's
    /// behalf) when the checkpoint closure has run.
    pub fn pass(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_all();
    }

    /// Collector side: wait until `target` passes have happened. The caller
    /// must not hold the mutator lock.
    pub fn wait_for(&self, target: usize) {
        let mut count = self.count.lock();
        while *count < target {
            self.cond.wait(&mut count);
        }
    }
}

impl Default for GcBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocks mutators that asked for a collection until the cycle they requested
/// has finished.
pub struct CollectionBarrier {
    cycles: Mutex<u64>,
    cond: Condvar,
    collection_requested: AtomicCell<bool>,
}

impl CollectionBarrier {
    pub fn new() -> Self {
        Self {
            cycles: Mutex::new(0),
            cond: Condvar::new(),
            collection_requested: AtomicCell::new(false),
        }
    }

    pub fn cycles_completed(&self) -> u64 {
        *self.cycles.lock()
    }

    pub fn was_gc_requested(&self) -> bool {
        self.collection_requested.load()
    }

    /// Returns false if a request was already pending.
    pub fn request_gc(&self) -> bool {
        !self.collection_requested.swap(true)
    }

    /// Collector side: publish cycle completion and wake every waiter.
    pub fn notify_cycle_finished(&self) {
        let mut cycles = self.cycles.lock();
        *cycles += 1;
        self.collection_requested.store(false);
        self.cond.notify_all();
    }

    /// Wait until at least one cycle beyond `seen` has completed. The calling
    /// thread must be in a GC-safe state.
    pub fn await_collection(&self, seen: u64) {
        let mut cycles = self.cycles.lock();
        while *cycles <= seen {
            self.cond.wait(&mut cycles);
        }
    }
}

impl Default for CollectionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn barrier_waits_for_all_passes() {
        let barrier = Arc::new(GcBarrier::new());
        barrier.init();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let b = barrier.clone();
            handles.push(std::thread::spawn(move || b.pass()));
        }
        barrier.wait_for(4);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn collection_barrier_releases_waiters() {
        let barrier = Arc::new(CollectionBarrier::new());
        assert!(barrier.request_gc());
        assert!(!barrier.request_gc());
        let seen = barrier.cycles_completed();
        let b = barrier.clone();
        let waiter = std::thread::spawn(move || b.await_collection(seen));
        barrier.notify_cycle_finished();
        waiter.join().unwrap();
        assert!(!barrier.was_gc_requested());
    }
}
