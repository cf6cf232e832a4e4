use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::formatted_size;

/// Log2-bucketed latency/value histogram. Cheap enough to record on the read
/// barrier slow path.
pub struct Histogram {
    name: &'static str,
    buckets: [u64; 64],
    count: u64,
    sum: u64,
    max: u64,
}

impl Histogram {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            buckets: [0; 64],
            count: 0,
            sum: 0,
            max: 0,
        }
    }

    pub fn add(&mut self, value: u64) {
        let bucket = 64 - (value | 1).leading_zeros() as usize - 1;
        self.buckets[bucket] += 1;
        self.count += 1;
        self.sum += value;
        self.max = self.max.max(value);
    }

    pub fn sample_size(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum / self.count
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn dump(&self, out: &mut dyn std::fmt::Write) {
        let _ = writeln!(
            out,
            "{}: samples={} mean={} max={}",
            self.name,
            self.count,
            self.mean(),
            self.max
        );
        for (i, &n) in self.buckets.iter().enumerate() {
            if n != 0 {
                let _ = writeln!(out, "  [2^{:02}..2^{:02}) {}", i, i + 1, n);
            }
        }
    }
}

/// Lifetime counters for the collector, plus the per-cycle numbers of the most
/// recent cycle.
#[derive(Default)]
pub struct GcStats {
    pub cycles_completed: AtomicU64,
    pub total_bytes_moved: AtomicU64,
    pub total_objects_moved: AtomicU64,
    pub total_bytes_freed: AtomicU64,
    pub total_objects_freed: AtomicU64,
    pub last_bytes_moved: AtomicU64,
    pub last_objects_moved: AtomicU64,
    pub last_bytes_freed: AtomicU64,
    pub last_objects_freed: AtomicU64,
    pub last_pause_ns: AtomicU64,
}

impl GcStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(
        &self,
        bytes_moved: u64,
        objects_moved: u64,
        bytes_freed: u64,
        objects_freed: u64,
    ) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_moved.fetch_add(bytes_moved, Ordering::Relaxed);
        self.total_objects_moved
            .fetch_add(objects_moved, Ordering::Relaxed);
        self.total_bytes_freed.fetch_add(bytes_freed, Ordering::Relaxed);
        self.total_objects_freed
            .fetch_add(objects_freed, Ordering::Relaxed);
        self.last_bytes_moved.store(bytes_moved, Ordering::Relaxed);
        self.last_objects_moved.store(objects_moved, Ordering::Relaxed);
        self.last_bytes_freed.store(bytes_freed, Ordering::Relaxed);
        self.last_objects_freed.store(objects_freed, Ordering::Relaxed);
    }

    pub fn dump(&self, out: &mut dyn std::fmt::Write) {
        let _ = writeln!(
            out,
            "cycles={} moved={} ({} objects) freed={} ({} objects) last pause={}ns",
            self.cycles_completed.load(Ordering::Relaxed),
            formatted_size(self.total_bytes_moved.load(Ordering::Relaxed) as usize),
            self.total_objects_moved.load(Ordering::Relaxed),
            formatted_size(self.total_bytes_freed.load(Ordering::Relaxed) as usize),
            self.total_objects_freed.load(Ordering::Relaxed),
            self.last_pause_ns.load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_powers_of_two() {
        let mut h = Histogram::new("test");
        h.add(1);
        h.add(2);
        h.add(3);
        h.add(1024);
        assert_eq!(h.sample_size(), 4);
        assert_eq!(h.max(), 1024);
        assert_eq!(h.mean(), (1 + 2 + 3 + 1024) / 4);
    }
}
