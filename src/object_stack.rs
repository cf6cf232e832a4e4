use std::sync::atomic::{AtomicUsize, Ordering};

use crate::header::HeapObjectHeader;
use crate::utils::mmap::Mmap;

/// Bounded LIFO of object pointers backed by its own mapping. Producers bump
/// an atomic index; consumption is single-threaded (the collector), as is
/// `reset`. Used for the gc mark stack, the pooled thread-local mark stacks
/// and the allocation / live stacks.
pub struct ObjectStack {
    name: &'static str,
    mem: Mmap,
    capacity: usize,
    back: AtomicUsize,
}

unsafe impl Send for ObjectStack {}
unsafe impl Sync for ObjectStack {}

impl ObjectStack {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            mem: Mmap::new(capacity * core::mem::size_of::<*mut HeapObjectHeader>()),
            capacity,
            back: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn slots(&self) -> *mut *mut HeapObjectHeader {
        self.mem.start().cast()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.back.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity
    }

    /// Racy multi-producer push. Returns false when the stack is full; the
    /// slot write is plain since only the pushing thread and a quiesced
    /// consumer ever look at it.
    #[inline]
    pub fn atomic_push_back(&self, obj: *mut HeapObjectHeader) -> bool {
        debug_assert!(!obj.is_null());
        let index = self.back.fetch_add(1, Ordering::SeqCst);
        if index >= self.capacity {
            self.back.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        unsafe {
            self.slots().add(index).write(obj);
        }
        true
    }

    /// Single-producer push.
    #[inline]
    pub fn push_back(&self, obj: *mut HeapObjectHeader) -> bool {
        debug_assert!(!obj.is_null());
        let index = self.back.load(Ordering::Relaxed);
        if index >= self.capacity {
            return false;
        }
        unsafe {
            self.slots().add(index).write(obj);
        }
        self.back.store(index + 1, Ordering::Relaxed);
        true
    }

    /// Single-consumer pop.
    #[inline]
    pub fn pop_back(&self) -> Option<*mut HeapObjectHeader> {
        let index = self.back.load(Ordering::Relaxed);
        if index == 0 {
            return None;
        }
        self.back.store(index - 1, Ordering::Relaxed);
        Some(unsafe { self.slots().add(index - 1).read() })
    }

    pub fn reset(&self) {
        // Zero the used slots so a racy membership probe against an in-flight
        // push can only read null, never a stale pointer from a previous
        // epoch.
        let used = self.size().min(self.capacity);
        unsafe {
            core::ptr::write_bytes(self.slots(), 0, used);
        }
        self.back.store(0, Ordering::Relaxed);
    }

    /// Snapshot of the current entries. Only meaningful while producers are
    /// quiescent or for the racy membership test below.
    pub fn as_slice(&self) -> &[*mut HeapObjectHeader] {
        let len = self.size().min(self.capacity);
        unsafe { std::slice::from_raw_parts(self.slots(), len) }
    }

    /// Racy membership test; pairs with an acquire fence at the call sites
    /// that tolerate in-flight pushes.
    pub fn contains(&self, obj: *const HeapObjectHeader) -> bool {
        self.as_slice().iter().any(|&p| p as *const _ == obj)
    }

    /// Grow to `new_capacity`, preserving entry order.
    pub fn resize(&mut self, new_capacity: usize) {
        assert!(new_capacity > self.capacity, "mark stack may only grow");
        let old_size = self.size().min(self.capacity);
        let new_mem = Mmap::new(new_capacity * core::mem::size_of::<*mut HeapObjectHeader>());
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.slots(),
                new_mem.start().cast::<*mut HeapObjectHeader>(),
                old_size,
            );
        }
        self.mem = new_mem;
        self.capacity = new_capacity;
        self.back.store(old_size, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_order() {
        let stack = ObjectStack::new("test stack", 16);
        let a = 0x1000 as *mut HeapObjectHeader;
        let b = 0x2000 as *mut HeapObjectHeader;
        assert!(stack.push_back(a));
        assert!(stack.push_back(b));
        assert_eq!(stack.pop_back(), Some(b));
        assert_eq!(stack.pop_back(), Some(a));
        assert_eq!(stack.pop_back(), None);
    }

    #[test]
    fn overflow_reports_full() {
        let stack = ObjectStack::new("test stack", 2);
        let p = 0x1000 as *mut HeapObjectHeader;
        assert!(stack.atomic_push_back(p));
        assert!(stack.atomic_push_back(p));
        assert!(!stack.atomic_push_back(p));
        assert_eq!(stack.size(), 2);
    }

    #[test]
    fn resize_preserves_order() {
        let mut stack = ObjectStack::new("test stack", 2);
        let a = 0x1000 as *mut HeapObjectHeader;
        let b = 0x2000 as *mut HeapObjectHeader;
        stack.push_back(a);
        stack.push_back(b);
        stack.resize(8);
        assert_eq!(stack.as_slice(), &[a, b]);
        assert!(stack.push_back(a));
        assert_eq!(stack.size(), 3);
    }
}
