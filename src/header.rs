use modular_bitfield::prelude::*;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::api::Collectable;

/// Granularity of object sizes encoded in the header. Every allocation is a
/// multiple of this.
pub const MIN_ALLOCATION: usize = 8;

/// Read barrier state: fields already scanned (or never needing a scan).
pub const GC_WHITE: u8 = 0;
/// Read barrier state: discovered, fields not yet scanned.
pub const GC_GRAY: u8 = 1;

#[derive(BitfieldSpecifier, Clone, Copy, PartialEq, Eq, Debug)]
#[bits = 2]
pub enum LockState {
    Unlocked = 0,
    ThinLocked = 1,
    Hash = 2,
    Forwarded = 3,
}

// One machine word per object encoding either the usual monitor/hash state or,
// once the object has been evacuated, the address of its copy. The payload of
// a forwarding word is the to-space address shifted by the allocation
// granularity; the two tag bits live at the top of the word.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct LockWord {
    payload: B62,
    state: LockState,
}

impl LockWord {
    #[inline(always)]
    pub fn from_u64(value: u64) -> Self {
        Self::from_bytes(value.to_le_bytes())
    }

    #[inline(always)]
    pub fn as_u64(self) -> u64 {
        u64::from_le_bytes(self.into_bytes())
    }

    #[inline(always)]
    pub fn from_forwarding_address(addr: usize) -> Self {
        debug_assert!(addr & (MIN_ALLOCATION - 1) == 0);
        Self::new()
            .with_payload((addr >> 3) as u64)
            .with_state(LockState::Forwarded)
    }

    #[inline(always)]
    pub fn from_hash(hash: u32) -> Self {
        Self::new()
            .with_payload(hash as u64)
            .with_state(LockState::Hash)
    }

    #[inline(always)]
    pub fn is_forwarding_address(self) -> bool {
        self.state() == LockState::Forwarded
    }

    #[inline(always)]
    pub fn forwarding_address(self) -> usize {
        debug_assert!(self.is_forwarding_address());
        (self.payload() << 3) as usize
    }

    #[inline(always)]
    pub fn hash(self) -> u32 {
        debug_assert!(self.state() == LockState::Hash);
        self.payload() as u32
    }
}

// Size, read barrier color and object kind bits share one atomic word so that
// color transitions can CAS without disturbing the rest.
#[bitfield(bits = 32)]
#[derive(Clone, Copy)]
pub struct EncodedState {
    size_in_granules: B28,
    rb_state: B2,
    is_reference: bool,
    needs_finalize: bool,
}

impl EncodedState {
    #[inline(always)]
    fn from_u32(value: u32) -> Self {
        Self::from_bytes(value.to_le_bytes())
    }

    #[inline(always)]
    fn as_u32(self) -> u32 {
        u32::from_le_bytes(self.into_bytes())
    }
}

// HeapObjectHeader is prepended to every object:
//
// +-----------+------+----------------------------------------------------+
// | word      | bits |                                                    |
// +-----------+------+----------------------------------------------------+
// | vtable    |   64 | Collectable vtable; shape and size derive from it. |
// | lock word |   64 | 2-bit tag: unlocked / thin lock / hash /           |
// |           |      | forwarding address (see [LockWord]).               |
// | encoded   |   32 | size in granules (0 for large objects),            |
// |           |      | read barrier state, reference bit, finalize bit.   |
// | type id   |   32 | cheap downcast id.                                 |
// +-----------+------+----------------------------------------------------+
#[repr(C)]
pub struct HeapObjectHeader {
    pub(crate) vtable: usize,
    pub(crate) lock_word: AtomicU64,
    pub(crate) encoded: AtomicU32,
    pub(crate) type_id: u32,
}

impl HeapObjectHeader {
    #[inline(always)]
    pub fn new(vtable: usize, type_id: u32) -> Self {
        Self {
            vtable,
            lock_word: AtomicU64::new(0),
            encoded: AtomicU32::new(0),
            type_id,
        }
    }

    #[inline(always)]
    pub fn data(&self) -> *const u8 {
        (self as *const Self as usize + size_of::<Self>()) as *const u8
    }

    #[inline(always)]
    pub fn vtable(&self) -> usize {
        self.vtable
    }

    #[inline(always)]
    pub fn set_vtable(&mut self, vtable: usize) {
        self.vtable = vtable;
    }

    #[inline(always)]
    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    #[inline(always)]
    pub fn get_dyn(&self) -> &mut dyn Collectable {
        unsafe {
            core::mem::transmute(mopa::TraitObject {
                data: self.data() as *mut (),
                vtable: self.vtable as *mut (),
            })
        }
    }

    /// Encoded size of the object including the header, or 0 for large
    /// objects whose size is recovered through the vtable.
    #[inline(always)]
    pub fn size(&self) -> usize {
        EncodedState::from_u32(self.encoded.load(Ordering::Relaxed)).size_in_granules() as usize
            * MIN_ALLOCATION
    }

    #[inline(always)]
    pub fn set_size(&self, size: usize) {
        debug_assert!(size % MIN_ALLOCATION == 0);
        let old = EncodedState::from_u32(self.encoded.load(Ordering::Relaxed));
        self.encoded.store(
            old.with_size_in_granules((size / MIN_ALLOCATION) as u32)
                .as_u32(),
            Ordering::Relaxed,
        );
    }

    #[inline(always)]
    pub fn is_large(&self) -> bool {
        self.size() == 0
    }

    #[inline(always)]
    pub fn set_large(&self) {
        self.set_size(0);
    }

    /// Size of the object including the header. Safe to call on a from-space
    /// object: the vtable and the value body are still readable there.
    #[inline(always)]
    pub fn object_size(&self) -> usize {
        let encoded = self.size();
        if encoded != 0 {
            return encoded;
        }
        crate::utils::align_usize(
            self.get_dyn().allocation_size() + size_of::<Self>(),
            MIN_ALLOCATION,
        )
    }

    #[inline(always)]
    pub fn rb_state(&self) -> u8 {
        EncodedState::from_u32(self.encoded.load(Ordering::Relaxed)).rb_state()
    }

    /// Color load ordered before any subsequent field read; pairs with the
    /// release on the gray-to-white transition so a white holder implies
    /// fully updated fields.
    #[inline(always)]
    pub fn rb_state_acquire(&self) -> u8 {
        EncodedState::from_u32(self.encoded.load(Ordering::Acquire)).rb_state()
    }

    /// Unsynchronized color store. Only for contexts where no other thread can
    /// observe the object yet (freshly allocated, or a to-space copy before
    /// its forwarding pointer is published).
    #[inline(always)]
    pub fn set_rb_state(&self, state: u8) {
        let old = EncodedState::from_u32(self.encoded.load(Ordering::Relaxed));
        self.encoded
            .store(old.with_rb_state(state).as_u32(), Ordering::Relaxed);
    }

    /// Color store with release semantics, for the gc-exclusive gray-to-white
    /// transition after a scan.
    #[inline(always)]
    pub fn set_rb_state_release(&self, state: u8) {
        let old = EncodedState::from_u32(self.encoded.load(Ordering::Relaxed));
        self.encoded
            .store(old.with_rb_state(state).as_u32(), Ordering::Release);
    }

    /// Atomically transition the read barrier state, preserving the rest of
    /// the encoded word. Returns false if the current state was not
    /// `expected`.
    #[inline]
    pub fn atomic_set_rb_state(&self, expected: u8, new: u8) -> bool {
        let mut old_word = self.encoded.load(Ordering::Relaxed);
        loop {
            let old = EncodedState::from_u32(old_word);
            if old.rb_state() != expected {
                return false;
            }
            match self.encoded.compare_exchange_weak(
                old_word,
                old.with_rb_state(new).as_u32(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(w) => old_word = w,
            }
        }
    }

    #[inline(always)]
    pub fn is_reference(&self) -> bool {
        EncodedState::from_u32(self.encoded.load(Ordering::Relaxed)).is_reference()
    }

    #[inline(always)]
    pub fn set_is_reference(&self) {
        let old = EncodedState::from_u32(self.encoded.load(Ordering::Relaxed));
        self.encoded
            .store(old.with_is_reference(true).as_u32(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn needs_finalize(&self) -> bool {
        EncodedState::from_u32(self.encoded.load(Ordering::Relaxed)).needs_finalize()
    }

    #[inline(always)]
    pub fn set_needs_finalize(&self) {
        let old = EncodedState::from_u32(self.encoded.load(Ordering::Relaxed));
        self.encoded
            .store(old.with_needs_finalize(true).as_u32(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn lock_word(&self) -> LockWord {
        LockWord::from_u64(self.lock_word.load(Ordering::SeqCst))
    }

    #[inline(always)]
    pub fn lock_word_relaxed(&self) -> LockWord {
        LockWord::from_u64(self.lock_word.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn set_lock_word(&self, word: LockWord) {
        self.lock_word.store(word.as_u64(), Ordering::SeqCst);
    }

    /// Weak seq-cst CAS on the lock word; callers loop.
    #[inline(always)]
    pub fn cas_lock_word_weak(&self, old: LockWord, new: LockWord) -> bool {
        self.lock_word
            .compare_exchange_weak(
                old.as_u64(),
                new.as_u64(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Forwarding address installed by a finished copy, or null.
    #[inline(always)]
    pub fn forwarding_address(&self) -> *mut HeapObjectHeader {
        let lw = self.lock_word();
        if lw.is_forwarding_address() {
            lw.forwarding_address() as *mut HeapObjectHeader
        } else {
            core::ptr::null_mut()
        }
    }

    /// Install an identity hash. Fails (returns false) if the lock word is no
    /// longer unlocked, e.g. because a forwarding address won the race.
    #[inline]
    pub fn install_hash(&self, hash: u32) -> bool {
        let old = self.lock_word();
        if old.state() != LockState::Unlocked {
            return false;
        }
        self.cas_lock_word_weak(old, LockWord::from_hash(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_word_forwarding_round_trip() {
        let addr = 0xdead_beef_000usize & !(MIN_ALLOCATION - 1);
        let lw = LockWord::from_forwarding_address(addr);
        assert!(lw.is_forwarding_address());
        assert_eq!(lw.forwarding_address(), addr);
        let lw2 = LockWord::from_u64(lw.as_u64());
        assert_eq!(lw2.forwarding_address(), addr);
    }

    #[test]
    fn lock_word_hash_state() {
        let lw = LockWord::from_hash(0x1234_5678);
        assert_eq!(lw.state(), LockState::Hash);
        assert_eq!(lw.hash(), 0x1234_5678);
        assert!(!lw.is_forwarding_address());
    }

    #[test]
    fn encoded_state_is_independent_of_color() {
        let hdr = HeapObjectHeader::new(0, 0);
        hdr.set_size(64);
        hdr.set_is_reference();
        assert!(hdr.atomic_set_rb_state(GC_WHITE, GC_GRAY));
        assert_eq!(hdr.size(), 64);
        assert!(hdr.is_reference());
        assert_eq!(hdr.rb_state(), GC_GRAY);
        assert!(!hdr.atomic_set_rb_state(GC_WHITE, GC_GRAY));
        assert!(hdr.atomic_set_rb_state(GC_GRAY, GC_WHITE));
        assert_eq!(hdr.rb_state(), GC_WHITE);
    }
}
