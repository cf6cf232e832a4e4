use std::{
    cell::UnsafeCell,
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem::size_of,
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
};

use mopa::mopafy;

pub use crate::header::{HeapObjectHeader, GC_GRAY, GC_WHITE, MIN_ALLOCATION};

/// Visitor invoked for every reference field of a traced object. The slot is
/// handed over by pointer so the collector can forward it in place.
pub trait Visitor {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>);
}

pub unsafe trait Trace {
    fn trace(&mut self, _vis: &mut dyn Visitor) {}
}

pub unsafe trait Finalize {
    unsafe fn finalize(&mut self) {
        std::ptr::drop_in_place(self)
    }
}

pub trait Collectable: Trace + Finalize + mopa::Any {
    #[inline(always)]
    fn allocation_size(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

mopafy!(Collectable);

pub(crate) fn vtable_of<T: Collectable>() -> usize {
    let x = null_mut::<T>();
    unsafe { std::mem::transmute::<_, mopa::TraitObject>(x as *mut dyn Collectable).vtable as _ }
}

pub fn small_type_id<T: 'static>() -> u32 {
    let mut hasher = ahash::AHasher::default();
    std::any::TypeId::of::<T>().hash(&mut hasher);
    let h = hasher.finish();
    ((h >> 32) as u32 ^ h as u32) | 1
}

/// Typed handle to a heap object. Plain word; always passes through the
/// mutator read barrier when loaded out of another heap object.
pub struct Gc<T: Collectable + ?Sized> {
    pub(crate) base: NonNull<HeapObjectHeader>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable + ?Sized> Gc<T> {
    #[inline(always)]
    pub(crate) fn from_header(base: *mut HeapObjectHeader) -> Self {
        Self {
            base: unsafe { NonNull::new_unchecked(base) },
            marker: PhantomData,
        }
    }

    #[inline(always)]
    pub(crate) fn header(&self) -> &HeapObjectHeader {
        unsafe { self.base.as_ref() }
    }

    pub fn to_dyn(self) -> Gc<dyn Collectable> {
        Gc {
            base: self.base,
            marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn is<U: Collectable>(&self) -> bool {
        self.header().type_id() == small_type_id::<U>()
    }

    pub fn downcast<U: Collectable>(&self) -> Option<Gc<U>> {
        if self.is::<U>() {
            Some(Gc {
                base: self.base,
                marker: PhantomData,
            })
        } else {
            None
        }
    }

    pub fn to_field(self) -> Field<T> {
        Field { base: self }
    }

    pub fn allocation_size(&self) -> usize {
        self.header().object_size()
    }

    #[inline(always)]
    pub fn ptr_eq<U: Collectable + ?Sized>(&self, other: &Gc<U>) -> bool {
        self.base == other.base
    }
}

impl<T: Collectable + ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Collectable + ?Sized> Copy for Gc<T> {}

impl<T: Collectable> Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*(*self.base.as_ptr()).data().cast::<T>() }
    }
}

impl<T: Collectable> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *((*self.base.as_ptr()).data().cast::<T>() as *mut T) }
    }
}

unsafe impl<T: Collectable + ?Sized> Trace for Gc<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.mark_object(&mut self.base);
    }
}
unsafe impl<T: Collectable + ?Sized> Finalize for Gc<T> {}
impl<T: Collectable + ?Sized> Collectable for Gc<T> {}

impl<T: Collectable + ?Sized> std::fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.base)
    }
}

/// A reference field stored inside a heap object. Reads of such a field from
/// mutator code go through [`crate::mutator::Mutator::load`] so the read
/// barrier sees them.
#[repr(transparent)]
pub struct Field<T: Collectable + ?Sized> {
    base: Gc<T>,
}

impl<T: Collectable + ?Sized> Field<T> {
    pub fn to_gc(&self) -> Gc<T> {
        self.base
    }

    pub fn is<U: Collectable>(&self) -> bool {
        self.base.is::<U>()
    }

    pub fn downcast<U: Collectable>(&self) -> Option<Gc<U>> {
        self.base.downcast::<U>()
    }

    pub(crate) fn slot(&self) -> *mut *mut HeapObjectHeader {
        &self.base.base as *const NonNull<HeapObjectHeader> as *mut *mut HeapObjectHeader
    }
}

impl<T: Collectable + Sized> Deref for Field<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*(*self.base.base.as_ptr()).data().cast::<T>() }
    }
}

impl<T: Collectable + Sized> DerefMut for Field<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *((*self.base.base.as_ptr()).data().cast::<T>() as *mut T) }
    }
}

unsafe impl<T: Collectable + ?Sized> Trace for Field<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.mark_object(&mut self.base.base);
    }
}
unsafe impl<T: Collectable + ?Sized> Finalize for Field<T> {}
impl<T: Collectable> Collectable for Field<T> {}

/// Weak reference object. The referent is deliberately not traced: the
/// collector discovers reference objects during the field scan and routes the
/// referent through the reference processor instead. A cleared referent reads
/// as `None`.
#[repr(C)]
pub struct WeakRef<T: Collectable> {
    pub(crate) referent: UnsafeCell<*mut HeapObjectHeader>,
    pub(crate) is_soft: bool,
    marker: PhantomData<T>,
}

impl<T: Collectable> WeakRef<T> {
    pub(crate) fn new(target: Gc<T>, is_soft: bool) -> Self {
        Self {
            referent: UnsafeCell::new(target.base.as_ptr()),
            is_soft,
            marker: PhantomData,
        }
    }

    pub(crate) fn referent_slot(&self) -> *mut *mut HeapObjectHeader {
        self.referent.get()
    }

    pub(crate) fn raw_referent(&self) -> *mut HeapObjectHeader {
        unsafe { *self.referent.get() }
    }
}

// Layout-stable view of any `WeakRef<T>` body, for the collector which only
// holds headers. Kept in sync with `WeakRef` by the `repr(C)` layout.
#[repr(C)]
struct WeakRefRepr {
    referent: UnsafeCell<*mut HeapObjectHeader>,
    is_soft: bool,
}

/// # Safety
/// `obj` must be a reference object (`is_reference` header bit set).
pub(crate) unsafe fn reference_referent_slot(obj: *mut HeapObjectHeader) -> *mut *mut HeapObjectHeader {
    debug_assert!((*obj).is_reference());
    (*((*obj).data() as *const WeakRefRepr)).referent.get()
}

/// # Safety
/// `obj` must be a reference object.
pub(crate) unsafe fn reference_is_soft(obj: *mut HeapObjectHeader) -> bool {
    debug_assert!((*obj).is_reference());
    (*((*obj).data() as *const WeakRefRepr)).is_soft
}

unsafe impl<T: Collectable> Trace for WeakRef<T> {}
unsafe impl<T: Collectable> Finalize for WeakRef<T> {}
impl<T: Collectable> Collectable for WeakRef<T> {}

pub type Weak<T> = Gc<WeakRef<T>>;

/// Fixed-length inline array. Also the shape used to fill to-space holes left
/// by lost copy races, so a region stays walkable.
#[repr(C, align(8))]
pub struct Array<T: Trace + 'static> {
    pub(crate) length: u32,
    pub(crate) is_inited: bool,
    values: [T; 0],
}

impl<T: Trace + 'static> Array<T> {
    pub(crate) fn uninit(length: usize) -> Self {
        Self {
            length: length as u32,
            is_inited: false,
            values: [],
        }
    }

    pub fn data(&self) -> *const T {
        self.values.as_ptr()
    }

    pub fn data_mut(&mut self) -> *mut T {
        self.values.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.length as _
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn at(&self, index: usize) -> &T {
        debug_assert!(index < self.len());
        unsafe { &*self.data().add(index) }
    }

    pub fn at_mut(&mut self, index: usize) -> &mut T {
        debug_assert!(index < self.len());
        unsafe { &mut *self.data_mut().add(index) }
    }
}

unsafe impl<T: Trace> Trace for Array<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        if !self.is_inited {
            return;
        }
        let mut cursor = self.data_mut();
        unsafe {
            let end = cursor.add(self.length as _);
            while cursor < end {
                (*cursor).trace(vis);
                cursor = cursor.add(1);
            }
        }
    }
}

unsafe impl<T: Trace> Finalize for Array<T> {}
impl<T: Trace> Collectable for Array<T> {
    fn allocation_size(&self) -> usize {
        self.length as usize * size_of::<T>() + size_of::<Self>()
    }
}

/// Total byte size (header included) of a hole filled with an `Array<i32>`
/// body of `length` elements.
pub(crate) const fn int_array_byte_size(length: usize) -> usize {
    size_of::<HeapObjectHeader>() + size_of::<Array<i32>>() + length * size_of::<i32>()
}

/// Smallest hole that can hold a valid object: a bare unit-typed header.
pub(crate) const fn min_object_size() -> usize {
    size_of::<HeapObjectHeader>()
}

macro_rules! impl_prim {
    ($($t: ty)*) => {
        $(
            unsafe impl Trace for $t {}
            unsafe impl Finalize for $t {}
            impl Collectable for $t {}
        )*
    };
}

impl_prim!(
    u8 u16 u32 u64 u128
    i8 i16 i32 i64 i128
    f32 f64
    bool String
);

unsafe impl Trace for () {}
unsafe impl Finalize for () {}
impl Collectable for () {}

unsafe impl<T: Trace> Trace for Option<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        if let Some(val) = self {
            val.trace(vis);
        }
    }
}
unsafe impl<T: Collectable> Finalize for Option<T> {}
impl<T: Collectable> Collectable for Option<T> {}

unsafe impl<T: Trace> Trace for Vec<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        for entry in self.iter_mut() {
            entry.trace(vis);
        }
    }
}

unsafe impl<T: Trace> Trace for Box<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        (**self).trace(vis);
    }
}

unsafe impl<T: Trace> Trace for [T] {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        for x in self.iter_mut() {
            x.trace(vis);
        }
    }
}

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        for x in self.iter_mut() {
            x.trace(vis);
        }
    }
}

unsafe impl Trace for &mut [&mut dyn Trace] {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        for x in self.iter_mut() {
            x.trace(vis);
        }
    }
}
