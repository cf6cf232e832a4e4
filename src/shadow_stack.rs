use crate::api::Trace;

/// Per-mutator list of on-stack roots. Entries are linked through the native
/// stack itself; the collector walks the list at the flip pause and at
/// verification time.
pub struct ShadowStack {
    #[doc(hidden)]
    pub head: core::cell::Cell<*mut RawShadowStackEntry>,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self {
            head: core::cell::Cell::new(core::ptr::null_mut()),
        }
    }

    /// Walk all rooted values.
    ///
    /// # Safety
    /// The handed-out `&mut dyn` aliases a stack slot of the owning thread;
    /// callers run either on that thread or while it is suspended.
    pub unsafe fn walk(&self, mut visitor: impl FnMut(&mut dyn Rootable)) {
        let mut head = *self.head.as_ptr();
        while !head.is_null() {
            let next = (*head).prev;
            visitor((*head).get_dyn());
            head = next;
        }
    }
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Rootable: Trace {}
impl<T: Trace> Rootable for T {}

#[repr(C)]
pub struct RawShadowStackEntry {
    stack: *mut ShadowStack,
    prev: *mut RawShadowStackEntry,
    vtable: usize,
    data_start: [u8; 0],
}

impl RawShadowStackEntry {
    /// # Safety
    /// Returns `&mut dyn` into a stack slot; see [`ShadowStack::walk`].
    pub unsafe fn get_dyn(&self) -> &mut dyn Rootable {
        core::mem::transmute(mopa::TraitObject {
            vtable: self.vtable as _,
            data: self.data_start.as_ptr() as *mut (),
        })
    }
}

#[repr(C)]
pub struct ShadowStackInternal<'a, T: Rootable> {
    pub stack: &'a ShadowStack,
    pub prev: *mut RawShadowStackEntry,
    pub vtable: usize,
    pub value: T,
}

impl<'a, T: Rootable> ShadowStackInternal<'a, T> {
    #[doc(hidden)]
    /// # Safety
    /// Only the `letroot!` macro may call this.
    #[inline]
    pub unsafe fn construct(
        stack: &'a ShadowStack,
        prev: *mut RawShadowStackEntry,
        vtable: usize,
        value: T,
    ) -> Self {
        Self {
            stack,
            prev,
            vtable,
            value,
        }
    }
}

impl<T: Rootable> Drop for ShadowStackInternal<'_, T> {
    #[inline(always)]
    fn drop(&mut self) {
        self.stack.head.set(self.prev);
    }
}

pub struct Rooted<'a, T: Rootable> {
    #[doc(hidden)]
    value: &'a mut T,
}

impl<'a, T: Rootable> Rooted<'a, T> {
    /// # Safety
    /// Only the `letroot!` macro may call this.
    pub unsafe fn construct(ptr: &'a mut T) -> Self {
        Self { value: ptr }
    }
}

impl<'a, T: Rootable> core::ops::Deref for Rooted<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<'a, T: Rootable> core::ops::DerefMut for Rooted<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value
    }
}

/// Root a value on the current thread's shadow stack for the enclosing scope.
/// Allocates nothing: the value lives in a stack slot that is threaded into
/// the shadow stack list.
#[macro_export]
macro_rules! letroot {
    ($var_name: ident = $stack: expr, $value: expr) => {
        let stack: &$crate::shadow_stack::ShadowStack = &$stack;
        let value = $value;
        let mut $var_name = unsafe {
            $crate::shadow_stack::ShadowStackInternal::<_>::construct(
                stack,
                stack.head.get(),
                core::mem::transmute::<_, $crate::mopa::TraitObject>(
                    &value as &dyn $crate::shadow_stack::Rootable,
                )
                .vtable as usize,
                value,
            )
        };

        stack
            .head
            .set(unsafe { core::mem::transmute(&mut $var_name) });
        #[allow(unused_mut)]
        let mut $var_name =
            unsafe { $crate::shadow_stack::Rooted::construct(&mut $var_name.value) };
    };
}
