use std::{
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
};

use crossbeam_utils::atomic::AtomicCell;

use crate::{
    header::HeapObjectHeader, internal::trace_trait::TraceTrait, liveness_broker::LivenessBroker,
    visitor::Visitor,
};

/// Typed handle to an object allocated in a [HeapBase](crate::heap::HeapBase).
#[repr(C)]
pub struct GcRef<T> {
    pub(crate) header: NonNull<HeapObjectHeader>,
    pub(crate) marker: PhantomData<T>,
}

impl<T> GcRef<T> {
    /// # Safety
    /// `header` must belong to an object of type `T`.
    pub unsafe fn from_header(header: NonNull<HeapObjectHeader>) -> Self {
        Self {
            header,
            marker: PhantomData,
        }
    }

    pub fn header(&self) -> &HeapObjectHeader {
        unsafe { self.header.as_ref() }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.header().payload() as *mut T
    }
}

impl<T> Deref for GcRef<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.as_ptr() }
    }
}
impl<T> DerefMut for GcRef<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.as_ptr() }
    }
}

impl<T> Copy for GcRef<T> {}

impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for GcRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
    }
}

impl<T> Eq for GcRef<T> {}

impl<T> fmt::Pointer for GcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.as_ptr())
    }
}

impl<T> fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({:p})", self.as_ptr())
    }
}

/// Strong reference stored in a field. May be null.
pub struct Member<T> {
    raw: *mut T,
}

impl<T> Member<T> {
    pub const fn null() -> Self {
        Self { raw: null_mut() }
    }

    pub fn new(object: GcRef<T>) -> Self {
        Self {
            raw: object.as_ptr(),
        }
    }

    pub fn get(&self) -> *mut T {
        self.raw
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }

    pub fn set(&mut self, object: GcRef<T>) {
        self.raw = object.as_ptr();
    }

    pub fn clear(&mut self) {
        self.raw = null_mut();
    }
}

impl<T> Default for Member<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<GcRef<T>> for Member<T> {
    fn from(object: GcRef<T>) -> Self {
        Self::new(object)
    }
}

impl<T> Copy for Member<T> {}

impl<T> Clone for Member<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: TraceTrait> TraceTrait for Member<T> {
    fn trace(&self, vis: &mut Visitor<'_>) {
        vis.trace_member(self);
    }
}

/// Weak reference stored in a field. Cleared once marking finds its target dead.
pub struct WeakMember<T> {
    raw: AtomicCell<*mut T>,
}

impl<T> WeakMember<T> {
    pub fn null() -> Self {
        Self {
            raw: AtomicCell::new(null_mut()),
        }
    }

    pub fn new(object: GcRef<T>) -> Self {
        Self {
            raw: AtomicCell::new(object.as_ptr()),
        }
    }

    pub fn get(&self) -> *mut T {
        self.raw.load()
    }

    pub fn is_null(&self) -> bool {
        self.get().is_null()
    }

    pub fn set(&self, object: GcRef<T>) {
        self.raw.store(object.as_ptr());
    }

    pub fn clear(&self) {
        self.raw.store(null_mut());
    }

    /// Weak callback registered for every traced weak member. `slot` is the member itself.
    pub(crate) fn clear_if_dead(broker: &LivenessBroker, slot: *const u8) {
        let member = unsafe { &*slot.cast::<Self>() };
        let target = member.get();
        if !broker.is_heap_object_alive(target.cast()) {
            log::trace!("clearing weak member {:p} -> {:p}", slot, target);
            member.clear();
        }
    }
}

impl<T> Default for WeakMember<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<GcRef<T>> for WeakMember<T> {
    fn from(object: GcRef<T>) -> Self {
        Self::new(object)
    }
}

impl<T: TraceTrait> TraceTrait for WeakMember<T> {
    fn trace(&self, vis: &mut Visitor<'_>) {
        vis.trace_weak_member(self);
    }
}

macro_rules! impl_prim {
    ($($t:ty)*) => {
        $(
            impl TraceTrait for $t {}
        )*
    };
}

impl_prim!(
    bool f32 f64 char
    u8 u16 u32 u64 usize
    i8 i16 i32 i64 isize
    String
);

impl<T: TraceTrait> TraceTrait for Vec<T> {
    fn trace(&self, vis: &mut Visitor<'_>) {
        for elem in self.iter() {
            vis.trace_ref(elem);
        }
    }
}

impl<T: TraceTrait> TraceTrait for Option<T> {
    fn trace(&self, vis: &mut Visitor<'_>) {
        if let Some(elem) = self {
            elem.trace(vis);
        }
    }
}

impl<T: TraceTrait, const N: usize> TraceTrait for [T; N] {
    fn trace(&self, vis: &mut Visitor<'_>) {
        for elem in self.iter() {
            vis.trace_ref(elem);
        }
    }
}
