use crate::{
    gcref::{GcRef, Member, WeakMember},
    header::{AccessMode, HeapObjectHeader},
    heap::HeapBase,
    internal::trace_trait::{TraceDescriptor, TraceTrait},
    liveness_broker::WeakCallback,
};

/// Receiver of the references reported by trace callbacks.
pub trait VisitorTrait {
    fn heap(&self) -> &HeapBase;

    /// Strong reference to the object described by `descriptor`.
    fn visit(&mut self, this: *const u8, descriptor: TraceDescriptor);

    /// Weak reference to `this`. `callback` is invoked with `parameter` once liveness of
    /// `this` is known.
    fn visit_weak(
        &mut self,
        this: *const u8,
        descriptor: TraceDescriptor,
        callback: WeakCallback,
        parameter: *const u8,
    );

    fn visit_conservative(&mut self, from: *const *const u8, to: *const *const u8);

    fn register_weak_callback(&mut self, callback: WeakCallback, parameter: *const u8);
}

/// Handle passed to every trace callback.
pub struct Visitor<'a> {
    pub(crate) vis: &'a mut dyn VisitorTrait,
}

impl<'a> Visitor<'a> {
    pub fn new(vis: &'a mut dyn VisitorTrait) -> Self {
        Self { vis }
    }

    pub fn heap(&self) -> &HeapBase {
        self.vis.heap()
    }

    /// Trace method for raw pointers. Prefer the versions for managed pointers.
    ///
    /// # Safety
    /// `t` must be null or point at the payload of a live heap object of type `T`.
    pub unsafe fn trace<T: TraceTrait>(&mut self, t: *const T) {
        if t.is_null() {
            return;
        }
        self.vis
            .visit(t.cast(), <T as TraceTrait>::get_trace_descriptor(t.cast()))
    }

    /// Trace method for inlined objects that are not allocated themselves but
    /// otherwise follow managed heap layout and have a trace() method.
    pub fn trace_ref<T: TraceTrait>(&mut self, object: &T) {
        <T as TraceTrait>::trace(object, self);
    }

    pub fn trace_gcref<T: TraceTrait>(&mut self, object: GcRef<T>) {
        unsafe { self.trace(object.as_ptr() as *const T) }
    }

    pub fn trace_member<T: TraceTrait>(&mut self, member: &Member<T>) {
        unsafe { self.trace(member.get() as *const T) }
    }

    pub fn trace_weak_member<T: TraceTrait>(&mut self, member: &WeakMember<T>) {
        let target = member.get();
        if target.is_null() {
            return;
        }
        // Objects under construction can not be traced through their type yet.
        let header = unsafe { &*HeapObjectHeader::from_payload(target.cast()) };
        let descriptor = if header.is_in_construction(AccessMode::Atomic) {
            TraceDescriptor::not_fully_constructed(<T as TraceTrait>::trace_)
        } else {
            <T as TraceTrait>::get_trace_descriptor(target.cast())
        };
        self.vis.visit_weak(
            target.cast(),
            descriptor,
            WeakMember::<T>::clear_if_dead,
            member as *const WeakMember<T> as *const u8,
        );
    }

    /// Traces a reference that may point anywhere inside an object. Addresses outside
    /// of the heap and free objects are ignored.
    pub fn trace_interior(&mut self, address: *const u8) {
        if let Some(descriptor) = self.vis.heap().trace_descriptor_for_inner(address) {
            self.vis.visit(address, descriptor);
        }
    }

    /// Treats every word in `[from, to)` as a potential pointer into the heap.
    pub fn trace_conservatively(&mut self, from: *const u8, to: *const u8) {
        self.vis.visit_conservative(from.cast(), to.cast());
    }

    pub fn register_weak_callback(&mut self, callback: WeakCallback, parameter: *const u8) {
        self.vis.register_weak_callback(callback, parameter);
    }
}
