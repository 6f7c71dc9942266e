use crate::{
    heap::HeapBase,
    internal::trace_trait::TraceDescriptor,
    liveness_broker::WeakCallback,
    marking_state::MarkingState,
    visitor::VisitorTrait,
};

/// Visitor handed to trace callbacks while draining the marking worklist.
pub struct MarkingVisitor<'s, 'w> {
    state: &'s mut MarkingState<'w>,
}

impl<'s, 'w> MarkingVisitor<'s, 'w> {
    pub fn new(state: &'s mut MarkingState<'w>) -> Self {
        Self { state }
    }
}

impl<'s, 'w> VisitorTrait for MarkingVisitor<'s, 'w> {
    fn heap(&self) -> &HeapBase {
        self.state.heap()
    }

    fn visit(&mut self, this: *const u8, descriptor: TraceDescriptor) {
        self.state.mark_and_push(this, descriptor);
    }

    fn visit_weak(
        &mut self,
        this: *const u8,
        descriptor: TraceDescriptor,
        callback: WeakCallback,
        parameter: *const u8,
    ) {
        self.state
            .register_weak_reference_if_needed(this, descriptor, callback, parameter);
    }

    fn visit_conservative(&mut self, from: *const *const u8, to: *const *const u8) {
        self.state.mark_conservatively(from, to);
    }

    fn register_weak_callback(&mut self, callback: WeakCallback, parameter: *const u8) {
        self.state.register_weak_callback(callback, parameter);
    }
}

/// Visitor for weak roots. Marking is done by the time it runs, so weak references are
/// resolved on the spot instead of being queued.
pub struct WeakRootsMarkingVisitor<'s, 'w> {
    state: &'s mut MarkingState<'w>,
}

impl<'s, 'w> WeakRootsMarkingVisitor<'s, 'w> {
    pub fn new(state: &'s mut MarkingState<'w>) -> Self {
        Self { state }
    }
}

impl<'s, 'w> VisitorTrait for WeakRootsMarkingVisitor<'s, 'w> {
    fn heap(&self) -> &HeapBase {
        self.state.heap()
    }

    fn visit(&mut self, this: *const u8, descriptor: TraceDescriptor) {
        self.state.mark_and_push(this, descriptor);
    }

    fn visit_weak(
        &mut self,
        this: *const u8,
        descriptor: TraceDescriptor,
        callback: WeakCallback,
        parameter: *const u8,
    ) {
        self.state
            .invoke_weak_roots_callback_if_needed(this, descriptor, callback, parameter);
    }

    fn visit_conservative(&mut self, from: *const *const u8, to: *const *const u8) {
        self.state.mark_conservatively(from, to);
    }

    fn register_weak_callback(&mut self, callback: WeakCallback, parameter: *const u8) {
        self.state.register_weak_callback(callback, parameter);
    }
}
