//! Per task marking state.
//!
//! A [MarkingState] owns one task's views on the shared [MarkingWorklists] and is the
//! only place where objects get marked. Objects are marked with
//! [HeapObjectHeader::try_mark_atomic] so that any number of tasks can race on the same
//! object and exactly one of them pushes it.

use std::mem::size_of;

use crate::{
    gc_info_table::GCInfoTable,
    gc_size,
    header::{AccessMode, HeapObjectHeader},
    heap::HeapBase,
    internal::trace_trait::{BaseObject, TraceDescriptor},
    liveness_broker::{LivenessBrokerFactory, WeakCallback},
    marking_worklists::{
        MarkingItem, MarkingWorklistView, MarkingWorklists, NotFullyConstructedItem,
        NotFullyConstructedWorklistView, WeakCallbackItem, WeakCallbackWorklistView,
    },
};

pub struct MarkingState<'w> {
    heap: &'w HeapBase,
    marking_worklist: MarkingWorklistView<'w>,
    not_fully_constructed_worklist: NotFullyConstructedWorklistView<'w>,
    weak_callback_worklist: WeakCallbackWorklistView<'w>,
    marked_bytes: usize,
    marked_objects: usize,
    not_fully_constructed_pushed: usize,
    weak_callbacks_invoked: usize,
}

impl<'w> MarkingState<'w> {
    pub fn new(heap: &'w HeapBase, worklists: &'w MarkingWorklists, task_id: usize) -> Self {
        Self {
            heap,
            marking_worklist: worklists.marking_worklist().view(task_id),
            not_fully_constructed_worklist: worklists.not_fully_constructed_worklist().view(task_id),
            weak_callback_worklist: worklists.weak_callback_worklist().view(task_id),
            marked_bytes: 0,
            marked_objects: 0,
            not_fully_constructed_pushed: 0,
            weak_callbacks_invoked: 0,
        }
    }

    pub fn heap(&self) -> &'w HeapBase {
        self.heap
    }

    pub fn task_id(&self) -> usize {
        self.marking_worklist.task_id()
    }

    /// Marks the object `payload` belongs to and pushes `descriptor` if this call marked it.
    pub fn mark_and_push(&mut self, payload: *const u8, descriptor: TraceDescriptor) {
        debug_assert!(!payload.is_null());
        match descriptor.base_object {
            BaseObject::NotFullyConstructed => {
                self.push_not_fully_constructed(payload);
            }
            BaseObject::Payload(base) => {
                let header = unsafe { &*self.heap.header_from_payload(base) };
                self.mark_and_push_header(header, descriptor);
            }
        }
    }

    pub fn mark_and_push_header(&mut self, header: &HeapObjectHeader, descriptor: TraceDescriptor) {
        if header.is_in_construction(AccessMode::NonAtomic) {
            self.push_not_fully_constructed(header.payload());
        } else if self.mark_no_push(header) {
            log::trace!("push {:p} (task {})", header.payload(), self.task_id());
            self.marking_worklist.push(descriptor);
        }
    }

    pub fn mark_and_push_header_from_gc_info(&mut self, header: &HeapObjectHeader) {
        let descriptor = GCInfoTable::global().trace_descriptor_for(header);
        self.mark_and_push_header(header, descriptor);
    }

    /// Sets the mark bit without pushing. Returns whether this call marked the object.
    pub fn mark_no_push(&mut self, header: &HeapObjectHeader) -> bool {
        debug_assert!(self
            .heap
            .is_heap_address(header as *const HeapObjectHeader as *const u8));
        debug_assert!(!header.is_free());
        header.try_mark_atomic()
    }

    /// Marks an object given any address inside of it, e.g. a pointer found on the stack.
    pub fn dynamically_mark_address(&mut self, address: *const u8) {
        let header = match self.heap.object_header_from_inner_address(address) {
            Some(header) => header,
            None => return,
        };
        debug_assert!(!header.is_in_construction(AccessMode::Atomic));
        if self.mark_no_push(header) {
            log::trace!("dynamically marked {:p} via {:p}", header.payload(), address);
            self.marking_worklist
                .push(GCInfoTable::global().trace_descriptor_for(header));
        }
    }

    /// Scans `[from, to)` word by word. Words pointing into live heap objects mark them,
    /// objects still in construction are deferred.
    pub fn mark_conservatively(&mut self, from: *const *const u8, to: *const *const u8) {
        let mut scan = from;
        while scan < to {
            let pointer = unsafe { scan.read_unaligned() };
            scan = unsafe { scan.add(1) };
            let header = match self.heap.object_header_from_inner_address(pointer) {
                Some(header) if !header.is_free() => header,
                _ => continue,
            };
            if header.is_in_construction(AccessMode::Atomic) {
                self.push_not_fully_constructed(pointer);
            } else {
                self.dynamically_mark_address(pointer);
            }
        }
    }

    /// Registers `callback` unless the weak target is already known to be alive.
    pub fn register_weak_reference_if_needed(
        &mut self,
        object: *const u8,
        descriptor: TraceDescriptor,
        callback: WeakCallback,
        parameter: *const u8,
    ) {
        if let BaseObject::Payload(base) = descriptor.base_object {
            let header = unsafe { &*self.heap.header_from_payload(base) };
            if header.is_marked(AccessMode::Atomic) {
                return;
            }
        }
        log::trace!("weak reference to {:p} needs a callback", object);
        self.register_weak_callback(callback, parameter);
    }

    pub fn register_weak_callback(&mut self, callback: WeakCallback, parameter: *const u8) {
        self.weak_callback_worklist
            .push(WeakCallbackItem { callback, parameter });
    }

    /// Weak roots are visited once marking is done, so their callbacks run right away.
    pub fn invoke_weak_roots_callback_if_needed(
        &mut self,
        object: *const u8,
        descriptor: TraceDescriptor,
        callback: WeakCallback,
        parameter: *const u8,
    ) {
        debug_assert!(self.marking_worklist.worklist().is_global_empty());
        debug_assert!(self.not_fully_constructed_worklist.is_local_empty());
        debug_assert!(self
            .not_fully_constructed_worklist
            .worklist()
            .is_global_empty());
        if descriptor.is_not_fully_constructed() {
            log::trace!("skipping weak root {:p} in construction", object);
            return;
        }
        callback(&LivenessBrokerFactory::create(), parameter);
        self.weak_callbacks_invoked += 1;
    }

    pub fn account_marked_bytes(&mut self, header: &HeapObjectHeader) {
        self.marked_bytes += if header.is_large_object() {
            self.heap.large_object_payload_size(header)
        } else {
            header.get_size()
        };
        self.marked_objects += 1;
    }

    /// Payload words of `header` as a range for [MarkingState::mark_conservatively].
    pub fn payload_words(header: &HeapObjectHeader) -> (*const *const u8, *const *const u8) {
        let start = header.payload();
        let end = (start as usize + gc_size(header) - size_of::<HeapObjectHeader>()) as *const u8;
        (start.cast(), end.cast())
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    pub fn marked_objects(&self) -> usize {
        self.marked_objects
    }

    pub fn not_fully_constructed_pushed(&self) -> usize {
        self.not_fully_constructed_pushed
    }

    pub fn weak_callbacks_invoked(&self) -> usize {
        self.weak_callbacks_invoked
    }

    pub(crate) fn count_weak_callback_invoked(&mut self) {
        self.weak_callbacks_invoked += 1;
    }

    pub fn reset_marked_bytes(&mut self) {
        self.marked_bytes = 0;
        self.marked_objects = 0;
        self.not_fully_constructed_pushed = 0;
        self.weak_callbacks_invoked = 0;
    }

    pub fn push_not_fully_constructed(&mut self, address: *const u8) {
        log::trace!("defer {:p}: not fully constructed", address);
        self.not_fully_constructed_pushed += 1;
        self.not_fully_constructed_worklist
            .push(NotFullyConstructedItem(address));
    }

    /// Puts back an entry that is still in construction without counting it again.
    pub(crate) fn retain_not_fully_constructed(&mut self, item: NotFullyConstructedItem) {
        self.not_fully_constructed_worklist.push(item);
    }

    pub fn pop_marking(&mut self) -> Option<MarkingItem> {
        self.marking_worklist.pop()
    }

    pub fn pop_not_fully_constructed(&mut self) -> Option<NotFullyConstructedItem> {
        self.not_fully_constructed_worklist.pop()
    }

    pub fn pop_weak_callback(&mut self) -> Option<WeakCallbackItem> {
        self.weak_callback_worklist.pop()
    }

    pub fn local_marking_size(&self) -> usize {
        self.marking_worklist.local_size()
    }

    pub fn is_local_empty(&self) -> bool {
        self.marking_worklist.is_local_empty()
            && self.not_fully_constructed_worklist.is_local_empty()
            && self.weak_callback_worklist.is_local_empty()
    }

    /// Makes every locally held item visible to other tasks.
    pub fn publish(&mut self) {
        self.marking_worklist.publish();
        self.not_fully_constructed_worklist.publish();
        self.weak_callback_worklist.publish();
    }
}
