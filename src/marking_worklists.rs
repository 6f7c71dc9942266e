use crate::{
    internal::trace_trait::TraceDescriptor,
    liveness_broker::WeakCallback,
    worklist::{View, Worklist},
};

pub const MARKING_WORKLIST_SEGMENT_SIZE: usize = 512;
pub const NOT_FULLY_CONSTRUCTED_WORKLIST_SEGMENT_SIZE: usize = 16;
pub const WEAK_CALLBACK_WORKLIST_SEGMENT_SIZE: usize = 64;

pub type MarkingItem = TraceDescriptor;

/// Address of (or into) an object found before its constructor finished.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NotFullyConstructedItem(pub *const u8);

unsafe impl Send for NotFullyConstructedItem {}

#[derive(Clone, Copy)]
pub struct WeakCallbackItem {
    pub callback: WeakCallback,
    pub parameter: *const u8,
}

unsafe impl Send for WeakCallbackItem {}

pub type MarkingWorklist = Worklist<MarkingItem, MARKING_WORKLIST_SEGMENT_SIZE>;
pub type NotFullyConstructedWorklist =
    Worklist<NotFullyConstructedItem, NOT_FULLY_CONSTRUCTED_WORKLIST_SEGMENT_SIZE>;
pub type WeakCallbackWorklist = Worklist<WeakCallbackItem, WEAK_CALLBACK_WORKLIST_SEGMENT_SIZE>;

pub type MarkingWorklistView<'a> = View<'a, MarkingItem, MARKING_WORKLIST_SEGMENT_SIZE>;
pub type NotFullyConstructedWorklistView<'a> =
    View<'a, NotFullyConstructedItem, NOT_FULLY_CONSTRUCTED_WORKLIST_SEGMENT_SIZE>;
pub type WeakCallbackWorklistView<'a> =
    View<'a, WeakCallbackItem, WEAK_CALLBACK_WORKLIST_SEGMENT_SIZE>;

/// The three worklists shared by all marking tasks of one marking episode.
#[derive(Default)]
pub struct MarkingWorklists {
    marking_worklist: MarkingWorklist,
    not_fully_constructed_worklist: NotFullyConstructedWorklist,
    weak_callback_worklist: WeakCallbackWorklist,
}

impl MarkingWorklists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn marking_worklist(&self) -> &MarkingWorklist {
        &self.marking_worklist
    }

    pub fn not_fully_constructed_worklist(&self) -> &NotFullyConstructedWorklist {
        &self.not_fully_constructed_worklist
    }

    pub fn weak_callback_worklist(&self) -> &WeakCallbackWorklist {
        &self.weak_callback_worklist
    }

    /// Only meaningful when no task holds a view, i.e. all local segments were published.
    pub fn are_global_pools_empty(&self) -> bool {
        self.marking_worklist.is_global_empty()
            && self.not_fully_constructed_worklist.is_global_empty()
            && self.weak_callback_worklist.is_global_empty()
    }

    pub fn clear(&self) {
        self.marking_worklist.clear();
        self.not_fully_constructed_worklist.clear();
        self.weak_callback_worklist.clear();
    }
}
