use crate::header::{AccessMode, HeapObjectHeader};

/// Callback invoked for weak references once marking reached a point where liveness is final.
pub type WeakCallback = fn(&LivenessBroker, *const u8);

/// Proof that liveness queries against the heap are valid.
///
/// Only handed out to weak callbacks after marking finished, i.e. when mark bits are final.
#[derive(Clone, Copy, Debug)]
pub struct LivenessBroker {
    _private: (),
}

impl LivenessBroker {
    /// Returns whether the object starting at `payload` survived marking. Null is
    /// considered alive as there is nothing to clear.
    pub fn is_heap_object_alive(&self, payload: *const u8) -> bool {
        if payload.is_null() {
            return true;
        }
        unsafe { (*HeapObjectHeader::from_payload(payload)).is_marked(AccessMode::Atomic) }
    }
}

pub(crate) struct LivenessBrokerFactory;

impl LivenessBrokerFactory {
    pub(crate) fn create() -> LivenessBroker {
        LivenessBroker { _private: () }
    }
}
