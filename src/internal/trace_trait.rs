use std::fmt;

use crate::visitor::Visitor;

pub type TraceCallback = fn(&mut Visitor<'_>, *const u8);

/// Object a [TraceDescriptor] traces.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BaseObject {
    /// Payload of a constructed object.
    Payload(*const u8),
    /// The object is still being constructed and its base address or trace
    /// information can not be trusted yet.
    NotFullyConstructed,
}

/// Describe how to trace an object.
#[derive(Clone, Copy)]
pub struct TraceDescriptor {
    pub base_object: BaseObject,
    pub callback: TraceCallback,
}

// Descriptors travel between marking tasks through the worklists. The payload
// pointer is only dereferenced by the trace callback.
unsafe impl Send for TraceDescriptor {}

impl fmt::Debug for TraceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceDescriptor")
            .field("base_object", &self.base_object)
            .field("callback", &(self.callback as usize as *const u8))
            .finish()
    }
}

impl TraceDescriptor {
    pub fn new(base_object_payload: *const u8, callback: TraceCallback) -> Self {
        Self {
            base_object: BaseObject::Payload(base_object_payload),
            callback,
        }
    }

    pub fn not_fully_constructed(callback: TraceCallback) -> Self {
        Self {
            base_object: BaseObject::NotFullyConstructed,
            callback,
        }
    }

    pub fn is_not_fully_constructed(&self) -> bool {
        self.base_object == BaseObject::NotFullyConstructed
    }
}

/// Trait specifying how the garbage collector processes an object of type `T`.
pub trait TraceTrait: Sized {
    /// Function invoking the tracing for an object of type `T`.
    /// - `vis`: The visitor to dispatch to.
    fn trace(&self, vis: &mut Visitor<'_>) {
        let _ = vis;
    }
    /// Type erased entry point stored in the GC info table.
    fn trace_(vis: &mut Visitor<'_>, this: *const u8) {
        unsafe {
            (*this.cast::<Self>()).trace(vis);
        }
    }
    /// Returns trace descriptor for type that implements this trait. Not recommended to override it.
    fn get_trace_descriptor(this: *const u8) -> TraceDescriptor {
        TraceDescriptor::new(this, Self::trace_)
    }
}
