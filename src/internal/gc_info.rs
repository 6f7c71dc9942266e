use std::any::{type_name, TypeId};

use crate::gc_info_table::{GCInfo, GCInfoTable};

use super::trace_trait::TraceTrait;

/// Index into the [GCInfoTable]. Index 0 is reserved for free headers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct GCInfoIndex(pub u16);

pub trait GCInfoTrait: TraceTrait + 'static {
    /// Returns the index of this type, registering it on first use.
    fn index() -> GCInfoIndex {
        GCInfoTable::global().add_gc_info_type_id(
            TypeId::of::<Self>(),
            GCInfo {
                trace: <Self as TraceTrait>::trace_,
                name: type_name::<Self>(),
            },
        )
    }
}

impl<T: TraceTrait + 'static> GCInfoTrait for T {}
