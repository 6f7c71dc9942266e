use std::{
    any::TypeId,
    collections::HashMap,
    mem::size_of,
    sync::{
        atomic::{AtomicU16, Ordering},
        OnceLock,
    },
};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::{
    header::HeapObjectHeader,
    internal::{
        gc_info::GCInfoIndex,
        trace_trait::{TraceCallback, TraceDescriptor},
    },
};

/// GCInfo contains metadata for objects.
#[derive(Clone, Copy)]
pub struct GCInfo {
    pub trace: TraceCallback,
    pub name: &'static str,
}

pub struct GCInfoTable {
    #[allow(dead_code)]
    map: MmapMut,
    table: *mut GCInfo,
    type_id_map: Mutex<HashMap<TypeId, GCInfoIndex>>,
    current_index: AtomicU16,
}

// Entries are written exactly once before their index is handed out and are
// never modified afterwards.
unsafe impl Send for GCInfoTable {}
unsafe impl Sync for GCInfoTable {}

static GC_TABLE: OnceLock<GCInfoTable> = OnceLock::new();

impl GCInfoTable {
    /// At maximum [`MAX_INDEX - 1`](GCInfoTable::MAX_INDEX) indices are supported.
    ///
    /// We assume that 14 bits are enough to represent all possible types.
    pub const MAX_INDEX: u16 = 1 << 14;
    /// Minimum index returned. Values smaller [`MIN_INDEX`](GCInfoTable::MIN_INDEX) may be used as
    /// sentinels.
    pub const MIN_INDEX: u16 = 1;

    fn new() -> Self {
        let mut map = MmapMut::map_anon(Self::MAX_INDEX as usize * size_of::<GCInfo>())
            .unwrap_or_else(|err| panic!("failed to reserve GCInfoTable memory: {}", err));
        let table = map.as_mut_ptr().cast::<GCInfo>();
        Self {
            map,
            table,
            type_id_map: Mutex::new(HashMap::new()),
            current_index: AtomicU16::new(Self::MIN_INDEX),
        }
    }

    /// Process wide table, created on first use.
    pub fn global() -> &'static GCInfoTable {
        GC_TABLE.get_or_init(Self::new)
    }

    pub(crate) fn add_gc_info_type_id(&self, type_id: TypeId, info: GCInfo) -> GCInfoIndex {
        let mut type_id_map = self.type_id_map.lock();
        if let Some(index) = type_id_map.get(&type_id) {
            return *index;
        }
        let index = self.add_gc_info(info);
        log::trace!("registered {} as GCInfoIndex {}", info.name, index.0);
        type_id_map.insert(type_id, index);
        index
    }

    pub fn add_gc_info(&self, info: GCInfo) -> GCInfoIndex {
        let index = match self.current_index.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |index| (index < Self::MAX_INDEX).then(|| index + 1),
        ) {
            Ok(index) => index,
            Err(_) => panic!("GCInfoTable memory exhausted"),
        };
        unsafe {
            self.table.add(index as usize).write(info);
        }
        GCInfoIndex(index)
    }

    pub fn gc_info(&self, index: GCInfoIndex) -> GCInfo {
        debug_assert!(
            index.0 >= Self::MIN_INDEX && index.0 < self.number_of_gc_infos(),
            "invalid GCInfoIndex {}",
            index.0
        );
        unsafe { self.table.add(index.0 as usize).read() }
    }

    /// Number of indices handed out so far, sentinels included.
    pub fn number_of_gc_infos(&self) -> u16 {
        self.current_index
            .load(Ordering::Acquire)
            .min(Self::MAX_INDEX)
    }

    /// Builds the descriptor of a constructed object from its recorded type.
    pub fn trace_descriptor_for(&self, header: &HeapObjectHeader) -> TraceDescriptor {
        TraceDescriptor::new(
            header.payload(),
            self.gc_info(header.get_gc_info_index()).trace,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::{gc_info::GCInfoTrait, trace_trait::TraceTrait};
    use std::panic::AssertUnwindSafe;

    struct Registered(#[allow(dead_code)] u32);
    impl TraceTrait for Registered {}

    struct Other;
    impl TraceTrait for Other {}

    #[test]
    fn exhausted_table_never_hands_out_sentinels() {
        let table = GCInfoTable::new();
        table
            .current_index
            .store(GCInfoTable::MAX_INDEX - 1, Ordering::Relaxed);
        let info = GCInfo {
            trace: <Other as TraceTrait>::trace_,
            name: "Other",
        };
        assert_eq!(table.add_gc_info(info).0, GCInfoTable::MAX_INDEX - 1);
        for _ in 0..3 {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| table.add_gc_info(info)));
            assert!(result.is_err());
        }
        assert_eq!(
            table.current_index.load(Ordering::Relaxed),
            GCInfoTable::MAX_INDEX
        );
        assert_eq!(table.number_of_gc_infos(), GCInfoTable::MAX_INDEX);
    }

    #[test]
    fn type_registration_is_idempotent() {
        let first = <Registered as GCInfoTrait>::index();
        let second = <Registered as GCInfoTrait>::index();
        assert_eq!(first, second);
        assert!(first.0 >= GCInfoTable::MIN_INDEX);
        assert_ne!(first, <Other as GCInfoTrait>::index());
        assert!(GCInfoTable::global()
            .gc_info(first)
            .name
            .ends_with("Registered"));
    }
}
