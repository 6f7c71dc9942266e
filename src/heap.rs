use std::{
    collections::BTreeMap,
    mem::{align_of, size_of},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    gc_info_table::GCInfoTable,
    gcref::GcRef,
    header::{AccessMode, HeapObjectHeader, ALLOCATION_GRANULARITY},
    internal::{
        gc_info::{GCInfoIndex, GCInfoTrait},
        trace_trait::TraceDescriptor,
    },
    page::{align_usize, BasePage, LargePage, NormalPage, LARGE_OBJECT_SIZE_THRESHOLD, PAGE_SIZE},
};

#[derive(Clone, Copy)]
struct PageRange {
    end: usize,
    page: *mut BasePage,
}

struct Space {
    current_page: Option<NonNull<NormalPage>>,
    normal_pages: Vec<NonNull<NormalPage>>,
    large_pages: Vec<NonNull<LargePage>>,
}

/// Page owner for one heap.
///
/// Only what marking needs is implemented: allocation of headers in normal and large
/// pages, payload and interior pointer resolution, and resetting mark bits between
/// marking episodes. Freed objects are never reused.
pub struct HeapBase {
    space: Mutex<Space>,
    page_registry: RwLock<BTreeMap<usize, PageRange>>,
    allocated_bytes: AtomicUsize,
}

// Page lists are only touched under `space`; object headers are atomics.
unsafe impl Send for HeapBase {}
unsafe impl Sync for HeapBase {}

impl HeapBase {
    /// Heaps are boxed since every page points back to its heap.
    pub fn new() -> Box<Self> {
        Box::new(Self {
            space: Mutex::new(Space {
                current_page: None,
                normal_pages: Vec::new(),
                large_pages: Vec::new(),
            }),
            page_registry: RwLock::new(BTreeMap::new()),
            allocated_bytes: AtomicUsize::new(0),
        })
    }

    /// Allocates `size` payload bytes for an object of type `gc_info_index`. The returned
    /// header is unmarked and in construction. `None` is returned if no memory is available.
    pub fn try_allocate_raw(
        &self,
        size: usize,
        gc_info_index: GCInfoIndex,
    ) -> Option<NonNull<HeapObjectHeader>> {
        debug_assert!(gc_info_index.0 >= GCInfoTable::MIN_INDEX);
        let allocation_size = align_usize(size + size_of::<HeapObjectHeader>(), ALLOCATION_GRANULARITY);
        let mut space = self.space.lock();
        let header = if allocation_size >= LARGE_OBJECT_SIZE_THRESHOLD {
            let page = LargePage::create(self, allocation_size, gc_info_index)?;
            space.large_pages.push(page);
            let base = page.as_ptr().cast::<BasePage>();
            self.register_page(base, unsafe { page.as_ref().payload_end() as usize });
            log::trace!("new large page {:p} for {} bytes", base, allocation_size);
            NonNull::from(unsafe { page.as_ref().object_header() })
        } else {
            let current = space
                .current_page
                .and_then(|page| unsafe { page.as_ref().try_allocate(allocation_size, gc_info_index) });
            match current {
                Some(header) => header,
                None => {
                    let page = NormalPage::create(self)?;
                    space.normal_pages.push(page);
                    space.current_page = Some(page);
                    let base = page.as_ptr().cast::<BasePage>();
                    self.register_page(base, base as usize + PAGE_SIZE);
                    log::trace!("new normal page {:p}", base);
                    unsafe { page.as_ref().try_allocate(allocation_size, gc_info_index)? }
                }
            }
        };
        self.allocated_bytes.fetch_add(allocation_size, Ordering::Relaxed);
        Some(header)
    }

    /// Like [HeapBase::try_allocate_raw] but aborts when out of memory.
    pub fn allocate_raw(&self, size: usize, gc_info_index: GCInfoIndex) -> NonNull<HeapObjectHeader> {
        match self.try_allocate_raw(size, gc_info_index) {
            Some(header) => header,
            None => panic!("out of memory: failed to allocate {} bytes", size),
        }
    }

    /// Allocates `value` and finishes its construction.
    pub fn allocate<T: GCInfoTrait>(&self, value: T) -> GcRef<T> {
        let object = self.allocate_in_construction(value);
        object.header().mark_as_fully_constructed();
        object
    }

    /// Allocates `value` but leaves the object in construction, as if its constructor
    /// was still running. Call [HeapObjectHeader::mark_as_fully_constructed] when done.
    pub fn allocate_in_construction<T: GCInfoTrait>(&self, value: T) -> GcRef<T> {
        debug_assert!(align_of::<T>() <= ALLOCATION_GRANULARITY);
        let header = self.allocate_raw(size_of::<T>(), T::index());
        unsafe {
            (header.as_ref().payload() as *mut T).write(value);
            GcRef::from_header(header)
        }
    }

    /// Promptly frees an object. The memory stays on its page as a free entry.
    pub fn free_object(&self, header: &HeapObjectHeader) {
        debug_assert!(!header.is_free());
        header.set_free();
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    fn register_page(&self, page: *mut BasePage, end: usize) {
        self.page_registry
            .write()
            .insert(page as usize, PageRange { end, page });
    }

    /// Page that contains `address` if it belongs to this heap.
    pub fn lookup_page(&self, address: *const u8) -> Option<&BasePage> {
        let address = address as usize;
        let registry = self.page_registry.read();
        let (_, range) = registry.range(..=address).next_back()?;
        if address < range.end {
            Some(unsafe { &*range.page })
        } else {
            None
        }
    }

    pub fn is_heap_address(&self, address: *const u8) -> bool {
        self.lookup_page(address).is_some()
    }

    #[inline(always)]
    pub fn header_from_payload(&self, payload: *const u8) -> *mut HeapObjectHeader {
        HeapObjectHeader::from_payload(payload)
    }

    /// Resolves an arbitrary address to the header of the object containing it.
    pub fn object_header_from_inner_address(&self, address: *const u8) -> Option<&HeapObjectHeader> {
        self.lookup_page(address)?
            .object_header_from_inner_address(address)
    }

    /// Size of a large object including its header.
    pub fn large_object_payload_size(&self, header: &HeapObjectHeader) -> usize {
        debug_assert!(header.is_large_object());
        unsafe { (*LargePage::from_object_header(header)).payload_size() }
    }

    /// Trace descriptor for a reference that may point into the middle of an object.
    /// Objects still in construction yield a not fully constructed descriptor.
    pub fn trace_descriptor_for_inner(&self, address: *const u8) -> Option<TraceDescriptor> {
        let header = self.object_header_from_inner_address(address)?;
        if header.is_free() {
            return None;
        }
        let table = GCInfoTable::global();
        if header.is_in_construction(AccessMode::Atomic) {
            return Some(TraceDescriptor::not_fully_constructed(
                table.gc_info(header.get_gc_info_index()).trace,
            ));
        }
        Some(table.trace_descriptor_for(header))
    }

    pub fn for_each_object(&self, mut visitor: impl FnMut(&HeapObjectHeader)) {
        let space = self.space.lock();
        for page in space.normal_pages.iter() {
            unsafe { page.as_ref().for_each_object(&mut visitor) };
        }
        for page in space.large_pages.iter() {
            visitor(unsafe { page.as_ref().object_header() });
        }
    }

    /// Clears all mark bits. Starts a new marking episode.
    pub fn reset_marks(&self) {
        self.for_each_object(|header| header.unmark());
    }
}

impl Drop for HeapBase {
    fn drop(&mut self) {
        let space = self.space.get_mut();
        space.current_page = None;
        for page in space.normal_pages.drain(..) {
            unsafe { NormalPage::destroy(page) };
        }
        for page in space.large_pages.drain(..) {
            unsafe { LargePage::destroy(page) };
        }
        self.page_registry.get_mut().clear();
    }
}
