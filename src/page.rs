//! Heap pages.
//!
//! Every page is a `PAGE_SIZE` aligned mapping that starts with its own metadata.
//! Normal pages hold many bump allocated objects and record object starts in an
//! [ObjectStartBitmap] so that interior pointers can be resolved. Large pages hold a
//! single object whose header directly follows the page metadata.

use std::{
    mem::size_of,
    ptr::{self, NonNull},
};

use atomic::{Atomic, Ordering};
use memmap2::MmapMut;

use crate::{
    header::{HeapObjectHeader, ALLOCATION_GRANULARITY},
    heap::HeapBase,
    internal::gc_info::GCInfoIndex,
};

pub const PAGE_SIZE_LOG2: usize = 17;
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG2;
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;
pub const PAGE_BASE_MASK: usize = !PAGE_OFFSET_MASK;
/// Allocations of at least this size (header included) go to a [LargePage].
pub const LARGE_OBJECT_SIZE_THRESHOLD: usize = PAGE_SIZE / 2;

/// rounds the given value `value` up to the nearest multiple of `align`, which must be
/// a power of two.
#[inline(always)]
pub const fn align_usize(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn map_aligned(size: usize) -> Option<(MmapMut, *mut u8)> {
    let mut map = MmapMut::map_anon(size + PAGE_SIZE).ok()?;
    let start = align_usize(map.as_mut_ptr() as usize, PAGE_SIZE) as *mut u8;
    Some((map, start))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    Normal,
    Large,
}

#[repr(C)]
pub struct BasePage {
    heap: *const HeapBase,
    kind: PageKind,
}

impl BasePage {
    /// Page containing `address`. Valid for any address of a normal page and for the
    /// first `PAGE_SIZE` bytes of a large page, which always include the object header.
    #[inline(always)]
    pub fn from_payload(address: *const u8) -> *mut BasePage {
        (address as usize & PAGE_BASE_MASK) as _
    }

    pub fn heap(&self) -> *const HeapBase {
        self.heap
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn is_large(&self) -> bool {
        self.kind == PageKind::Large
    }

    /// Resolves any address inside an allocated object, header included, to that object's header.
    pub fn object_header_from_inner_address(&self, address: *const u8) -> Option<&HeapObjectHeader> {
        unsafe {
            match self.kind {
                PageKind::Normal => (*(self as *const Self).cast::<NormalPage>())
                    .object_header_from_inner_address(address),
                PageKind::Large => (*(self as *const Self).cast::<LargePage>())
                    .object_header_from_inner_address(address),
            }
        }
    }

    pub fn for_each_object(&self, visitor: &mut dyn FnMut(&HeapObjectHeader)) {
        unsafe {
            match self.kind {
                PageKind::Normal => {
                    (*(self as *const Self).cast::<NormalPage>()).for_each_object(visitor)
                }
                PageKind::Large => visitor((*(self as *const Self).cast::<LargePage>()).object_header()),
            }
        }
    }
}

const BITS_PER_CELL: usize = size_of::<usize>() * 8;
const CELL_COUNT: usize = PAGE_SIZE / ALLOCATION_GRANULARITY / BITS_PER_CELL;

/// One bit per allocation granule of a normal page, set where an object header starts.
pub struct ObjectStartBitmap {
    cells: [Atomic<usize>; CELL_COUNT],
}

impl ObjectStartBitmap {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY_CELL: Atomic<usize> = Atomic::new(0);

    pub fn new() -> Self {
        Self {
            cells: [Self::EMPTY_CELL; CELL_COUNT],
        }
    }

    #[inline]
    fn position(offset: usize) -> (usize, usize) {
        debug_assert!(offset < PAGE_SIZE);
        debug_assert_eq!(offset % ALLOCATION_GRANULARITY, 0);
        let bit = offset / ALLOCATION_GRANULARITY;
        (bit / BITS_PER_CELL, bit % BITS_PER_CELL)
    }

    pub fn set_bit(&self, offset: usize) {
        let (cell, bit) = Self::position(offset);
        self.cells[cell].fetch_or(1 << bit, Ordering::Release);
    }

    pub fn clear_bit(&self, offset: usize) {
        let (cell, bit) = Self::position(offset);
        self.cells[cell].fetch_and(!(1 << bit), Ordering::Release);
    }

    pub fn is_set(&self, offset: usize) -> bool {
        let (cell, bit) = Self::position(offset);
        self.cells[cell].load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Offset of the closest object start at or below `offset`.
    pub fn find_header(&self, offset: usize) -> Option<usize> {
        let (mut cell, bit) = Self::position(offset & !(ALLOCATION_GRANULARITY - 1));
        let mut word = self.cells[cell].load(Ordering::Acquire) & (usize::MAX >> (BITS_PER_CELL - 1 - bit));
        loop {
            if word != 0 {
                let top = BITS_PER_CELL - 1 - word.leading_zeros() as usize;
                return Some((cell * BITS_PER_CELL + top) * ALLOCATION_GRANULARITY);
            }
            if cell == 0 {
                return None;
            }
            cell -= 1;
            word = self.cells[cell].load(Ordering::Acquire);
        }
    }
}

impl Default for ObjectStartBitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
pub struct NormalPage {
    base: BasePage,
    map: MmapMut,
    /// Offset of the first unallocated byte.
    allocation_top: Atomic<usize>,
    object_start_bitmap: ObjectStartBitmap,
}

impl NormalPage {
    pub(crate) fn create(heap: *const HeapBase) -> Option<NonNull<Self>> {
        let (map, start) = map_aligned(PAGE_SIZE)?;
        let page = start.cast::<Self>();
        unsafe {
            page.write(Self {
                base: BasePage {
                    heap,
                    kind: PageKind::Normal,
                },
                map,
                allocation_top: Atomic::new(Self::payload_offset()),
                object_start_bitmap: ObjectStartBitmap::new(),
            });
        }
        NonNull::new(page)
    }

    /// Unmaps the page. Nothing may point into it afterwards.
    pub(crate) unsafe fn destroy(page: NonNull<Self>) {
        drop(ptr::read(page.as_ptr()));
    }

    pub fn base(&self) -> &BasePage {
        &self.base
    }

    pub const fn payload_offset() -> usize {
        align_usize(size_of::<Self>(), ALLOCATION_GRANULARITY)
    }

    pub const fn payload_size() -> usize {
        PAGE_SIZE - Self::payload_offset()
    }

    #[inline(always)]
    fn start(&self) -> usize {
        self as *const Self as usize
    }

    pub fn payload_start(&self) -> *const u8 {
        (self.start() + Self::payload_offset()) as _
    }

    pub fn payload_end(&self) -> *const u8 {
        (self.start() + PAGE_SIZE) as _
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocation_top.load(Ordering::Acquire) - Self::payload_offset()
    }

    /// Bump allocates `size` bytes (header included) and writes an in construction header.
    /// Callers serialize allocation on the page.
    pub(crate) fn try_allocate(
        &self,
        size: usize,
        gc_info_index: GCInfoIndex,
    ) -> Option<NonNull<HeapObjectHeader>> {
        debug_assert_eq!(size % ALLOCATION_GRANULARITY, 0);
        let top = self.allocation_top.load(Ordering::Relaxed);
        if top + size > PAGE_SIZE {
            return None;
        }
        let header = (self.start() + top) as *mut HeapObjectHeader;
        unsafe {
            header.write(HeapObjectHeader::new(size, gc_info_index));
        }
        self.object_start_bitmap.set_bit(top);
        self.allocation_top.store(top + size, Ordering::Release);
        NonNull::new(header)
    }

    pub fn object_header_from_inner_address(&self, address: *const u8) -> Option<&HeapObjectHeader> {
        let address = address as usize;
        let start = self.start();
        let top = start + self.allocation_top.load(Ordering::Acquire);
        if address < start + Self::payload_offset() || address >= top {
            return None;
        }
        let offset = self.object_start_bitmap.find_header(address - start)?;
        let header = unsafe { &*((start + offset) as *const HeapObjectHeader) };
        if address >= start + offset + header.get_size() {
            return None;
        }
        Some(header)
    }

    pub fn for_each_object(&self, visitor: &mut dyn FnMut(&HeapObjectHeader)) {
        let top = self.start() + self.allocation_top.load(Ordering::Acquire);
        let mut cursor = self.payload_start() as usize;
        while cursor < top {
            let header = unsafe { &*(cursor as *const HeapObjectHeader) };
            visitor(header);
            cursor += header.get_size();
        }
    }
}

#[repr(C)]
pub struct LargePage {
    base: BasePage,
    map: MmapMut,
    /// Size of the object including its header.
    payload_size: usize,
}

impl LargePage {
    pub const fn page_header_size() -> usize {
        align_usize(size_of::<Self>(), ALLOCATION_GRANULARITY)
    }

    /// Maps a page for an object of `payload_size` bytes (header included) and writes an
    /// in construction header.
    pub(crate) fn create(
        heap: *const HeapBase,
        payload_size: usize,
        gc_info_index: GCInfoIndex,
    ) -> Option<NonNull<Self>> {
        let (map, start) = map_aligned(Self::page_header_size() + payload_size)?;
        let page = start.cast::<Self>();
        unsafe {
            page.write(Self {
                base: BasePage {
                    heap,
                    kind: PageKind::Large,
                },
                map,
                payload_size,
            });
            (*page)
                .object_header_ptr()
                .write(HeapObjectHeader::new(0, gc_info_index));
        }
        NonNull::new(page)
    }

    pub(crate) unsafe fn destroy(page: NonNull<Self>) {
        drop(ptr::read(page.as_ptr()));
    }

    pub fn base(&self) -> &BasePage {
        &self.base
    }

    pub fn from_object_header(header: *const HeapObjectHeader) -> *mut Self {
        BasePage::from_payload(header.cast()).cast()
    }

    fn object_header_ptr(&self) -> *mut HeapObjectHeader {
        (self as *const Self as usize + Self::page_header_size()) as _
    }

    pub fn object_header(&self) -> &HeapObjectHeader {
        unsafe { &*self.object_header_ptr() }
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn payload_start(&self) -> *const u8 {
        self.object_header_ptr() as _
    }

    pub fn payload_end(&self) -> *const u8 {
        (self.payload_start() as usize + self.payload_size) as _
    }

    pub fn object_header_from_inner_address(&self, address: *const u8) -> Option<&HeapObjectHeader> {
        if address >= self.payload_start() && address < self.payload_end() {
            Some(self.object_header())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::null;

    #[test]
    fn bitmap_finds_closest_start() {
        let bitmap = ObjectStartBitmap::new();
        assert_eq!(bitmap.find_header(1024), None);
        bitmap.set_bit(64);
        bitmap.set_bit(4096);
        assert_eq!(bitmap.find_header(64), Some(64));
        assert_eq!(bitmap.find_header(65), Some(64));
        assert_eq!(bitmap.find_header(4095), Some(64));
        assert_eq!(bitmap.find_header(4096), Some(4096));
        assert_eq!(bitmap.find_header(PAGE_SIZE - 8), Some(4096));
        bitmap.clear_bit(4096);
        assert!(!bitmap.is_set(4096));
        assert_eq!(bitmap.find_header(5000), Some(64));
    }

    #[test]
    fn normal_page_resolves_inner_addresses() {
        let page = NormalPage::create(null()).unwrap();
        unsafe {
            let p = page.as_ref();
            assert_eq!(p as *const NormalPage as usize % PAGE_SIZE, 0);
            let a = p.try_allocate(32, GCInfoIndex(1)).unwrap();
            let b = p.try_allocate(64, GCInfoIndex(1)).unwrap();
            let a_addr = a.as_ptr() as *const u8;
            let b_addr = b.as_ptr() as *const u8;
            assert!(std::ptr::eq(p.object_header_from_inner_address(a_addr.add(8)).unwrap(), a.as_ptr()));
            assert!(std::ptr::eq(p.object_header_from_inner_address(a_addr.add(31)).unwrap(), a.as_ptr()));
            assert!(std::ptr::eq(p.object_header_from_inner_address(b_addr).unwrap(), b.as_ptr()));
            assert!(p.object_header_from_inner_address(b_addr.add(64)).is_none());
            assert!(p.object_header_from_inner_address(p as *const NormalPage as *const u8).is_none());
            assert_eq!(p.allocated_bytes(), 96);
            let mut count = 0;
            p.for_each_object(&mut |_| count += 1);
            assert_eq!(count, 2);
            assert!(std::ptr::eq(
                BasePage::from_payload(b_addr.add(16)) as *const BasePage,
                p.base()
            ));
            NormalPage::destroy(page);
        }
    }

    #[test]
    fn large_page_holds_one_object() {
        let size = 3 * PAGE_SIZE;
        let page = LargePage::create(null(), size, GCInfoIndex(1)).unwrap();
        unsafe {
            let p = page.as_ref();
            let header = p.object_header();
            assert!(header.is_large_object());
            assert_eq!(p.payload_size(), size);
            assert!(std::ptr::eq(
                LargePage::from_object_header(header) as *const LargePage,
                p
            ));
            let deep = p.payload_start().add(2 * PAGE_SIZE + 40);
            assert!(std::ptr::eq(p.object_header_from_inner_address(deep).unwrap(), header));
            assert!(p.object_header_from_inner_address(p.payload_end()).is_none());
            assert!(p.base().is_large());
            LargePage::destroy(page);
        }
    }
}
