use crate::internal::gc_info::GCInfoIndex;
use atomic::{Atomic, Ordering};
use modular_bitfield::prelude::*;
use std::mem::size_of;

// HeapObjectHeader contains meta data per object and is prepended to each
// object.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | padding         |   32 | Only present on 64-bit platform.         |
// +-----------------+------+------------------------------------------+
// | size            |   15 | 18 bits because allocations are aligned. |
// | mark bit        |    1 |                                          |
// +-----------------+------+------------------------------------------+
// | GCInfoIndex     |   14 |                                          |
// | unused          |    1 |                                          |
// | in construction |    1 | In construction encoded as |false|.      |
// +-----------------+------+------------------------------------------+
//
// Notes:
// - See [GCInfoTable](crate::gc_info_table::GCInfoTable) for constraints on GCInfoIndex.
// - |size| for regular objects is encoded with 15 bits but can actually
//   represent sizes up to 2^18 because allocations are always
//   [ALLOCATION_GRANULARITY] aligned.
// - |size| for large objects is encoded as 0. The size of a large object is
//   stored in [LargePage::payload_size](crate::page::LargePage::payload_size).
// - |mark bit| and |in construction| bits are located in separate 16-bit halves
//    so that marking never races with the constructor finishing.
// - GCInfoIndex 0 marks a free header.
#[repr(C)]
pub struct HeapObjectHeader {
    #[cfg(target_pointer_width = "64")]
    _padding: u32,
    encoded_high: Atomic<u16>,
    encoded_low: Atomic<u16>,
}

pub const ALLOCATION_GRANULARITY: usize = size_of::<usize>();

/// Largest size that can be encoded in a header. Bigger objects live on large pages.
pub const MAX_ENCODED_SIZE: usize = ((1 << 15) - 1) * ALLOCATION_GRANULARITY;

/// How a header bit is read.
///
/// `NonAtomic` is used when the caller knows there is no concurrent writer, e.g. when
/// the object was discovered from the thread that allocates it. It is still a relaxed
/// atomic load, it just does not synchronize with anything.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessMode {
    NonAtomic,
    Atomic,
}

impl AccessMode {
    #[inline(always)]
    fn load_ordering(self) -> Ordering {
        match self {
            AccessMode::NonAtomic => Ordering::Relaxed,
            AccessMode::Atomic => Ordering::Acquire,
        }
    }
}

impl HeapObjectHeader {
    /// Creates a header for a fresh allocation. `size` is the full allocation size
    /// including the header, or 0 for objects on large pages.
    pub(crate) fn new(size: usize, gc_info_index: GCInfoIndex) -> Self {
        debug_assert_eq!(size % ALLOCATION_GRANULARITY, 0);
        debug_assert!(size <= MAX_ENCODED_SIZE);
        let high = EncodedHigh::new()
            .with_size((size / ALLOCATION_GRANULARITY) as u16)
            .with_marked(false);
        let low = EncodedLow::new()
            .with_gc_info_index(gc_info_index.0)
            .with_fully_constructed(false);
        Self {
            #[cfg(target_pointer_width = "64")]
            _padding: 0,
            encoded_high: Atomic::new(u16::from(high)),
            encoded_low: Atomic::new(u16::from(low)),
        }
    }

    #[inline(always)]
    pub fn from_payload(payload: *const u8) -> *mut Self {
        (payload as usize - size_of::<Self>()) as _
    }

    #[inline(always)]
    pub fn payload(&self) -> *const u8 {
        (self as *const Self as usize + size_of::<Self>()) as _
    }

    #[inline(always)]
    fn high(&self, mode: AccessMode) -> EncodedHigh {
        EncodedHigh::from(self.encoded_high.load(mode.load_ordering()))
    }

    #[inline(always)]
    fn low(&self, mode: AccessMode) -> EncodedLow {
        EncodedLow::from(self.encoded_low.load(mode.load_ordering()))
    }

    #[inline(always)]
    pub fn get_gc_info_index(&self) -> GCInfoIndex {
        GCInfoIndex(self.low(AccessMode::NonAtomic).gc_info_index())
    }

    /// Returns size of an object. If it is allocated in large object space `0` is returned.
    #[inline(always)]
    pub fn get_size(&self) -> usize {
        self.high(AccessMode::NonAtomic).size() as usize * ALLOCATION_GRANULARITY
    }

    #[inline(always)]
    pub fn is_large_object(&self) -> bool {
        self.get_size() == 0
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.get_gc_info_index().0 == 0
    }

    #[inline(always)]
    pub fn is_in_construction(&self, mode: AccessMode) -> bool {
        !self.low(mode).fully_constructed()
    }

    /// Called once the constructor body finished. There is no way back.
    pub fn mark_as_fully_constructed(&self) {
        let mut old = self.encoded_low.load(Ordering::Relaxed);
        loop {
            let low = EncodedLow::from(old);
            if low.fully_constructed() {
                return;
            }
            let new = u16::from(low.with_fully_constructed(true));
            match self.encoded_low.compare_exchange_weak(
                old,
                new,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => old = actual,
            }
        }
    }

    #[inline(always)]
    pub fn is_marked(&self, mode: AccessMode) -> bool {
        self.high(mode).marked()
    }

    /// Sets the mark bit. Returns `true` iff this call flipped it, so out of any number of
    /// concurrent callers exactly one wins.
    #[inline]
    pub fn try_mark_atomic(&self) -> bool {
        debug_assert!(!self.is_free(), "free headers must never be marked");
        let mut old = self.encoded_high.load(Ordering::Relaxed);
        loop {
            let high = EncodedHigh::from(old);
            if high.marked() {
                return false;
            }
            let new = u16::from(high.with_marked(true));
            match self.encoded_high.compare_exchange_weak(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    pub(crate) fn unmark(&self) {
        let mut old = self.encoded_high.load(Ordering::Relaxed);
        loop {
            let new = u16::from(EncodedHigh::from(old).with_marked(false));
            match self.encoded_high.compare_exchange_weak(
                old,
                new,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => old = actual,
            }
        }
    }

    /// Turns this header into a free entry. Size is preserved so pages stay iterable.
    pub(crate) fn set_free(&self) {
        debug_assert!(!self.is_marked(AccessMode::Atomic));
        let low = EncodedLow::new()
            .with_gc_info_index(0)
            .with_fully_constructed(true);
        self.encoded_low.store(u16::from(low), Ordering::Release);
    }
}

#[bitfield(bits = 16)]
#[repr(u16)]
#[derive(Clone, Copy)]
pub struct EncodedHigh {
    size: B15,
    marked: bool,
}

#[bitfield(bits = 16)]
#[repr(u16)]
#[derive(Clone, Copy)]
pub struct EncodedLow {
    gc_info_index: B14,
    #[skip]
    __: B1,
    fully_constructed: bool,
}
