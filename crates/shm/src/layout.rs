//! Segment header — the binary layout shared by every process attached to a name.
//!
//! Layout (repr(C), native alignment):
//!   - lock:          sem_t, process-shared, one permit
//!   - reserved:      sem_t, second signal slot, never initialized
//!   - live_handles:  u8, attached handles across all processes
//!   - value:         T, at T's native alignment
//!
//! The prefix up to and including `live_handles` does not depend on `T`, so
//! tools can read the counter without knowing the stored type.

use std::cell::UnsafeCell;
use std::mem::{offset_of, size_of};

/// Plain data that may live in a segment.
///
/// # Safety
/// Implementors must not contain pointers, references, descriptors or
/// anything else that is only meaningful inside one process, and must be
/// valid for any bit pattern written by a process built from the same type
/// definition. Alignment must not exceed the page size.
pub unsafe trait SharedValue: Copy + Default + Send + 'static {}

macro_rules! shared_value_primitives {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl SharedValue for $t {})*
    };
}

shared_value_primitives!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

#[repr(C)]
pub struct SegmentHeader<T> {
    pub(crate) lock: UnsafeCell<libc::sem_t>,
    pub(crate) reserved: UnsafeCell<libc::sem_t>,
    pub(crate) live_handles: UnsafeCell<u8>,
    pub(crate) value: UnsafeCell<T>,
}

impl<T> SegmentHeader<T> {
    pub const SIZE: usize = size_of::<Self>();
}

/// Byte offset of the live-handle counter, identical for every `T`.
pub const LIVE_HANDLES_OFFSET: usize = 2 * size_of::<libc::sem_t>();

/// Smallest mapping that covers the type-independent prefix.
pub const PREFIX_SIZE: usize = SegmentHeader::<()>::SIZE;

const _: () = {
    assert!(offset_of!(SegmentHeader<()>, live_handles) == LIVE_HANDLES_OFFSET);
    assert!(offset_of!(SegmentHeader<u8>, live_handles) == LIVE_HANDLES_OFFSET);
    assert!(offset_of!(SegmentHeader<u128>, live_handles) == LIVE_HANDLES_OFFSET);
    assert!(offset_of!(SegmentHeader<[u64; 16]>, live_handles) == LIVE_HANDLES_OFFSET);
    assert!(PREFIX_SIZE > LIVE_HANDLES_OFFSET);
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::align_of;

    #[allow(dead_code)]
    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct Wide {
        a: u8,
        b: u64,
    }

    #[test]
    fn test_value_follows_counter() {
        assert_eq!(offset_of!(SegmentHeader<u8>, value), LIVE_HANDLES_OFFSET + 1);
        assert_eq!(
            offset_of!(SegmentHeader<Wide>, value) % align_of::<Wide>(),
            0
        );
        assert!(offset_of!(SegmentHeader<Wide>, value) > LIVE_HANDLES_OFFSET);
    }

    #[test]
    fn test_every_header_covers_prefix() {
        assert!(SegmentHeader::<u8>::SIZE >= PREFIX_SIZE);
        assert!(SegmentHeader::<Wide>::SIZE >= PREFIX_SIZE);
        assert!(SegmentHeader::<[u8; 3]>::SIZE >= PREFIX_SIZE);
    }
}
