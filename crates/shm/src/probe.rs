//! Type-agnostic segment inspection for operators.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use common::types::normalize_segment_name;

use crate::error::{Result, SegmentError};
use crate::layout::{SegmentHeader, PREFIX_SIZE};
use crate::mmap::{self, SizeCheck};
use crate::semaphore::SemGuard;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub name: String,
    /// Size of the OS object in bytes (header plus payload).
    pub size: u64,
    pub live_handles: u8,
}

/// Read the live-handle count of `name` under its lock without knowing the
/// stored type. Does not change the count.
pub fn inspect(dir: &Path, name: &str, timeout: Option<Duration>) -> Result<SegmentInfo> {
    let name = normalize_segment_name(name).map_err(|reason| SegmentError::InvalidName {
        name: name.to_string(),
        reason,
    })?;

    let (file, mut mmap) = mmap::open_shm(dir, name, PREFIX_SIZE, SizeCheck::AtLeast)?;
    let size = file
        .metadata()
        .map_err(|e| SegmentError::map(name, e))?
        .len();

    // Only the prefix is mapped; `SegmentHeader<()>` covers exactly that.
    let header = unsafe { &*(mmap.as_mut_ptr() as *const SegmentHeader<()>) };
    let live_handles = {
        let _held = unsafe { SemGuard::acquire(&header.lock, timeout)? };
        unsafe { *header.live_handles.get() }
    };

    debug!("segment {}: {} bytes, {} live handles", name, size, live_handles);
    Ok(SegmentInfo {
        name: name.to_string(),
        size,
        live_handles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{SegmentOptions, SharedHandle};

    #[test]
    fn test_inspect_counts_handles() {
        let dir = tempfile::tempdir().unwrap();
        let opts = SegmentOptions {
            dir: dir.path().to_path_buf(),
            ..SegmentOptions::default()
        };

        let a = SharedHandle::<u64>::open_with("probe", &opts).unwrap();
        let b = a.try_clone().unwrap();

        let info = inspect(dir.path(), "/probe", None).unwrap();
        assert_eq!(info.name, "probe");
        assert_eq!(info.live_handles, 2);
        assert_eq!(info.size, SegmentHeader::<u64>::SIZE as u64);

        drop(b);
        assert_eq!(inspect(dir.path(), "probe", None).unwrap().live_handles, 1);
        assert_eq!(a.live_handles().unwrap(), 1);

        drop(a);
        assert!(inspect(dir.path(), "probe", None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_inspect_times_out_on_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let opts = SegmentOptions {
            dir: dir.path().to_path_buf(),
            lock_timeout: Some(Duration::from_millis(500)),
            ..SegmentOptions::default()
        };
        let a = SharedHandle::<u64>::open_with("held", &opts).unwrap();

        let (_file, mut mmap) = mmap::open_shm(dir.path(), "held", PREFIX_SIZE, SizeCheck::AtLeast).unwrap();
        let header = unsafe { &*(mmap.as_mut_ptr() as *const SegmentHeader<()>) };
        let held = unsafe { SemGuard::acquire(&header.lock, None).unwrap() };

        let err = inspect(dir.path(), "held", Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, SegmentError::LockWaitFailure(_)));

        drop(held);
        assert_eq!(inspect(dir.path(), "held", None).unwrap().live_handles, 1);
        drop(a);
    }
}
