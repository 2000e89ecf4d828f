//! Error taxonomy for segment construction and handle access.

use std::io;

use common::types::NameError;

/// Why a lock acquisition on the segment semaphore did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("lock wait interrupted by a signal")]
    Interrupted,

    #[error("lock wait timed out")]
    TimedOut,

    #[error("lock wait failed: {0}")]
    Os(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("invalid segment name {name:?}: {reason}")]
    InvalidName { name: String, reason: NameError },

    #[error("failed to create or open segment {name}: {source}")]
    CreationFailure {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to map segment {name}: {source}")]
    MapFailure {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("segment {name} has the wrong size: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: u64,
    },

    #[error("invalid handle access: {reason}")]
    InvalidHandleAccess { reason: &'static str },

    #[error(transparent)]
    LockWaitFailure(#[from] WaitError),

    #[error("segment {name} already has the maximum number of live handles")]
    TooManyHandles { name: String },

    #[error("segment {name} was retired while attaching")]
    Retired { name: String },
}

impl SegmentError {
    pub(crate) fn creation(name: &str, source: io::Error) -> Self {
        Self::CreationFailure {
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn map(name: &str, source: io::Error) -> Self {
        Self::MapFailure {
            name: name.to_string(),
            source,
        }
    }

    /// True when the named segment simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::CreationFailure { source, .. } if source.kind() == io::ErrorKind::NotFound
        )
    }

    /// Construction-time failures end the factory call; the rest concern a
    /// single operation on an established handle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidName { .. }
                | Self::CreationFailure { .. }
                | Self::MapFailure { .. }
                | Self::SizeMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SegmentError>;
