//! Named shared-memory segments holding one fixed-layout value, shared across
//! processes through reference-counted handles.
//!
//! ```no_run
//! use shm::SharedHandle;
//!
//! let a = SharedHandle::<u64>::open("demo")?;
//! let b = SharedHandle::<u64>::open("demo")?; // attaches, count = 2
//! a.commit(&7)?;
//! assert_eq!(b.load()?, Some(7));
//! # Ok::<(), shm::SegmentError>(())
//! ```

pub mod error;
pub mod handle;
pub mod layout;
pub mod mmap;
pub mod probe;
pub mod semaphore;

pub use crate::error::{Result, SegmentError, WaitError};
pub use crate::handle::{
    Handle, HandleState, Ownership, SegmentOptions, Shared, SharedHandle, Unique, UniqueHandle,
};
pub use crate::layout::SharedValue;
