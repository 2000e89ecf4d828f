//! Handles onto named shared value segments.
//!
//! `Handle::open` runs attach-or-create: an exclusive create is tried first
//! (staged, then published under the name); if the name is taken, the
//! existing segment is mapped and its live-handle count incremented under the
//! segment lock. Every read, commit and count change happens inside one
//! acquisition of that lock. When the count reaches zero the name is unlinked.
//!
//! A holder that dies with the lock held leaves the segment locked for good.
//! `shm-ctl remove` is the manual way out.

use std::fmt;
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr::{addr_of_mut, NonNull};
use std::sync::Arc;
use std::time::Duration;

use memmap2::MmapMut;
use tracing::{debug, trace, warn};

use common::config::SegmentConfig;
use common::types::{normalize_segment_name, DEFAULT_SEGMENT_MODE, DEFAULT_SHM_DIR};

use crate::error::{Result, SegmentError, WaitError};
use crate::layout::{SegmentHeader, SharedValue};
use crate::mmap::{self, SizeCheck};
use crate::semaphore::{self, SemGuard};

/// Attach-or-create passes. A second pass only happens when the segment we
/// found was retired by its last handle before we could join it.
const OPEN_ATTEMPTS: u32 = 2;

/// Where segments live, how they are created, and how long lock waits may take.
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    pub dir: PathBuf,
    /// Exact permission bits of newly created segments.
    pub mode: u32,
    /// Bound on lock waits for attach, clone, read and commit. `None` blocks
    /// forever. Releasing a handle always blocks.
    ///
    /// The deadline is taken from CLOCK_REALTIME (`sem_timedwait`), so a
    /// wall-clock step while waiting stretches or shortens the wait.
    pub lock_timeout: Option<Duration>,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_SHM_DIR),
            mode: DEFAULT_SEGMENT_MODE,
            lock_timeout: None,
        }
    }
}

impl From<&SegmentConfig> for SegmentOptions {
    fn from(cfg: &SegmentConfig) -> Self {
        Self {
            dir: PathBuf::from(&cfg.dir),
            mode: cfg.mode,
            lock_timeout: cfg.lock_timeout(),
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Ownership mode of a [`Handle`].
pub trait Ownership: sealed::Sealed + 'static {}

/// Copyable handles: [`Handle::try_clone`] adds a reference to the segment.
#[derive(Debug)]
pub enum Shared {}

/// Move-only handles.
#[derive(Debug)]
pub enum Unique {}

impl sealed::Sealed for Shared {}
impl sealed::Sealed for Unique {}
impl Ownership for Shared {}
impl Ownership for Unique {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Default-constructed or moved-from.
    Empty,
    Attached,
    /// Explicitly released. Terminal.
    Released,
}

/// One process-local mapping of a segment, shared by clones of a handle.
struct Mapping<T> {
    name: String,
    path: PathBuf,
    header: NonNull<SegmentHeader<T>>,
    _mmap: MmapMut,
    file: File,
}

// Safety: the header is only touched through the segment semaphore.
unsafe impl<T: Send> Send for Mapping<T> {}
unsafe impl<T: Send> Sync for Mapping<T> {}

impl<T> Mapping<T> {
    fn new(name: &str, path: PathBuf, file: File, mut mmap: MmapMut) -> Self {
        // Safety: a successful mmap never returns null.
        let header = unsafe { NonNull::new_unchecked(mmap.as_mut_ptr() as *mut SegmentHeader<T>) };
        Self {
            name: name.to_string(),
            path,
            header,
            _mmap: mmap,
            file,
        }
    }

    fn header(&self) -> &SegmentHeader<T> {
        unsafe { self.header.as_ref() }
    }

    fn lock(&self, timeout: Option<Duration>) -> std::result::Result<SemGuard<'_>, WaitError> {
        // Safety: the semaphore was initialized before the segment was published.
        unsafe { SemGuard::acquire(&self.header().lock, timeout) }
    }

    fn count(&self, _held: &SemGuard<'_>) -> u8 {
        unsafe { *self.header().live_handles.get() }
    }

    fn set_count(&self, _held: &SemGuard<'_>, count: u8) {
        unsafe { *self.header().live_handles.get() = count }
    }

    /// Drop one reference. The last one out unlinks the name; the lock is
    /// posted either way so attachers that opened the file before the unlink
    /// see a retired segment instead of blocking forever.
    ///
    /// Always blocks: a reference may only leave once it has been counted out.
    fn detach(&self) -> Result<()> {
        let held = loop {
            match self.lock(None) {
                Ok(held) => break held,
                Err(WaitError::Interrupted) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        let remaining = self.count(&held).saturating_sub(1);
        self.set_count(&held, remaining);
        if remaining > 0 {
            trace!("segment {}: released, {} handles left", self.name, remaining);
            return Ok(());
        }

        match mmap::remove_shm_if_same(&self.path, &self.file) {
            Ok(true) => debug!("segment {}: last handle released, unlinked", self.name),
            Ok(false) => debug!("segment {}: last handle released, name already gone", self.name),
            Err(e) => warn!("segment {}: last handle released, unlink failed: {}", self.name, e),
        }
        Ok(())
    }
}

impl<T: SharedValue> Mapping<T> {
    fn value(&self, _held: &SemGuard<'_>) -> T {
        unsafe { *self.header().value.get() }
    }

    fn set_value(&self, _held: &SemGuard<'_>, value: &T) {
        unsafe { *self.header().value.get() = *value }
    }
}

/// One counted reference to a segment. Dropping it gives the reference back.
struct Attachment<T> {
    mapping: Arc<Mapping<T>>,
    lock_timeout: Option<Duration>,
    released: bool,
}

impl<T> Attachment<T> {
    fn new(mapping: Arc<Mapping<T>>, lock_timeout: Option<Duration>) -> Self {
        Self {
            mapping,
            lock_timeout,
            released: false,
        }
    }

    /// Add a reference backed by the same mapping.
    fn share(&self) -> Result<Self> {
        let held = self.mapping.lock(self.lock_timeout)?;
        let count = self.mapping.count(&held);
        if count == u8::MAX {
            return Err(SegmentError::TooManyHandles {
                name: self.mapping.name.clone(),
            });
        }
        self.mapping.set_count(&held, count + 1);
        drop(held);

        trace!("segment {}: shared, {} handles", self.mapping.name, count + 1);
        Ok(Self::new(Arc::clone(&self.mapping), self.lock_timeout))
    }

    /// Count this reference out. On error the reference is still held and
    /// the call may be repeated.
    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.mapping.detach()?;
            self.released = true;
        }
        Ok(())
    }
}

impl<T: SharedValue> Attachment<T> {
    fn read_into(&self, out: &mut T, timeout: Option<Duration>) -> bool {
        match self.mapping.lock(timeout) {
            Ok(held) => {
                *out = self.mapping.value(&held);
                true
            }
            Err(e) => {
                debug!("segment {}: read skipped: {}", self.mapping.name, e);
                false
            }
        }
    }

    fn commit_from(&self, value: &T, timeout: Option<Duration>) -> bool {
        match self.mapping.lock(timeout) {
            Ok(held) => {
                self.mapping.set_value(&held, value);
                true
            }
            Err(e) => {
                debug!("segment {}: commit skipped: {}", self.mapping.name, e);
                false
            }
        }
    }
}

impl<T> Drop for Attachment<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.mapping.detach() {
            warn!("segment {}: handle dropped without release: {}", self.mapping.name, e);
        }
    }
}

enum Slot<T> {
    Empty,
    Attached(Attachment<T>),
    Released,
}

/// Per-process handle onto a named segment holding one `T`.
///
/// `M` picks the ownership mode: [`Shared`] handles can be cloned with
/// [`Handle::try_clone`], [`Unique`] handles can only be moved. Both release
/// their reference on drop.
pub struct Handle<T, M = Shared> {
    slot: Slot<T>,
    _mode: PhantomData<M>,
}

pub type SharedHandle<T> = Handle<T, Shared>;
pub type UniqueHandle<T> = Handle<T, Unique>;

impl<T: SharedValue, M: Ownership> Handle<T, M> {
    /// Attach to `name` in the default shm directory, creating it if needed.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, &SegmentOptions::default())
    }

    /// Attach-or-create with explicit options.
    ///
    /// A new segment starts with `T::default()` and a live-handle count of 1.
    /// Joining an existing one bumps the count.
    pub fn open_with(name: &str, opts: &SegmentOptions) -> Result<Self> {
        let name = checked_name(name)?;
        let path = mmap::shm_path(&opts.dir, name);

        for attempt in 1..=OPEN_ATTEMPTS {
            if let Some(att) = create::<T>(name, &path, opts)? {
                debug!(
                    "segment {}: created ({} bytes, mode {:o})",
                    name,
                    SegmentHeader::<T>::SIZE,
                    opts.mode
                );
                return Ok(Self::from_attachment(att));
            }

            match attach_existing::<T>(name, &path, opts) {
                Ok(Some(att)) => {
                    debug!("segment {}: attached", name);
                    return Ok(Self::from_attachment(att));
                }
                Ok(None) => debug!("segment {}: retired while attaching (attempt {})", name, attempt),
                Err(e) if e.is_not_found() => {
                    debug!("segment {}: vanished before attach (attempt {})", name, attempt)
                }
                Err(e) => return Err(e),
            }
        }

        Err(SegmentError::Retired {
            name: name.to_string(),
        })
    }

    /// Attach to an existing segment only. A missing name is a
    /// `CreationFailure` with `io::ErrorKind::NotFound`.
    pub fn attach(name: &str) -> Result<Self> {
        Self::attach_with(name, &SegmentOptions::default())
    }

    pub fn attach_with(name: &str, opts: &SegmentOptions) -> Result<Self> {
        let name = checked_name(name)?;
        let path = mmap::shm_path(&opts.dir, name);
        match attach_existing::<T>(name, &path, opts)? {
            Some(att) => {
                debug!("segment {}: attached", name);
                Ok(Self::from_attachment(att))
            }
            None => Err(SegmentError::Retired {
                name: name.to_string(),
            }),
        }
    }

    /// Copy the stored value into `out`.
    ///
    /// `Ok(false)` when the lock wait fails (interrupted, or timed out under
    /// the handle's configured timeout); the caller may retry.
    pub fn read(&self, out: &mut T) -> Result<bool> {
        let att = self.attachment()?;
        Ok(att.read_into(out, att.lock_timeout))
    }

    pub fn read_timeout(&self, out: &mut T, timeout: Duration) -> Result<bool> {
        Ok(self.attachment()?.read_into(out, Some(timeout)))
    }

    /// Store `value`. Same outcomes as [`Handle::read`].
    pub fn commit(&self, value: &T) -> Result<bool> {
        let att = self.attachment()?;
        Ok(att.commit_from(value, att.lock_timeout))
    }

    pub fn commit_timeout(&self, value: &T, timeout: Duration) -> Result<bool> {
        Ok(self.attachment()?.commit_from(value, Some(timeout)))
    }

    /// `read` into a fresh value; `None` if the lock wait failed.
    pub fn load(&self) -> Result<Option<T>> {
        let mut value = T::default();
        Ok(self.read(&mut value)?.then_some(value))
    }
}

impl<T, M> Handle<T, M> {
    fn from_attachment(att: Attachment<T>) -> Self {
        Self {
            slot: Slot::Attached(att),
            _mode: PhantomData,
        }
    }

    fn attachment(&self) -> Result<&Attachment<T>> {
        match &self.slot {
            Slot::Attached(att) => Ok(att),
            Slot::Empty => Err(SegmentError::InvalidHandleAccess {
                reason: "handle is empty (default-constructed or moved-from)",
            }),
            Slot::Released => Err(SegmentError::InvalidHandleAccess {
                reason: "handle has been released",
            }),
        }
    }

    pub fn state(&self) -> HandleState {
        match self.slot {
            Slot::Empty => HandleState::Empty,
            Slot::Attached(_) => HandleState::Attached,
            Slot::Released => HandleState::Released,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.state() == HandleState::Attached
    }

    pub fn name(&self) -> Option<&str> {
        match &self.slot {
            Slot::Attached(att) => Some(&att.mapping.name),
            _ => None,
        }
    }

    /// Current live-handle count, read under the segment lock.
    pub fn live_handles(&self) -> Result<u8> {
        let att = self.attachment()?;
        let held = att.mapping.lock(att.lock_timeout)?;
        Ok(att.mapping.count(&held))
    }

    /// Move the reference out, leaving `self` empty. The live-handle count
    /// does not change.
    pub fn take(&mut self) -> Self {
        let slot = if matches!(self.slot, Slot::Attached(_)) {
            mem::replace(&mut self.slot, Slot::Empty)
        } else {
            Slot::Empty
        };
        Self {
            slot,
            _mode: PhantomData,
        }
    }

    /// Give the reference back now instead of on drop. Idempotent; the last
    /// handle out unlinks the segment.
    ///
    /// Waits for the lock without a timeout. If the wait fails the handle
    /// stays attached and `release` can be called again.
    pub fn release(&mut self) -> Result<()> {
        if let Slot::Attached(att) = &mut self.slot {
            att.release()?;
            self.slot = Slot::Released;
        }
        Ok(())
    }
}

impl<T> Handle<T, Shared> {
    /// Another handle on the same segment and mapping. Bumps the count.
    pub fn try_clone(&self) -> Result<Self> {
        self.attachment()?.share().map(Self::from_attachment)
    }
}

impl<T, M> Default for Handle<T, M> {
    fn default() -> Self {
        Self {
            slot: Slot::Empty,
            _mode: PhantomData,
        }
    }
}

impl<T, M> fmt::Debug for Handle<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

fn checked_name(name: &str) -> Result<&str> {
    normalize_segment_name(name).map_err(|reason| SegmentError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Exclusive create. `Ok(None)` when the name is already taken.
fn create<T: SharedValue>(
    name: &str,
    path: &Path,
    opts: &SegmentOptions,
) -> Result<Option<Attachment<T>>> {
    let mut staged = mmap::stage_shm(&opts.dir, name, SegmentHeader::<T>::SIZE, opts.mode)?;
    let header = staged.as_mut_ptr() as *mut SegmentHeader<T>;

    // Safety: the staged mapping is private to us, zero-filled and exactly
    // one header long. UnsafeCell is repr(transparent).
    unsafe {
        semaphore::init(addr_of_mut!((*header).lock).cast::<libc::sem_t>())
            .map_err(|e| SegmentError::map(name, e))?;
        addr_of_mut!((*header).live_handles).cast::<u8>().write(1);
        addr_of_mut!((*header).value).cast::<T>().write(T::default());
    }

    match staged.publish(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(SegmentError::creation(name, e)),
    }

    let (file, mmap) = staged.into_parts();
    let mapping = Mapping::new(name, path.to_path_buf(), file, mmap);
    Ok(Some(Attachment::new(Arc::new(mapping), opts.lock_timeout)))
}

/// Join an existing segment. `Ok(None)` when it has already been retired.
fn attach_existing<T: SharedValue>(
    name: &str,
    path: &Path,
    opts: &SegmentOptions,
) -> Result<Option<Attachment<T>>> {
    let (file, mmap) =
        mmap::open_shm(&opts.dir, name, SegmentHeader::<T>::SIZE, SizeCheck::Exact)?;
    let mapping = Arc::new(Mapping::<T>::new(name, path.to_path_buf(), file, mmap));

    {
        let held = mapping.lock(opts.lock_timeout)?;
        match mapping.count(&held) {
            0 => return Ok(None),
            u8::MAX => {
                return Err(SegmentError::TooManyHandles {
                    name: name.to_string(),
                })
            }
            n => mapping.set_count(&held, n + 1),
        }
    }

    Ok(Some(Attachment::new(mapping, opts.lock_timeout)))
}
