//! Segment files — create, publish, open and remove named segments via /dev/shm.
//!
//! A new segment is built in a private staging file and only becomes visible
//! under its public name once fully initialized (`link(2)` is atomic and fails
//! with `EEXIST` if the name is taken). Attachers therefore never map a
//! half-initialized header.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Result, SegmentError};

static STAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Staging files are named `.shm-stage.<pid>.<seq>.<nanos>`.
const STAGING_PREFIX: &str = ".shm-stage.";

/// Path in the shm directory for a named segment.
pub fn shm_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

/// Bounded-length, process-unique staging name. Hidden so `ls` stays tidy.
fn staging_path(dir: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    dir.join(format!(
        "{}{}.{}.{}",
        STAGING_PREFIX,
        std::process::id(),
        STAGE_SEQ.fetch_add(1, Ordering::Relaxed),
        nanos
    ))
}

/// Removes the staging name when dropped, whether or not it was published.
struct StagingName(PathBuf);

impl Drop for StagingName {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

/// A zero-filled, mapped segment that is not yet visible under its public name.
pub struct StagedShm {
    file: File,
    mmap: MmapMut,
    staging: StagingName,
}

impl StagedShm {
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Link the staging file under `path`. Fails with `AlreadyExists` when
    /// another segment already holds the name.
    pub fn publish(&self, path: &Path) -> io::Result<()> {
        fs::hard_link(&self.staging.0, path)
    }

    /// Descriptor and mapping; the staging name is removed here.
    pub fn into_parts(self) -> (File, MmapMut) {
        (self.file, self.mmap)
    }
}

/// Create a private staging file of `size` bytes with exactly `mode`
/// permissions (the umask is not applied) and map it.
pub fn stage_shm(dir: &Path, name: &str, size: usize, mode: u32) -> Result<StagedShm> {
    let path = staging_path(dir);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(&path)
        .map_err(|e| SegmentError::creation(name, e))?;
    let staging = StagingName(path);

    file.set_permissions(Permissions::from_mode(mode))
        .map_err(|e| SegmentError::creation(name, e))?;
    file.set_len(size as u64)
        .map_err(|e| SegmentError::map(name, e))?;

    // Safety: the file is private to this process until published, and all
    // later shared access goes through the segment semaphore.
    let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }
        .map_err(|e| SegmentError::map(name, e))?;

    Ok(StagedShm {
        file,
        mmap,
        staging,
    })
}

/// How the size of an existing segment is checked on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    /// The object must be exactly the expected size. Handles use this: a
    /// segment created for another type is never joined.
    Exact,
    /// The object must cover at least the expected size. For readers that
    /// only map a type-independent prefix.
    AtLeast,
}

impl SizeCheck {
    fn accepts(self, expected: u64, actual: u64) -> bool {
        match self {
            SizeCheck::Exact => actual == expected,
            SizeCheck::AtLeast => actual >= expected,
        }
    }
}

/// Open an existing segment and map its first `expected_size` bytes.
pub fn open_shm(
    dir: &Path,
    name: &str,
    expected_size: usize,
    check: SizeCheck,
) -> Result<(File, MmapMut)> {
    let path = shm_path(dir, name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| SegmentError::creation(name, e))?;

    let actual_size = file
        .metadata()
        .map_err(|e| SegmentError::map(name, e))?
        .len();
    if !check.accepts(expected_size as u64, actual_size) {
        return Err(SegmentError::SizeMismatch {
            name: name.to_string(),
            expected: expected_size,
            actual: actual_size,
        });
    }

    let mmap = unsafe { MmapOptions::new().len(expected_size).map_mut(&file) }
        .map_err(|e| SegmentError::map(name, e))?;
    Ok((file, mmap))
}

/// Remove a segment name. Missing names are not an error.
pub fn remove_shm(dir: &Path, name: &str) -> io::Result<()> {
    match fs::remove_file(shm_path(dir, name)) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Unlink `path` only if it still names the object behind `file`.
/// Returns whether the name was removed.
pub fn remove_shm_if_same(path: &Path, file: &File) -> io::Result<bool> {
    let ours = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) if current.dev() == ours.dev() && current.ino() == ours.ino() => {
            fs::remove_file(path)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn shm_exists(dir: &Path, name: &str) -> bool {
    shm_path(dir, name).exists()
}

/// Remove staging files whose creating process no longer exists. A process
/// killed between staging and publishing leaves one behind.
///
/// Owners are looked up in the caller's pid namespace. Returns the removed paths.
pub fn sweep_stale_staging(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let pid = match entry.file_name().to_str().and_then(staging_owner) {
            Some(pid) => pid,
            None => continue,
        };
        if process_alive(pid) {
            continue;
        }

        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

fn staging_owner(file_name: &str) -> Option<libc::pid_t> {
    file_name
        .strip_prefix(STAGING_PREFIX)?
        .split('.')
        .next()?
        .parse()
        .ok()
}

fn process_alive(pid: libc::pid_t) -> bool {
    // 0 and negative pids address process groups.
    if pid <= 0 {
        return true;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: alive, owned by someone else.
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
