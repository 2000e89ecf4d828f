//! Process-shared POSIX semaphore used as the segment mutex.
//!
//! The semaphore lives inside the mapped header and is initialized once by the
//! creating process with `pshared = 1` and a single permit. `SemGuard` holds
//! that permit and gives it back when dropped.

use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::time::Duration;

use crate::error::WaitError;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Initialize `sem` for cross-process use with one permit.
///
/// # Safety
/// `sem` must point to writable memory inside a shared mapping that no other
/// thread or process is using as a semaphore yet.
pub unsafe fn init(sem: *mut libc::sem_t) -> io::Result<()> {
    if libc::sem_init(sem, 1, 1) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Take the permit, blocking forever (`None`) or until `timeout` elapses.
///
/// # Safety
/// `sem` must point to a semaphore initialized with [`init`].
pub unsafe fn wait(sem: *mut libc::sem_t, timeout: Option<Duration>) -> Result<(), WaitError> {
    let rc = match timeout {
        None => libc::sem_wait(sem),
        Some(timeout) => {
            let deadline = deadline_after(timeout)?;
            libc::sem_timedwait(sem, &deadline)
        }
    };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    Err(match err.raw_os_error() {
        Some(libc::EINTR) => WaitError::Interrupted,
        Some(libc::ETIMEDOUT) => WaitError::TimedOut,
        _ => WaitError::Os(err),
    })
}

/// Give the permit back.
///
/// # Safety
/// `sem` must point to a semaphore initialized with [`init`].
pub unsafe fn post(sem: *mut libc::sem_t) -> io::Result<()> {
    if libc::sem_post(sem) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `sem_timedwait` takes an absolute CLOCK_REALTIME deadline. The wait is
/// measured against the wall clock, so stepping the clock moves it.
fn deadline_after(timeout: Duration) -> Result<libc::timespec, WaitError> {
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(WaitError::Os(io::Error::last_os_error()));
    }

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    let secs = (now.tv_sec as u64)
        .saturating_add(timeout.as_secs())
        .saturating_add(nanos / NANOS_PER_SEC);

    let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
    deadline.tv_sec = libc::time_t::try_from(secs).unwrap_or(libc::time_t::MAX);
    deadline.tv_nsec = (nanos % NANOS_PER_SEC) as libc::c_long;
    Ok(deadline)
}

/// Scoped hold of a segment semaphore. Released on drop, on every path.
pub struct SemGuard<'a> {
    sem: *mut libc::sem_t,
    _marker: PhantomData<&'a UnsafeCell<libc::sem_t>>,
}

impl<'a> SemGuard<'a> {
    /// # Safety
    /// `sem` must hold a semaphore initialized with [`init`].
    pub unsafe fn acquire(
        sem: &'a UnsafeCell<libc::sem_t>,
        timeout: Option<Duration>,
    ) -> Result<Self, WaitError> {
        wait(sem.get(), timeout)?;
        Ok(Self {
            sem: sem.get(),
            _marker: PhantomData,
        })
    }
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        // sem_post only fails with EINVAL/EOVERFLOW, neither reachable for a
        // semaphore we just took.
        let _ = unsafe { post(self.sem) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    struct TestSem(UnsafeCell<libc::sem_t>);

    // The semaphore is the synchronization itself.
    unsafe impl Sync for TestSem {}
    unsafe impl Send for TestSem {}

    fn make_sem() -> Arc<TestSem> {
        let sem = Arc::new(TestSem(UnsafeCell::new(unsafe { std::mem::zeroed() })));
        unsafe { init(sem.0.get()).unwrap() };
        sem
    }

    fn value(sem: &TestSem) -> i32 {
        let mut v = 0;
        unsafe { libc::sem_getvalue(sem.0.get(), &mut v) };
        v
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let sem = make_sem();
        assert_eq!(value(&sem), 1);
        {
            let _guard = unsafe { SemGuard::acquire(&sem.0, None).unwrap() };
            assert_eq!(value(&sem), 0);
        }
        assert_eq!(value(&sem), 1);
    }

    #[test]
    fn test_guard_releases_on_early_return() {
        fn fails_while_holding(sem: &TestSem) -> Result<(), WaitError> {
            let _guard = unsafe { SemGuard::acquire(&sem.0, None)? };
            Err(WaitError::Interrupted)
        }

        let sem = make_sem();
        assert!(fails_while_holding(&sem).is_err());
        assert_eq!(value(&sem), 1);
    }

    #[test]
    fn test_timed_wait_times_out_while_held() {
        let sem = make_sem();
        let _guard = unsafe { SemGuard::acquire(&sem.0, None).unwrap() };

        let start = Instant::now();
        let result = unsafe { wait(sem.0.get(), Some(Duration::from_millis(30))) };
        assert!(matches!(result, Err(WaitError::TimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_timed_wait_succeeds_when_free() {
        let sem = make_sem();
        unsafe {
            wait(sem.0.get(), Some(Duration::from_millis(500))).unwrap();
            post(sem.0.get()).unwrap();
        }
        assert_eq!(value(&sem), 1);
    }

    #[test]
    fn test_blocked_waiter_wakes_on_release() {
        let sem = make_sem();
        let guard = unsafe { SemGuard::acquire(&sem.0, None).unwrap() };

        let sem_t = Arc::clone(&sem);
        let waiter = std::thread::spawn(move || {
            let guard = unsafe { SemGuard::acquire(&sem_t.0, Some(Duration::from_secs(5))) };
            guard.is_ok()
        });

        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap());
        assert_eq!(value(&sem), 1);
    }

    #[test]
    fn test_deadline_is_wall_clock() {
        let before = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let d = deadline_after(Duration::from_secs(10)).unwrap();
        let deadline = Duration::new(d.tv_sec as u64, d.tv_nsec as u32);

        assert!(deadline >= before + Duration::from_secs(10));
        assert!(deadline < before + Duration::from_secs(11));
    }

    #[test]
    fn test_deadline_normalizes_nanos() {
        let d = deadline_after(Duration::new(1, 999_999_999)).unwrap();
        assert!((0..NANOS_PER_SEC as libc::c_long).contains(&d.tv_nsec));
    }
}
