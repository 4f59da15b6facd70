//! Reader/writer lock of one collection.

use crate::error::{CoreError, CoreResult};
use crate::lock::DeadlockDetector;
use crate::types::CollectionId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Shortest sleep between two polls of a timed acquisition.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Access mode of a lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

impl LockMode {
    const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

/// Per-collection reader/writer lock with deadlock bookkeeping.
///
/// Many readers may hold the lock at once, at most one writer, and a writer
/// excludes readers. The lock is not re-entrant; nested use goes through the
/// transaction's no-lock set.
pub struct CollectionLock {
    collection: CollectionId,
    state: Mutex<LockState>,
    released: Condvar,
    detector: Arc<DeadlockDetector>,
    default_timeout: Duration,
    deadlock_check_interval: u32,
}

impl CollectionLock {
    /// Creates the lock for `collection`.
    ///
    /// `default_timeout` replaces a zero timeout in timed acquisition;
    /// `deadlock_check_interval` is the number of failed polls between two
    /// cycle checks.
    #[must_use]
    pub fn new(
        collection: CollectionId,
        detector: Arc<DeadlockDetector>,
        default_timeout: Duration,
        deadlock_check_interval: u32,
    ) -> Self {
        Self {
            collection,
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            detector,
            default_timeout,
            deadlock_check_interval: deadlock_check_interval.max(1),
        }
    }

    /// Returns the collection this lock protects.
    #[must_use]
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    /// Blocks until a read lock is held.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the detector bookkeeping fails; the lock is
    /// released again in that case.
    pub fn begin_read(&self) -> CoreResult<()> {
        self.begin(LockMode::Read)
    }

    /// Releases a read lock taken by [`begin_read`](Self::begin_read) or
    /// [`begin_read_timed`](Self::begin_read_timed).
    pub fn end_read(&self) {
        self.end(LockMode::Read);
    }

    /// Blocks until the write lock is held.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the detector bookkeeping fails; the lock is
    /// released again in that case.
    pub fn begin_write(&self) -> CoreResult<()> {
        self.begin(LockMode::Write)
    }

    /// Releases the write lock.
    pub fn end_write(&self) {
        self.end(LockMode::Write);
    }

    /// Polls for a read lock for at most `timeout` (zero means the default).
    ///
    /// Polls are at least a millisecond apart, so the call returns no later
    /// than `timeout` plus one poll interval.
    ///
    /// # Errors
    ///
    /// Returns `Deadlock`, `LockTimeout` or `OutOfMemory`; in each case the
    /// lock is not held and the thread's blocked mark is cleared.
    pub fn begin_read_timed(&self, timeout: Duration, poll_interval: Duration) -> CoreResult<()> {
        self.begin_timed(LockMode::Read, timeout, poll_interval)
    }

    /// Polls for the write lock for at most `timeout` (zero means the default).
    ///
    /// # Errors
    ///
    /// See [`begin_read_timed`](Self::begin_read_timed).
    pub fn begin_write_timed(&self, timeout: Duration, poll_interval: Duration) -> CoreResult<()> {
        self.begin_timed(LockMode::Write, timeout, poll_interval)
    }

    /// Acquires in `mode` and returns a guard that releases on drop.
    ///
    /// With `skip` set nothing is acquired and the guard releases nothing.
    ///
    /// # Errors
    ///
    /// Same as [`begin_read`](Self::begin_read).
    pub fn guard(&self, mode: LockMode, skip: bool) -> CoreResult<LockGuard<'_>> {
        if !skip {
            self.begin(mode)?;
        }
        Ok(LockGuard {
            lock: self,
            mode,
            held: !skip,
        })
    }

    /// Timed variant of [`guard`](Self::guard).
    ///
    /// # Errors
    ///
    /// Same as [`begin_read_timed`](Self::begin_read_timed).
    pub fn guard_timed(
        &self,
        mode: LockMode,
        skip: bool,
        timeout: Duration,
        poll_interval: Duration,
    ) -> CoreResult<LockGuard<'_>> {
        if !skip {
            self.begin_timed(mode, timeout, poll_interval)?;
        }
        Ok(LockGuard {
            lock: self,
            mode,
            held: !skip,
        })
    }

    fn begin(&self, mode: LockMode) -> CoreResult<()> {
        {
            let mut state = self.state.lock();
            while !Self::grantable(&state, mode) {
                self.released.wait(&mut state);
            }
            Self::grant(&mut state, mode);
        }
        if let Err(err) = self.detector.add_holder(self.collection, mode.is_write(), false) {
            self.release(mode);
            return Err(err);
        }
        trace!(collection = %self.collection, ?mode, "lock acquired");
        Ok(())
    }

    fn begin_timed(
        &self,
        mode: LockMode,
        timeout: Duration,
        poll_interval: Duration,
    ) -> CoreResult<()> {
        let timeout = if timeout.is_zero() {
            self.default_timeout
        } else {
            timeout
        };
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let started = Instant::now();
        let mut was_blocked = false;
        let mut polls: u32 = 0;

        loop {
            if self.try_grant(mode) {
                let write = mode.is_write();
                if let Err(err) = self.detector.add_holder(self.collection, write, was_blocked) {
                    self.release(mode);
                    self.detector.unset_blocked();
                    return Err(err);
                }
                let waited = started.elapsed();
                trace!(collection = %self.collection, ?mode, ?waited, "lock acquired after wait");
                return Ok(());
            }

            if was_blocked {
                polls = polls.wrapping_add(1);
                let check_due = polls % self.deadlock_check_interval == 0;
                if check_due && self.detector.detect_deadlock() {
                    self.detector.unset_blocked();
                    return Err(CoreError::Deadlock {
                        collection: self.collection,
                    });
                }
            } else {
                // a deadlock found here already removed the mark
                self.detector.set_blocked(self.collection, mode.is_write())?;
                was_blocked = true;
            }

            let waited = started.elapsed();
            if waited >= timeout {
                self.detector.unset_blocked();
                debug!(collection = %self.collection, ?mode, ?waited, "lock timeout");
                return Err(CoreError::LockTimeout {
                    collection: self.collection,
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }

            std::thread::sleep(poll_interval.min(timeout - waited));
        }
    }

    fn end(&self, mode: LockMode) {
        self.detector.remove_holder(self.collection, mode.is_write());
        self.release(mode);
        trace!(collection = %self.collection, ?mode, "lock released");
    }

    fn try_grant(&self, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        if Self::grantable(&state, mode) {
            Self::grant(&mut state, mode);
            true
        } else {
            false
        }
    }

    fn grantable(state: &LockState, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !state.writer,
            LockMode::Write => !state.writer && state.readers == 0,
        }
    }

    fn grant(state: &mut LockState, mode: LockMode) {
        match mode {
            LockMode::Read => state.readers += 1,
            LockMode::Write => state.writer = true,
        }
    }

    fn release(&self, mode: LockMode) {
        let mut state = self.state.lock();
        match mode {
            LockMode::Read => state.readers = state.readers.saturating_sub(1),
            LockMode::Write => state.writer = false,
        }
        drop(state);
        self.released.notify_all();
    }
}

impl std::fmt::Debug for CollectionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CollectionLock")
            .field("collection", &self.collection)
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .finish_non_exhaustive()
    }
}

/// Releases a collection lock when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a CollectionLock,
    mode: LockMode,
    held: bool,
}

impl LockGuard<'_> {
    /// Returns true if this guard actually holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Returns the mode the guard was taken in.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.lock.end(self.mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn lock() -> Arc<CollectionLock> {
        Arc::new(CollectionLock::new(
            CollectionId::new(7),
            Arc::new(DeadlockDetector::new()),
            Duration::from_secs(60),
            5,
        ))
    }

    #[test]
    fn many_readers_share() {
        let lock = lock();
        lock.begin_read().unwrap();
        lock.begin_read_timed(Duration::from_millis(20), Duration::from_millis(1))
            .unwrap();
        lock.end_read();
        lock.end_read();
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = lock();
        lock.begin_write().unwrap();

        let contender = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                lock.begin_read_timed(Duration::from_millis(30), Duration::from_millis(5))
            })
        };
        let result = contender.join().unwrap();
        assert!(matches!(result, Err(CoreError::LockTimeout { .. })));
        lock.end_write();
    }

    #[test]
    fn timed_acquire_respects_bound() {
        let lock = lock();
        lock.begin_read().unwrap();
        let timeout = Duration::from_millis(40);
        let poll = Duration::from_millis(10);

        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let started = Instant::now();
                let result = lock.begin_write_timed(timeout, poll);
                (result, started.elapsed())
            })
        };
        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(CoreError::LockTimeout { .. })));
        assert!(elapsed >= timeout);
        lock.end_read();
    }

    #[test]
    fn zero_poll_interval_still_times_out() {
        let lock = lock();
        lock.begin_write().unwrap();
        let (tx, rx) = mpsc::channel();
        {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let started = Instant::now();
                let result = lock.begin_read_timed(Duration::from_millis(50), Duration::ZERO);
                let _ = tx.send((result, started.elapsed()));
            });
        }
        let (result, elapsed) = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(matches!(result, Err(CoreError::LockTimeout { .. })), "{result:?}");
        assert!(elapsed >= Duration::from_millis(50));
        lock.end_write();
    }

    #[test]
    fn blocked_writer_proceeds_after_release() {
        let lock = lock();
        lock.begin_write().unwrap();
        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                lock.begin_write_timed(Duration::from_secs(5), Duration::from_millis(1))?;
                lock.end_write();
                Ok::<_, CoreError>(())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        lock.end_write();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = lock();
        {
            let guard = lock.guard(LockMode::Write, false).unwrap();
            assert!(guard.is_held());
        }
        lock.begin_write_timed(Duration::from_millis(10), Duration::from_millis(1))
            .unwrap();
        lock.end_write();
    }

    #[test]
    fn skipped_guard_holds_nothing() {
        let lock = lock();
        lock.begin_write().unwrap();
        let guard = lock.guard(LockMode::Read, true).unwrap();
        assert!(!guard.is_held());
        drop(guard);
        lock.end_write();
    }
}
