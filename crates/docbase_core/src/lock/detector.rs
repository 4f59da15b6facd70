//! Wait-for graph shared by all collection locks of a database.

use crate::error::{CoreError, CoreResult};
use crate::types::CollectionId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::thread::ThreadId;
use tracing::debug;

/// Holders of one collection lock. A thread may read-lock the same
/// collection more than once; each acquisition counts.
#[derive(Debug, Default)]
struct Holders {
    readers: HashMap<ThreadId, usize>,
    writer: Option<ThreadId>,
}

impl Holders {
    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }
}

/// What a blocked thread is waiting for.
#[derive(Debug, Clone, Copy)]
struct Waiting {
    collection: CollectionId,
    write: bool,
}

#[derive(Debug, Default)]
struct Graph {
    holders: HashMap<CollectionId, Holders>,
    blocked: HashMap<ThreadId, Waiting>,
}

impl Graph {
    /// Threads that keep `waiter` from getting the lock it waits for.
    fn blockers(&self, waiter: ThreadId, waiting: Waiting) -> Vec<ThreadId> {
        let Some(holders) = self.holders.get(&waiting.collection) else {
            return Vec::new();
        };
        let mut out: Vec<ThreadId> = holders.writer.into_iter().collect();
        if waiting.write {
            out.extend(holders.readers.keys().copied());
        }
        out.retain(|t| *t != waiter);
        out
    }

    /// Walks the wait-for edges from `start` looking for a way back to it.
    fn has_cycle_from(&self, start: ThreadId) -> bool {
        let Some(waiting) = self.blocked.get(&start).copied() else {
            return false;
        };
        let mut visited = HashSet::new();
        let mut stack = self.blockers(start, waiting);
        while let Some(thread) = stack.pop() {
            if thread == start {
                return true;
            }
            if !visited.insert(thread) {
                continue;
            }
            if let Some(next) = self.blocked.get(&thread).copied() {
                stack.extend(
                    self.blockers(thread, next)
                        .into_iter()
                        .filter(|t| *t == start || !visited.contains(t)),
                );
            }
        }
        false
    }
}

/// Database-scope deadlock detector.
///
/// Tracks per thread which collections it holds (as reader or writer) and
/// which one it is blocked on. The graph sits behind its own mutex,
/// independent of every collection lock.
#[derive(Debug, Default)]
pub struct DeadlockDetector {
    graph: Mutex<Graph>,
}

impl DeadlockDetector {
    /// Creates an empty detector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the current thread as a holder of `collection`.
    ///
    /// Clears the blocked mark if the thread was waiting.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the bookkeeping cannot grow.
    pub fn add_holder(
        &self,
        collection: CollectionId,
        write: bool,
        was_blocked: bool,
    ) -> CoreResult<()> {
        let me = std::thread::current().id();
        let mut graph = self.graph.lock();
        if was_blocked {
            graph.blocked.remove(&me);
        }
        graph.holders.try_reserve(1)?;
        let holders = graph.holders.entry(collection).or_default();
        if write {
            holders.writer = Some(me);
        } else {
            holders.readers.try_reserve(1)?;
            *holders.readers.entry(me).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Unregisters the current thread as a holder of `collection`.
    pub fn remove_holder(&self, collection: CollectionId, write: bool) {
        let me = std::thread::current().id();
        let mut graph = self.graph.lock();
        if let Some(holders) = graph.holders.get_mut(&collection) {
            if write {
                if holders.writer == Some(me) {
                    holders.writer = None;
                }
            } else if let Some(count) = holders.readers.get_mut(&me) {
                *count -= 1;
                if *count == 0 {
                    holders.readers.remove(&me);
                }
            }
            if holders.is_empty() {
                graph.holders.remove(&collection);
            }
        }
    }

    /// Marks the current thread as blocked on `collection` and checks for a
    /// cycle right away.
    ///
    /// # Errors
    ///
    /// Returns `Deadlock` (with the blocked mark removed again) if waiting
    /// would close a cycle, or `OutOfMemory`.
    pub fn set_blocked(&self, collection: CollectionId, write: bool) -> CoreResult<()> {
        let me = std::thread::current().id();
        let mut graph = self.graph.lock();
        graph.blocked.try_reserve(1)?;
        graph.blocked.insert(me, Waiting { collection, write });
        if graph.has_cycle_from(me) {
            graph.blocked.remove(&me);
            debug!(%collection, write, "deadlock detected on block");
            return Err(CoreError::Deadlock { collection });
        }
        Ok(())
    }

    /// Clears the blocked mark of the current thread.
    pub fn unset_blocked(&self) {
        let me = std::thread::current().id();
        self.graph.lock().blocked.remove(&me);
    }

    /// Returns true if the current thread's wait closes a cycle.
    #[must_use]
    pub fn detect_deadlock(&self) -> bool {
        let me = std::thread::current().id();
        let found = self.graph.lock().has_cycle_from(me);
        if found {
            debug!(thread = ?me, "deadlock detected while polling");
        }
        found
    }

    /// Number of threads currently marked as blocked.
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.graph.lock().blocked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    impl DeadlockDetector {
        fn holds(&self, collection: CollectionId) -> bool {
            let me = std::thread::current().id();
            self.graph
                .lock()
                .holders
                .get(&collection)
                .is_some_and(|h| h.writer == Some(me) || h.readers.contains_key(&me))
        }
    }

    #[test]
    fn holder_bookkeeping() {
        let detector = DeadlockDetector::new();
        let c = CollectionId::new(1);
        detector.add_holder(c, false, false).unwrap();
        assert!(detector.holds(c));
        detector.remove_holder(c, false);
        assert!(!detector.holds(c));
    }

    #[test]
    fn repeated_reads_count_per_thread() {
        let detector = Arc::new(DeadlockDetector::new());
        let c1 = CollectionId::new(1);
        let c2 = CollectionId::new(2);
        detector.add_holder(c1, false, false).unwrap();
        detector.add_holder(c1, false, false).unwrap();
        detector.remove_holder(c1, false);
        // one read lock is still held
        assert!(detector.holds(c1));

        let barrier = Arc::new(Barrier::new(2));
        let other = {
            let detector = Arc::clone(&detector);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                detector.add_holder(c2, true, false).unwrap();
                barrier.wait();
                let outcome = detector.set_blocked(c1, true);
                barrier.wait();
                barrier.wait();
                detector.unset_blocked();
                detector.remove_holder(c2, true);
                outcome
            })
        };
        barrier.wait();
        barrier.wait();
        // the writer waits behind our remaining read lock, so waiting for
        // its collection closes a cycle
        assert!(detector.set_blocked(c2, false).is_err());
        barrier.wait();
        assert!(other.join().unwrap().is_ok());

        detector.remove_holder(c1, false);
        assert!(!detector.holds(c1));
    }

    #[test]
    fn blocking_on_free_collection_is_no_deadlock() {
        let detector = DeadlockDetector::new();
        detector.set_blocked(CollectionId::new(1), true).unwrap();
        assert!(!detector.detect_deadlock());
        assert_eq!(detector.blocked_count(), 1);
        detector.unset_blocked();
        assert_eq!(detector.blocked_count(), 0);
    }

    #[test]
    fn readers_do_not_block_readers() {
        let detector = Arc::new(DeadlockDetector::new());
        let c1 = CollectionId::new(1);
        let c2 = CollectionId::new(2);
        let barrier = Arc::new(Barrier::new(2));

        let other = {
            let detector = Arc::clone(&detector);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                detector.add_holder(c2, false, false).unwrap();
                detector.set_blocked(c1, false).unwrap();
                barrier.wait();
                barrier.wait();
                detector.unset_blocked();
                detector.remove_holder(c2, false);
            })
        };

        detector.add_holder(c1, false, false).unwrap();
        barrier.wait();
        // both only read: no edge between the two threads
        assert!(detector.set_blocked(c2, false).is_ok());
        detector.unset_blocked();
        barrier.wait();
        other.join().unwrap();
    }

    #[test]
    fn crossed_writers_form_a_cycle() {
        let detector = Arc::new(DeadlockDetector::new());
        let c1 = CollectionId::new(1);
        let c2 = CollectionId::new(2);
        let barrier = Arc::new(Barrier::new(2));

        let other = {
            let detector = Arc::clone(&detector);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                detector.add_holder(c2, true, false).unwrap();
                barrier.wait();
                detector.set_blocked(c1, true).unwrap();
                barrier.wait();
                barrier.wait();
                detector.unset_blocked();
                detector.remove_holder(c2, true);
            })
        };

        detector.add_holder(c1, true, false).unwrap();
        barrier.wait();
        barrier.wait();
        let err = detector.set_blocked(c2, true).unwrap_err();
        assert!(matches!(err, CoreError::Deadlock { collection } if collection == c2));
        // the failed block must not leave a mark behind
        assert_eq!(detector.blocked_count(), 1);
        barrier.wait();
        other.join().unwrap();
        detector.remove_holder(c1, true);
    }
}
