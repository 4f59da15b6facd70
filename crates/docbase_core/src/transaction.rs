//! Transaction context.
//!
//! A [`Transaction`] carries the id stamped on the markers it writes and the
//! no-lock set: ids of collections whose lock the transaction already
//! holds. Ids survive renames, so a held lock keeps being skipped after the
//! collection changed its name. Pipeline calls on those collections skip lock acquisition, so a
//! transaction can keep a lock across several calls without deadlocking on
//! itself.
//!
//! Collection locks are registered with the deadlock detector per thread, so
//! a transaction must stay on the thread that created it.

use crate::collection::Collection;
use crate::error::CoreResult;
use crate::lock::LockMode;
use crate::types::{CollectionId, TransactionId};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Per-call context of document operations.
pub struct Transaction {
    id: TransactionId,
    no_lock: HashSet<CollectionId>,
    held: Vec<(Arc<Collection>, LockMode)>,
    _not_send: PhantomData<*const ()>,
}

impl Transaction {
    /// Creates a transaction that holds no locks.
    #[must_use]
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            no_lock: HashSet::new(),
            held: Vec::new(),
            _not_send: PhantomData,
        }
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Adds `cid` to the no-lock set. The caller promises it already
    /// holds that collection's lock.
    pub fn hold_lock(&mut self, cid: CollectionId) {
        self.no_lock.insert(cid);
    }

    /// Removes `cid` from the no-lock set.
    pub fn release_lock(&mut self, cid: CollectionId) -> bool {
        self.no_lock.remove(&cid)
    }

    /// Whether locking of `cid` is skipped.
    #[must_use]
    pub fn skips_lock(&self, cid: CollectionId) -> bool {
        self.no_lock.contains(&cid)
    }

    /// Takes `collection`'s lock for the rest of the transaction and adds
    /// it to the no-lock set. Locking an already held collection does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns `Deadlock`, `LockTimeout` or `OutOfMemory`; the lock is not
    /// held afterwards.
    pub fn lock(&mut self, collection: &Arc<Collection>, mode: LockMode) -> CoreResult<()> {
        let cid = collection.id();
        if self.skips_lock(cid) {
            return Ok(());
        }
        let poll = collection.config().lock_poll_interval;
        match mode {
            LockMode::Read => collection.lock().begin_read_timed(Duration::ZERO, poll)?,
            LockMode::Write => collection.lock().begin_write_timed(Duration::ZERO, poll)?,
        }
        trace!(trx = %self.id, collection = %cid, ?mode, "transaction lock taken");
        self.no_lock.insert(cid);
        self.held.push((Arc::clone(collection), mode));
        Ok(())
    }

    /// Releases every lock taken through [`lock`](Self::lock), newest
    /// first.
    pub fn release_locks(&mut self) {
        while let Some((collection, mode)) = self.held.pop() {
            match mode {
                LockMode::Read => collection.lock().end_read(),
                LockMode::Write => collection.lock().end_write(),
            }
            self.no_lock.remove(&collection.id());
        }
    }

    /// Number of locks taken through [`lock`](Self::lock).
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.held.len()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.release_locks();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("no_lock", &self.no_lock)
            .field("held", &self.held.len())
            .finish()
    }
}
