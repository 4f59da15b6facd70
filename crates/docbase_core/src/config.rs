//! Database configuration.

use std::time::Duration;

/// Lock timeout applied when a caller passes a zero timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Role of this process in a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerRole {
    /// Standalone server.
    #[default]
    Single,
    /// Shard server in a cluster. Documents get plan-qualified ids and
    /// shard keys become immutable.
    DbServer,
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Timeout used by timed lock acquisition when the caller passes zero.
    pub lock_timeout: Duration,

    /// Sleep between two lock polls.
    pub lock_poll_interval: Duration,

    /// Ask the deadlock detector every this many failed polls.
    pub deadlock_check_interval: u32,

    /// Whether to flush the WAL on every append.
    pub sync_on_write: bool,

    /// Upper bound on index-population worker threads.
    pub fill_workers: usize,

    /// Minimum document count before batched index population is used.
    pub fill_batch_threshold: usize,

    /// Documents handed to one batched insert call.
    pub fill_block_size: usize,

    /// Role of this process.
    pub server_role: ServerRole,

    /// Bytes after which the WAL rotates to a new logical datafile.
    pub logfile_size: u64,

    /// Set while the whole database is replaying its log; secondary index
    /// population is deferred until first use.
    pub in_recovery: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: Duration::from_millis(10),
            deadlock_check_interval: 5,
            sync_on_write: false,
            fill_workers: workers,
            fill_batch_threshold: 256 * 1024,
            fill_block_size: 1024 * 1024,
            server_role: ServerRole::Single,
            logfile_size: 32 * 1024 * 1024, // 32 MB
            in_recovery: false,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the lock poll interval.
    #[must_use]
    pub const fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// Sets how many failed polls pass between deadlock checks.
    #[must_use]
    pub const fn deadlock_check_interval(mut self, polls: u32) -> Self {
        self.deadlock_check_interval = polls;
        self
    }

    /// Sets whether to flush the WAL on every append.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the number of index-population workers.
    #[must_use]
    pub const fn fill_workers(mut self, workers: usize) -> Self {
        self.fill_workers = workers;
        self
    }

    /// Sets the batched population threshold.
    #[must_use]
    pub const fn fill_batch_threshold(mut self, documents: usize) -> Self {
        self.fill_batch_threshold = documents;
        self
    }

    /// Sets the batched population block size.
    #[must_use]
    pub const fn fill_block_size(mut self, documents: usize) -> Self {
        self.fill_block_size = documents;
        self
    }

    /// Sets the server role.
    #[must_use]
    pub const fn server_role(mut self, role: ServerRole) -> Self {
        self.server_role = role;
        self
    }

    /// Sets the logfile rotation size.
    #[must_use]
    pub const fn logfile_size(mut self, bytes: u64) -> Self {
        self.logfile_size = bytes;
        self
    }

    /// Marks the database as replaying its log.
    #[must_use]
    pub const fn in_recovery(mut self, value: bool) -> Self {
        self.in_recovery = value;
        self
    }

    /// Returns the effective timeout for a timed acquisition.
    #[must_use]
    pub fn effective_lock_timeout(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.lock_timeout
        } else {
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(config.deadlock_check_interval, 5);
        assert_eq!(config.fill_batch_threshold, 256 * 1024);
        assert!(config.fill_workers >= 1);
        assert_eq!(config.server_role, ServerRole::Single);
        assert!(!config.in_recovery);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .lock_poll_interval(Duration::from_millis(1))
            .fill_workers(2)
            .server_role(ServerRole::DbServer)
            .logfile_size(4096);

        assert_eq!(config.lock_poll_interval, Duration::from_millis(1));
        assert_eq!(config.fill_workers, 2);
        assert_eq!(config.server_role, ServerRole::DbServer);
        assert_eq!(config.logfile_size, 4096);
    }

    #[test]
    fn zero_timeout_means_default() {
        let config = StoreConfig::new().lock_timeout(Duration::from_secs(3));
        assert_eq!(
            config.effective_lock_timeout(Duration::ZERO),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.effective_lock_timeout(Duration::from_millis(5)),
            Duration::from_millis(5)
        );
    }
}
