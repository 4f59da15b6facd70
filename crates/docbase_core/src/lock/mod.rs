//! Collection locking.
//!
//! Each collection owns a [`CollectionLock`]: a reader/writer lock with
//! explicit begin/end calls rather than scoped guards, because a lock may be
//! taken by one pipeline call and released by another when a transaction
//! holds it across calls. Every acquisition registers the calling thread
//! with the database-wide [`DeadlockDetector`]; timed acquisition consults
//! the detector's wait-for graph while it polls.
//!
//! Transactions that already hold a collection's lock list its id in
//! their no-lock set; acquisition and release then become no-ops.

mod detector;
mod manager;

pub use detector::DeadlockDetector;
pub use manager::{CollectionLock, LockGuard, LockMode};
