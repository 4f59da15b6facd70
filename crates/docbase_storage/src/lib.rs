//! # docbase storage
//!
//! Byte stores underneath the docbase write-ahead log.
//!
//! A backend is an **opaque, append-only byte store**. It never interprets
//! what it holds: markers, ticks and checksums belong to `docbase_core`.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral storage with fault injection for tests
//! - [`FileBackend`] - persistent storage through OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use docbase_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"marker").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"marker");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
