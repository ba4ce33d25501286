//! # mqjournal storage
//!
//! Sequential file abstraction and I/O backends for the message journal.
//!
//! Files are **opaque, fixed-capacity byte stores** written at explicit
//! offsets. They do not interpret the data they hold; the journal owns
//! headers, records and checksums.
//!
//! ## Design Principles
//!
//! - Files are pre-allocated when created and reset rather than re-created
//! - Writes report their outcome through a single callback ([`IoCallback`])
//! - Completions are delivered in submission order on every backend
//! - Factories are `Send + Sync` and own backend-wide resources
//!
//! ## Available Backends
//!
//! - [`NioFileFactory`] - Synchronous writes plus explicit force
//! - [`AioFileFactory`] - Asynchronous writes bounded by `max_io`
//! - [`InMemoryFileFactory`] - For testing and ephemeral journals
//!
//! ## Example
//!
//! ```rust
//! use mqjournal_storage::{InMemoryFileFactory, SequentialFileFactory};
//! use bytes::Bytes;
//!
//! let factory = InMemoryFileFactory::new();
//! let file = factory.create_file("data-1.mqj", 1024).unwrap();
//! file.write_at(0, Bytes::from_static(b"hello"), true, Box::new(|result| {
//!     assert!(result.is_ok());
//! }));
//! assert_eq!(file.read_at(0, 5).unwrap(), b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod aio;
mod backend;
mod error;
mod file;
mod memory;

pub use aio::{AioFile, AioFileFactory};
pub use backend::{BackendKind, IoCallback, SequentialFile, SequentialFileFactory};
pub use error::{StorageError, StorageResult};
pub use file::{NioFile, NioFileFactory};
pub use memory::{InMemoryFile, InMemoryFileFactory};
