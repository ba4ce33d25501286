//! # mqjournal testkit
//!
//! Test utilities for mqjournal.
//!
//! This crate provides:
//! - Fixtures that open journals on every file backend
//! - Property-based generators and a reference model of the live records
//! - Crash and corruption simulation
//! - Fuzz harnesses
//! - Stress runs
//! - On-disk format vectors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mqjournal_testkit::prelude::*;
//!
//! #[test]
//! fn survives_restart() {
//!     for_each_backend(&small_config(), |env| {
//!         let (journal, _) = env.open_loaded();
//!         journal.append_add(1u64, 1, b"x", true).unwrap();
//!         let (journal, loaded) = env.restart(journal);
//!         assert_eq!(loaded.committed_records.len(), 1);
//!         close(journal);
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod fuzz;
pub mod generators;
pub mod stress;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use fuzz::*;
pub use generators::*;
pub use stress::*;
pub use vectors::*;
