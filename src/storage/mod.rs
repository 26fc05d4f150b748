//! Storage module
//!
//! Filesystem-as-database: a blob and a JSON sidecar per file, grouped by
//! pseudonymous owner.

mod file_store;
pub mod ids;
mod types;

pub use file_store::{FileStore, StoreError};
pub use types::*;
