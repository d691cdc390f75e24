//! blobdir - read-through cache over a remote object store
//!
//! Serves remote objects from a local cache directory that is refreshed
//! only when stale, and provides a distributed lease lock with background
//! renewal and a hold ceiling.

pub mod cache;
pub mod cli;
pub mod compression;
pub mod config;
pub mod directory;
pub mod error;
pub mod lock;
pub mod store;
pub mod ui;

pub use directory::BlobDirectory;
pub use error::{BlobdirError, BlobdirResult};
pub use lock::{LeaseLock, LockState};
