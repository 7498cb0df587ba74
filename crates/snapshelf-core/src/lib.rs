//! Snapshelf Core Library
//!
//! This crate provides the sync core of Snapshelf, including:
//! - Library snapshot model and its compact wire projection
//! - Versioned, checksummed sync envelopes
//! - Fragmenting payloads across bounded visual codes
//! - Resumable import sessions
//! - Device identity
//! - Key/value persistence (in-memory and file-backed)
//! - Configuration

pub mod config;
pub mod error;
pub mod storage;
pub mod sync;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::storage::{FileStore, KeyValueStore, MemoryStore};
    pub use crate::sync::{
        ImportProgress, LibrarySnapshot, SyncManager, SyncPayload, TransferSettings,
    };
}
