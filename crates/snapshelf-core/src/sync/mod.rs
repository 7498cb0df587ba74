//! Device-to-device snapshot sync
//!
//! Moves a library snapshot between two devices through a run of visual
//! codes, or through a JSON file attachment when the library is too large.
//!
//! # Architecture
//!
//! - **Model**: `LibrarySnapshot` and the records it holds
//! - **Codec**: projection to `MinimalSnapshot`, compact text form, compression
//! - **Checksum**: strong digest over envelopes, fast digest over fragments
//! - **Chunker**: splitting encoded text into bounded `Fragment`s and back
//! - **Envelope**: versioned, checksummed wrapper and its wire forms
//! - **Device**: persisted device identity
//! - **Session**: per-transfer fragment accumulator and its state machine
//! - **Transport**: rendering, scanning and attachment ports
//! - **Manager**: `SyncManager`, orchestrating export and import
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use snapshelf_core::storage::MemoryStore;
//! use snapshelf_core::sync::{ImportProgress, SyncManager, TransferSettings};
//!
//! let manager = SyncManager::new(Arc::new(MemoryStore::new()), TransferSettings::default());
//! let bundle = manager.export_codes(&library).await?;
//!
//! // On the receiving device
//! let session = manager.begin_import().await?;
//! for code in &bundle.codes {
//!     if let ImportProgress::Done(outcome) = manager.accept_payload(session, code).await? {
//!         println!("{} items received", outcome.snapshot.items.len());
//!     }
//! }
//! ```

pub mod checksum;
pub mod chunker;
pub mod codec;
pub mod device;
pub mod envelope;
pub mod manager;
pub mod model;
pub mod session;
pub mod transport;

pub use chunker::{Fragment, HEADER_OVERHEAD};
pub use codec::{MinimalGroup, MinimalItem, MinimalPhoto, MinimalSnapshot};
pub use device::{DeviceIdentity, DeviceIdentityManager};
pub use envelope::{CURRENT_VERSION, EnvelopeFrame, FrameData, LEGACY_VERSION, SyncEnvelope, SyncPayload};
pub use manager::{
    EnvelopeMetadata, ExportBundle, ExportMode, ImportOutcome, ImportProgress, SyncManager,
    TransferSettings,
};
pub use model::{DateValue, Group, Item, LibrarySnapshot, Location, Photo, Tag};
pub use session::{ImportSession, ImportState, SessionInfo};
pub use transport::{
    Attachment, AttachmentSink, CodeRenderer, CodeScanner, DirectoryAttachmentSink, FileScanner,
    PlainTextRenderer, write_codes,
};
