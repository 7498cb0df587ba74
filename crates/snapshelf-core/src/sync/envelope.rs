//! Versioned, checksummed sync envelope and its wire forms
//!
//! A [`SyncEnvelope`] wraps one [`MinimalSnapshot`] with the format version,
//! the export time, the sending device and a SHA-256 checksum over the
//! compact serialized payload.
//!
//! On the wire an envelope travels either as a single-shot
//! [`EnvelopeFrame`] (payload compressed into `data`) or, when that text is
//! too long for one visual code, as a run of chunk frames carrying pieces of
//! the single-shot text. [`SyncPayload`] is the tagged union of the two.
//!
//! Version `1.0` frames are decode-only: their `data` is the uncompressed
//! payload object with long keys.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::checksum::{strong_digest, verify_strong};
use super::chunker::Fragment;
use super::codec::{self, MinimalSnapshot};
use super::model::LibrarySnapshot;

/// Version written by this build
pub const CURRENT_VERSION: &str = "2.0";

/// Uncompressed legacy format, accepted on import only
pub const LEGACY_VERSION: &str = "1.0";

/// Every version this build can read
pub const SUPPORTED_VERSIONS: &[&str] = &[LEGACY_VERSION, CURRENT_VERSION];

/// Reject versions this build does not understand
pub fn ensure_supported(version: &str) -> Result<()> {
    if SUPPORTED_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(Error::UnsupportedVersion(version.to_string()))
    }
}

/// One exported snapshot with its integrity metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    pub version: String,
    /// Export time in epoch milliseconds
    pub timestamp: i64,
    pub device_id: String,
    pub payload: MinimalSnapshot,
    /// SHA-256 of `codec::serialize(payload)`
    pub checksum: String,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: String,
}

impl SyncEnvelope {
    /// Build an envelope from the live library
    pub fn build(snapshot: &LibrarySnapshot, device_id: &str) -> Result<Self> {
        Self::from_minimal(codec::minimize(snapshot), device_id)
    }

    /// Build an envelope around an already minimized payload
    pub fn from_minimal(payload: MinimalSnapshot, device_id: &str) -> Result<Self> {
        let serialized = codec::serialize(&payload)?;
        Ok(Self {
            version: CURRENT_VERSION.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            device_id: device_id.to_string(),
            checksum: strong_digest(&serialized),
            payload,
        })
    }

    /// Check version and checksum, returning the payload when both hold
    pub fn validate(&self) -> Result<&MinimalSnapshot> {
        ensure_supported(&self.version)?;
        verify_strong(codec::serialize(&self.payload)?, &self.checksum)?;
        Ok(&self.payload)
    }

    /// Consuming form of [`validate`](Self::validate)
    pub fn into_validated(self) -> Result<MinimalSnapshot> {
        self.validate()?;
        Ok(self.payload)
    }

    /// Encode as a single-shot frame with the payload compressed
    pub fn to_frame(&self, compression_level: u32) -> Result<EnvelopeFrame> {
        let serialized = codec::serialize(&self.payload)?;
        Ok(EnvelopeFrame {
            version: self.version.clone(),
            timestamp: self.timestamp,
            device_id: self.device_id.clone(),
            data: FrameData::Encoded(codec::compress_with_level(&serialized, compression_level)?),
            checksum: self.checksum.clone(),
        })
    }

    /// Pretty-printed JSON for file and email attachments
    pub fn to_attachment_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse an attachment, rejecting unknown versions before the payload
    pub fn from_attachment_json(text: &str) -> Result<Self> {
        let header: VersionHeader = serde_json::from_str(text)
            .map_err(|e| Error::MalformedPayload(format!("Not a sync attachment: {}", e)))?;
        ensure_supported(&header.version)?;

        serde_json::from_str(text)
            .map_err(|e| Error::MalformedPayload(format!("Invalid sync attachment: {}", e)))
    }
}

/// The `data` field of a single-shot frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameData {
    /// Compressed compact payload text (current format)
    Encoded(String),
    /// Inline long-key payload object (legacy format)
    Legacy(MinimalSnapshot),
    /// Anything else; only ever rejected
    Unknown(serde_json::Value),
}

/// Single-shot wire form of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeFrame {
    pub version: String,
    pub timestamp: i64,
    pub device_id: String,
    pub data: FrameData,
    pub checksum: String,
}

impl EnvelopeFrame {
    /// Decode and verify the frame
    ///
    /// The version is checked before the data is touched; the checksum is
    /// checked before the payload is parsed.
    pub fn open(self) -> Result<SyncEnvelope> {
        let Self {
            version,
            timestamp,
            device_id,
            data,
            checksum,
        } = self;
        ensure_supported(&version)?;

        let payload = match (version.as_str(), data) {
            (CURRENT_VERSION, FrameData::Encoded(text)) => {
                let serialized = codec::decompress(&text)?;
                verify_strong(&serialized, &checksum)?;
                codec::deserialize(&serialized)?
            }
            (LEGACY_VERSION, FrameData::Legacy(payload)) => {
                verify_strong(codec::serialize(&payload)?, &checksum)?;
                payload
            }
            (version, _) => {
                return Err(Error::MalformedPayload(format!(
                    "Frame data does not match format version {}",
                    version
                )));
            }
        };

        Ok(SyncEnvelope {
            version,
            timestamp,
            device_id,
            payload,
            checksum,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum ChunkKind {
    #[serde(rename = "chunk")]
    Chunk,
}

#[derive(Serialize, Deserialize)]
struct ChunkFrame {
    #[serde(rename = "type")]
    kind: ChunkKind,
    index: usize,
    total: usize,
    data: String,
    checksum: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WirePayload {
    Chunk(ChunkFrame),
    SingleShot(EnvelopeFrame),
}

/// Text decoded from one visual code
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPayload {
    SingleShot(EnvelopeFrame),
    Chunk(Fragment),
}

impl SyncPayload {
    /// Parse scanned or pasted text
    pub fn parse(text: &str) -> Result<Self> {
        let wire: WirePayload = serde_json::from_str(text.trim()).map_err(|_| {
            Error::MalformedPayload("Text is neither a sync envelope nor a sync chunk".to_string())
        })?;

        Ok(match wire {
            WirePayload::Chunk(frame) => Self::Chunk(Fragment {
                index: frame.index,
                total: frame.total,
                data: frame.data,
                checksum: frame.checksum,
            }),
            WirePayload::SingleShot(frame) => Self::SingleShot(frame),
        })
    }

    /// Render as the text placed in a visual code
    pub fn to_text(&self) -> Result<String> {
        let text = match self {
            Self::SingleShot(frame) => serde_json::to_string(frame)?,
            Self::Chunk(fragment) => serde_json::to_string(&ChunkFrame {
                kind: ChunkKind::Chunk,
                index: fragment.index,
                total: fragment.total,
                data: fragment.data.clone(),
                checksum: fragment.checksum.clone(),
            })?,
        };
        Ok(text)
    }
}
