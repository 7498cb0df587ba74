//! Error types for Snapshelf

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using Snapshelf's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Snapshelf error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Integrity errors (E001-E099)
    #[error("Checksum mismatch: expected {expected}, computed {actual}. The transfer is corrupted.")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Fragment {index} failed its checksum. Scan that code again.")]
    FragmentCorrupted { index: usize },

    #[error("Fragments disagree on the total count (expected {expected}, found {found}). Start the import again.")]
    InconsistentTotal { expected: usize, found: usize },

    #[error("Fragment {index} was received twice with different content. Start the import again.")]
    ConflictingFragment { index: usize },

    #[error("Transfer incomplete: missing fragments {missing:?}")]
    IncompleteTransfer { missing: Vec<usize> },

    // Export errors (E100-E199)
    #[error("Snapshot needs {total} codes but at most {cap} are allowed. Export fewer items.")]
    PayloadTooLarge { total: usize, cap: usize },

    // Format errors (E200-E299)
    #[error("Unsupported sync format version '{0}'. Update Snapshelf on this device.")]
    UnsupportedVersion(String),

    #[error("Malformed sync payload: {0}")]
    MalformedPayload(String),

    #[error("Compression error: {0}")]
    Compression(String),

    // Session errors (E300-E399)
    #[error("Import session '{0}' not found. Run `snapshelf sessions list` to see pending imports.")]
    SessionNotFound(Uuid),

    // Storage errors (E400-E499)
    #[error("Storage error: {0}")]
    StorageError(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChecksumMismatch { .. } => "E001",
            Self::FragmentCorrupted { .. } => "E002",
            Self::InconsistentTotal { .. } => "E003",
            Self::ConflictingFragment { .. } => "E004",
            Self::IncompleteTransfer { .. } => "E005",
            Self::PayloadTooLarge { .. } => "E100",
            Self::UnsupportedVersion(_) => "E200",
            Self::MalformedPayload(_) => "E201",
            Self::Compression(_) => "E202",
            Self::SessionNotFound(_) => "E300",
            Self::StorageError(_) => "E400",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Serialization(_) => "E900",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::FragmentCorrupted { index } => {
                Some(format!("Re-scan code {} of the set", index + 1))
            }
            Self::PayloadTooLarge { .. } => Some(
                "Export fewer items, or use `snapshelf export-file`, which has no code limit"
                    .to_string(),
            ),
            Self::InconsistentTotal { .. } | Self::ConflictingFragment { .. } => {
                Some("snapshelf sessions list".to_string())
            }
            Self::SessionNotFound(_) => Some("snapshelf sessions list".to_string()),
            Self::UnsupportedVersion(_) => Some("Update Snapshelf on this device".to_string()),
            _ => None,
        }
    }

    /// Whether the user can fix this by re-capturing or reducing the export
    /// without throwing away the rest of the transfer.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::FragmentCorrupted { .. } | Self::PayloadTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_corrupted_error() {
        let error = Error::FragmentCorrupted { index: 2 };
        assert_eq!(error.code(), "E002");
        assert!(error.to_string().contains("Fragment 2"));
        assert_eq!(
            error.suggestion(),
            Some("Re-scan code 3 of the set".to_string())
        );
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_payload_too_large_error() {
        let error = Error::PayloadTooLarge { total: 11, cap: 8 };
        assert_eq!(error.code(), "E100");
        assert!(error.to_string().contains("11"));
        assert!(error.to_string().contains("8"));
        let suggestion = error.suggestion().unwrap();
        assert!(suggestion.contains("snapshelf export-file"));
        assert!(!suggestion.contains("max_fragments"));
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_unsupported_version_error() {
        let error = Error::UnsupportedVersion("9.9".to_string());
        assert_eq!(error.code(), "E200");
        assert!(error.to_string().contains("9.9"));
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let error = Error::ChecksumMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(error.code(), "E001");
        assert_eq!(error.suggestion(), None);
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error: Error = io.into();
        assert_eq!(error.code(), "E9999");
    }
}
