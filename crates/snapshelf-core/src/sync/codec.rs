//! Snapshot codec
//!
//! Turns a [`LibrarySnapshot`] into the reduced [`MinimalSnapshot`] that
//! travels between devices, renders it as compact short-key JSON, and
//! compresses that text for visual-code transport.
//!
//! # Compression format
//!
//! Compressed text is `~Z` followed by base64 of a raw DEFLATE stream. When
//! that would not be shorter than the input, the input is returned as-is.
//! Only input that itself starts with a marker is escaped, as `~R<input>`,
//! so [`decompress`] never confuses raw text with a marker. Everything else
//! comes back no longer than it went in.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

use super::model::{DateValue, Group, Item, LibrarySnapshot, Photo, Tag};

/// Marker for DEFLATE + base64 text
pub const COMPRESSED_MARKER: &str = "~Z";

/// Marker for raw text that had to be escaped
pub const RAW_MARKER: &str = "~R";

/// Default DEFLATE level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

/// Item reduced to what sync needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalItem {
    pub id: String,
    pub tags: Vec<String>,
    pub memo: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Group photo reduced to what sync needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalPhoto {
    pub id: String,
    pub tags: Vec<String>,
    pub memo: String,
}

/// Group reduced to what sync needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalGroup {
    pub id: String,
    pub title: String,
    pub photos: Vec<MinimalPhoto>,
    pub tags: Vec<String>,
    pub memo: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The projection of a library that is transferred between devices
///
/// No images, OCR text or locations: those stay on the device that
/// captured them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalSnapshot {
    pub items: Vec<MinimalItem>,
    pub groups: Vec<MinimalGroup>,
    pub tags: Vec<Tag>,
}

// =============================================================================
// Compact wire form - short keys, used for the checksummed text
// =============================================================================

#[derive(Serialize, Deserialize)]
struct CompactSnapshot {
    #[serde(rename = "i")]
    items: Vec<CompactItem>,
    #[serde(rename = "g")]
    groups: Vec<CompactGroup>,
    #[serde(rename = "t")]
    tags: Vec<CompactTag>,
}

#[derive(Serialize, Deserialize)]
struct CompactItem {
    id: String,
    #[serde(rename = "tg")]
    tags: Vec<String>,
    #[serde(rename = "m")]
    memo: String,
    #[serde(rename = "c")]
    created_at: i64,
    #[serde(rename = "u")]
    updated_at: i64,
}

#[derive(Serialize, Deserialize)]
struct CompactPhoto {
    id: String,
    #[serde(rename = "tg")]
    tags: Vec<String>,
    #[serde(rename = "m")]
    memo: String,
}

#[derive(Serialize, Deserialize)]
struct CompactGroup {
    id: String,
    #[serde(rename = "ti")]
    title: String,
    #[serde(rename = "p")]
    photos: Vec<CompactPhoto>,
    #[serde(rename = "tg")]
    tags: Vec<String>,
    #[serde(rename = "m")]
    memo: String,
    #[serde(rename = "c")]
    created_at: i64,
    #[serde(rename = "u")]
    updated_at: i64,
}

#[derive(Serialize, Deserialize)]
struct CompactTag {
    id: String,
    #[serde(rename = "n")]
    name: String,
    #[serde(rename = "cl", default, skip_serializing_if = "Option::is_none")]
    color: Option<String>,
}

impl From<&MinimalSnapshot> for CompactSnapshot {
    fn from(snapshot: &MinimalSnapshot) -> Self {
        Self {
            items: snapshot
                .items
                .iter()
                .map(|item| CompactItem {
                    id: item.id.clone(),
                    tags: item.tags.clone(),
                    memo: item.memo.clone(),
                    created_at: item.created_at,
                    updated_at: item.updated_at,
                })
                .collect(),
            groups: snapshot
                .groups
                .iter()
                .map(|group| CompactGroup {
                    id: group.id.clone(),
                    title: group.title.clone(),
                    photos: group
                        .photos
                        .iter()
                        .map(|photo| CompactPhoto {
                            id: photo.id.clone(),
                            tags: photo.tags.clone(),
                            memo: photo.memo.clone(),
                        })
                        .collect(),
                    tags: group.tags.clone(),
                    memo: group.memo.clone(),
                    created_at: group.created_at,
                    updated_at: group.updated_at,
                })
                .collect(),
            tags: snapshot
                .tags
                .iter()
                .map(|tag| CompactTag {
                    id: tag.id.clone(),
                    name: tag.name.clone(),
                    color: tag.color.clone(),
                })
                .collect(),
        }
    }
}

impl From<CompactSnapshot> for MinimalSnapshot {
    fn from(compact: CompactSnapshot) -> Self {
        Self {
            items: compact
                .items
                .into_iter()
                .map(|item| MinimalItem {
                    id: item.id,
                    tags: item.tags,
                    memo: item.memo,
                    created_at: item.created_at,
                    updated_at: item.updated_at,
                })
                .collect(),
            groups: compact
                .groups
                .into_iter()
                .map(|group| MinimalGroup {
                    id: group.id,
                    title: group.title,
                    photos: group
                        .photos
                        .into_iter()
                        .map(|photo| MinimalPhoto {
                            id: photo.id,
                            tags: photo.tags,
                            memo: photo.memo,
                        })
                        .collect(),
                    tags: group.tags,
                    memo: group.memo,
                    created_at: group.created_at,
                    updated_at: group.updated_at,
                })
                .collect(),
            tags: compact
                .tags
                .into_iter()
                .map(|tag| Tag {
                    id: tag.id,
                    name: tag.name,
                    color: tag.color,
                })
                .collect(),
        }
    }
}

// =============================================================================
// Minimize / expand
// =============================================================================

/// Project a library snapshot down to the fields that are synchronized
///
/// Dates that cannot be parsed are replaced with the current time.
pub fn minimize(snapshot: &LibrarySnapshot) -> MinimalSnapshot {
    let now = Utc::now().timestamp_millis();

    MinimalSnapshot {
        items: snapshot
            .items
            .iter()
            .map(|item| MinimalItem {
                id: item.id.clone(),
                tags: item.tags.clone(),
                memo: item.memo.clone(),
                created_at: epoch_or_now(&item.created_at, now, &item.id),
                updated_at: epoch_or_now(&item.updated_at, now, &item.id),
            })
            .collect(),
        groups: snapshot
            .groups
            .iter()
            .map(|group| MinimalGroup {
                id: group.id.clone(),
                title: group.title.clone(),
                photos: group
                    .photos
                    .iter()
                    .map(|photo| MinimalPhoto {
                        id: photo.id.clone(),
                        tags: photo.tags.clone(),
                        memo: photo.memo.clone(),
                    })
                    .collect(),
                tags: group.tags.clone(),
                memo: group.memo.clone(),
                created_at: epoch_or_now(&group.created_at, now, &group.id),
                updated_at: epoch_or_now(&group.updated_at, now, &group.id),
            })
            .collect(),
        tags: snapshot.tags.clone(),
    }
}

fn epoch_or_now(value: &DateValue, now: i64, record_id: &str) -> i64 {
    value.to_epoch_millis().unwrap_or_else(|| {
        warn!(record_id = %record_id, value = ?value, "Unparseable date, using current time");
        now
    })
}

/// Rebuild the application's snapshot shape from a received projection
///
/// Image, OCR and location fields are left empty; the receiving app merges
/// them from its own store.
pub fn expand(minimal: MinimalSnapshot) -> LibrarySnapshot {
    LibrarySnapshot {
        items: minimal
            .items
            .into_iter()
            .map(|item| Item {
                created_at: date_from_millis(item.created_at, &item.id),
                updated_at: date_from_millis(item.updated_at, &item.id),
                id: item.id,
                image_uri: None,
                ocr_text: None,
                location: None,
                tags: item.tags,
                memo: item.memo,
            })
            .collect(),
        groups: minimal
            .groups
            .into_iter()
            .map(|group| Group {
                created_at: date_from_millis(group.created_at, &group.id),
                updated_at: date_from_millis(group.updated_at, &group.id),
                id: group.id,
                title: group.title,
                photos: group
                    .photos
                    .into_iter()
                    .map(|photo| Photo {
                        id: photo.id,
                        image_uri: None,
                        ocr_text: None,
                        tags: photo.tags,
                        memo: photo.memo,
                    })
                    .collect(),
                tags: group.tags,
                memo: group.memo,
                location: None,
            })
            .collect(),
        tags: minimal.tags,
    }
}

fn date_from_millis(ms: i64, record_id: &str) -> DateValue {
    DateValue::from_epoch_millis(ms).unwrap_or_else(|| {
        warn!(record_id = %record_id, millis = ms, "Timestamp out of range, using current time");
        DateValue::now()
    })
}

// =============================================================================
// Serialize / deserialize
// =============================================================================

/// Render a minimal snapshot as compact short-key JSON
///
/// This exact text is what envelope checksums cover.
pub fn serialize(snapshot: &MinimalSnapshot) -> Result<String> {
    Ok(serde_json::to_string(&CompactSnapshot::from(snapshot))?)
}

/// Parse compact short-key JSON back into a minimal snapshot
pub fn deserialize(text: &str) -> Result<MinimalSnapshot> {
    let compact: CompactSnapshot = serde_json::from_str(text)
        .map_err(|e| Error::MalformedPayload(format!("Invalid snapshot data: {}", e)))?;
    Ok(compact.into())
}

// =============================================================================
// Compression
// =============================================================================

/// Compress text at the default level
pub fn compress(input: &str) -> Result<String> {
    compress_with_level(input, DEFAULT_COMPRESSION_LEVEL)
}

/// Compress text, falling back to the input when compression does not help
pub fn compress_with_level(input: &str, level: u32) -> Result<String> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(input.as_bytes())
        .map_err(|e| Error::Compression(e.to_string()))?;
    let deflated = encoder
        .finish()
        .map_err(|e| Error::Compression(e.to_string()))?;

    let encoded_len = base64::encoded_len(deflated.len(), true)
        .map(|len| len + COMPRESSED_MARKER.len())
        .unwrap_or(usize::MAX);
    if encoded_len < input.len() {
        return Ok(format!("{}{}", COMPRESSED_MARKER, STANDARD.encode(deflated)));
    }

    if input.starts_with(COMPRESSED_MARKER) || input.starts_with(RAW_MARKER) {
        Ok(format!("{}{}", RAW_MARKER, input))
    } else {
        Ok(input.to_string())
    }
}

/// Reverse [`compress`], passing uncompressed text through unchanged
pub fn decompress(input: &str) -> Result<String> {
    if let Some(body) = input.strip_prefix(COMPRESSED_MARKER) {
        let deflated = STANDARD
            .decode(body)
            .map_err(|e| Error::Compression(format!("Invalid base64: {}", e)))?;
        let mut text = String::new();
        DeflateDecoder::new(deflated.as_slice())
            .read_to_string(&mut text)
            .map_err(|e| Error::Compression(format!("Invalid deflate stream: {}", e)))?;
        Ok(text)
    } else if let Some(raw) = input.strip_prefix(RAW_MARKER) {
        Ok(raw.to_string())
    } else {
        Ok(input.to_string())
    }
}

/// Whether `input` carries the compressed marker
pub fn is_compressed(input: &str) -> bool {
    input.starts_with(COMPRESSED_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::model::Location;
    use chrono::TimeZone;
    use rand::distributions::Alphanumeric;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    fn sample_library() -> LibrarySnapshot {
        let created = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        LibrarySnapshot {
            items: vec![Item {
                id: "item-1".to_string(),
                image_uri: Some("file:///photos/1.jpg".to_string()),
                ocr_text: Some("TOTAL 12.40".to_string()),
                location: Some(Location {
                    latitude: 35.68,
                    longitude: 139.76,
                    address: None,
                }),
                tags: vec!["t1".to_string()],
                memo: "lunch receipt".to_string(),
                created_at: DateValue::Native(created),
                updated_at: DateValue::Millis(1_700_000_500_000),
            }],
            groups: vec![Group {
                id: "group-1".to_string(),
                title: "Trip".to_string(),
                photos: vec![Photo {
                    id: "p1".to_string(),
                    image_uri: Some("file:///photos/p1.jpg".to_string()),
                    ocr_text: None,
                    tags: vec![],
                    memo: "station".to_string(),
                }],
                tags: vec!["t1".to_string()],
                memo: String::new(),
                location: None,
                created_at: DateValue::Text("2023-11-14T22:13:20Z".to_string()),
                updated_at: DateValue::Text("2023-11-14T22:13:20Z".to_string()),
            }],
            tags: vec![Tag {
                id: "t1".to_string(),
                name: "receipts".to_string(),
                color: Some("#ff0000".to_string()),
            }],
        }
    }

    #[test]
    fn test_minimize_drops_binary_fields() {
        let minimal = minimize(&sample_library());
        assert_eq!(minimal.items.len(), 1);
        assert_eq!(minimal.items[0].created_at, 1_700_000_000_000);
        assert_eq!(minimal.items[0].updated_at, 1_700_000_500_000);
        assert_eq!(minimal.groups[0].created_at, 1_700_000_000_000);
        assert_eq!(minimal.groups[0].photos[0].memo, "station");

        let json = serde_json::to_string(&minimal).unwrap();
        assert!(!json.contains("photos/1.jpg"));
        assert!(!json.contains("TOTAL"));
        assert!(!json.contains("139.76"));
    }

    #[test]
    fn test_minimize_unparseable_date_falls_back_to_now() {
        let mut library = sample_library();
        library.items[0].created_at = DateValue::Text("not a date".to_string());

        let before = Utc::now().timestamp_millis();
        let minimal = minimize(&library);
        let after = Utc::now().timestamp_millis();

        let created = minimal.items[0].created_at;
        assert!(created >= before && created <= after);
    }

    #[test]
    fn test_serialize_is_compact_with_short_keys() {
        let text = serialize(&minimize(&sample_library())).unwrap();
        assert!(text.starts_with("{\"i\":["));
        assert!(text.contains("\"tg\":[\"t1\"]"));
        assert!(text.contains("\"cl\":\"#ff0000\""));
        assert!(!text.contains("createdAt"));
        assert!(!text.contains(": "));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn test_serialize_is_deterministic() {
        let minimal = minimize(&sample_library());
        assert_eq!(serialize(&minimal).unwrap(), serialize(&minimal).unwrap());
    }

    #[test]
    fn test_deserialize_inverts_serialize() {
        let minimal = minimize(&sample_library());
        let text = serialize(&minimal).unwrap();
        assert_eq!(deserialize(&text).unwrap(), minimal);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(matches!(
            deserialize("{\"items\":[]}"),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_expand_restores_dates_and_clears_binary_fields() {
        let library = expand(minimize(&sample_library()));
        let item = &library.items[0];
        assert_eq!(item.created_at.to_epoch_millis(), Some(1_700_000_000_000));
        assert!(matches!(item.created_at, DateValue::Native(_)));
        assert!(item.image_uri.is_none());
        assert!(item.ocr_text.is_none());
        assert!(item.location.is_none());
        assert_eq!(item.memo, "lunch receipt");
        assert!(library.groups[0].photos[0].image_uri.is_none());
        assert_eq!(library.tags[0].name, "receipts");
    }

    #[test]
    fn test_compress_shrinks_repetitive_text() {
        let input = "{\"id\":\"item\",\"tg\":[\"receipts\"],\"m\":\"\"},".repeat(50);
        let compressed = compress(&input).unwrap();
        assert!(is_compressed(&compressed));
        assert!(compressed.len() < input.len());
        assert_eq!(decompress(&compressed).unwrap(), input);
    }

    #[test]
    fn test_compress_falls_back_for_incompressible_text() {
        let mut rng = StdRng::seed_from_u64(7);
        for len in [0, 1, 16, 64, 512, 4096] {
            let input: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect();
            let compressed = compress(&input).unwrap();
            assert!(compressed.len() <= input.len(), "len {len}");
            assert_eq!(decompress(&compressed).unwrap(), input);
        }
    }

    #[test]
    fn test_short_text_passes_through_unchanged() {
        assert_eq!(compress("{}").unwrap(), "{}");
        assert_eq!(decompress("{}").unwrap(), "{}");
    }

    #[test]
    fn test_marker_prefixed_text_is_escaped() {
        for input in ["~Zabc", "~R", "~R~Zx"] {
            let compressed = compress(input).unwrap();
            assert!(compressed.starts_with(RAW_MARKER));
            assert_eq!(decompress(&compressed).unwrap(), input);
        }
    }

    #[test]
    fn test_other_tilde_text_passes_through_unchanged() {
        for input in ["~", "~abc", "~z lowercase", "a~Z"] {
            assert_eq!(compress(input).unwrap(), input);
            assert_eq!(decompress(input).unwrap(), input);
        }
    }

    #[test]
    fn test_compress_multibyte_text() {
        let input = "領収書 ランチ 写真メモ ".repeat(40);
        let compressed = compress(&input).unwrap();
        assert_eq!(decompress(&compressed).unwrap(), input);
    }

    #[test]
    fn test_decompress_reports_corruption() {
        assert!(matches!(
            decompress("~Z!!!not-base64"),
            Err(Error::Compression(_))
        ));
    }
}
