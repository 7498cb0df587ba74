//! Library snapshot types
//!
//! These mirror the shape the rest of the application keeps in its local
//! store. Only a projection of them travels between devices (see
//! [`super::codec::MinimalSnapshot`]).

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A timestamp as it appears in stored library data
///
/// Library files written by older app versions hold dates in several shapes.
/// Variants are tried in order during deserialization: an RFC 3339 string
/// becomes `Native`, an integer becomes `Millis`, any other string is kept
/// as `Text` and parsed lazily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateValue {
    Native(DateTime<Utc>),
    Millis(i64),
    Text(String),
}

impl DateValue {
    /// Current time
    pub fn now() -> Self {
        Self::Native(Utc::now())
    }

    /// Build from epoch milliseconds, `None` when out of range
    pub fn from_epoch_millis(ms: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(ms).single().map(Self::Native)
    }

    /// Convert to epoch milliseconds, `None` when the value cannot be parsed
    pub fn to_epoch_millis(&self) -> Option<i64> {
        match self {
            Self::Native(dt) => Some(dt.timestamp_millis()),
            Self::Millis(ms) => Some(*ms),
            Self::Text(text) => parse_date_text(text).map(|dt| dt.timestamp_millis()),
        }
    }
}

impl From<DateTime<Utc>> for DateValue {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::Native(dt)
    }
}

fn parse_date_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ms) = text.parse::<i64>() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// A tag that can be attached to items, groups and photos
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Where a photo was taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// A single captured photo or document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub memo: String,
    pub created_at: DateValue,
    pub updated_at: DateValue,
}

/// A photo inside a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub memo: String,
}

/// An ordered collection of photos with its own title and memo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub memo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub created_at: DateValue,
    pub updated_at: DateValue,
}

/// The whole library as held by one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibrarySnapshot {
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl LibrarySnapshot {
    /// Create an empty snapshot
    pub fn empty() -> Self {
        Self::default()
    }

    /// Total number of records (items, groups and tags)
    pub fn record_count(&self) -> usize {
        self.items.len() + self.groups.len() + self.tags.len()
    }
}
