//! Splitting encoded payloads into bounded fragments and joining them back
//!
//! A visual code holds a limited amount of text, so an encoded envelope that
//! does not fit in one code is cut into an ordered run of [`Fragment`]s.
//! Every fragment carries its position, the size of the run and a
//! [`fast_digest`] of its data.
//!
//! Fragment data is budgeted by its JSON-escaped width, since that is what
//! lands in the chunk frame. Cuts always fall on character boundaries, so
//! multi-byte memo text survives the round trip.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::checksum::{fast_digest, verify_fast};

/// Characters reserved for the chunk frame around each fragment's data
///
/// `{"type":"chunk","index":NNN,"total":NNN,"data":"","checksum":"xxxxxxxx"}`
pub const HEADER_OVERHEAD: usize = 72;

/// Longest run a chunk frame can describe within [`HEADER_OVERHEAD`]
pub const MAX_FRAGMENT_TOTAL: usize = 999;

/// Smallest data budget per fragment, the widest escape of one character
pub const MIN_FRAGMENT_DATA: usize = 6;

/// One bounded piece of an encoded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub index: usize,
    pub total: usize,
    pub data: String,
    pub checksum: String,
}

impl Fragment {
    /// Create a fragment, computing its checksum
    pub fn new(index: usize, total: usize, data: impl Into<String>) -> Self {
        let data = data.into();
        let checksum = fast_digest(&data);
        Self {
            index,
            total,
            data,
            checksum,
        }
    }

    /// Check the fragment's data against its own checksum
    pub fn verify(&self) -> Result<()> {
        verify_fast(self.index, &self.data, &self.checksum)
    }
}

/// Width of `c` once written inside a JSON string
fn escaped_width(c: char) -> usize {
    match c {
        '"' | '\\' | '\n' | '\r' | '\t' | '\u{8}' | '\u{c}' => 2,
        c if c < '\u{20}' => 6,
        _ => 1,
    }
}

/// Characters `text` takes up inside a JSON string, quotes excluded
pub fn escaped_len(text: &str) -> usize {
    text.chars().map(escaped_width).sum()
}

/// Byte offset ending the next fragment cut from `rest`
fn next_cut(rest: &str, effective: usize) -> usize {
    let mut width = 0;
    for (offset, c) in rest.char_indices() {
        width += escaped_width(c);
        if width > effective {
            return offset;
        }
    }
    rest.len()
}

/// Escaped data characters that fit in a fragment of `max_fragment_size`
pub fn effective_size(max_fragment_size: usize) -> Result<usize> {
    match max_fragment_size.checked_sub(HEADER_OVERHEAD) {
        Some(size) if size >= MIN_FRAGMENT_DATA => Ok(size),
        _ => Err(Error::InvalidInput(format!(
            "Fragment size {} leaves no room for data (needs at least {} characters)",
            max_fragment_size,
            HEADER_OVERHEAD + MIN_FRAGMENT_DATA
        ))),
    }
}

/// Number of fragments `payload` needs at `max_fragment_size`
pub fn fragment_count(payload: &str, max_fragment_size: usize) -> Result<usize> {
    let effective = effective_size(max_fragment_size)?;
    let mut count = 0;
    let mut rest = payload;
    loop {
        rest = &rest[next_cut(rest, effective)..];
        count += 1;
        if rest.is_empty() {
            return Ok(count);
        }
    }
}

/// Split `payload` into fragments whose chunk frames are at most
/// `max_fragment_size` characters, refusing runs longer than `max_fragments`
pub fn split(payload: &str, max_fragment_size: usize, max_fragments: usize) -> Result<Vec<Fragment>> {
    let effective = effective_size(max_fragment_size)?;
    let total = fragment_count(payload, max_fragment_size)?;
    let cap = max_fragments.min(MAX_FRAGMENT_TOTAL);
    if total > cap {
        return Err(Error::PayloadTooLarge { total, cap });
    }

    let mut fragments = Vec::with_capacity(total);
    let mut rest = payload;
    for index in 0..total {
        let (data, tail) = rest.split_at(next_cut(rest, effective));
        fragments.push(Fragment::new(index, total, data));
        rest = tail;
    }

    Ok(fragments)
}

/// Refuse a run length no sender can produce
pub fn check_total(total: usize) -> Result<()> {
    if total > MAX_FRAGMENT_TOTAL {
        return Err(Error::MalformedPayload(format!(
            "Fragment run of {} exceeds the limit of {}",
            total, MAX_FRAGMENT_TOTAL
        )));
    }
    Ok(())
}

/// Join a complete set of fragments back into the original payload
///
/// Input order does not matter. Identical duplicates are tolerated.
pub fn join(fragments: &[Fragment]) -> Result<String> {
    let Some(first) = fragments.first() else {
        return Err(Error::IncompleteTransfer { missing: vec![0] });
    };

    let total = first.total;
    check_total(total)?;
    let mut by_index: BTreeMap<usize, &Fragment> = BTreeMap::new();
    for fragment in fragments {
        fragment.verify()?;
        if fragment.total != total {
            return Err(Error::InconsistentTotal {
                expected: total,
                found: fragment.total,
            });
        }
        if fragment.index >= total {
            return Err(Error::MalformedPayload(format!(
                "Fragment index {} is outside a run of {}",
                fragment.index, total
            )));
        }
        if let Some(existing) = by_index.insert(fragment.index, fragment) {
            if existing.data != fragment.data {
                return Err(Error::ConflictingFragment {
                    index: fragment.index,
                });
            }
        }
    }

    let missing = missing_indices(total, by_index.keys().copied());
    if !missing.is_empty() {
        return Err(Error::IncompleteTransfer { missing });
    }

    Ok(by_index.values().map(|fragment| fragment.data.as_str()).collect())
}

/// Indices in `[0, total)` that are not present
pub fn missing_indices(total: usize, present: impl IntoIterator<Item = usize>) -> Vec<usize> {
    let mut seen = vec![false; total];
    for index in present {
        if let Some(slot) = seen.get_mut(index) {
            *slot = true;
        }
    }
    seen.iter()
        .enumerate()
        .filter(|(_, seen)| !**seen)
        .map(|(index, _)| index)
        .collect()
}
