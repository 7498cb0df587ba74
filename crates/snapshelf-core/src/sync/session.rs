//! Import session accumulator
//!
//! One [`ImportSession`] collects the fragments of one transfer. Sessions
//! are keyed by id and never share fragments; the orchestrator persists a
//! session after every accepted fragment and deletes it when the session
//! completes, fails or is abandoned.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::chunker::{Fragment, check_total, missing_indices};

/// Storage key prefix for persisted sessions
pub const SESSION_KEY_PREFIX: &str = "import_session/";

/// Where an import stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    /// Nothing received yet
    Idle,
    /// Session open, waiting for the first payload
    AwaitingFragments,
    /// Some fragments received, more needed
    ScanningMore,
    /// Every fragment present
    ReadyToJoin,
    /// Joining, decoding and verifying
    Validating,
    /// Snapshot delivered
    Done,
    /// Transfer rejected
    Failed,
}

impl ImportState {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingFragments => "awaiting_fragments",
            Self::ScanningMore => "scanning_more",
            Self::ReadyToJoin => "ready_to_join",
            Self::Validating => "validating",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Check if the session has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Check whether moving to `next` is allowed
    pub fn can_transition_to(&self, next: ImportState) -> bool {
        use ImportState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Idle, AwaitingFragments | Validating) => true,
            (AwaitingFragments, ScanningMore | ReadyToJoin | Validating) => true,
            (ScanningMore, ScanningMore | ReadyToJoin) => true,
            (ReadyToJoin, Validating) => true,
            (Validating, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of offering a fragment to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentAcceptance {
    Added,
    /// Same index and data as one already held
    Duplicate,
}

/// Fragments collected for one transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: Uuid,
    pub state: ImportState,
    /// Run length agreed by the first fragment
    pub total: Option<usize>,
    fragments: BTreeMap<usize, Fragment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportSession {
    /// Open a new session waiting for payloads
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: ImportState::AwaitingFragments,
            total: None,
            fragments: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Storage key for a session id
    pub fn key_for(id: Uuid) -> String {
        format!("{}{}", SESSION_KEY_PREFIX, id)
    }

    /// Storage key for this session
    pub fn storage_key(&self) -> String {
        Self::key_for(self.id)
    }

    /// Move to `next`, refusing transitions the state machine does not allow
    pub fn transition(&mut self, next: ImportState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidInput(format!(
                "Import session {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Add a verified fragment
    ///
    /// A fragment that fails its own checksum is refused with
    /// `FragmentCorrupted` and leaves the session untouched. So is one
    /// claiming a run longer than any sender produces.
    pub fn insert(&mut self, fragment: Fragment) -> Result<FragmentAcceptance> {
        fragment.verify()?;

        if fragment.total == 0 || fragment.index >= fragment.total {
            return Err(Error::MalformedPayload(format!(
                "Fragment index {} is outside a run of {}",
                fragment.index, fragment.total
            )));
        }
        check_total(fragment.total)?;

        match self.total {
            Some(total) if total != fragment.total => {
                return Err(Error::InconsistentTotal {
                    expected: total,
                    found: fragment.total,
                });
            }
            Some(_) => {}
            None => self.total = Some(fragment.total),
        }

        if let Some(existing) = self.fragments.get(&fragment.index) {
            return if existing.data == fragment.data {
                Ok(FragmentAcceptance::Duplicate)
            } else {
                Err(Error::ConflictingFragment {
                    index: fragment.index,
                })
            };
        }

        self.fragments.insert(fragment.index, fragment);
        self.updated_at = Utc::now();
        Ok(FragmentAcceptance::Added)
    }

    /// Number of distinct fragments held
    pub fn received(&self) -> usize {
        self.fragments.len()
    }

    /// Indices still needed
    pub fn missing(&self) -> Vec<usize> {
        match self.total {
            Some(total) => missing_indices(total, self.fragments.keys().copied()),
            None => Vec::new(),
        }
    }

    /// Whether every index in `[0, total)` is present
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.fragments.len() == total)
    }

    /// Held fragments in index order
    pub fn fragments(&self) -> Vec<Fragment> {
        self.fragments.values().cloned().collect()
    }

    /// Drop every held fragment
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.total = None;
        self.updated_at = Utc::now();
    }
}

impl Default for ImportSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of a pending session for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub state: ImportState,
    pub received: usize,
    pub total: Option<usize>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ImportSession> for SessionInfo {
    fn from(session: &ImportSession) -> Self {
        Self {
            id: session.id,
            state: session.state,
            received: session.received(),
            total: session.total,
            updated_at: session.updated_at,
        }
    }
}
