//! Transfer orchestration
//!
//! [`SyncManager`] drives both directions of a transfer. Export builds an
//! envelope for the live library and encodes it as one or more code texts
//! (or as a file attachment). Import collects scanned texts into an
//! [`ImportSession`], joins and verifies them once the run is complete and
//! hands back the expanded snapshot.
//!
//! Sessions are persisted after every accepted fragment so an interrupted
//! import can be resumed, and are removed on completion, failure or
//! abandonment.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::{KeyValueStore, get_json, set_json};

use super::chunker::{self, HEADER_OVERHEAD};
use super::codec::{self, DEFAULT_COMPRESSION_LEVEL};
use super::device::DeviceIdentityManager;
use super::envelope::{SyncEnvelope, SyncPayload};
use super::model::LibrarySnapshot;
use super::session::{FragmentAcceptance, ImportSession, ImportState, SESSION_KEY_PREFIX, SessionInfo};
use super::transport::{Attachment, CodeScanner};

/// Size limits and compression used for exports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub max_fragment_size: usize,
    pub max_fragments: usize,
    pub compression_level: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_fragment_size: 1000,
            max_fragments: 12,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl From<&Config> for TransferSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_fragment_size: config.transfer.max_fragment_size,
            max_fragments: config.transfer.max_fragments,
            compression_level: config.transfer.compression_level,
        }
    }
}

/// How an export was laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// The whole envelope fits one code
    SingleCode,
    /// The envelope was split into chunk codes
    Chunked,
}

impl ExportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleCode => "single_code",
            Self::Chunked => "chunked",
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum ExportStage {
    BuildingEnvelope,
    Compressing,
    SingleCode,
    Chunking,
    Encoded,
}

impl ExportStage {
    fn as_str(&self) -> &'static str {
        match self {
            Self::BuildingEnvelope => "building_envelope",
            Self::Compressing => "compressing",
            Self::SingleCode => "single_code",
            Self::Chunking => "chunking",
            Self::Encoded => "encoded",
        }
    }
}

/// Envelope fields worth showing alongside an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    pub version: String,
    pub timestamp: i64,
    pub device_id: String,
    pub checksum: String,
    pub items: usize,
    pub groups: usize,
    pub tags: usize,
}

impl From<&SyncEnvelope> for EnvelopeMetadata {
    fn from(envelope: &SyncEnvelope) -> Self {
        Self {
            version: envelope.version.clone(),
            timestamp: envelope.timestamp,
            device_id: envelope.device_id.clone(),
            checksum: envelope.checksum.clone(),
            items: envelope.payload.items.len(),
            groups: envelope.payload.groups.len(),
            tags: envelope.payload.tags.len(),
        }
    }
}

/// Code texts ready to be rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBundle {
    pub metadata: EnvelopeMetadata,
    pub mode: ExportMode,
    /// Code texts in display order
    pub codes: Vec<String>,
}

/// A completed import
#[derive(Debug, Clone, PartialEq)]
pub struct ImportOutcome {
    pub snapshot: LibrarySnapshot,
    /// Device that exported the snapshot
    pub device_id: String,
    pub version: String,
    /// Export time in epoch milliseconds
    pub exported_at: i64,
    /// Codes consumed; zero for attachments
    pub fragments: usize,
}

/// Where an import stands after accepting a payload
#[derive(Debug, Clone, PartialEq)]
pub enum ImportProgress {
    AwaitingFragments {
        received: usize,
        total: usize,
        missing: Vec<usize>,
    },
    Done(ImportOutcome),
}

enum Step {
    Pending,
    Complete {
        envelope: SyncEnvelope,
        fragments: usize,
    },
}

/// Why a payload was refused
enum Rejection {
    /// The session is unchanged and the user may capture again
    Retry(Error),
    /// The session cannot continue
    Fatal(Error),
}

impl From<Error> for Rejection {
    fn from(err: Error) -> Self {
        Self::Fatal(err)
    }
}

/// Exports and imports library snapshots
pub struct SyncManager {
    store: Arc<dyn KeyValueStore>,
    identity: DeviceIdentityManager,
    settings: TransferSettings,
    sessions: Mutex<HashMap<Uuid, ImportSession>>,
}

impl SyncManager {
    /// Create a manager persisting through `store`
    pub fn new(store: Arc<dyn KeyValueStore>, settings: TransferSettings) -> Self {
        Self {
            identity: DeviceIdentityManager::new(store.clone()),
            store,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the identity manager, e.g. to set a default device name
    pub fn with_identity(mut self, identity: DeviceIdentityManager) -> Self {
        self.identity = identity;
        self
    }

    pub fn identity(&self) -> &DeviceIdentityManager {
        &self.identity
    }

    pub fn settings(&self) -> TransferSettings {
        self.settings
    }

    // ========== Export ==========

    /// Wrap `snapshot` in an envelope stamped with this device
    pub async fn build_envelope(&self, snapshot: &LibrarySnapshot) -> Result<SyncEnvelope> {
        trace_stage(ExportStage::BuildingEnvelope);
        let identity = self.identity.load_or_create().await?;
        SyncEnvelope::build(snapshot, &identity.device_id)
    }

    /// Encode an envelope as code texts
    ///
    /// One code when the single-shot text fits `max_fragment_size`,
    /// otherwise a run of chunk codes over that text.
    pub fn encode_codes(&self, envelope: &SyncEnvelope) -> Result<(ExportMode, Vec<String>)> {
        trace_stage(ExportStage::Compressing);
        let frame = envelope.to_frame(self.settings.compression_level)?;
        let frame_text = SyncPayload::SingleShot(frame).to_text()?;
        let length = frame_text.chars().count();

        if length <= self.settings.max_fragment_size {
            trace_stage(ExportStage::SingleCode);
            trace_stage(ExportStage::Encoded);
            return Ok((ExportMode::SingleCode, vec![frame_text]));
        }

        trace_stage(ExportStage::Chunking);
        let fragments = chunker::split(
            &frame_text,
            self.settings.max_fragment_size,
            self.settings.max_fragments,
        )?;
        let codes = fragments
            .into_iter()
            .map(|fragment| SyncPayload::Chunk(fragment).to_text())
            .collect::<Result<Vec<_>>>()?;

        debug!(
            length,
            fragments = codes.len(),
            header_overhead = HEADER_OVERHEAD,
            "Split envelope into chunk codes"
        );
        trace_stage(ExportStage::Encoded);
        Ok((ExportMode::Chunked, codes))
    }

    /// Export `snapshot` as visual-code texts
    pub async fn export_codes(&self, snapshot: &LibrarySnapshot) -> Result<ExportBundle> {
        let envelope = self.build_envelope(snapshot).await?;
        let (mode, codes) = self.encode_codes(&envelope)?;

        info!(
            device_id = %envelope.device_id,
            records = snapshot.record_count(),
            mode = %mode,
            codes = codes.len(),
            "Exported library as codes"
        );
        Ok(ExportBundle {
            metadata: EnvelopeMetadata::from(&envelope),
            mode,
            codes,
        })
    }

    /// Export `snapshot` as a JSON file attachment
    pub async fn export_attachment(&self, snapshot: &LibrarySnapshot) -> Result<Attachment> {
        let identity = self.identity.load_or_create().await?;
        let envelope = self.build_envelope(snapshot).await?;
        let exported_at = DateTime::<Utc>::from_timestamp_millis(envelope.timestamp)
            .unwrap_or_else(Utc::now);

        let file_name = format!(
            "snapshelf-{}-{}.json",
            file_name_segment(&identity.device_name),
            exported_at.format("%Y%m%d-%H%M%S")
        );
        let subject = format!("Snapshelf library from {}", identity.device_name);
        let body = format!(
            "{} items, {} groups and {} tags exported on {}.\n\
             Open this file in Snapshelf on the other device to import it.",
            envelope.payload.items.len(),
            envelope.payload.groups.len(),
            envelope.payload.tags.len(),
            exported_at.format("%Y-%m-%d %H:%M UTC")
        );
        let bytes = envelope.to_attachment_json()?.into_bytes();

        info!(device_id = %envelope.device_id, file_name = %file_name, "Exported library as attachment");
        Ok(Attachment {
            file_name,
            subject,
            body,
            bytes,
        })
    }

    // ========== Import ==========

    /// Open a new import session
    pub async fn begin_import(&self) -> Result<Uuid> {
        let session = ImportSession::new();
        let id = session.id;
        self.persist(&session).await?;
        self.sessions.lock().await.insert(id, session);

        info!(session_id = %id, "Import session started");
        Ok(id)
    }

    /// Load a persisted session back into memory
    pub async fn resume_import(&self, id: Uuid) -> Result<SessionInfo> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&id) {
            return Ok(SessionInfo::from(session));
        }

        let session = self
            .load_session(id)
            .await?
            .ok_or(Error::SessionNotFound(id))?;
        let info = SessionInfo::from(&session);
        sessions.insert(id, session);

        info!(session_id = %id, received = info.received, "Import session resumed");
        Ok(info)
    }

    /// Drop a session and everything it holds
    pub async fn abandon_import(&self, id: Uuid) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let in_memory = sessions.remove(&id).is_some();
        let persisted = self.store.remove(&ImportSession::key_for(id)).await?;
        if !in_memory && !persisted {
            return Err(Error::SessionNotFound(id));
        }

        info!(session_id = %id, "Import session abandoned");
        Ok(())
    }

    /// Sessions waiting for more codes, oldest first
    pub async fn pending_sessions(&self) -> Result<Vec<SessionInfo>> {
        let sessions = self.sessions.lock().await;
        let mut infos: HashMap<Uuid, SessionInfo> = sessions
            .values()
            .map(|session| (session.id, SessionInfo::from(session)))
            .collect();

        for key in self.store.keys_with_prefix(SESSION_KEY_PREFIX).await? {
            let Some(session) = get_json::<ImportSession, _>(self.store.as_ref(), &key).await?
            else {
                continue;
            };
            infos
                .entry(session.id)
                .or_insert_with(|| SessionInfo::from(&session));
        }

        let mut infos: Vec<SessionInfo> = infos.into_values().collect();
        infos.sort_by_key(|info| (info.updated_at, info.id));
        Ok(infos)
    }

    /// Offer one scanned or pasted text to a session
    ///
    /// Text that is not a sync payload and chunks failing their own checksum
    /// are refused without touching the session, so the user can capture
    /// again. Every other error ends the session.
    pub async fn accept_payload(&self, id: Uuid, text: &str) -> Result<ImportProgress> {
        let mut sessions = self.sessions.lock().await;
        let mut session = match sessions.remove(&id) {
            Some(session) => session,
            None => self
                .load_session(id)
                .await?
                .ok_or(Error::SessionNotFound(id))?,
        };

        match apply(&mut session, text) {
            Ok(Step::Pending) => {
                let persisted = self.persist(&session).await;
                let progress = ImportProgress::AwaitingFragments {
                    received: session.received(),
                    total: session.total.unwrap_or_default(),
                    missing: session.missing(),
                };
                sessions.insert(id, session);
                persisted?;
                Ok(progress)
            }
            Ok(Step::Complete {
                envelope,
                fragments,
            }) => self.complete(session, envelope, fragments).await,
            Err(Rejection::Retry(err)) => {
                warn!(session_id = %id, error = %err, "Payload refused, capture it again");
                sessions.insert(id, session);
                Err(err)
            }
            Err(Rejection::Fatal(err)) => self.fail(session, err).await,
        }
    }

    /// Import one text in a throwaway session
    ///
    /// Fails with `IncompleteTransfer` if the text is a chunk of a longer run.
    pub async fn import_code(&self, text: &str) -> Result<ImportOutcome> {
        let id = self.begin_import().await?;
        match self.accept_payload(id, text).await {
            Ok(ImportProgress::Done(outcome)) => Ok(outcome),
            Ok(ImportProgress::AwaitingFragments { missing, .. }) => {
                self.abandon_import(id).await?;
                Err(Error::IncompleteTransfer { missing })
            }
            Err(err) => {
                if self.has_session(id).await {
                    self.abandon_import(id).await?;
                }
                Err(err)
            }
        }
    }

    /// Feed codes from `scanner` into a session until it completes
    ///
    /// Refused captures are skipped. When the scanner runs dry the session
    /// is kept for a later resume and `IncompleteTransfer` is returned.
    pub async fn scan_until_complete(
        &self,
        id: Uuid,
        scanner: &dyn CodeScanner,
    ) -> Result<ImportOutcome> {
        while let Some(text) = scanner.scan().await? {
            match self.accept_payload(id, &text).await {
                Ok(ImportProgress::Done(outcome)) => return Ok(outcome),
                Ok(ImportProgress::AwaitingFragments { missing, .. }) => {
                    debug!(session_id = %id, missing = ?missing, "Waiting for more codes");
                }
                Err(err) => {
                    if !self.has_session(id).await {
                        return Err(err);
                    }
                    warn!(session_id = %id, error = %err, "Skipping capture");
                }
            }
        }

        let missing = {
            let sessions = self.sessions.lock().await;
            match sessions.get(&id) {
                Some(session) if session.total.is_some() => session.missing(),
                Some(_) => vec![0],
                None => return Err(Error::SessionNotFound(id)),
            }
        };
        Err(Error::IncompleteTransfer { missing })
    }

    /// Validate and expand a file attachment
    pub async fn import_attachment(&self, bytes: &[u8]) -> Result<ImportOutcome> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::MalformedPayload("Attachment is not UTF-8 text".to_string()))?;
        let envelope = SyncEnvelope::from_attachment_json(text)?;
        envelope.validate()?;

        let outcome = outcome_from(envelope, 0);
        self.identity.record_sync(Utc::now().timestamp_millis()).await?;

        info!(
            device_id = %outcome.device_id,
            records = outcome.snapshot.record_count(),
            "Imported attachment"
        );
        Ok(outcome)
    }

    async fn has_session(&self, id: Uuid) -> bool {
        self.sessions.lock().await.contains_key(&id)
    }

    async fn load_session(&self, id: Uuid) -> Result<Option<ImportSession>> {
        get_json(self.store.as_ref(), &ImportSession::key_for(id)).await
    }

    async fn persist(&self, session: &ImportSession) -> Result<()> {
        set_json(self.store.as_ref(), &session.storage_key(), session).await
    }

    async fn complete(
        &self,
        mut session: ImportSession,
        envelope: SyncEnvelope,
        fragments: usize,
    ) -> Result<ImportProgress> {
        if let Err(transition_err) = session.transition(ImportState::Done) {
            debug!(session_id = %session.id, error = %transition_err, "Session already ended");
        }
        session.clear();
        // Cleanup failures are logged and the verified snapshot is still returned
        if let Err(remove_err) = self.store.remove(&session.storage_key()).await {
            warn!(session_id = %session.id, error = %remove_err, "Failed to remove session");
        }
        if let Err(record_err) = self.identity.record_sync(Utc::now().timestamp_millis()).await {
            warn!(session_id = %session.id, error = %record_err, "Failed to record sync time");
        }

        let outcome = outcome_from(envelope, fragments);
        info!(
            session_id = %session.id,
            device_id = %outcome.device_id,
            version = %outcome.version,
            fragments,
            records = outcome.snapshot.record_count(),
            "Import completed"
        );
        Ok(ImportProgress::Done(outcome))
    }

    async fn fail(&self, mut session: ImportSession, err: Error) -> Result<ImportProgress> {
        if let Err(transition_err) = session.transition(ImportState::Failed) {
            debug!(session_id = %session.id, error = %transition_err, "Session already ended");
        }
        session.clear();
        if let Err(remove_err) = self.store.remove(&session.storage_key()).await {
            warn!(session_id = %session.id, error = %remove_err, "Failed to remove session");
        }

        warn!(
            session_id = %session.id,
            code = err.code(),
            error = %err,
            "Import failed"
        );
        Err(err)
    }
}

fn trace_stage(stage: ExportStage) {
    debug!(stage = stage.as_str(), "Export stage");
}

fn apply(session: &mut ImportSession, text: &str) -> std::result::Result<Step, Rejection> {
    let payload = SyncPayload::parse(text).map_err(Rejection::Retry)?;

    match payload {
        SyncPayload::SingleShot(frame) => {
            if let Some(total) = session.total {
                return Err(Rejection::Fatal(Error::InconsistentTotal {
                    expected: total,
                    found: 1,
                }));
            }
            session.transition(ImportState::Validating)?;
            let envelope = frame.open()?;
            Ok(Step::Complete {
                envelope,
                fragments: 1,
            })
        }
        SyncPayload::Chunk(fragment) => {
            let (index, total) = (fragment.index, fragment.total);
            match session.insert(fragment) {
                Ok(FragmentAcceptance::Added) => {
                    debug!(session_id = %session.id, index, total, "Fragment accepted");
                }
                Ok(FragmentAcceptance::Duplicate) => {
                    debug!(session_id = %session.id, index, total, "Duplicate fragment ignored");
                }
                Err(err) if err.is_recoverable() => return Err(Rejection::Retry(err)),
                Err(err) => return Err(Rejection::Fatal(err)),
            }

            if !session.is_complete() {
                session.transition(ImportState::ScanningMore)?;
                return Ok(Step::Pending);
            }

            session.transition(ImportState::ReadyToJoin)?;
            session.transition(ImportState::Validating)?;
            let fragments = session.fragments();
            let joined = chunker::join(&fragments)?;
            let envelope = match SyncPayload::parse(&joined)? {
                SyncPayload::SingleShot(frame) => frame.open()?,
                SyncPayload::Chunk(_) => {
                    return Err(Rejection::Fatal(Error::MalformedPayload(
                        "Joined fragments hold another chunk".to_string(),
                    )));
                }
            };
            Ok(Step::Complete {
                envelope,
                fragments: fragments.len(),
            })
        }
    }
}

fn outcome_from(envelope: SyncEnvelope, fragments: usize) -> ImportOutcome {
    let SyncEnvelope {
        version,
        timestamp,
        device_id,
        payload,
        ..
    } = envelope;
    ImportOutcome {
        snapshot: codec::expand(payload),
        device_id,
        version,
        exported_at: timestamp,
        fragments,
    }
}

fn file_name_segment(name: &str) -> String {
    let segment: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let segment = segment
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if segment.is_empty() {
        "device".to_string()
    } else {
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::sync::chunker::Fragment;
    use crate::sync::model::{DateValue, Item, Tag};

    fn library(items: usize) -> LibrarySnapshot {
        LibrarySnapshot {
            items: (0..items)
                .map(|i| Item {
                    id: format!("item-{i}"),
                    image_uri: Some(format!("file:///photos/{i}.jpg")),
                    ocr_text: Some("long recognized text".to_string()),
                    location: None,
                    tags: vec!["t1".to_string()],
                    memo: format!("memo number {i} with a few words"),
                    created_at: DateValue::Millis(1_700_000_000_000 + i as i64),
                    updated_at: DateValue::Millis(1_700_000_000_000 + i as i64),
                })
                .collect(),
            groups: vec![],
            tags: vec![Tag {
                id: "t1".to_string(),
                name: "receipts".to_string(),
                color: Some("#ff0000".to_string()),
            }],
        }
    }

    fn manager(settings: TransferSettings) -> SyncManager {
        SyncManager::new(Arc::new(MemoryStore::new()), settings)
    }

    fn small_codes() -> TransferSettings {
        TransferSettings {
            max_fragment_size: HEADER_OVERHEAD + 40,
            max_fragments: 200,
            compression_level: 0,
        }
    }

    #[tokio::test]
    async fn test_small_export_is_single_code() {
        let manager = manager(TransferSettings::default());
        let bundle = manager.export_codes(&library(2)).await.unwrap();
        assert_eq!(bundle.mode, ExportMode::SingleCode);
        assert_eq!(bundle.codes.len(), 1);
        assert_eq!(bundle.metadata.items, 2);
        assert_eq!(bundle.metadata.tags, 1);

        let outcome = manager.import_code(&bundle.codes[0]).await.unwrap();
        assert_eq!(outcome.fragments, 1);
        assert_eq!(outcome.snapshot.items.len(), 2);
        assert_eq!(outcome.snapshot.items[0].image_uri, None);
        assert_eq!(outcome.device_id, bundle.metadata.device_id);
    }

    #[tokio::test]
    async fn test_chunked_export_imports_out_of_order() {
        let manager = manager(small_codes());
        let bundle = manager.export_codes(&library(4)).await.unwrap();
        assert_eq!(bundle.mode, ExportMode::Chunked);
        assert!(bundle.codes.len() > 2);

        let id = manager.begin_import().await.unwrap();
        let mut progress = None;
        for code in bundle.codes.iter().rev() {
            progress = Some(manager.accept_payload(id, code).await.unwrap());
        }
        match progress {
            Some(ImportProgress::Done(outcome)) => {
                assert_eq!(outcome.fragments, bundle.codes.len());
                assert_eq!(outcome.snapshot.items.len(), 4);
                assert_eq!(outcome.snapshot.items[3].memo, "memo number 3 with a few words");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(manager.pending_sessions().await.unwrap().is_empty());
        assert!(
            manager
                .identity()
                .current()
                .await
                .unwrap()
                .unwrap()
                .last_sync_timestamp
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_progress_reports_missing_indices() {
        let manager = manager(small_codes());
        let bundle = manager.export_codes(&library(3)).await.unwrap();
        let total = bundle.codes.len();

        let id = manager.begin_import().await.unwrap();
        let progress = manager.accept_payload(id, &bundle.codes[1]).await.unwrap();
        assert_eq!(
            progress,
            ImportProgress::AwaitingFragments {
                received: 1,
                total,
                missing: (0..total).filter(|&i| i != 1).collect(),
            }
        );

        // Duplicate capture does not change progress
        let again = manager.accept_payload(id, &bundle.codes[1]).await.unwrap();
        assert_eq!(again, progress);
    }

    #[tokio::test]
    async fn test_corrupted_chunk_keeps_session() {
        let manager = manager(small_codes());
        let bundle = manager.export_codes(&library(3)).await.unwrap();
        let id = manager.begin_import().await.unwrap();
        manager.accept_payload(id, &bundle.codes[0]).await.unwrap();

        let corrupted = match SyncPayload::parse(&bundle.codes[1]).unwrap() {
            SyncPayload::Chunk(mut fragment) => {
                let flipped = if fragment.data.starts_with('x') { "y" } else { "x" };
                fragment.data.replace_range(0..1, flipped);
                SyncPayload::Chunk(fragment).to_text().unwrap()
            }
            other => panic!("unexpected: {other:?}"),
        };
        let err = manager.accept_payload(id, &corrupted).await.unwrap_err();
        assert!(matches!(err, Error::FragmentCorrupted { index: 1 }));
        assert!(err.is_recoverable());

        // Garbage text is refused the same way
        assert!(matches!(
            manager.accept_payload(id, "not a code").await,
            Err(Error::MalformedPayload(_))
        ));

        let mut last = None;
        for code in &bundle.codes[1..] {
            last = Some(manager.accept_payload(id, code).await.unwrap());
        }
        assert!(matches!(last, Some(ImportProgress::Done(_))));
    }

    #[tokio::test]
    async fn test_inconsistent_total_ends_session() {
        let manager = manager(small_codes());
        let bundle = manager.export_codes(&library(3)).await.unwrap();
        let id = manager.begin_import().await.unwrap();
        manager.accept_payload(id, &bundle.codes[0]).await.unwrap();

        let foreign = SyncPayload::Chunk(Fragment::new(1, bundle.codes.len() + 5, "abc"))
            .to_text()
            .unwrap();
        assert!(matches!(
            manager.accept_payload(id, &foreign).await,
            Err(Error::InconsistentTotal { .. })
        ));
        assert!(matches!(
            manager.accept_payload(id, &bundle.codes[1]).await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(manager.pending_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_shot_into_chunked_session_is_rejected() {
        let chunked = manager(small_codes());
        let bundle = chunked.export_codes(&library(3)).await.unwrap();
        let whole = manager(TransferSettings::default())
            .export_codes(&library(1))
            .await
            .unwrap();

        let id = chunked.begin_import().await.unwrap();
        chunked.accept_payload(id, &bundle.codes[0]).await.unwrap();
        assert!(matches!(
            chunked.accept_payload(id, &whole.codes[0]).await,
            Err(Error::InconsistentTotal { found: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_version_leaves_identity_untouched() {
        let manager = manager(TransferSettings::default());
        manager.identity().load_or_create().await.unwrap();

        let text = r#"{"version":"9.9","timestamp":1,"deviceId":"x","data":"~Zabc","checksum":"00"}"#;
        let id = manager.begin_import().await.unwrap();
        assert!(matches!(
            manager.accept_payload(id, text).await,
            Err(Error::UnsupportedVersion(v)) if v == "9.9"
        ));
        assert_eq!(
            manager
                .identity()
                .current()
                .await
                .unwrap()
                .unwrap()
                .last_sync_timestamp,
            None
        );
        assert!(manager.pending_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let manager = manager(TransferSettings {
            max_fragment_size: HEADER_OVERHEAD + 10,
            max_fragments: 2,
            compression_level: 0,
        });
        assert!(matches!(
            manager.export_codes(&library(5)).await,
            Err(Error::PayloadTooLarge { cap: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_codes_stay_within_fragment_size() {
        for compression_level in [0, 9] {
            let manager = manager(TransferSettings {
                max_fragment_size: 300,
                max_fragments: 500,
                compression_level,
            });
            let bundle = manager.export_codes(&library(40)).await.unwrap();
            assert_eq!(bundle.mode, ExportMode::Chunked, "level {compression_level}");
            for code in &bundle.codes {
                assert!(
                    code.chars().count() <= 300,
                    "level {compression_level}: code of {} chars",
                    code.chars().count()
                );
            }

            let id = manager.begin_import().await.unwrap();
            let mut last = None;
            for code in &bundle.codes {
                last = Some(manager.accept_payload(id, code).await.unwrap());
            }
            match last {
                Some(ImportProgress::Done(outcome)) => assert_eq!(outcome.snapshot.items.len(), 40),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_total_ends_session_without_allocating() {
        let manager = manager(TransferSettings::default());
        let id = manager.begin_import().await.unwrap();

        let text = r#"{"type":"chunk","index":0,"total":100000000,"data":"a","checksum":"00000061"}"#;
        assert!(matches!(
            manager.accept_payload(id, text).await,
            Err(Error::MalformedPayload(_))
        ));
        assert!(manager.pending_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_verified_import() {
        let store = Arc::new(FrozenStore::default());
        let manager = SyncManager::new(store.clone(), TransferSettings::default());
        let bundle = manager.export_codes(&library(2)).await.unwrap();
        let id = manager.begin_import().await.unwrap();

        store.frozen.store(true, Ordering::SeqCst);
        match manager.accept_payload(id, &bundle.codes[0]).await.unwrap() {
            ImportProgress::Done(outcome) => assert_eq!(outcome.snapshot.items.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// Store that refuses removals and identity writes once frozen
    #[derive(Default)]
    struct FrozenStore {
        inner: MemoryStore,
        frozen: AtomicBool,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for FrozenStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            if self.frozen.load(Ordering::SeqCst) && !key.starts_with(SESSION_KEY_PREFIX) {
                return Err(Error::StorageError(format!("{key} is read-only")));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<bool> {
            if self.frozen.load(Ordering::SeqCst) {
                return Err(Error::StorageError(format!("{key} is read-only")));
            }
            self.inner.remove(key).await
        }

        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.keys_with_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let manager = manager(small_codes());
        let first = manager.export_codes(&library(3)).await.unwrap();
        let second = manager.export_codes(&library(2)).await.unwrap();

        let a = manager.begin_import().await.unwrap();
        let b = manager.begin_import().await.unwrap();
        manager.accept_payload(a, &first.codes[0]).await.unwrap();
        manager.accept_payload(b, &second.codes[0]).await.unwrap();

        let pending = manager.pending_sessions().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|info| info.received == 1));

        manager.abandon_import(a).await.unwrap();
        assert!(matches!(
            manager.abandon_import(a).await,
            Err(Error::SessionNotFound(_))
        ));
        assert_eq!(manager.pending_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_attachment_round_trip() {
        let manager = manager(TransferSettings::default());
        manager.identity().rename("Kitchen iPad").await.unwrap();

        let attachment = manager.export_attachment(&library(3)).await.unwrap();
        assert!(attachment.file_name.starts_with("snapshelf-kitchen-ipad-"));
        assert!(attachment.file_name.ends_with(".json"));
        assert!(attachment.subject.contains("Kitchen iPad"));
        assert!(attachment.body.starts_with("3 items"));

        let outcome = manager.import_attachment(&attachment.bytes).await.unwrap();
        assert_eq!(outcome.fragments, 0);
        assert_eq!(outcome.snapshot.items.len(), 3);
        assert_eq!(outcome.snapshot.tags[0].color.as_deref(), Some("#ff0000"));
    }

    #[tokio::test]
    async fn test_tampered_attachment_is_rejected() {
        let manager = manager(TransferSettings::default());
        let attachment = manager.export_attachment(&library(2)).await.unwrap();
        let tampered = String::from_utf8(attachment.bytes)
            .unwrap()
            .replace("memo number 1", "memo number 9");
        assert!(matches!(
            manager.import_attachment(tampered.as_bytes()).await,
            Err(Error::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            manager.import_attachment(&[0xff, 0xfe]).await,
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_file_name_segment() {
        assert_eq!(file_name_segment("Kitchen iPad"), "kitchen-ipad");
        assert_eq!(file_name_segment("  ??  "), "device");
        assert_eq!(file_name_segment("Anna's Phone 2"), "anna-s-phone-2");
    }
}
