//! Background sync of dirty notes.
//!
//! [`SyncService`] pushes every dirty note to `POST /notes/user-notes` and
//! applies the per-note results through [`reconcile`](crate::reconcile). It
//! runs once when started and then on a fixed interval until stopped.
//!
//! - Rounds without an access token are skipped, not failed.
//! - Only one round runs at a time; a trigger that arrives while a round is
//!   active is dropped.
//! - A rejected token stops the loop and publishes
//!   [`SyncEvent::AuthExpired`] once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ApiError, NotesApi, SyncBatchRequest, SyncNotePayload};
use crate::database::Database;
use crate::error::BoardResult;
use crate::models::{Lifecycle, NoteId, NoteRecord};
use crate::reconcile::{apply_sync_result, ReconcileOutcome};

/// Default time between rounds.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest time between rounds; shorter periods are raised to this.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Credentials for remote calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncContext {
    pub access_token: String,
}

/// Result of a sync round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub success: bool,
    /// Notes whose server outcome was applied, including local-only
    /// deletions purged without a request
    pub reconciled: i64,
    /// The round did not run (no token, round already active, loop stopped)
    pub skipped: bool,
    pub auth_expired: bool,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn success(reconciled: i64) -> Self {
        Self {
            success: true,
            reconciled,
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            ..Default::default()
        }
    }

    pub fn auth_expired() -> Self {
        Self {
            auth_expired: true,
            ..Self::failure(ApiError::AuthRequired.to_string())
        }
    }
}

/// Published after every round that ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    RoundCompleted { reconciled: i64 },
    RoundFailed { error: String },
    /// The token was rejected; the loop has stopped
    AuthExpired,
}

/// Minimal sync payload for one dirty note.
///
/// Pending deletions carry only the id and the deletion flag. Notes without
/// change tracking send their full content and properties.
pub fn build_payload(note: &NoteRecord) -> SyncNotePayload {
    let mut payload = SyncNotePayload {
        note_id: note.note_id,
        content: None,
        properties: None,
        is_deleted: None,
    };

    if note.lifecycle == Lifecycle::PendingDelete {
        payload.is_deleted = Some(true);
        return payload;
    }

    let pending = &note.pending;
    if pending.full || pending.is_empty() {
        payload.content = Some(note.content.clone());
        payload.properties = Some(note.properties.to_json());
        return payload;
    }

    if pending.content {
        payload.content = Some(note.content.clone());
    }
    if !pending.property_keys.is_empty() {
        payload.properties = Some(
            note.properties
                .to_partial_json(pending.property_keys.iter().map(String::as_str)),
        );
    }
    payload
}

/// What a round sends, plus the revisions it sent.
struct PreparedRound {
    batch: SyncBatchRequest,
    revisions: HashMap<NoteId, i64>,
    purged: i64,
}

/// Periodic note sync worker.
///
/// Cheap to clone; clones share the same loop and state.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    db: Arc<Mutex<Database>>,
    api: Arc<dyn NotesApi>,
    period: Duration,
    context: RwLock<Option<SyncContext>>,
    round_active: AtomicBool,
    running: AtomicBool,
    auth_reported: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SyncEvent>,
    /// Placeholder id to server id, for every rename applied so far
    renamed: Mutex<HashMap<NoteId, NoteId>>,
}

/// Clears the round flag even if the round is cancelled mid-flight.
struct RoundGuard<'a>(&'a AtomicBool);

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncService {
    pub fn new(db: Arc<Mutex<Database>>, api: Arc<dyn NotesApi>, period: Duration) -> Self {
        let period = if period < MIN_SYNC_INTERVAL {
            warn!(?period, "Sync interval too short, using the minimum");
            MIN_SYNC_INTERVAL
        } else {
            period
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SyncInner {
                db,
                api,
                period,
                context: RwLock::new(None),
                round_active: AtomicBool::new(false),
                running: AtomicBool::new(false),
                auth_reported: AtomicBool::new(false),
                task: Mutex::new(None),
                events,
                renamed: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Sets the access token used by subsequent rounds.
    pub async fn set_context(&self, context: SyncContext) {
        let mut guard = self.inner.context.write().await;
        *guard = Some(context);
    }

    /// Clears the access token; rounds are skipped until a new one is set.
    pub async fn clear_context(&self) {
        let mut guard = self.inner.context.write().await;
        *guard = None;
    }

    /// Server id that replaced the placeholder `note_id`, if a round has
    /// renamed it.
    pub fn resolve_id(&self, note_id: NoteId) -> Option<NoteId> {
        self.inner
            .renamed
            .lock()
            .ok()
            .and_then(|renamed| renamed.get(&note_id).copied())
    }

    /// Drop the recorded renames, e.g. after the store was cleared.
    pub fn forget_renames(&self) {
        if let Ok(mut renamed) = self.inner.renamed.lock() {
            renamed.clear();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the loop: one round now, then one per interval.
    ///
    /// A loop that is already running is stopped first. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        self.stop();

        self.inner.auth_reported.store(false, Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(inner.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let result = inner.run_round().await;
                if result.auth_expired {
                    break;
                }
            }
        });

        if let Ok(mut slot) = self.inner.task.lock() {
            *slot = Some(handle);
        }
        info!(interval_secs = self.inner.period.as_secs(), "Sync loop started");
    }

    /// Stop the loop and cancel its timer. Safe to call when not running.
    pub fn stop(&self) {
        if self.inner.halt() {
            info!("Sync loop stopped");
        }
    }

    /// Run one round now, outside the timer.
    pub async fn sync_round(&self) -> SyncResult {
        self.inner.run_round().await
    }
}

impl SyncInner {
    /// Cancel the timer task. Returns whether one was running.
    fn halt(&self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let handle = match self.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    async fn run_round(&self) -> SyncResult {
        let token = {
            let guard = self.context.read().await;
            guard.as_ref().map(|c| c.access_token.clone())
        };
        let Some(token) = token else {
            debug!("No access token, skipping sync round");
            return SyncResult::skipped();
        };

        if self
            .round_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync round already active, skipping");
            return SyncResult::skipped();
        }
        let _guard = RoundGuard(&self.round_active);

        let result = self.push_dirty(&token).await;

        if result.auth_expired {
            self.halt();
            if !self.auth_reported.swap(true, Ordering::SeqCst) {
                warn!("Access token rejected, sync loop stopped");
                let _ = self.events.send(SyncEvent::AuthExpired);
            }
        } else if result.success {
            debug!(reconciled = result.reconciled, "Sync round complete");
            let _ = self.events.send(SyncEvent::RoundCompleted {
                reconciled: result.reconciled,
            });
        } else {
            let error = result.errors.join("; ");
            warn!(error = %error, "Sync round failed");
            let _ = self.events.send(SyncEvent::RoundFailed { error });
        }

        result
    }

    async fn push_dirty(&self, token: &str) -> SyncResult {
        let prepared = match self.prepare() {
            Ok(prepared) => prepared,
            Err(e) => return SyncResult::failure(e.to_string()),
        };

        if prepared.batch.notes.is_empty() {
            return SyncResult::success(prepared.purged);
        }

        debug!(notes = prepared.batch.notes.len(), "Pushing dirty notes");
        let results = match self.api.sync_notes(token, &prepared.batch).await {
            Ok(results) => results,
            Err(ApiError::AuthRequired) => return SyncResult::auth_expired(),
            Err(e) => return SyncResult::failure(e.to_string()),
        };

        let db = match self.db.lock() {
            Ok(db) => db,
            Err(e) => return SyncResult::failure(e.to_string()),
        };

        let mut outcome = SyncResult::success(prepared.purged);
        for result in &results {
            let sent = prepared.revisions.get(&result.send_note_id).copied();
            match apply_sync_result(&db, result, sent) {
                Ok(applied) if applied.applied() => {
                    debug!(note_id = applied.note_id(), "Applied sync result");
                    if let ReconcileOutcome::Renamed { from, to, .. } = applied {
                        self.record_rename(from, to);
                    }
                    outcome.reconciled += 1;
                }
                Ok(_) => {
                    debug!(
                        note_id = result.send_note_id,
                        "Sync result for unknown note ignored"
                    );
                }
                Err(e) => {
                    warn!(note_id = result.send_note_id, error = %e, "Failed to apply sync result");
                    outcome.errors.push(e.to_string());
                }
            }
        }
        outcome
    }

    fn record_rename(&self, from: NoteId, to: NoteId) {
        if let Ok(mut renamed) = self.renamed.lock() {
            renamed.insert(from, to);
        }
    }

    /// Read dirty notes, purge local-only deletions and build the batch.
    fn prepare(&self) -> BoardResult<PreparedRound> {
        let db = self.db.lock()?;
        let dirty = db.get_dirty()?;

        let mut prepared = PreparedRound {
            batch: SyncBatchRequest::default(),
            revisions: HashMap::new(),
            purged: 0,
        };

        for note in dirty {
            if note.is_local_only() && note.lifecycle == Lifecycle::PendingDelete {
                // Never reached the server, nothing to tell it
                db.remove(note.note_id)?;
                prepared.purged += 1;
                continue;
            }
            prepared.revisions.insert(note.note_id, note.revision);
            prepared.batch.notes.push(build_payload(&note));
        }

        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NotePatch, NoteProperties, PendingChanges, PropertiesPatch};

    #[test]
    fn test_new_note_sends_everything() {
        let note = NoteRecord::new_local(-1, "buy milk".into(), NoteProperties::default());
        let payload = build_payload(&note);

        assert_eq!(payload.note_id, -1);
        assert_eq!(payload.content.as_deref(), Some("buy milk"));
        assert_eq!(payload.properties.unwrap().len(), 7);
        assert_eq!(payload.is_deleted, None);
    }

    #[test]
    fn test_property_edit_sends_only_changed_keys() {
        let db = Database::new_in_memory().unwrap();
        db.put(&NoteRecord::from_server(4, "same".into(), NoteProperties::default()))
            .unwrap();
        let note = db
            .patch(4, &NotePatch::properties(PropertiesPatch::position(10.0, 0.0)))
            .unwrap();

        let payload = build_payload(&note);

        assert_eq!(payload.content, None);
        let props = payload.properties.unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props["x"], serde_json::json!(10.0));
    }

    #[test]
    fn test_content_edit_sends_only_content() {
        let db = Database::new_in_memory().unwrap();
        db.put(&NoteRecord::from_server(4, "old".into(), NoteProperties::default()))
            .unwrap();
        let note = db.patch(4, &NotePatch::content("new")).unwrap();

        let payload = build_payload(&note);

        assert_eq!(payload.content.as_deref(), Some("new"));
        assert_eq!(payload.properties, None);
    }

    #[test]
    fn test_untracked_dirty_note_falls_back_to_full_payload() {
        let mut note = NoteRecord::from_server(4, "x".into(), NoteProperties::default());
        note.is_dirty = true;
        note.pending = PendingChanges::default();

        let payload = build_payload(&note);

        assert!(payload.content.is_some());
        assert!(payload.properties.is_some());
    }

    #[test]
    fn test_pending_delete_payload() {
        let mut note = NoteRecord::from_server(4, "x".into(), NoteProperties::default());
        note.lifecycle = Lifecycle::PendingDelete;

        let json = serde_json::to_value(build_payload(&note)).unwrap();

        assert_eq!(json, serde_json::json!({"noteId": 4, "isDeleted": true}));
    }

    #[test]
    fn test_zero_period_is_raised_to_minimum() {
        let api = crate::api::HttpNotesApi::new("http://localhost:8080").unwrap();
        let db = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));
        let service = SyncService::new(db, Arc::new(api), Duration::ZERO);

        assert_eq!(service.period(), MIN_SYNC_INTERVAL);
    }

    #[test]
    fn test_sync_result_constructors() {
        assert!(SyncResult::skipped().skipped);
        assert!(SyncResult::skipped().success);
        assert_eq!(SyncResult::success(3).reconciled, 3);

        let expired = SyncResult::auth_expired();
        assert!(expired.auth_expired);
        assert!(!expired.success);
        assert_eq!(expired.errors.len(), 1);
    }
}
