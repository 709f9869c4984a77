//! Whiteboard session: the operations the UI calls.
//!
//! A session owns the password gate, the sync loop and an in-memory list of
//! visible notes mirroring the local store. Edits are written locally and
//! reach the server through the next sync round; nothing here waits on the
//! network except unlock, setup and force-sync.
//!
//! While the sync loop runs, a watcher task reloads the visible notes after
//! every completed round, so ids the server assigned show up without a
//! manual reload. A placeholder id the UI still holds keeps working: edits
//! and deletes follow it to the server id that replaced it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::api::{ApiError, HttpNotesApi, NotesApi};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::database::{Database, PASSWORD_HASH_KEY};
use crate::error::{BoardError, BoardResult};
use crate::models::{NoteId, NotePatch, NoteProperties, NoteRecord, PropertiesPatch};
use crate::passkey::{GateState, PasswordGate, SetupOutcome, Verification};
use crate::sync_client::{
    SyncContext, SyncEvent, SyncResult, SyncService, DEFAULT_SYNC_INTERVAL,
};
use crate::validation::{
    validate_note_content, validate_password, validate_properties, validate_properties_patch,
};

/// Upper bound on pages fetched during unlock.
const MAX_PAGES: u32 = 10_000;

/// Tunables for a session, usually taken from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub page_size: u32,
    pub sync_enabled: bool,
    pub sync_interval: Duration,
    pub default_color: String,
    pub default_width: f64,
    pub default_height: f64,
    pub canvas_width: f64,
    pub canvas_height: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let props = NoteProperties::default();
        Self {
            page_size: 50,
            sync_enabled: true,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            default_color: props.color,
            default_width: props.width,
            default_height: props.height,
            canvas_width: 1200.0,
            canvas_height: 800.0,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        let notes = config.notes_config();
        Self {
            page_size: notes.page_size,
            sync_enabled: config.is_sync_enabled(),
            sync_interval: config.sync_interval(),
            default_color: notes.default_color.clone(),
            default_width: notes.default_width,
            default_height: notes.default_height,
            canvas_width: notes.canvas_width,
            canvas_height: notes.canvas_height,
        }
    }
}

/// Facade over the store, the gate and the sync loop.
pub struct WhiteboardSession {
    db: Arc<Mutex<Database>>,
    api: Arc<dyn NotesApi>,
    gate: PasswordGate,
    sync: SyncService,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    token: Option<String>,
    notes: Arc<Mutex<Vec<NoteRecord>>>,
    watcher: Option<JoinHandle<()>>,
}

impl WhiteboardSession {
    pub fn new(
        db: Arc<Mutex<Database>>,
        api: Arc<dyn NotesApi>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Self {
        let gate = PasswordGate::new(db.clone(), api.clone());
        let sync = SyncService::new(db.clone(), api.clone(), settings.sync_interval);
        Self {
            db,
            api,
            gate,
            sync,
            clock,
            settings,
            token: None,
            notes: Arc::new(Mutex::new(Vec::new())),
            watcher: None,
        }
    }

    /// Open the store and remote client named in `config`.
    pub fn open(config: &Config) -> BoardResult<Self> {
        let db = Database::new(config.database_file())?;
        let api = HttpNotesApi::new(config.api_base_url())?;
        Ok(Self::new(
            Arc::new(Mutex::new(db)),
            Arc::new(api),
            Arc::new(SystemClock),
            SessionSettings::from_config(config),
        ))
    }

    pub fn state(&self) -> GateState {
        self.gate.state()
    }

    pub fn is_unlocked(&self) -> bool {
        self.gate.is_unlocked()
    }

    /// Visible notes, ordered by z then id
    pub fn notes(&self) -> Vec<NoteRecord> {
        match self.notes.lock() {
            Ok(notes) => notes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn sync_service(&self) -> &SyncService {
        &self.sync
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Set or clear the access token for remote calls.
    pub async fn set_auth_token(&mut self, token: Option<String>) {
        match &token {
            Some(access_token) => {
                self.sync
                    .set_context(SyncContext {
                        access_token: access_token.clone(),
                    })
                    .await
            }
            None => self.sync.clear_context().await,
        }
        self.token = token;
    }

    /// Work out whether the user should set up or enter a password.
    pub async fn refresh_gate(&mut self) -> BoardResult<GateState> {
        self.gate.refresh_state(self.token.as_deref()).await
    }

    /// Unlock with `password` and load every note.
    ///
    /// Returns the number of visible notes. A rejected password is
    /// `BoardError::WrongPassword`; connectivity problems are
    /// `BoardError::Network` and leave the gate locked. Without an access
    /// token a locally verified password unlocks the notes already stored.
    pub async fn unlock(&mut self, password: &str) -> BoardResult<usize> {
        validate_password(password)?;

        let verification = self
            .gate
            .verify_password(self.token.as_deref(), password)
            .await?;
        if verification == Verification::Invalid {
            tracing::debug!("Password rejected");
            return Err(BoardError::WrongPassword);
        }

        if let Some(token) = self.token.clone() {
            if let Err(e) = self.load_remote(&token, password).await {
                if e.is_wrong_password() {
                    // Server disagrees with the stored hash
                    self.gate.forget_local_hash()?;
                } else {
                    self.gate.lock();
                }
                return Err(e);
            }
        } else {
            tracing::info!("Unlocked offline, showing stored notes only");
        }

        self.reload()?;
        if self.settings.sync_enabled {
            self.start_sync();
        }
        Ok(self.notes_mut()?.len())
    }

    /// First-time password setup.
    ///
    /// `SetupOutcome::AlreadySet` means the account has a passkey; continue
    /// with [`unlock`](Self::unlock).
    pub async fn setup(&mut self, password: &str) -> BoardResult<SetupOutcome> {
        let token = self.token.clone().ok_or(BoardError::AuthRequired)?;
        let outcome = self.gate.setup_passkey(&token, password).await?;

        if outcome == SetupOutcome::Created {
            self.reload()?;
            if self.settings.sync_enabled {
                self.start_sync();
            }
        }
        Ok(outcome)
    }

    /// Create a note locally. It reaches the server on the next sync round.
    pub fn create(
        &mut self,
        content: &str,
        position: Option<(f64, f64)>,
    ) -> BoardResult<NoteRecord> {
        self.ensure_unlocked()?;
        validate_note_content(content)?;

        let (x, y) = position.unwrap_or_else(|| self.random_position());
        let properties = NoteProperties {
            x,
            y,
            z: self.clock.now_millis(),
            color: self.settings.default_color.clone(),
            height: self.settings.default_height,
            width: self.settings.default_width,
            empty: content.trim().is_empty(),
        };
        validate_properties(&properties)?;

        let note = {
            let db = self.store()?;
            let note_id = db.mint_negative_id()?;
            let note = NoteRecord::new_local(note_id, content.to_string(), properties);
            db.put(&note)?;
            note
        };

        tracing::debug!(note_id = note.note_id, "Created local note");
        self.notes_mut()?.push(note.clone());
        Ok(note)
    }

    pub fn edit_content(&mut self, note_id: NoteId, content: &str) -> BoardResult<NoteRecord> {
        self.ensure_unlocked()?;
        validate_note_content(content)?;
        let note_id = self.resolve(note_id)?;

        let patch = NotePatch {
            content: Some(content.to_string()),
            properties: Some(PropertiesPatch {
                empty: Some(content.trim().is_empty()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let note = self.store()?.patch(note_id, &patch)?;
        self.mirror(note.clone())?;
        Ok(note)
    }

    pub fn edit_properties(
        &mut self,
        note_id: NoteId,
        properties: PropertiesPatch,
    ) -> BoardResult<NoteRecord> {
        self.ensure_unlocked()?;
        validate_properties_patch(&properties)?;
        let note_id = self.resolve(note_id)?;

        let note = self
            .store()?
            .patch(note_id, &NotePatch::properties(properties))?;
        self.mirror(note.clone())?;
        Ok(note)
    }

    /// Mark a note for deletion and hide it. The server learns about it on
    /// the next sync round.
    pub fn delete(&mut self, note_id: NoteId) -> BoardResult<()> {
        self.ensure_unlocked()?;
        let note_id = self.resolve(note_id)?;

        self.store()?.patch(note_id, &NotePatch::delete())?;
        self.notes_mut()?.retain(|n| n.note_id != note_id);
        Ok(())
    }

    /// Local substring search over note content.
    pub fn search(&self, query: &str) -> BoardResult<Vec<NoteRecord>> {
        self.ensure_unlocked()?;
        self.store()?.search_notes(query)
    }

    /// Run a sync round now and reload the visible notes.
    ///
    /// Does nothing while the sync loop is stopped.
    pub async fn force_sync(&mut self) -> BoardResult<SyncResult> {
        self.ensure_unlocked()?;
        if !self.sync.is_running() {
            tracing::debug!("Sync loop stopped, ignoring force sync");
            return Ok(SyncResult::skipped());
        }

        let result = self.sync.sync_round().await;
        self.reload()?;

        if result.auth_expired {
            return Err(BoardError::AuthRequired);
        }
        Ok(result)
    }

    /// Re-read the visible notes from the store.
    pub fn reload(&mut self) -> BoardResult<()> {
        refresh_mirror(&self.db, &self.notes)
    }

    /// Stop syncing and return to the unlock prompt. Stored notes are kept.
    pub fn lock(&mut self) {
        self.stop_sync();
        if let Ok(mut notes) = self.notes.lock() {
            notes.clear();
        }
        self.gate.lock();
    }

    /// Lock, forget the token and wipe local notes and the password hash.
    pub async fn logout(&mut self) -> BoardResult<()> {
        self.lock();
        self.set_auth_token(None).await;
        {
            let db = self.store()?;
            db.clear()?;
            db.delete_config(PASSWORD_HASH_KEY)?;
        }
        self.sync.forget_renames();
        self.gate.reset();
        tracing::info!("Logged out, local notes cleared");
        Ok(())
    }

    /// Fetch every page before writing anything, then store the result.
    async fn load_remote(&self, token: &str, password: &str) -> BoardResult<usize> {
        let size = self.settings.page_size.max(1);
        let mut records = Vec::new();

        for page in 0..MAX_PAGES {
            let batch = match self.api.fetch_notes_page(token, page, size, password).await {
                Ok(batch) => batch,
                Err(ApiError::PageEmpty) => break,
                Err(e) => return Err(e.into()),
            };
            let last = batch.len() < size as usize;
            records.extend(
                batch
                    .into_iter()
                    .map(|n| NoteRecord::from_server(n.note_id, n.content, n.properties)),
            );
            if last {
                break;
            }
        }

        let written = self.store()?.put_server_notes(&records)?;
        tracing::info!(fetched = records.len(), written, "Loaded notes from server");
        Ok(written)
    }

    fn random_position(&self) -> (f64, f64) {
        let max_x = (self.settings.canvas_width - self.settings.default_width).max(0.0);
        let max_y = (self.settings.canvas_height - self.settings.default_height).max(0.0);
        let mut rng = rand::thread_rng();
        (rng.gen_range(0.0..=max_x), rng.gen_range(0.0..=max_y))
    }

    /// Start the sync loop together with the watcher that keeps the
    /// visible notes current after background rounds.
    fn start_sync(&mut self) {
        self.stop_sync();

        let mut events = self.sync.subscribe();
        let db = self.db.clone();
        let notes = self.notes.clone();
        self.watcher = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SyncEvent::RoundCompleted { reconciled }) if reconciled > 0 => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "Sync events lagged, reloading notes");
                    }
                    Err(RecvError::Closed) => break,
                }
                if let Err(e) = refresh_mirror(&db, &notes) {
                    tracing::warn!(error = %e, "Failed to reload notes after sync");
                }
            }
        }));

        self.sync.start();
    }

    fn stop_sync(&mut self) {
        self.sync.stop();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }

    /// The id a note is stored under now. A placeholder that a sync round
    /// replaced resolves to its server id.
    fn resolve(&self, note_id: NoteId) -> BoardResult<NoteId> {
        if note_id >= 0 || self.store()?.get_note(note_id)?.is_some() {
            return Ok(note_id);
        }
        Ok(self.sync.resolve_id(note_id).unwrap_or(note_id))
    }

    fn mirror(&mut self, note: NoteRecord) -> BoardResult<()> {
        let visible = note.is_visible();
        let mut notes = self.notes_mut()?;
        match notes.iter().position(|n| n.note_id == note.note_id) {
            Some(i) if visible => notes[i] = note,
            Some(i) => {
                notes.remove(i);
            }
            None if visible => notes.push(note),
            None => {}
        }
        Ok(())
    }

    fn notes_mut(&self) -> BoardResult<MutexGuard<'_, Vec<NoteRecord>>> {
        Ok(self.notes.lock()?)
    }

    fn ensure_unlocked(&self) -> BoardResult<()> {
        if self.gate.is_unlocked() {
            Ok(())
        } else {
            Err(BoardError::Locked)
        }
    }

    fn store(&self) -> BoardResult<MutexGuard<'_, Database>> {
        Ok(self.db.lock()?)
    }
}

/// Replace `notes` with the visible records in the store.
fn refresh_mirror(db: &Mutex<Database>, notes: &Mutex<Vec<NoteRecord>>) -> BoardResult<()> {
    let mut visible: Vec<NoteRecord> = db
        .lock()?
        .try_get_all()?
        .into_iter()
        .filter(NoteRecord::is_visible)
        .collect();
    visible.sort_by_key(|n| (n.properties.z, n.note_id));
    *notes.lock()? = visible;
    Ok(())
}

impl Drop for WhiteboardSession {
    fn drop(&mut self) {
        self.stop_sync();
    }
}
