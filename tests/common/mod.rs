#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use whiteboardcore::api::{
    ApiError, NewRemoteNote, NotesApi, PasskeyInfo, RemoteNote, SyncBatchRequest, SyncNoteResult,
};
use whiteboardcore::clock::ManualClock;
use whiteboardcore::models::{NoteId, NoteProperties};
use whiteboardcore::{Database, SessionSettings, WhiteboardSession};

pub const TOKEN: &str = "test-token";
pub const PASSWORD: &str = "abc123";

/// In-process notes backend that records every call.
///
/// Sync batches answer with scripted responses first; once those run out,
/// negative ids are assigned fresh server ids and everything comes back
/// clean.
pub struct FakeNotesApi {
    calls: Mutex<Vec<&'static str>>,
    passkey: Mutex<Option<String>>,
    notes: Mutex<Vec<RemoteNote>>,
    sync_responses: Mutex<VecDeque<Result<Vec<SyncNoteResult>, ApiError>>>,
    batches: Mutex<Vec<SyncBatchRequest>>,
    sync_delay: Mutex<Option<Duration>>,
    network_down: AtomicBool,
    next_id: AtomicI64,
}

impl FakeNotesApi {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            passkey: Mutex::new(None),
            notes: Mutex::new(Vec::new()),
            sync_responses: Mutex::new(VecDeque::new()),
            batches: Mutex::new(Vec::new()),
            sync_delay: Mutex::new(None),
            network_down: AtomicBool::new(false),
            next_id: AtomicI64::new(1000),
        }
    }

    /// A backend whose account already has a passkey for `password`.
    pub fn with_passkey(password: &str) -> Self {
        let api = Self::new();
        *api.passkey.lock().unwrap() = Some(password.to_string());
        api
    }

    pub fn add_note(&self, note_id: NoteId, content: &str) {
        self.notes.lock().unwrap().push(RemoteNote {
            note_id,
            content: content.to_string(),
            properties: NoteProperties::default(),
        });
    }

    pub fn push_sync_response(&self, response: Result<Vec<SyncNoteResult>, ApiError>) {
        self.sync_responses.lock().unwrap().push_back(response);
    }

    pub fn set_sync_delay(&self, delay: Duration) {
        *self.sync_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_network_down(&self, down: bool) {
        self.network_down.store(down, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == name)
            .count()
    }

    pub fn batches(&self) -> Vec<SyncBatchRequest> {
        self.batches.lock().unwrap().clone()
    }

    fn record(&self, name: &'static str) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(name);
        if self.network_down.load(Ordering::SeqCst) {
            return Err(ApiError::Network("connection refused".into()));
        }
        Ok(())
    }

    fn key_info(&self) -> PasskeyInfo {
        PasskeyInfo {
            id: Some(1),
            public_key: "pk".into(),
        }
    }

    fn check_password(&self, password: &str) -> Result<(), ApiError> {
        match self.passkey.lock().unwrap().as_deref() {
            Some(p) if p == password => Ok(()),
            Some(_) => Err(ApiError::WrongPassword),
            None => Err(ApiError::PasskeyNotFound),
        }
    }
}

#[async_trait]
impl NotesApi for FakeNotesApi {
    async fn create_passkey(&self, _token: &str, password: &str) -> Result<PasskeyInfo, ApiError> {
        self.record("create_passkey")?;
        let mut passkey = self.passkey.lock().unwrap();
        if passkey.is_some() {
            return Err(ApiError::AlreadySet);
        }
        *passkey = Some(password.to_string());
        Ok(self.key_info())
    }

    async fn get_passkey(&self, _token: &str) -> Result<PasskeyInfo, ApiError> {
        self.record("get_passkey")?;
        match self.passkey.lock().unwrap().as_ref() {
            Some(_) => Ok(self.key_info()),
            None => Err(ApiError::PasskeyNotFound),
        }
    }

    async fn verify_passkey(&self, _token: &str, password: &str) -> Result<PasskeyInfo, ApiError> {
        self.record("verify_passkey")?;
        self.check_password(password)?;
        Ok(self.key_info())
    }

    async fn fetch_notes_page(
        &self,
        _token: &str,
        page: u32,
        size: u32,
        password: &str,
    ) -> Result<Vec<RemoteNote>, ApiError> {
        self.record("fetch_notes_page")?;
        self.check_password(password)?;

        let notes = self.notes.lock().unwrap();
        let start = (page * size) as usize;
        if start >= notes.len() {
            return Err(ApiError::PageEmpty);
        }
        let end = (start + size as usize).min(notes.len());
        Ok(notes[start..end].to_vec())
    }

    async fn sync_notes(
        &self,
        _token: &str,
        batch: &SyncBatchRequest,
    ) -> Result<Vec<SyncNoteResult>, ApiError> {
        self.record("sync_notes")?;
        self.batches.lock().unwrap().push(batch.clone());

        let delay = *self.sync_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.sync_responses.lock().unwrap().pop_front();
        if let Some(response) = scripted {
            return response;
        }

        Ok(batch
            .notes
            .iter()
            .map(|note| SyncNoteResult {
                send_note_id: note.note_id,
                real_note_id: if note.note_id < 0 {
                    self.next_id.fetch_add(1, Ordering::SeqCst)
                } else {
                    note.note_id
                },
                modify_flag: false,
            })
            .collect())
    }

    async fn create_note(
        &self,
        _token: &str,
        note: &NewRemoteNote,
    ) -> Result<RemoteNote, ApiError> {
        self.record("create_note")?;
        let created = RemoteNote {
            note_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            content: note.content.clone(),
            properties: note.properties.clone(),
        };
        self.notes.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn update_content(
        &self,
        _token: &str,
        _note_id: NoteId,
        _content: &str,
    ) -> Result<(), ApiError> {
        self.record("update_content")
    }

    async fn update_properties(
        &self,
        _token: &str,
        _note_id: NoteId,
        _properties: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ApiError> {
        self.record("update_properties")
    }
}

pub fn shared_db() -> Arc<Mutex<Database>> {
    Arc::new(Mutex::new(Database::new_in_memory().unwrap()))
}

/// Session over an in-memory store and the given fake backend.
pub fn new_session(
    db: Arc<Mutex<Database>>,
    api: Arc<FakeNotesApi>,
    settings: SessionSettings,
) -> WhiteboardSession {
    WhiteboardSession::new(
        db,
        api,
        Arc::new(ManualClock::new(1_700_000_000_000)),
        settings,
    )
}
