//! WhiteboardCore - offline-first sticky-note whiteboard core.
//!
//! This library provides:
//! - Data models (NoteRecord, NoteProperties, Lifecycle)
//! - Local note store (SQLite) with dirty tracking
//! - Reconciliation of client-minted ids with server ids
//! - Password gate and passkey setup
//! - Background sync against the remote notes API
//! - A session controller tying these together for UI code
//!
//! Notes created on this device get negative placeholder ids and are stored
//! dirty. The sync loop pushes dirty notes and replaces placeholders with the
//! ids the server assigns.
//!
//! # Feature Flags
//!
//! - `desktop`: Default config directory detection.

pub mod api;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod passkey;
pub mod reconcile;
pub mod session;
pub mod sync_client;
pub mod validation;

// Re-export commonly used types
pub use api::{ApiError, HttpNotesApi, NotesApi};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use database::Database;
pub use error::{BoardError, BoardResult};
pub use models::{Lifecycle, NoteId, NotePatch, NoteProperties, NoteRecord, PropertiesPatch};
pub use passkey::{GateState, PasswordGate, SetupOutcome};
pub use session::{SessionSettings, WhiteboardSession};
pub use sync_client::{SyncContext, SyncEvent, SyncResult, SyncService};
