//! Local note store backed by SQLite.
//!
//! Two tables live here: `notes`, keyed by `note_id` and indexed on
//! `is_dirty`, and `config`, a string-keyed table holding the password hash.
//! Every operation returns a [`BoardResult`]; nothing panics across this
//! boundary. [`Database::get_all`] additionally offers a fail-closed listing
//! for UI code that would rather show an empty board than an error.

use std::cell::Cell;
use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};

use crate::error::{BoardError, BoardResult};
use crate::models::{Lifecycle, NoteId, NotePatch, NoteProperties, NoteRecord, PendingChanges};
use crate::validation::validate_search_query;

/// Current schema version, stored in `PRAGMA user_version`.
///
/// Bump whenever the notes table's columns or indexes change.
pub const SCHEMA_VERSION: i64 = 3;

/// The one secondary index the notes table is allowed to carry.
pub const DIRTY_INDEX_NAME: &str = "idx_notes_is_dirty";

/// Config key for the stored password verification hash.
pub const PASSWORD_HASH_KEY: &str = "passwordHash";

/// Fail-closed result of listing every note.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteListing {
    pub notes: Vec<NoteRecord>,
    /// Set when the store could not be read; `notes` is empty then
    pub error: Option<String>,
}

impl NoteListing {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
    /// Lowest id handed out by [`Database::mint_negative_id`] in this process
    last_minted: Cell<Option<NoteId>>,
}

impl Database {
    /// Open (or create) the store at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> BoardResult<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn,
            last_minted: Cell::new(None),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> BoardResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            last_minted: Cell::new(None),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Create tables and bring the schema up to [`SCHEMA_VERSION`].
    ///
    /// Safe to call on every start: existing data is kept, stale secondary
    /// indexes on `notes` are dropped and the dirty-flag index is recreated.
    pub fn initialize(&self) -> BoardResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS notes (
                note_id INTEGER PRIMARY KEY,
                content TEXT NOT NULL DEFAULT '',
                properties TEXT NOT NULL DEFAULT '{}',
                is_dirty INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        let version = self.schema_version()?;
        if version < SCHEMA_VERSION {
            self.migrate_from(version)?;
        }

        self.conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS {} ON notes(is_dirty)",
                DIRTY_INDEX_NAME
            ),
            [],
        )?;

        Ok(())
    }

    /// Schema version recorded in the database file
    pub fn schema_version(&self) -> BoardResult<i64> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate_from(&self, version: i64) -> BoardResult<()> {
        tracing::info!(
            from = version,
            to = SCHEMA_VERSION,
            "Upgrading local note store schema"
        );

        let tx = self.conn.unchecked_transaction()?;

        // Older stores indexed notes by content and position; only the dirty
        // flag index survives.
        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT name FROM sqlite_master
                WHERE type = 'index' AND tbl_name = 'notes'
                  AND name NOT LIKE 'sqlite_autoindex%'
                "#,
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            names
        };
        for name in stale {
            tx.execute(&format!("DROP INDEX IF EXISTS \"{}\"", name), [])?;
            tracing::info!(index = %name, "Dropped stale notes index");
        }

        if !column_exists(&tx, "notes", "lifecycle")? {
            tx.execute(
                "ALTER TABLE notes ADD COLUMN lifecycle TEXT NOT NULL DEFAULT 'active'",
                [],
            )?;
            tracing::info!("Added lifecycle column to notes");
        }

        // Version 1 stores marked deletions with a boolean column
        if column_exists(&tx, "notes", "is_deleted")? {
            tx.execute(
                "UPDATE notes SET lifecycle = 'pending_delete' WHERE is_deleted = 1",
                [],
            )?;
        }

        if !column_exists(&tx, "notes", "revision")? {
            tx.execute(
                "ALTER TABLE notes ADD COLUMN revision INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
            tracing::info!("Added revision column to notes");
        }

        if !column_exists(&tx, "notes", "pending_changes")? {
            tx.execute("ALTER TABLE notes ADD COLUMN pending_changes TEXT", [])?;
            tracing::info!("Added pending_changes column to notes");
        }

        tx.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        tx.commit()?;
        Ok(())
    }

    /// Get the underlying connection (for advanced operations)
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a single SQLite transaction.
    ///
    /// The transaction is committed when `f` succeeds and rolled back when it
    /// returns an error, so readers never observe a half-applied change.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> BoardResult<T>,
    ) -> BoardResult<T> {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    /// Every stored note, or an empty listing with the error when the store
    /// cannot be read.
    pub fn get_all(&self) -> NoteListing {
        match self.try_get_all() {
            Ok(notes) => NoteListing { notes, error: None },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read local notes");
                NoteListing {
                    notes: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Every stored note, including pending deletions
    pub fn try_get_all(&self) -> BoardResult<Vec<NoteRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM notes ORDER BY note_id",
            NOTE_COLUMNS
        ))?;
        let notes = stmt
            .query_map([], row_to_note)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    /// Get a note by id
    pub fn get_note(&self, note_id: NoteId) -> BoardResult<Option<NoteRecord>> {
        read_note(&self.conn, note_id)
    }

    /// Insert or fully replace a note.
    ///
    /// A record in the `Deleted` state is removed instead of stored.
    pub fn put(&self, record: &NoteRecord) -> BoardResult<()> {
        if record.lifecycle == Lifecycle::Deleted {
            delete_note(&self.conn, record.note_id)?;
            return Ok(());
        }
        write_note(&self.conn, record)
    }

    /// Store notes delivered by the server in one transaction.
    ///
    /// Local copies with unsynced edits are left alone. Returns the number of
    /// notes written.
    pub fn put_server_notes(&self, records: &[NoteRecord]) -> BoardResult<usize> {
        self.with_transaction(|tx| {
            let mut written = 0;
            for record in records {
                if let Some(local) = read_note(tx, record.note_id)? {
                    if local.is_dirty {
                        tracing::debug!(
                            note_id = record.note_id,
                            "Keeping unsynced local copy over server note"
                        );
                        continue;
                    }
                }
                write_note(tx, record)?;
                written += 1;
            }
            Ok(written)
        })
    }

    /// Merge `patch` into the stored note and return the result.
    ///
    /// The current row is re-read inside the same transaction, so patches
    /// issued one after another always build on each other. Any real change
    /// to content, properties or lifecycle marks the note dirty and bumps its
    /// revision; `patch.is_dirty` overrides the flag afterwards.
    pub fn patch(&self, note_id: NoteId, patch: &NotePatch) -> BoardResult<NoteRecord> {
        self.with_transaction(|tx| {
            let mut note = read_note(tx, note_id)?.ok_or(BoardError::NotFound(note_id))?;
            let mut changed = false;

            if let Some(content) = &patch.content {
                if &note.content != content {
                    note.content = content.clone();
                    note.pending.content = true;
                    changed = true;
                }
            }

            if let Some(props) = &patch.properties {
                let keys = props.apply_to(&mut note.properties);
                if !keys.is_empty() {
                    note.pending.record_properties(keys);
                    changed = true;
                }
            }

            if let Some(lifecycle) = patch.lifecycle {
                if note.lifecycle != lifecycle {
                    note.lifecycle = lifecycle;
                    changed = true;
                }
            }

            if changed {
                note.is_dirty = true;
                note.revision += 1;
            }

            if let Some(dirty) = patch.is_dirty {
                note.is_dirty = dirty;
                if !dirty {
                    note.pending = PendingChanges::default();
                }
            }

            write_note(tx, &note)?;
            Ok(note)
        })
    }

    /// Hard-delete a note. Returns whether a row was removed.
    pub fn remove(&self, note_id: NoteId) -> BoardResult<bool> {
        delete_note(&self.conn, note_id)
    }

    /// Remove every note (logout / reset). Config rows are kept.
    pub fn clear(&self) -> BoardResult<()> {
        self.conn.execute("DELETE FROM notes", [])?;
        self.last_minted.set(None);
        Ok(())
    }

    /// Notes whose local state has not been confirmed by the server
    pub fn get_dirty(&self) -> BoardResult<Vec<NoteRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM notes WHERE is_dirty = 1 ORDER BY note_id",
            NOTE_COLUMNS
        ))?;
        let notes = stmt
            .query_map([], row_to_note)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    /// Clear the dirty flag and change tracking of an existing note
    pub fn mark_synced(&self, note_id: NoteId) -> BoardResult<()> {
        let updated = self.conn.execute(
            "UPDATE notes SET is_dirty = 0, pending_changes = NULL WHERE note_id = ?",
            params![note_id],
        )?;
        if updated == 0 {
            return Err(BoardError::NotFound(note_id));
        }
        Ok(())
    }

    /// Next client-side placeholder id.
    ///
    /// One below the smallest negative id in the store or handed out earlier
    /// in this process, `-1` when there is none.
    pub fn mint_negative_id(&self) -> BoardResult<NoteId> {
        let stored: Option<NoteId> = self.conn.query_row(
            "SELECT MIN(note_id) FROM notes WHERE note_id < 0",
            [],
            |row| row.get(0),
        )?;

        let lowest = match (stored, self.last_minted.get()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let next = lowest.map_or(-1, |id| id - 1);
        self.last_minted.set(Some(next));
        Ok(next)
    }

    /// Case-insensitive substring search over the content of active notes.
    ///
    /// An empty query returns every active note.
    pub fn search_notes(&self, query: &str) -> BoardResult<Vec<NoteRecord>> {
        validate_search_query(query)?;

        let pattern = format!("%{}%", escape_like(query.trim()));
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM notes
            WHERE lifecycle = 'active' AND LOWER(content) LIKE LOWER(?) ESCAPE '\'
            "#,
            NOTE_COLUMNS
        ))?;
        let mut notes = stmt
            .query_map(params![pattern], row_to_note)?
            .collect::<Result<Vec<_>, _>>()?;
        notes.sort_by_key(|n| (n.properties.z, n.note_id));
        Ok(notes)
    }

    /// Number of stored notes, including pending deletions
    pub fn count_notes(&self) -> BoardResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?)
    }

    // =========================================================================
    // Config table
    // =========================================================================

    pub fn get_config(&self, key: &str) -> BoardResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM config WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_config(&self, key: &str, value: &str) -> BoardResult<()> {
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_config(&self, key: &str) -> BoardResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM config WHERE key = ?", params![key])?;
        Ok(deleted > 0)
    }
}

const NOTE_COLUMNS: &str =
    "note_id, content, properties, is_dirty, lifecycle, revision, pending_changes";

/// Read one note through any connection or open transaction
pub(crate) fn read_note(conn: &Connection, note_id: NoteId) -> BoardResult<Option<NoteRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM notes WHERE note_id = ?", NOTE_COLUMNS),
            params![note_id],
            row_to_note,
        )
        .optional()?)
}

/// Insert or replace one note through any connection or open transaction
pub(crate) fn write_note(conn: &Connection, note: &NoteRecord) -> BoardResult<()> {
    let properties = serde_json::to_string(&note.properties)?;
    let pending = if note.pending.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&note.pending)?)
    };

    conn.execute(
        r#"
        INSERT OR REPLACE INTO notes
            (note_id, content, properties, is_dirty, lifecycle, revision, pending_changes)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            note.note_id,
            note.content,
            properties,
            note.is_dirty,
            note.lifecycle.as_str(),
            note.revision,
            pending,
        ],
    )?;
    Ok(())
}

/// Delete one note through any connection or open transaction
pub(crate) fn delete_note(conn: &Connection, note_id: NoteId) -> BoardResult<bool> {
    let deleted = conn.execute("DELETE FROM notes WHERE note_id = ?", params![note_id])?;
    Ok(deleted > 0)
}

fn row_to_note(row: &Row) -> rusqlite::Result<NoteRecord> {
    let properties_json: String = row.get(2)?;
    let properties: NoteProperties = serde_json::from_str(&properties_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    let lifecycle_str: String = row.get(4)?;
    let lifecycle = Lifecycle::parse(&lifecycle_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown lifecycle '{}'", lifecycle_str).into(),
        )
    })?;

    let pending_json: Option<String> = row.get(6)?;
    let pending = match pending_json {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
        None => PendingChanges::default(),
    };

    Ok(NoteRecord {
        note_id: row.get(0)?,
        content: row.get(1)?,
        properties,
        is_dirty: row.get(3)?,
        lifecycle,
        revision: row.get(5)?,
        pending,
    })
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> BoardResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|name| name == column))
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
