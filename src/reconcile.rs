//! Applying per-note sync results to the local store.
//!
//! A note created on this client is stored under a negative placeholder id.
//! When the server reports the id it assigned, the placeholder row is deleted
//! and the note is reinserted under the real id inside one SQLite
//! transaction, so no reader ever sees both rows or neither.
//!
//! Whether the note is clean afterwards depends on two things: the server's
//! modify flag, and whether the note was edited locally while the request was
//! in flight. The caller passes the revision it sent; any other stored
//! revision keeps the note dirty.

use rusqlite::Connection;

use crate::api::SyncNoteResult;
use crate::database::{delete_note, read_note, write_note, Database};
use crate::error::BoardResult;
use crate::models::{Lifecycle, NoteId, NoteRecord, PendingChanges};

/// What a single reconciliation did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Placeholder replaced by the server id
    Renamed { from: NoteId, to: NoteId, dirty: bool },
    /// Same id, dirty flag updated
    Updated { note_id: NoteId, dirty: bool },
    /// Server confirmed a deletion; the row is gone
    Removed { note_id: NoteId },
    /// Nothing stored under either id
    Missing { note_id: NoteId },
}

impl ReconcileOutcome {
    /// The id the note is stored under afterwards
    pub fn note_id(&self) -> NoteId {
        match *self {
            ReconcileOutcome::Renamed { to, .. } => to,
            ReconcileOutcome::Updated { note_id, .. }
            | ReconcileOutcome::Removed { note_id }
            | ReconcileOutcome::Missing { note_id } => note_id,
        }
    }

    /// Whether the store was touched at all
    pub fn applied(&self) -> bool {
        !matches!(self, ReconcileOutcome::Missing { .. })
    }
}

/// Apply one sync result.
///
/// `sent_revision` is the revision of the note when its payload was built;
/// `None` means no snapshot was taken and the modify flag alone decides.
/// Applying the same result twice leaves the store as applying it once.
pub fn apply_sync_result(
    db: &Database,
    result: &SyncNoteResult,
    sent_revision: Option<i64>,
) -> BoardResult<ReconcileOutcome> {
    db.with_transaction(|tx| reconcile_in(tx, result, sent_revision))
}

fn reconcile_in(
    conn: &Connection,
    result: &SyncNoteResult,
    sent_revision: Option<i64>,
) -> BoardResult<ReconcileOutcome> {
    let from = result.send_note_id;
    let to = result.real_note_id;
    let renaming = from < 0 && to > 0 && from != to;

    let current = match read_note(conn, from)? {
        Some(note) => note,
        None if renaming => {
            // Already renamed by an earlier application of this result
            return match read_note(conn, to)? {
                Some(note) => settle(conn, note, result.modify_flag, sent_revision),
                None => Ok(ReconcileOutcome::Missing { note_id: to }),
            };
        }
        None => return Ok(ReconcileOutcome::Missing { note_id: from }),
    };

    let edited_in_flight = sent_revision.is_some_and(|rev| rev != current.revision);
    let dirty = result.modify_flag || edited_in_flight;

    if !renaming {
        return settle(conn, current, result.modify_flag, sent_revision);
    }

    if read_note(conn, to)?.is_some() {
        tracing::warn!(
            from,
            to,
            "Server id already stored locally; replacing it with the placeholder"
        );
    }

    delete_note(conn, from)?;
    let mut renamed = NoteRecord {
        note_id: to,
        ..current
    };
    if !dirty {
        renamed.is_dirty = false;
        renamed.pending = PendingChanges::default();
        renamed.lifecycle = renamed.lifecycle.after_confirmed_sync();
    } else {
        renamed.is_dirty = true;
    }

    if renamed.lifecycle == Lifecycle::Deleted {
        delete_note(conn, to)?;
        return Ok(ReconcileOutcome::Removed { note_id: to });
    }

    write_note(conn, &renamed)?;
    tracing::debug!(from, to, dirty, "Reconciled placeholder id");
    Ok(ReconcileOutcome::Renamed { from, to, dirty })
}

/// Update the flag of a note that keeps its id.
fn settle(
    conn: &Connection,
    mut note: NoteRecord,
    modify_flag: bool,
    sent_revision: Option<i64>,
) -> BoardResult<ReconcileOutcome> {
    let note_id = note.note_id;
    let edited_in_flight = sent_revision.is_some_and(|rev| rev != note.revision);

    if modify_flag || edited_in_flight {
        note.is_dirty = true;
        write_note(conn, &note)?;
        return Ok(ReconcileOutcome::Updated {
            note_id,
            dirty: true,
        });
    }

    note.lifecycle = note.lifecycle.after_confirmed_sync();
    if note.lifecycle == Lifecycle::Deleted {
        delete_note(conn, note_id)?;
        return Ok(ReconcileOutcome::Removed { note_id });
    }

    note.is_dirty = false;
    note.pending = PendingChanges::default();
    write_note(conn, &note)?;
    Ok(ReconcileOutcome::Updated {
        note_id,
        dirty: false,
    })
}
