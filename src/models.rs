//! Data models for the whiteboard.
//!
//! A [`NoteRecord`] is the unit of local storage. Its `note_id` is negative
//! while the note only exists on this client and becomes the server-assigned
//! positive id after the first successful sync.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Note identifier. Negative values are client-minted placeholders.
pub type NoteId = i64;

/// Property keys as they appear on the wire and in change tracking.
pub const PROPERTY_KEYS: [&str; 7] = ["x", "y", "z", "color", "height", "width", "empty"];

/// Per-record lifecycle.
///
/// `Deleted` is never persisted: a record reaching it is removed from the
/// store in the same step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Active,
    PendingDelete,
    Deleted,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "active",
            Lifecycle::PendingDelete => "pending_delete",
            Lifecycle::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Lifecycle::Active),
            "pending_delete" => Some(Lifecycle::PendingDelete),
            "deleted" => Some(Lifecycle::Deleted),
            _ => None,
        }
    }

    /// Whether the UI should show a record in this state
    pub fn is_visible(&self) -> bool {
        matches!(self, Lifecycle::Active)
    }

    /// State after the server confirmed the synced version is current.
    pub fn after_confirmed_sync(self) -> Self {
        match self {
            Lifecycle::PendingDelete => Lifecycle::Deleted,
            other => other,
        }
    }
}

/// Spatial and visual attributes of a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteProperties {
    pub x: f64,
    pub y: f64,
    /// Stacking order; newer notes sit on top
    pub z: i64,
    pub color: String,
    pub height: f64,
    pub width: f64,
    pub empty: bool,
}

impl Default for NoteProperties {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0,
            color: "#FFF9B1".to_string(),
            height: 200.0,
            width: 200.0,
            empty: true,
        }
    }
}

impl NoteProperties {
    /// Serialize only the given keys, for partial sync payloads.
    pub fn to_partial_json<'a, I>(&self, keys: I) -> serde_json::Map<String, serde_json::Value>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let full = self.to_json();
        keys.into_iter()
            .filter_map(|k| full.get(k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }

    /// Serialize every property.
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// Partial property update. `None` leaves the current value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertiesPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty: Option<bool>,
}

impl PropertiesPatch {
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &PropertiesPatch::default()
    }

    /// Shallow-merge into `props`, returning the keys whose value changed.
    pub fn apply_to(&self, props: &mut NoteProperties) -> Vec<&'static str> {
        let mut changed = Vec::new();

        fn set<T: PartialEq + Clone>(
            slot: &mut T,
            value: &Option<T>,
            key: &'static str,
            changed: &mut Vec<&'static str>,
        ) {
            if let Some(v) = value {
                if slot != v {
                    *slot = v.clone();
                    changed.push(key);
                }
            }
        }

        set(&mut props.x, &self.x, "x", &mut changed);
        set(&mut props.y, &self.y, "y", &mut changed);
        set(&mut props.z, &self.z, "z", &mut changed);
        set(&mut props.color, &self.color, "color", &mut changed);
        set(&mut props.height, &self.height, "height", &mut changed);
        set(&mut props.width, &self.width, "width", &mut changed);
        set(&mut props.empty, &self.empty, "empty", &mut changed);
        changed
    }
}

/// What changed locally since the last confirmed sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChanges {
    /// Record has never reached the server; send everything
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub content: bool,
    #[serde(default)]
    pub property_keys: BTreeSet<String>,
}

impl PendingChanges {
    pub fn full() -> Self {
        Self {
            full: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.full && !self.content && self.property_keys.is_empty()
    }

    pub fn record_properties<'a, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.property_keys.extend(keys.into_iter().map(String::from));
    }
}

/// A note as stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub note_id: NoteId,
    pub content: String,
    pub properties: NoteProperties,
    /// Local state diverges from the last confirmed server state
    pub is_dirty: bool,
    pub lifecycle: Lifecycle,
    /// Bumped on every local mutation
    pub revision: i64,
    pub pending: PendingChanges,
}

impl NoteRecord {
    /// A note created on this client, not yet known to the server.
    pub fn new_local(note_id: NoteId, content: String, properties: NoteProperties) -> Self {
        Self {
            note_id,
            content,
            properties,
            is_dirty: true,
            lifecycle: Lifecycle::Active,
            revision: 1,
            pending: PendingChanges::full(),
        }
    }

    /// A note as delivered by the server: clean, nothing pending.
    pub fn from_server(note_id: NoteId, content: String, properties: NoteProperties) -> Self {
        Self {
            note_id,
            content,
            properties,
            is_dirty: false,
            lifecycle: Lifecycle::Active,
            revision: 0,
            pending: PendingChanges::default(),
        }
    }

    /// Whether the id was minted on this client
    pub fn is_local_only(&self) -> bool {
        self.note_id < 0
    }

    pub fn is_visible(&self) -> bool {
        self.lifecycle.is_visible()
    }
}

/// Update applied by [`Database::patch`](crate::database::Database::patch).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotePatch {
    pub content: Option<String>,
    pub properties: Option<PropertiesPatch>,
    pub lifecycle: Option<Lifecycle>,
    /// Explicit override, applied after change detection
    pub is_dirty: Option<bool>,
}

impl NotePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn properties(properties: PropertiesPatch) -> Self {
        Self {
            properties: Some(properties),
            ..Default::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            lifecycle: Some(Lifecycle::PendingDelete),
            ..Default::default()
        }
    }
}
