use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Partial field map carried by an update
pub type FieldPatch = Map<String, Value>;

/// Keys owned by the entity envelope. A patch can never overwrite them.
pub const RESERVED_KEYS: [&str; 3] = ["id", "ownerCollectionId", "updatedAt"];

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A structured record cached locally and mirrored by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Stable identifier
    pub id: String,

    /// Grouping key: all entities of one account or group share it
    pub owner_collection_id: String,

    /// Last update time in milliseconds
    #[serde(default)]
    pub updated_at: i64,

    /// Payload fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>, owner_collection_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_collection_id: owner_collection_id.into(),
            updated_at: now_millis(),
            fields: Map::new(),
        }
    }

    pub fn with_fields(mut self, fields: FieldPatch) -> Self {
        self.apply_patch(&fields, self.updated_at);
        self
    }

    /// Merge only the fields present in the patch (last writer wins per field)
    ///
    /// Applying the same patch twice leaves the entity unchanged the second time.
    pub fn apply_patch(&mut self, patch: &FieldPatch, updated_at: i64) {
        for (key, value) in patch {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
        self.updated_at = updated_at;
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Outbound mutation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update" => Ok(MutationKind::Update),
            "delete" => Ok(MutationKind::Delete),
            other => Err(format!("unknown mutation kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Syncing,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "syncing" => Ok(QueueStatus::Syncing),
            other => Err(format!("unknown queue status '{}'", other)),
        }
    }
}

/// A mutation about to be queued
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    /// Generated when absent
    pub id: Option<String>,
    pub kind: MutationKind,
    pub owner_collection_id: String,
    pub target_entity_id: String,
    pub payload: Option<FieldPatch>,
}

impl NewMutation {
    pub fn update(owner: &str, target: &str, payload: FieldPatch) -> Self {
        Self {
            id: None,
            kind: MutationKind::Update,
            owner_collection_id: owner.to_string(),
            target_entity_id: target.to_string(),
            payload: Some(payload),
        }
    }

    pub fn delete(owner: &str, target: &str) -> Self {
        Self {
            id: None,
            kind: MutationKind::Delete,
            owner_collection_id: owner.to_string(),
            target_entity_id: target.to_string(),
            payload: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A pending outbound mutation as persisted in the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MutationKind,
    pub owner_collection_id: String,
    pub target_entity_id: String,
    pub payload: Option<FieldPatch>,
    pub status: QueueStatus,
    pub created_at: i64,
    pub retry_count: u32,
    /// Insertion order, breaks `created_at` ties
    #[serde(skip)]
    pub seq: i64,
}

/// A mutation abandoned after exhausting its retry budget
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub entry: QueueEntry,
    pub dropped_at: i64,
    pub last_error: String,
}

/// Outcome counts of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Entries confirmed by the remote and removed
    pub synced: usize,
    /// Failed attempts in this pass, including the ones that were dropped
    pub failed: usize,
    /// Entries removed for good after their last allowed failure
    pub dropped: usize,
    /// Superseded entries removed by deduplication without being applied
    pub deduplicated: usize,
    /// Whether every affected collection was re-fetched into the local store
    pub refreshed: bool,
    /// Queue bookkeeping failures; the entries involved stay queued
    pub storage_errors: usize,
}
