//! One-time import of the flat legacy cache
//!
//! Older clients kept each owner's entities as one serialized JSON list under
//! a per-owner key. On first access to an owner collection the list is moved
//! into the `LocalStore` and the key is erased. Corrupt data is erased without
//! importing anything: it must never break startup.

use rusqlite::{params, OptionalExtension};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::database::Database;
use super::local_store::LocalStore;
use crate::error::{EngineError, EngineResult};
use crate::model::Entity;

/// A simple key-value namespace holding legacy serialized data
pub trait LegacyNamespace: Send + Sync {
    fn read(&self, key: &str) -> EngineResult<Option<String>>;
    fn erase(&self, key: &str) -> EngineResult<()>;
}

/// The `legacy_kv` table of the local database
pub struct SqliteNamespace {
    db: Arc<Database>,
}

impl SqliteNamespace {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn write(&self, key: &str, value: &str) -> EngineResult<()> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO legacy_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

impl LegacyNamespace for SqliteNamespace {
    fn read(&self, key: &str) -> EngineResult<Option<String>> {
        let conn = self.db.connection()?;
        let value = conn
            .query_row(
                "SELECT value FROM legacy_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn erase(&self, key: &str) -> EngineResult<()> {
        let conn = self.db.connection()?;
        conn.execute("DELETE FROM legacy_kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// Entity shape of the flat cache. The owner is implied by the key.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecord {
    id: String,
    #[serde(default)]
    updated_at: Option<i64>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// What a migration attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// This owner was already checked during the store's lifetime
    AlreadyChecked,
    /// No legacy data (or an empty list) was found
    NothingToImport,
    /// Legacy data was imported and erased
    Imported(usize),
    /// Legacy data failed to parse and was erased
    Discarded,
}

pub struct LegacyMigrator {
    namespace: Arc<dyn LegacyNamespace>,
    store: LocalStore,
    key_prefix: String,
}

impl LegacyMigrator {
    pub fn new(namespace: Arc<dyn LegacyNamespace>, store: LocalStore, key_prefix: &str) -> Self {
        Self {
            namespace,
            store,
            key_prefix: key_prefix.to_string(),
        }
    }

    pub fn legacy_key(&self, owner_collection_id: &str) -> String {
        format!("{}{}", self.key_prefix, owner_collection_id)
    }

    /// Import the legacy list of `owner` once per store lifetime
    ///
    /// A storage error leaves the owner unchecked and the legacy key in
    /// place, so the next call tries again.
    pub fn migrate(&self, owner_collection_id: &str) -> EngineResult<MigrationOutcome> {
        if self.store.is_migration_checked(owner_collection_id) {
            return Ok(MigrationOutcome::AlreadyChecked);
        }

        let outcome = self.import(owner_collection_id)?;
        self.store.mark_migration_checked(owner_collection_id);
        Ok(outcome)
    }

    fn import(&self, owner_collection_id: &str) -> EngineResult<MigrationOutcome> {
        let key = self.legacy_key(owner_collection_id);
        let raw = match self.namespace.read(&key)? {
            Some(raw) => raw,
            None => return Ok(MigrationOutcome::NothingToImport),
        };

        let entities = match parse_legacy(&key, &raw, owner_collection_id) {
            Ok(entities) => entities,
            Err(e) => {
                tracing::warn!("Discarding legacy cache: {}", e);
                self.namespace.erase(&key)?;
                return Ok(MigrationOutcome::Discarded);
            }
        };

        if entities.is_empty() {
            self.namespace.erase(&key)?;
            return Ok(MigrationOutcome::NothingToImport);
        }

        self.store.try_put_many(&entities)?;
        self.namespace.erase(&key)?;

        tracing::info!(
            "Migrated {} legacy entities into collection {}",
            entities.len(),
            owner_collection_id
        );
        Ok(MigrationOutcome::Imported(entities.len()))
    }
}

fn parse_legacy(key: &str, raw: &str, owner: &str) -> EngineResult<Vec<Entity>> {
    let records: Vec<LegacyRecord> =
        serde_json::from_str(raw).map_err(|source| EngineError::MalformedLegacy {
            key: key.to_string(),
            source,
        })?;

    Ok(records
        .into_iter()
        .map(|record| {
            let mut fields = record.fields;
            fields.remove("ownerCollectionId");
            Entity {
                id: record.id,
                owner_collection_id: owner.to_string(),
                updated_at: record.updated_at.unwrap_or(0),
                fields,
            }
        })
        .collect())
}
