//! Local entity cache
//!
//! Upsert-by-id table with a secondary index on the owner collection. This is
//! a best-effort cache, not the source of truth: a full disk is logged and
//! swallowed so that it never aborts the operation that triggered the write.

use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use super::database::Database;
use super::queue::skip_unreadable;
use crate::error::{EngineError, EngineResult};
use crate::model::{now_millis, Entity};

#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
    /// Owner collections whose legacy cache has already been checked
    migration_checked: Arc<Mutex<HashSet<String>>>,
}

impl LocalStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            migration_checked: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn get(&self, id: &str) -> EngineResult<Option<Entity>> {
        let conn = self.db.connection()?;
        let mut stmt =
            conn.prepare("SELECT id, owner_id, data, updated_at FROM entities WHERE id = ?1")?;
        let entity = stmt.query_row(params![id], read_entity).optional()?;
        Ok(entity)
    }

    pub fn get_all(&self, owner_collection_id: &str) -> EngineResult<Vec<Entity>> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, data, updated_at FROM entities
             WHERE owner_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![owner_collection_id], read_entity)?;
        skip_unreadable(rows, "cached entity")
    }

    pub fn count(&self, owner_collection_id: &str) -> EngineResult<usize> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE owner_id = ?1",
            params![owner_collection_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn put(&self, entity: &Entity) -> EngineResult<()> {
        best_effort("put", self.write_many(std::slice::from_ref(entity), None))
    }

    pub fn put_many(&self, entities: &[Entity]) -> EngineResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        best_effort("put_many", self.write_many(entities, None))
    }

    /// Like `put_many`, but a full disk is reported instead of swallowed.
    ///
    /// For callers that must not discard their source after a lost write.
    pub fn try_put_many(&self, entities: &[Entity]) -> EngineResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.write_many(entities, None)
    }

    /// Make the cached collection exactly `entities`: upsert them all and
    /// drop every cached entity of the owner that is not in the list.
    pub fn replace_collection(
        &self,
        owner_collection_id: &str,
        entities: &[Entity],
    ) -> EngineResult<()> {
        best_effort(
            "replace_collection",
            self.write_many(entities, Some(owner_collection_id)),
        )
    }

    pub fn delete(&self, id: &str) -> EngineResult<()> {
        best_effort("delete", self.delete_row(id))
    }

    fn delete_row(&self, id: &str) -> EngineResult<()> {
        let conn = self.db.connection()?;
        conn.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn write_many(&self, entities: &[Entity], replace_owner: Option<&str>) -> EngineResult<()> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction()?;
        let now = now_millis();

        if let Some(owner) = replace_owner {
            let keep: HashSet<&str> = entities.iter().map(|e| e.id.as_str()).collect();
            let cached: Vec<String> = {
                let mut stmt = tx.prepare("SELECT id FROM entities WHERE owner_id = ?1")?;
                let rows = stmt.query_map(params![owner], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            for id in cached.iter().filter(|id| !keep.contains(id.as_str())) {
                tx.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO entities (id, owner_id, data, updated_at, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                 owner_id = excluded.owner_id,
                 data = excluded.data,
                 updated_at = excluded.updated_at,
                 cached_at = excluded.cached_at",
            )?;
            for entity in entities {
                let data = serde_json::to_string(&entity.fields)?;
                stmt.execute(params![
                    entity.id,
                    entity.owner_collection_id,
                    data,
                    entity.updated_at,
                    now
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub(crate) fn is_migration_checked(&self, owner_collection_id: &str) -> bool {
        self.migration_checked.lock().contains(owner_collection_id)
    }

    /// Record that the legacy cache of `owner` has been looked at.
    ///
    /// Returns `true` only for the first caller per owner.
    pub(crate) fn mark_migration_checked(&self, owner_collection_id: &str) -> bool {
        self.migration_checked
            .lock()
            .insert(owner_collection_id.to_string())
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").field("db", &self.db).finish()
    }
}

fn read_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let data: String = row.get(2)?;
    let fields: Map<String, Value> = serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Entity {
        id: row.get(0)?,
        owner_collection_id: row.get(1)?,
        updated_at: row.get(3)?,
        fields,
    })
}

fn best_effort(op: &str, result: EngineResult<()>) -> EngineResult<()> {
    match result {
        Err(EngineError::StorageFull(msg)) => {
            tracing::warn!("LocalStore {} skipped, storage full: {}", op, msg);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_store() -> LocalStore {
        LocalStore::new(Arc::new(Database::in_memory()))
    }

    fn entity(id: &str, owner: &str, name: &str) -> Entity {
        let mut e = Entity::new(id, owner);
        e.fields.insert("name".to_string(), json!(name));
        e
    }

    #[test]
    fn test_put_and_get() {
        let store = create_test_store();
        store.put(&entity("r1", "kitchen", "Soup")).unwrap();

        let got = store.get("r1").unwrap().unwrap();
        assert_eq!(got.owner_collection_id, "kitchen");
        assert_eq!(got.field("name"), Some(&json!("Soup")));
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_put_upserts_by_id() {
        let store = create_test_store();
        store.put(&entity("r1", "kitchen", "Soup")).unwrap();
        store.put(&entity("r1", "kitchen", "Stew")).unwrap();

        assert_eq!(store.count("kitchen").unwrap(), 1);
        assert_eq!(
            store.get("r1").unwrap().unwrap().field("name"),
            Some(&json!("Stew"))
        );
    }

    #[test]
    fn test_get_all_scoped_by_owner() {
        let store = create_test_store();
        store
            .put_many(&[
                entity("r1", "kitchen", "Soup"),
                entity("r2", "kitchen", "Bread"),
                entity("r3", "garage", "Oil"),
            ])
            .unwrap();

        let kitchen = store.get_all("kitchen").unwrap();
        assert_eq!(kitchen.len(), 2);
        assert!(kitchen.iter().all(|e| e.owner_collection_id == "kitchen"));
        assert_eq!(store.get_all("garage").unwrap().len(), 1);
        assert!(store.get_all("attic").unwrap().is_empty());
    }

    #[test]
    fn test_delete() {
        let store = create_test_store();
        store.put(&entity("r1", "kitchen", "Soup")).unwrap();
        store.delete("r1").unwrap();
        assert!(store.get("r1").unwrap().is_none());

        // Deleting an absent id is fine
        store.delete("r1").unwrap();
    }

    #[test]
    fn test_replace_collection() {
        let store = create_test_store();
        store
            .put_many(&[
                entity("r1", "kitchen", "Soup"),
                entity("r2", "kitchen", "Bread"),
                entity("g1", "garage", "Oil"),
            ])
            .unwrap();

        store
            .replace_collection(
                "kitchen",
                &[entity("r2", "kitchen", "Rye"), entity("r4", "kitchen", "Jam")],
            )
            .unwrap();

        let ids: Vec<String> = store
            .get_all("kitchen")
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["r2".to_string(), "r4".to_string()]);
        assert_eq!(
            store.get("r2").unwrap().unwrap().field("name"),
            Some(&json!("Rye"))
        );
        // Other owners untouched
        assert!(store.get("g1").unwrap().is_some());
    }

    #[test]
    fn test_corrupt_entity_data_is_an_error_not_an_empty_entity() {
        let store = create_test_store();
        store
            .put_many(&[entity("r1", "kitchen", "Soup"), entity("r2", "kitchen", "Bread")])
            .unwrap();
        store
            .database()
            .connection()
            .unwrap()
            .execute("UPDATE entities SET data = 'not json' WHERE id = 'r2'", [])
            .unwrap();

        assert!(store.get("r2").is_err());
        let kitchen = store.get_all("kitchen").unwrap();
        assert_eq!(kitchen.len(), 1);
        assert_eq!(kitchen[0].id, "r1");
    }

    #[test]
    fn test_best_effort_swallows_storage_full() {
        assert!(best_effort("put", Err(EngineError::StorageFull("quota".to_string()))).is_ok());
        assert!(best_effort("put", Err(EngineError::Config("x".to_string()))).is_err());
    }

    #[test]
    fn test_migration_marker_is_checked_once() {
        let store = create_test_store();
        assert!(store.mark_migration_checked("kitchen"));
        assert!(!store.mark_migration_checked("kitchen"));
        assert!(store.clone().mark_migration_checked("garage"));
        // Clones share the marker
        assert!(!store.clone().mark_migration_checked("garage"));
    }
}
