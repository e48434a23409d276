//! Optimistic entity repository
//!
//! Writes land in the in-memory view and the local store right away. The
//! remote is called directly when the platform reports online; when offline,
//! or when the direct call fails, the mutation goes to the queue for the next
//! reconciliation pass.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{EngineError, EngineResult};
use crate::model::{now_millis, Entity, FieldPatch, NewMutation};
use crate::reachability::ReachabilitySnapshot;
use crate::remote::{with_timeout, RemoteStore};
use crate::storage::{LegacyMigrator, LocalStore, MutationQueue};

/// Where a mutation ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Confirmed by the remote
    Synced,
    /// Queued for the next reconciliation pass
    Queued,
}

pub struct EntityRepository {
    owner: String,
    local: LocalStore,
    queue: MutationQueue,
    remote: Arc<dyn RemoteStore>,
    connectivity: watch::Receiver<ReachabilitySnapshot>,
    migrator: Option<LegacyMigrator>,
    request_timeout: Duration,
    view: RwLock<BTreeMap<String, Entity>>,
}

impl EntityRepository {
    pub fn new(
        owner_collection_id: &str,
        local: LocalStore,
        queue: MutationQueue,
        remote: Arc<dyn RemoteStore>,
        connectivity: watch::Receiver<ReachabilitySnapshot>,
    ) -> Self {
        Self {
            owner: owner_collection_id.to_string(),
            local,
            queue,
            remote,
            connectivity,
            migrator: None,
            request_timeout: Duration::from_secs(5),
            view: RwLock::new(BTreeMap::new()),
        }
    }

    /// Import the legacy cache of this owner on the first `load`
    pub fn with_migrator(mut self, migrator: LegacyMigrator) -> Self {
        self.migrator = Some(migrator);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.borrow().online
    }

    /// Fill the view from the local cache, then from the remote when online
    pub async fn load(&self) -> EngineResult<Vec<Entity>> {
        if let Some(migrator) = &self.migrator {
            if let Err(e) = migrator.migrate(&self.owner) {
                tracing::warn!("Legacy migration for {} failed: {}", self.owner, e);
            }
        }

        let cached = self.local.get_all(&self.owner)?;
        self.replace_view(cached);

        if self.is_online() {
            match with_timeout(self.request_timeout, self.remote.fetch_collection(&self.owner))
                .await
            {
                Ok(entities) => {
                    if let Err(e) = self.local.replace_collection(&self.owner, &entities) {
                        tracing::warn!("Failed to cache collection {}: {}", self.owner, e);
                    }
                    self.replace_view(entities);
                }
                Err(e) => {
                    tracing::info!("Using cached {} ({})", self.owner, e);
                }
            }
        }

        Ok(self.entities())
    }

    /// Patch the fields of an entity, creating it locally if unknown
    ///
    /// The patch is merged into the stored record, not into the view: the
    /// view may predate a refresh, or may not hold the entity at all.
    pub async fn save(&self, id: &str, fields: FieldPatch) -> EngineResult<SaveOutcome> {
        let updated_at = now_millis();
        let mut entity = self.base_record(id);
        entity.apply_patch(&fields, updated_at);

        if let Err(e) = self.local.put(&entity) {
            tracing::warn!("Local write of {} failed: {}", id, e);
        }
        self.view.write().insert(id.to_string(), entity);

        if self.is_online() {
            let result = with_timeout(
                self.request_timeout,
                self.remote.patch_entity(id, &fields, updated_at),
            )
            .await;
            match result {
                Ok(()) => return Ok(SaveOutcome::Synced),
                Err(e) => tracing::info!("Patch of {} deferred: {}", id, e),
            }
        }

        self.queue
            .enqueue(NewMutation::update(&self.owner, id, fields))?;
        Ok(SaveOutcome::Queued)
    }

    pub async fn delete(&self, id: &str) -> EngineResult<SaveOutcome> {
        self.view.write().remove(id);

        if let Err(e) = self.local.delete(id) {
            tracing::warn!("Local delete of {} failed: {}", id, e);
        }

        if self.is_online() {
            match with_timeout(self.request_timeout, self.remote.delete_entity(id)).await {
                Ok(()) => return Ok(SaveOutcome::Synced),
                Err(e) => tracing::info!("Delete of {} deferred: {}", id, e),
            }
        }

        self.queue.enqueue(NewMutation::delete(&self.owner, id))?;
        Ok(SaveOutcome::Queued)
    }

    /// Current view, ordered by id
    pub fn entities(&self) -> Vec<Entity> {
        self.view.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.view.read().get(id).cloned()
    }

    pub fn require(&self, id: &str) -> EngineResult<Entity> {
        self.get(id)
            .ok_or_else(|| EngineError::EntityNotFound(id.to_string()))
    }

    /// Re-read the view from the local store, e.g. after a reconciliation pass
    pub fn reload_cached(&self) -> EngineResult<()> {
        let cached = self.local.get_all(&self.owner)?;
        self.replace_view(cached);
        Ok(())
    }

    /// The record a patch applies to: the stored one, else the view's copy
    fn base_record(&self, id: &str) -> Entity {
        match self.local.get(id) {
            Ok(Some(stored)) => return stored,
            Ok(None) => {}
            Err(e) => tracing::warn!("Local read of {} failed: {}", id, e),
        }
        self.view
            .read()
            .get(id)
            .cloned()
            .unwrap_or_else(|| Entity::new(id, self.owner.as_str()))
    }

    fn replace_view(&self, entities: Vec<Entity>) {
        let mut view = self.view.write();
        view.clear();
        view.extend(entities.into_iter().map(|e| (e.id.clone(), e)));
    }
}

impl std::fmt::Debug for EntityRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRepository")
            .field("owner", &self.owner)
            .field("entities", &self.view.read().len())
            .finish()
    }
}
