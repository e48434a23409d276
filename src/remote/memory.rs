use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::RemoteStore;
use crate::error::{EngineError, EngineResult};
use crate::model::{Entity, FieldPatch};

/// In-process remote store
///
/// Behaves like the HTTP contract (field patches, idempotent deletes) and can
/// be told to fail, which makes it the backbone of the reconciliation tests
/// and of the CLI's `--memory` mode.
#[derive(Default)]
pub struct MemoryRemote {
    entities: Mutex<BTreeMap<String, Entity>>,
    unreachable: AtomicBool,
    fail_next: AtomicUsize,
    reject_status: Mutex<Option<u16>>,
    patch_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let remote = Self::new();
        {
            let mut map = remote.entities.lock();
            for entity in entities {
                map.insert(entity.id.clone(), entity);
            }
        }
        remote
    }

    /// Every call fails with a network error while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next `count` mutation calls fail with a network error
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Mutation calls are answered with this HTTP status until cleared
    pub fn reject_with(&self, status: Option<u16>) {
        *self.reject_status.lock() = status;
    }

    pub fn insert(&self, entity: Entity) {
        self.entities.lock().insert(entity.id.clone(), entity);
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.entities.lock().get(id).cloned()
    }

    pub fn snapshot(&self, owner_collection_id: &str) -> Vec<Entity> {
        self.entities
            .lock()
            .values()
            .filter(|e| e.owner_collection_id == owner_collection_id)
            .cloned()
            .collect()
    }

    pub fn patch_calls(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> EngineResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(EngineError::Network("remote unreachable".to_string()));
        }
        Ok(())
    }

    fn check_mutation(&self) -> EngineResult<()> {
        self.check_reachable()?;

        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::Network("injected failure".to_string()));
        }

        if let Some(status) = *self.reject_status.lock() {
            return Err(EngineError::Rejected {
                status,
                message: "rejected by test remote".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_collection(&self, owner_collection_id: &str) -> EngineResult<Vec<Entity>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(self.snapshot(owner_collection_id))
    }

    async fn patch_entity(
        &self,
        id: &str,
        fields: &FieldPatch,
        updated_at: i64,
    ) -> EngineResult<()> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_mutation()?;

        let mut entities = self.entities.lock();
        match entities.get_mut(id) {
            Some(entity) => {
                entity.apply_patch(fields, updated_at);
                Ok(())
            }
            None => Err(EngineError::Rejected {
                status: 404,
                message: format!("entity '{}' does not exist", id),
            }),
        }
    }

    async fn delete_entity(&self, id: &str) -> EngineResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_mutation()?;
        self.entities.lock().remove(id);
        Ok(())
    }
}
