//! Common test utilities for the sync engine tests
//!
//! Provides shared helpers for:
//! - Creating file-backed stores in a temp dir
//! - Building reconcilers and repositories around a `MemoryRemote`
//! - Writing entities and field patches concisely

#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use syncline::config::SyncConfig;
use syncline::model::{Entity, FieldPatch};
use syncline::reachability::ReachabilitySnapshot;
use syncline::remote::{MemoryRemote, RemoteStore};
use syncline::storage::{Database, LocalStore, MutationQueue};
use syncline::sync::{EntityRepository, SyncReconciler};
use syncline::EngineResult;
use tempfile::TempDir;
use tokio::sync::watch;

pub const OWNER: &str = "kitchen";

pub struct TestEnv {
    pub db: Arc<Database>,
    pub local: LocalStore,
    pub queue: MutationQueue,
    pub remote: Arc<MemoryRemote>,
    pub tmp: TempDir,
}

impl TestEnv {
    pub fn db_path(&self) -> std::path::PathBuf {
        self.tmp.path().join("syncline.db")
    }

    pub fn reconciler(&self) -> SyncReconciler {
        self.reconciler_with(SyncConfig::default())
    }

    pub fn reconciler_with(&self, config: SyncConfig) -> SyncReconciler {
        SyncReconciler::new(
            self.queue.clone(),
            self.local.clone(),
            self.remote.clone(),
            config,
            Duration::from_secs(5),
        )
    }

    pub fn repository(&self, online: bool) -> EntityRepository {
        let (tx, rx) = watch::channel(ReachabilitySnapshot::initial(online));
        drop(tx);
        EntityRepository::new(
            OWNER,
            self.local.clone(),
            self.queue.clone(),
            self.remote.clone(),
            rx,
        )
    }
}

pub fn create_test_env() -> TestEnv {
    create_test_env_with(MemoryRemote::new())
}

pub fn create_test_env_with(remote: MemoryRemote) -> TestEnv {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let db = Arc::new(Database::new(tmp.path().join("syncline.db")));

    TestEnv {
        local: LocalStore::new(db.clone()),
        queue: MutationQueue::new(db.clone()),
        db,
        remote: Arc::new(remote),
        tmp,
    }
}

pub fn fields(value: Value) -> FieldPatch {
    value
        .as_object()
        .cloned()
        .expect("fields must be a JSON object")
}

pub fn entity(id: &str, value: Value) -> Entity {
    let mut e = Entity::new(id, OWNER).with_fields(fields(value));
    e.updated_at = 1;
    e
}

/// Remote whose mutation calls take `delay` before reaching the inner store
pub struct SlowRemote {
    pub inner: MemoryRemote,
    pub delay: Duration,
}

#[async_trait::async_trait]
impl RemoteStore for SlowRemote {
    async fn fetch_collection(&self, owner_collection_id: &str) -> EngineResult<Vec<Entity>> {
        self.inner.fetch_collection(owner_collection_id).await
    }

    async fn patch_entity(
        &self,
        id: &str,
        fields: &FieldPatch,
        updated_at: i64,
    ) -> EngineResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.patch_entity(id, fields, updated_at).await
    }

    async fn delete_entity(&self, id: &str) -> EngineResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete_entity(id).await
    }
}
