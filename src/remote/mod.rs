//! Remote authoritative store
//!
//! The engine only needs three calls from the remote: read a whole owner
//! collection, patch fields of one entity, and delete one entity. Both
//! mutations must be idempotent: patching with the same fields twice leaves
//! the same state, and deleting an absent entity is a success.

pub mod http;
pub mod memory;

use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::model::{Entity, FieldPatch};

pub use http::HttpRemote;
pub use memory::MemoryRemote;

#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_collection(&self, owner_collection_id: &str) -> EngineResult<Vec<Entity>>;

    async fn patch_entity(&self, id: &str, fields: &FieldPatch, updated_at: i64)
        -> EngineResult<()>;

    async fn delete_entity(&self, id: &str) -> EngineResult<()>;
}

/// Bound a remote call; elapsing counts as a transient network failure.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> EngineResult<T>
where
    F: std::future::Future<Output = EngineResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(limit.as_millis() as u64)),
    }
}
