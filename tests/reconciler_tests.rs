//! Reconciliation Pass Tests
//!
//! Verifies the drain-and-refresh algorithm:
//! - Deduplication of superseded updates
//! - Bounded retries and dropping
//! - Convergence of the local cache to the remote
//! - Single-flight guard

mod common;

use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncline::config::SyncConfig;
use syncline::model::{Entity, FieldPatch, NewMutation, QueueStatus};
use syncline::remote::{MemoryRemote, RemoteStore};
use syncline::storage::Database;
use syncline::sync::SyncReconciler;
use syncline::{EngineError, EngineResult};

#[tokio::test]
async fn test_superseded_update_is_never_applied() {
    let env = create_test_env_with(MemoryRemote::with_entities([entity(
        "R1",
        json!({"name": "original"}),
    )]));

    env.queue
        .enqueue_at(
            NewMutation::update(OWNER, "R1", fields(json!({"name": "A"}))).with_id("E1"),
            100,
        )
        .unwrap();
    env.queue
        .enqueue_at(
            NewMutation::update(OWNER, "R1", fields(json!({"name": "B"}))).with_id("E2"),
            200,
        )
        .unwrap();

    let report = env.reconciler().run_pass(&[]).await.unwrap();

    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.deduplicated, 1);
    assert!(report.refreshed);
    assert_eq!(env.remote.patch_calls(), 1);
    assert!(env.queue.get("E1").unwrap().is_none());
    assert!(env.queue.get("E2").unwrap().is_none());

    let r1 = env.local.get("R1").unwrap().unwrap();
    assert_eq!(r1.field("name"), Some(&json!("B")));
}

#[tokio::test]
async fn test_entry_is_dropped_after_three_failures() {
    let env = create_test_env_with(MemoryRemote::with_entities([entity(
        "R1",
        json!({"name": "original"}),
    )]));
    env.remote.reject_with(Some(503));
    env.queue
        .enqueue(NewMutation::update(OWNER, "R1", fields(json!({"name": "X"}))).with_id("E1"))
        .unwrap();
    let reconciler = env.reconciler();

    for attempt in 1..=2 {
        let report = reconciler.run_pass(&[]).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.dropped, 0);
        let entry = env.queue.get("E1").unwrap().expect("entry kept for retry");
        assert_eq!(entry.retry_count, attempt);
    }

    let report = reconciler.run_pass(&[]).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.dropped, 1);
    assert!(env.queue.get("E1").unwrap().is_none());
    assert!(env.queue.dead_letters().unwrap().is_empty());

    // Nothing left to retry
    let report = reconciler.run_pass(&[]).await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(env.remote.patch_calls(), 3);

    // Local state converged to what the remote accepted
    let r1 = env.local.get("R1").unwrap().unwrap();
    assert_eq!(r1.field("name"), Some(&json!("original")));
}

#[tokio::test]
async fn test_transient_failure_is_retried_next_pass() {
    let env = create_test_env_with(MemoryRemote::with_entities([entity("R1", json!({}))]));
    env.queue
        .enqueue(NewMutation::update(OWNER, "R1", fields(json!({"name": "Soup"}))))
        .unwrap();
    env.remote.fail_next(1);
    let reconciler = env.reconciler();

    let first = reconciler.run_pass(&[]).await.unwrap();
    assert_eq!((first.synced, first.failed), (0, 1));

    let second = reconciler.run_pass(&[]).await.unwrap();
    assert_eq!((second.synced, second.failed), (1, 0));
    assert_eq!(
        env.local.get("R1").unwrap().unwrap().field("name"),
        Some(&json!("Soup"))
    );
}

#[tokio::test]
async fn test_local_cache_converges_to_remote() {
    let env = create_test_env_with(MemoryRemote::with_entities([
        entity("R1", json!({"name": "remote"})),
        entity("R2", json!({"name": "kept"})),
    ]));

    // Stale and orphaned local rows
    env.local
        .put_many(&[
            entity("R1", json!({"name": "stale"})),
            entity("GHOST", json!({"name": "deleted remotely"})),
        ])
        .unwrap();
    env.queue
        .enqueue(NewMutation::update(OWNER, "MISSING", fields(json!({"name": "x"}))))
        .unwrap();

    let report = env.reconciler().run_pass(&[OWNER.to_string()]).await.unwrap();
    assert_eq!(report.failed, 1);

    let local = env.local.get_all(OWNER).unwrap();
    let remote = env.remote.fetch_collection(OWNER).await.unwrap();
    assert_eq!(local, remote);
}

#[tokio::test]
async fn test_delete_of_absent_entity_succeeds() {
    let env = create_test_env();
    env.queue.enqueue(NewMutation::delete(OWNER, "R1")).unwrap();
    env.queue.enqueue(NewMutation::delete(OWNER, "R2")).unwrap();

    let report = env.reconciler().run_pass(&[]).await.unwrap();

    assert_eq!(report.synced, 2);
    assert_eq!(env.remote.delete_calls(), 2);
    assert!(env.queue.list_pending().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_and_delete_of_same_entity_both_survive_dedup() {
    let env = create_test_env_with(MemoryRemote::with_entities([entity("R1", json!({}))]));
    env.queue
        .enqueue_at(NewMutation::update(OWNER, "R1", fields(json!({"name": "A"}))), 100)
        .unwrap();
    env.queue
        .enqueue_at(NewMutation::delete(OWNER, "R1"), 200)
        .unwrap();

    let report = env.reconciler().run_pass(&[]).await.unwrap();

    assert_eq!(report.deduplicated, 0);
    assert_eq!(report.synced, 2);
    assert!(env.remote.get("R1").is_none());
    assert!(env.local.get("R1").unwrap().is_none());
}

#[tokio::test]
async fn test_terminal_rejection_goes_to_dead_letters() {
    let env = create_test_env_with(MemoryRemote::with_entities([entity("R1", json!({}))]));
    env.remote.reject_with(Some(422));
    env.queue
        .enqueue(NewMutation::update(OWNER, "R1", fields(json!({"name": 1}))).with_id("E1"))
        .unwrap();

    let reconciler = env.reconciler_with(SyncConfig {
        keep_dead_letters: true,
        drop_terminal_rejections: true,
        ..SyncConfig::default()
    });
    let report = reconciler.run_pass(&[]).await.unwrap();

    assert_eq!((report.failed, report.dropped), (1, 1));
    let letters = env.queue.dead_letters().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].entry.id, "E1");
    assert_eq!(letters[0].entry.retry_count, 1);
    assert!(letters[0].last_error.contains("422"));
}

#[tokio::test]
async fn test_refresh_failure_is_reported_not_raised() {
    let env = create_test_env();
    env.remote.set_unreachable(true);
    env.queue.enqueue(NewMutation::delete(OWNER, "R1")).unwrap();

    let report = env.reconciler().run_pass(&[]).await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(!report.refreshed);
    let retries: Vec<u32> = env
        .queue
        .list_pending()
        .unwrap()
        .iter()
        .map(|e| e.retry_count)
        .collect();
    assert_eq!(retries, vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_second_pass_is_refused_while_first_runs() {
    let env = create_test_env();
    let slow = SlowRemote {
        inner: MemoryRemote::with_entities([entity("R1", json!({}))]),
        delay: Duration::from_secs(2),
    };
    let reconciler = SyncReconciler::new(
        env.queue.clone(),
        env.local.clone(),
        Arc::new(slow),
        SyncConfig::default(),
        Duration::from_secs(5),
    );
    env.queue
        .enqueue(NewMutation::update(OWNER, "R1", fields(json!({"name": "A"}))))
        .unwrap();

    let (first, second) = tokio::join!(reconciler.run_pass(&[]), reconciler.run_pass(&[]));

    assert_eq!(first.unwrap().synced, 1);
    tokio_test::assert_err!(&second);
    assert!(matches!(second, Err(EngineError::PassInProgress)));
    assert!(!reconciler.is_running());

    // The guard is released: a later pass runs normally
    tokio_test::assert_ok!(reconciler.run_pass(&[]).await);
}

/// Remote that leaves the local database read-only after the first patch,
/// until the next fetch
struct ReadOnlyAfterPatch {
    inner: Arc<MemoryRemote>,
    db: Arc<Database>,
    armed: AtomicBool,
}

impl ReadOnlyAfterPatch {
    fn set_read_only(&self, on: bool) {
        let conn = self.db.connection().unwrap();
        conn.pragma_update(None, "query_only", on).unwrap();
    }
}

#[async_trait::async_trait]
impl RemoteStore for ReadOnlyAfterPatch {
    async fn fetch_collection(&self, owner_collection_id: &str) -> EngineResult<Vec<Entity>> {
        self.set_read_only(false);
        self.inner.fetch_collection(owner_collection_id).await
    }

    async fn patch_entity(
        &self,
        id: &str,
        fields: &FieldPatch,
        updated_at: i64,
    ) -> EngineResult<()> {
        self.inner.patch_entity(id, fields, updated_at).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.set_read_only(true);
        }
        Ok(())
    }

    async fn delete_entity(&self, id: &str) -> EngineResult<()> {
        self.inner.delete_entity(id).await
    }
}

#[tokio::test]
async fn test_queue_write_failure_still_refreshes_and_releases_entry() {
    let env = create_test_env_with(MemoryRemote::with_entities([entity(
        "R1",
        json!({"name": "Soup"}),
    )]));
    let entry = env
        .queue
        .enqueue(NewMutation::update(OWNER, "R1", fields(json!({"name": "Stew"}))))
        .unwrap();
    let remote = Arc::new(ReadOnlyAfterPatch {
        inner: env.remote.clone(),
        db: env.db.clone(),
        armed: AtomicBool::new(true),
    });
    let reconciler = SyncReconciler::new(
        env.queue.clone(),
        env.local.clone(),
        remote,
        SyncConfig::default(),
        Duration::from_secs(5),
    );

    let report = reconciler.run_pass(&[]).await.unwrap();

    assert_eq!(report.synced, 0);
    assert_eq!(report.storage_errors, 1);
    assert!(report.refreshed);
    assert_eq!(
        env.local.get("R1").unwrap().unwrap().field("name"),
        Some(&json!("Stew"))
    );
    let stored = env.queue.get(&entry.id).unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Pending);
    assert_eq!(stored.retry_count, 0);

    // The next pass re-applies it (patches are idempotent) and clears it
    let report = reconciler.run_pass(&[]).await.unwrap();
    assert_eq!((report.synced, report.storage_errors), (1, 0));
    assert!(env.queue.list_pending().unwrap().is_empty());
}
