//! Entity Repository Tests
//!
//! Verifies the optimistic write path:
//! - Offline writes are visible at once and queued
//! - Online writes go to the remote directly
//! - Online failures behave like offline writes
//! - A later pass converges the view

mod common;

use common::*;
use serde_json::json;
use syncline::sync::SaveOutcome;
use syncline::{EngineError, MemoryRemote};

#[tokio::test]
async fn test_load_prefers_remote_when_online() {
    let env = create_test_env_with(MemoryRemote::with_entities([
        entity("R1", json!({"name": "Soup"})),
        entity("R2", json!({"name": "Bread"})),
    ]));
    env.local.put(&entity("OLD", json!({}))).unwrap();

    let repo = env.repository(true);
    let loaded = repo.load().await.unwrap();

    let ids: Vec<&str> = loaded.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["R1", "R2"]);
    assert!(env.local.get("OLD").unwrap().is_none());
}

#[tokio::test]
async fn test_load_keeps_cache_when_remote_fails() {
    let env = create_test_env();
    env.local.put(&entity("R1", json!({"name": "cached"}))).unwrap();
    env.remote.set_unreachable(true);

    let repo = env.repository(true);
    let loaded = repo.load().await.unwrap();

    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].field("name"), Some(&json!("cached")));
}

#[tokio::test]
async fn test_offline_load_never_calls_remote() {
    let env = create_test_env();
    env.local.put(&entity("R1", json!({}))).unwrap();

    let repo = env.repository(false);
    assert_eq!(repo.load().await.unwrap().len(), 1);
    assert_eq!(env.remote.fetch_calls(), 0);
}

#[tokio::test]
async fn test_offline_save_merges_fields_and_queues() {
    let env = create_test_env();
    env.local
        .put(&entity("R1", json!({"name": "Soup", "servings": 2})))
        .unwrap();
    let repo = env.repository(false);
    repo.load().await.unwrap();

    let outcome = repo.save("R1", fields(json!({"servings": 4}))).await.unwrap();

    assert_eq!(outcome, SaveOutcome::Queued);
    let r1 = repo.get("R1").unwrap();
    assert_eq!(r1.field("name"), Some(&json!("Soup")));
    assert_eq!(r1.field("servings"), Some(&json!(4)));
    assert_eq!(
        env.local.get("R1").unwrap().unwrap().field("servings"),
        Some(&json!(4))
    );

    let pending = env.queue.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, Some(fields(json!({"servings": 4}))));
    assert_eq!(pending[0].retry_count, 0);
}

#[tokio::test]
async fn test_online_failure_is_queued_then_reconciled() {
    let env = create_test_env_with(MemoryRemote::with_entities([entity(
        "R1",
        json!({"name": "Soup"}),
    )]));
    let repo = env.repository(true);
    repo.load().await.unwrap();

    env.remote.fail_next(1);
    let outcome = repo.save("R1", fields(json!({"name": "Stew"}))).await.unwrap();
    assert_eq!(outcome, SaveOutcome::Queued);
    assert_eq!(
        env.remote.get("R1").unwrap().field("name"),
        Some(&json!("Soup"))
    );

    let report = env.reconciler().run_pass(&[OWNER.to_string()]).await.unwrap();
    assert_eq!(report.synced, 1);

    repo.reload_cached().unwrap();
    assert_eq!(repo.get("R1").unwrap().field("name"), Some(&json!("Stew")));
    assert_eq!(
        env.remote.get("R1").unwrap().field("name"),
        Some(&json!("Stew"))
    );
}

#[tokio::test]
async fn test_online_delete_is_synced() {
    let env = create_test_env_with(MemoryRemote::with_entities([entity("R1", json!({}))]));
    let repo = env.repository(true);
    repo.load().await.unwrap();

    assert_eq!(repo.delete("R1").await.unwrap(), SaveOutcome::Synced);
    assert!(repo.get("R1").is_none());
    assert!(env.remote.get("R1").is_none());
    assert!(env.queue.list_pending().unwrap().is_empty());
    assert!(matches!(
        repo.require("R1"),
        Err(EngineError::EntityNotFound(id)) if id == "R1"
    ));
}

#[tokio::test]
async fn test_save_before_load_keeps_cached_fields() {
    let env = create_test_env();
    env.local
        .put(&entity("R1", json!({"name": "Soup", "servings": 2})))
        .unwrap();
    let repo = env.repository(false);

    repo.save("R1", fields(json!({"servings": 4}))).await.unwrap();

    let stored = env.local.get("R1").unwrap().unwrap();
    assert_eq!(stored.field("name"), Some(&json!("Soup")));
    assert_eq!(stored.field("servings"), Some(&json!(4)));
    assert_eq!(repo.get("R1").unwrap(), stored);
}

#[tokio::test]
async fn test_save_after_refresh_does_not_restore_stale_fields() {
    let env = create_test_env_with(MemoryRemote::with_entities([entity(
        "R1",
        json!({"name": "Soup", "servings": 5}),
    )]));
    env.local
        .put(&entity("R1", json!({"name": "Soup", "servings": 2})))
        .unwrap();
    let repo = env.repository(false);
    repo.load().await.unwrap();
    assert_eq!(repo.get("R1").unwrap().field("servings"), Some(&json!(2)));

    // A pass refreshes the store behind the repository's back
    env.reconciler().run_pass(&[OWNER.to_string()]).await.unwrap();
    assert_eq!(
        env.local.get("R1").unwrap().unwrap().field("servings"),
        Some(&json!(5))
    );

    repo.save("R1", fields(json!({"name": "Stew"}))).await.unwrap();

    let stored = env.local.get("R1").unwrap().unwrap();
    assert_eq!(stored.field("name"), Some(&json!("Stew")));
    assert_eq!(stored.field("servings"), Some(&json!(5)));
    assert_eq!(repo.get("R1").unwrap().field("servings"), Some(&json!(5)));
}
