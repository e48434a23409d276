//! Reconciliation pass
//!
//! Drains the mutation queue against the remote store, then re-reads every
//! affected collection so the local cache matches what the remote accepted.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{now_millis, FieldPatch, MutationKind, QueueEntry, SyncReport};
use crate::remote::{with_timeout, RemoteStore};
use crate::storage::{LocalStore, MutationQueue};

/// Split pending entries into survivors and superseded ones
///
/// Entries are grouped by target entity and kind; the latest `created_at`
/// wins, and a tie goes to the later insertion. Survivors keep the input order.
pub fn dedup(entries: Vec<QueueEntry>) -> (Vec<QueueEntry>, Vec<QueueEntry>) {
    let mut latest: HashMap<(String, MutationKind), (i64, i64, String)> = HashMap::new();
    for entry in &entries {
        let rank = (entry.created_at, entry.seq, entry.id.clone());
        latest
            .entry((entry.target_entity_id.clone(), entry.kind))
            .and_modify(|best| {
                if (rank.0, rank.1) > (best.0, best.1) {
                    *best = rank.clone();
                }
            })
            .or_insert(rank);
    }

    let winners: HashSet<String> = latest.into_values().map(|(_, _, id)| id).collect();
    entries.into_iter().partition(|e| winners.contains(&e.id))
}

/// Resets the in-flight flag when a pass ends, including on early return
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncReconciler {
    queue: MutationQueue,
    local: LocalStore,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    request_timeout: Duration,
    in_flight: AtomicBool,
}

impl SyncReconciler {
    pub fn new(
        queue: MutationQueue,
        local: LocalStore,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            local,
            remote,
            config,
            request_timeout,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Run one pass
    ///
    /// `owners` are refreshed even when no queued entry touches them. Queue
    /// bookkeeping failures are counted in the report and never skip the
    /// refresh. Returns [`EngineError::PassInProgress`] if another pass has
    /// not finished yet.
    pub async fn run_pass(&self, owners: &[String]) -> EngineResult<SyncReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::PassInProgress);
        }
        let _guard = PassGuard(&self.in_flight);

        let mut report = SyncReport::default();
        let pending = match self.queue.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!("Failed to read the mutation queue: {}", e);
                report.storage_errors += 1;
                Vec::new()
            }
        };

        let mut affected: BTreeSet<String> = owners.iter().cloned().collect();
        affected.extend(self.config.collections.iter().cloned());
        affected.extend(pending.iter().map(|e| e.owner_collection_id.clone()));

        if !pending.is_empty() {
            tracing::info!("Reconciling {} queued mutations", pending.len());
        }

        let (survivors, superseded) = dedup(pending);
        for entry in &superseded {
            tracing::debug!(
                "Skipping {} {}: superseded by a newer entry",
                entry.kind,
                entry.id
            );
            match self.queue.remove(&entry.id) {
                Ok(()) => report.deduplicated += 1,
                Err(e) => {
                    tracing::warn!("Failed to remove superseded {}: {}", entry.id, e);
                    report.storage_errors += 1;
                }
            }
        }

        // Claimed entries whose outcome could not be recorded
        let mut unsettled = Vec::new();
        for entry in survivors {
            if let Err(e) = self.queue.mark_syncing(&entry.id) {
                tracing::warn!("Failed to claim {}: {}", entry.id, e);
                report.storage_errors += 1;
                continue;
            }

            let outcome = self.apply(&entry).await;
            if let Err(e) = self.settle(&entry, outcome, &mut report) {
                tracing::warn!("Failed to record the outcome of {}: {}", entry.id, e);
                report.storage_errors += 1;
                unsettled.push(entry.id);
            }
        }

        report.refreshed = self.refresh(&affected).await;

        for id in &unsettled {
            if let Err(e) = self.queue.mark_pending(id) {
                tracing::error!("Entry {} stays claimed until restart: {}", id, e);
            }
        }

        tracing::info!(
            "Sync pass done: synced={} failed={} dropped={} deduplicated={} storage_errors={}",
            report.synced,
            report.failed,
            report.dropped,
            report.deduplicated,
            report.storage_errors
        );
        Ok(report)
    }

    /// Record what happened to a claimed entry
    fn settle(
        &self,
        entry: &QueueEntry,
        outcome: EngineResult<()>,
        report: &mut SyncReport,
    ) -> EngineResult<()> {
        match outcome {
            Ok(()) => {
                self.queue.remove(&entry.id)?;
                report.synced += 1;
            }
            Err(e) => {
                report.failed += 1;
                if self.should_drop(entry, &e) {
                    self.drop_entry(entry, &e)?;
                    report.dropped += 1;
                } else {
                    tracing::debug!(
                        "{} of {} failed (attempt {}): {}",
                        entry.kind,
                        entry.target_entity_id,
                        entry.retry_count + 1,
                        e
                    );
                    self.queue.mark_pending_with_incremented_retry(&entry.id)?;
                }
            }
        }
        Ok(())
    }

    async fn apply(&self, entry: &QueueEntry) -> EngineResult<()> {
        match entry.kind {
            MutationKind::Update => {
                let empty = FieldPatch::new();
                let fields = entry.payload.as_ref().unwrap_or(&empty);
                with_timeout(
                    self.request_timeout,
                    self.remote
                        .patch_entity(&entry.target_entity_id, fields, now_millis()),
                )
                .await
            }
            MutationKind::Delete => {
                with_timeout(
                    self.request_timeout,
                    self.remote.delete_entity(&entry.target_entity_id),
                )
                .await
            }
        }
    }

    fn should_drop(&self, entry: &QueueEntry, error: &EngineError) -> bool {
        if self.config.drop_terminal_rejections && error.is_terminal_rejection() {
            return true;
        }
        entry.retry_count + 1 >= self.config.max_retries
    }

    fn drop_entry(&self, entry: &QueueEntry, error: &EngineError) -> EngineResult<()> {
        tracing::warn!(
            "Dropping {} of {} after {} attempts: {}",
            entry.kind,
            entry.target_entity_id,
            entry.retry_count + 1,
            error
        );

        if self.config.keep_dead_letters {
            self.queue.move_to_dead_letters(entry, &error.to_string())
        } else {
            self.queue.remove(&entry.id)
        }
    }

    /// Replace each affected collection with the remote copy
    async fn refresh(&self, owners: &BTreeSet<String>) -> bool {
        let mut all_refreshed = true;

        for owner in owners {
            let fetched =
                with_timeout(self.request_timeout, self.remote.fetch_collection(owner)).await;
            let result = fetched.and_then(|entities| {
                let count = entities.len();
                self.local.replace_collection(owner, &entities)?;
                Ok(count)
            });

            match result {
                Ok(count) => tracing::debug!("Refreshed {} ({} entities)", owner, count),
                Err(e) => {
                    tracing::warn!("Failed to refresh collection {}: {}", owner, e);
                    all_refreshed = false;
                }
            }
        }

        all_refreshed
    }
}

impl std::fmt::Debug for SyncReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncReconciler")
            .field("max_retries", &self.config.max_retries)
            .field("running", &self.is_running())
            .finish()
    }
}
