//! Sync Manager
//!
//! Background task that runs a reconciliation pass on every connectivity
//! restoration and on demand.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::reconciler::SyncReconciler;
use crate::error::{EngineError, EngineResult};
use crate::model::SyncReport;
use crate::reachability::ConnectivityEvent;

/// Commands that can be sent to the sync manager
#[derive(Debug)]
pub enum SyncCommand {
    /// Run a pass now
    SyncNow,
    /// Stop the background task
    Stop,
}

#[derive(Clone, Debug, Default)]
struct SyncState {
    /// Last completed pass timestamp
    last_sync_at: Option<i64>,
    last_report: Option<SyncReport>,
    passes: usize,
}

pub struct SyncManager {
    reconciler: Arc<SyncReconciler>,
    /// Collections refreshed by every pass
    owners: Vec<String>,
    state: Arc<RwLock<SyncState>>,
    reports: broadcast::Sender<SyncReport>,
    command_tx: Option<mpsc::Sender<SyncCommand>>,
}

impl SyncManager {
    pub fn new(reconciler: Arc<SyncReconciler>, owners: Vec<String>) -> Self {
        let (reports, _) = broadcast::channel(16);
        Self {
            reconciler,
            owners,
            state: Arc::new(RwLock::new(SyncState::default())),
            reports,
            command_tx: None,
        }
    }

    /// Start the background task, driven by `events`
    ///
    /// Only [`ConnectivityEvent::Restored`] triggers a pass; going offline
    /// is logged and otherwise ignored.
    pub fn start(
        &mut self,
        mut events: broadcast::Receiver<ConnectivityEvent>,
    ) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel(100);
        self.command_tx = Some(tx);

        let reconciler = self.reconciler.clone();
        let owners = self.owners.clone();
        let state = self.state.clone();
        let reports = self.reports.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = rx.recv() => {
                        match cmd {
                            Some(SyncCommand::SyncNow) => {
                                info!("Manual sync triggered");
                                Self::pass(&reconciler, &owners, &state, &reports).await;
                            }
                            Some(SyncCommand::Stop) | None => {
                                info!("Sync manager stopping");
                                break;
                            }
                        }
                    }

                    event = events.recv() => {
                        match event {
                            Ok(ConnectivityEvent::Restored) => {
                                info!("Back online - reconciling queued mutations");
                                Self::pass(&reconciler, &owners, &state, &reports).await;
                            }
                            Ok(ConnectivityEvent::WentOffline) => {
                                debug!("Offline - mutations will wait in the queue");
                            }
                            Err(RecvError::Lagged(missed)) => {
                                warn!("Missed {} connectivity events, reconciling", missed);
                                Self::pass(&reconciler, &owners, &state, &reports).await;
                            }
                            Err(RecvError::Closed) => {
                                info!("Connectivity events closed, sync manager stopping");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn pass(
        reconciler: &SyncReconciler,
        owners: &[String],
        state: &RwLock<SyncState>,
        reports: &broadcast::Sender<SyncReport>,
    ) -> Option<SyncReport> {
        match reconciler.run_pass(owners).await {
            Ok(report) => {
                {
                    let mut s = state.write().await;
                    s.last_sync_at = Some(Utc::now().timestamp_millis());
                    s.last_report = Some(report.clone());
                    s.passes += 1;
                }
                let _ = reports.send(report.clone());
                Some(report)
            }
            Err(EngineError::PassInProgress) => {
                debug!("Sync pass already running");
                None
            }
            Err(e) => {
                error!("Sync pass failed: {}", e);
                None
            }
        }
    }

    /// Run a pass on the caller's task, bypassing the command channel
    pub async fn run_once(&self) -> EngineResult<SyncReport> {
        let report = self.reconciler.run_pass(&self.owners).await?;
        let mut s = self.state.write().await;
        s.last_sync_at = Some(Utc::now().timestamp_millis());
        s.last_report = Some(report.clone());
        s.passes += 1;
        drop(s);

        let _ = self.reports.send(report.clone());
        Ok(report)
    }

    /// Trigger a pass on the background task
    pub async fn sync_now(&self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(SyncCommand::SyncNow).await;
        }
    }

    /// Stop the background task
    pub async fn stop(&self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(SyncCommand::Stop).await;
        }
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<SyncReport> {
        self.reports.subscribe()
    }

    /// Last sync time and the report of the last completed pass
    pub async fn get_state(&self) -> (Option<i64>, Option<SyncReport>) {
        let state = self.state.read().await;
        (state.last_sync_at, state.last_report.clone())
    }

    /// Number of completed passes
    pub async fn passes(&self) -> usize {
        self.state.read().await.passes
    }
}
