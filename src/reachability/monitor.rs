use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::probe::{LinkProbe, ServiceProbe};
use super::{classify, ConnectivityEvent, LinkHints, LinkState, ReachabilitySnapshot, RoundTrip};
use crate::config::ReachabilityConfig;

/// Tracks platform connectivity, link quality and service reachability
///
/// Platform edges come in through [`set_platform_online`](Self::set_platform_online).
/// Every offline-to-online edge broadcasts one [`ConnectivityEvent::Restored`]
/// and raises the `restored` flag of the snapshot for the display window.
pub struct ReachabilityMonitor {
    config: ReachabilityConfig,
    snapshot_tx: watch::Sender<ReachabilitySnapshot>,
    events_tx: broadcast::Sender<ConnectivityEvent>,
    hints: Mutex<Option<LinkHints>>,
    last_round_trip: Mutex<Option<RoundTrip>>,
    restored_generation: AtomicU64,
    link_probe: Option<Arc<dyn LinkProbe>>,
    data_probe: Option<Arc<dyn ServiceProbe>>,
    compute_probe: Option<Arc<dyn ServiceProbe>>,
}

impl ReachabilityMonitor {
    pub fn new(config: ReachabilityConfig, initially_online: bool) -> Self {
        let (snapshot_tx, _) = watch::channel(ReachabilitySnapshot::initial(initially_online));
        let (events_tx, _) = broadcast::channel(16);

        Self {
            config,
            snapshot_tx,
            events_tx,
            hints: Mutex::new(None),
            last_round_trip: Mutex::new(None),
            restored_generation: AtomicU64::new(0),
            link_probe: None,
            data_probe: None,
            compute_probe: None,
        }
    }

    pub fn with_link_probe(mut self, probe: Arc<dyn LinkProbe>) -> Self {
        self.link_probe = Some(probe);
        self
    }

    pub fn with_service_probes(
        mut self,
        data_api: Arc<dyn ServiceProbe>,
        compute_api: Arc<dyn ServiceProbe>,
    ) -> Self {
        self.data_probe = Some(data_api);
        self.compute_probe = Some(compute_api);
        self
    }

    pub fn snapshot(&self) -> ReachabilitySnapshot {
        *self.snapshot_tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.snapshot_tx.borrow().online
    }

    pub fn subscribe(&self) -> watch::Receiver<ReachabilitySnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events_tx.subscribe()
    }

    /// Feed a platform online/offline signal. Repeated values are ignored.
    pub fn set_platform_online(self: &Arc<Self>, online: bool) {
        let hints = *self.hints.lock();
        let round_trip = *self.last_round_trip.lock();
        let mut changed = false;

        self.snapshot_tx.send_modify(|snapshot| {
            if snapshot.online == online {
                return;
            }
            changed = true;
            snapshot.online = online;
            snapshot.restored = online;
            snapshot.link = classify(&self.config, online, hints.as_ref(), round_trip);
        });

        if !changed {
            return;
        }

        if online {
            tracing::info!("Connectivity restored");
            let _ = self.events_tx.send(ConnectivityEvent::Restored);
            self.schedule_restored_clear();
        } else {
            tracing::warn!("Connectivity lost, mutations will be queued");
            self.restored_generation.fetch_add(1, Ordering::SeqCst);
            let _ = self.events_tx.send(ConnectivityEvent::WentOffline);
        }
    }

    /// Lower the pulse after the display window, unless a newer pulse replaced it
    fn schedule_restored_clear(self: &Arc<Self>) {
        let generation = self.restored_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let monitor = Arc::clone(self);
        let window = self.config.restored_display();
        handle.spawn(async move {
            tokio::time::sleep(window).await;
            if monitor.restored_generation.load(Ordering::SeqCst) == generation {
                monitor.snapshot_tx.send_if_modified(|snapshot| {
                    let was_raised = snapshot.restored;
                    snapshot.restored = false;
                    was_raised
                });
            }
        });
    }

    /// Replace the platform connection-quality hints
    pub fn set_link_hints(&self, hints: Option<LinkHints>) {
        *self.hints.lock() = hints;
        self.reclassify();
    }

    /// Re-measure the link when no platform hints are available
    pub async fn refresh_link(&self) -> LinkState {
        let has_hints = self.hints.lock().is_some_and(|h| !h.is_empty());
        if self.is_online() && !has_hints {
            if let Some(probe) = &self.link_probe {
                let measured = match timeout(self.config.probe_timeout(), probe.round_trip()).await
                {
                    Ok(round_trip) => round_trip,
                    Err(_) => RoundTrip::Failed,
                };
                *self.last_round_trip.lock() = Some(measured);
            }
        }
        self.reclassify()
    }

    fn reclassify(&self) -> LinkState {
        let hints = *self.hints.lock();
        let round_trip = *self.last_round_trip.lock();
        let mut link = LinkState::Offline;

        self.snapshot_tx.send_if_modified(|snapshot| {
            link = classify(&self.config, snapshot.online, hints.as_ref(), round_trip);
            let changed = snapshot.link != link;
            snapshot.link = link;
            changed
        });

        if link == LinkState::Slow {
            tracing::debug!("Link classified as slow");
        }
        link
    }

    /// Probe both named services concurrently, each under the probe timeout
    pub async fn probe_services(&self) -> (bool, bool) {
        let limit = self.config.probe_timeout();
        let run = |probe: Option<Arc<dyn ServiceProbe>>| async move {
            match probe {
                Some(probe) => timeout(limit, probe.probe()).await.unwrap_or(false),
                None => true,
            }
        };

        let (data_ok, compute_ok) = tokio::join!(
            run(self.data_probe.clone()),
            run(self.compute_probe.clone())
        );

        self.snapshot_tx.send_if_modified(|snapshot| {
            let changed = snapshot.data_api_reachable != data_ok
                || snapshot.compute_api_reachable != compute_ok;
            snapshot.data_api_reachable = data_ok;
            snapshot.compute_api_reachable = compute_ok;
            changed
        });

        if !data_ok || !compute_ok {
            tracing::debug!(
                "Service reachability: data_api={} compute_api={}",
                data_ok,
                compute_ok
            );
        }
        (data_ok, compute_ok)
    }

    /// Start the periodic probe loop
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(self.config.probe_interval());
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;
                self.refresh_link().await;
                self.probe_services().await;
            }
        })
    }
}

impl std::fmt::Debug for ReachabilityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReachabilityMonitor")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
