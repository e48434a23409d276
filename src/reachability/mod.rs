//! Network and service reachability
//!
//! Classifies the link as online, slow or offline and tracks two service
//! reachability flags. Only the platform online flag can say "offline"; probes
//! can at worst downgrade an online link to slow. The offline-to-online edge of
//! the platform flag is what drives reconciliation.

pub mod monitor;
pub mod platform;
pub mod probe;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ReachabilityConfig;

pub use monitor::ReachabilityMonitor;
pub use platform::TcpPlatformWatch;
pub use probe::{HttpLinkProbe, HttpServiceProbe, LinkProbe, ServiceProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Online,
    Slow,
    Offline,
}

/// Link classification reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    Cellular2g,
    #[serde(rename = "3g")]
    Cellular3g,
    #[serde(rename = "4g")]
    Cellular4g,
}

/// Connection-quality hints, when the platform provides them
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkHints {
    pub effective_type: Option<EffectiveType>,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<u64>,
}

impl LinkHints {
    pub fn is_empty(&self) -> bool {
        self.effective_type.is_none() && self.downlink_mbps.is_none() && self.rtt_ms.is_none()
    }
}

/// Current reachability, rebuilt at process start and never persisted
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReachabilitySnapshot {
    /// Platform-reported, authoritative for "offline"
    pub online: bool,
    pub data_api_reachable: bool,
    pub compute_api_reachable: bool,
    pub link: LinkState,
    /// Raised for a short window after connectivity comes back
    pub restored: bool,
}

impl ReachabilitySnapshot {
    pub fn initial(online: bool) -> Self {
        Self {
            online,
            data_api_reachable: online,
            compute_api_reachable: online,
            link: if online {
                LinkState::Online
            } else {
                LinkState::Offline
            },
            restored: false,
        }
    }
}

/// Edges of the platform online flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    WentOffline,
    /// Offline to online; fired once per transition
    Restored,
}

/// Result of the generic round-trip probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundTrip {
    Measured(Duration),
    Failed,
}

/// Classify the link from the platform flag, optional hints and an optional
/// generic probe result.
pub fn classify(
    config: &ReachabilityConfig,
    online: bool,
    hints: Option<&LinkHints>,
    measured: Option<RoundTrip>,
) -> LinkState {
    if !online {
        return LinkState::Offline;
    }

    if let Some(hints) = hints.filter(|h| !h.is_empty()) {
        let slow_type = matches!(
            hints.effective_type,
            Some(EffectiveType::Slow2g) | Some(EffectiveType::Cellular2g)
        );
        let slow_downlink = hints
            .downlink_mbps
            .is_some_and(|mbps| mbps < config.slow_downlink_mbps);
        let slow_rtt = hints.rtt_ms.is_some_and(|rtt| rtt > config.slow_hint_rtt_ms);

        return if slow_type || slow_downlink || slow_rtt {
            LinkState::Slow
        } else {
            LinkState::Online
        };
    }

    match measured {
        Some(RoundTrip::Measured(rtt)) if rtt.as_millis() as u64 > config.slow_rtt_ms => {
            LinkState::Slow
        }
        Some(RoundTrip::Measured(_)) | None => LinkState::Online,
        Some(RoundTrip::Failed) => LinkState::Slow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReachabilityConfig {
        ReachabilityConfig::default()
    }

    #[test]
    fn test_offline_is_authoritative() {
        let fast = LinkHints {
            effective_type: Some(EffectiveType::Cellular4g),
            downlink_mbps: Some(50.0),
            rtt_ms: Some(20),
        };
        assert_eq!(
            classify(&config(), false, Some(&fast), Some(RoundTrip::Measured(Duration::from_millis(5)))),
            LinkState::Offline
        );
    }

    #[test]
    fn test_hints_take_priority_over_probe() {
        let fast = LinkHints {
            effective_type: Some(EffectiveType::Cellular4g),
            ..LinkHints::default()
        };
        assert_eq!(
            classify(&config(), true, Some(&fast), Some(RoundTrip::Measured(Duration::from_secs(10)))),
            LinkState::Online
        );
    }

    #[test]
    fn test_slow_hints() {
        let cases = [
            LinkHints {
                effective_type: Some(EffectiveType::Slow2g),
                ..LinkHints::default()
            },
            LinkHints {
                effective_type: Some(EffectiveType::Cellular2g),
                ..LinkHints::default()
            },
            LinkHints {
                downlink_mbps: Some(0.2),
                ..LinkHints::default()
            },
            LinkHints {
                rtt_ms: Some(2500),
                ..LinkHints::default()
            },
        ];
        for hints in cases {
            assert_eq!(
                classify(&config(), true, Some(&hints), None),
                LinkState::Slow,
                "{:?}",
                hints
            );
        }
    }

    #[test]
    fn test_empty_hints_fall_back_to_probe() {
        let empty = LinkHints::default();
        assert_eq!(
            classify(&config(), true, Some(&empty), Some(RoundTrip::Measured(Duration::from_millis(3500)))),
            LinkState::Slow
        );
    }

    #[test]
    fn test_probe_thresholds() {
        let c = config();
        assert_eq!(
            classify(&c, true, None, Some(RoundTrip::Measured(Duration::from_millis(3000)))),
            LinkState::Online
        );
        assert_eq!(
            classify(&c, true, None, Some(RoundTrip::Measured(Duration::from_millis(3001)))),
            LinkState::Slow
        );
        assert_eq!(classify(&c, true, None, None), LinkState::Online);
    }

    #[test]
    fn test_failed_probe_never_means_offline() {
        assert_eq!(classify(&config(), true, None, Some(RoundTrip::Failed)), LinkState::Slow);
    }
}
