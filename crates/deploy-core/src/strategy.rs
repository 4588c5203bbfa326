//! Rollout strategies handed to the compute control plane on deploy.

use serde::{Deserialize, Serialize};

/// How the compute plane should replace the running version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RolloutStrategy {
    /// Replace containers in batches. Default.
    Rolling(RollingConfig),
    /// Start a full parallel set, then switch traffic at once.
    BlueGreen,
    /// Route a slice of traffic to the new version before promoting it.
    Canary(CanaryConfig),
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self::Rolling(RollingConfig::default())
    }
}

impl RolloutStrategy {
    /// Short label used in logs and summaries.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rolling(_) => "rolling",
            Self::BlueGreen => "blue-green",
            Self::Canary(_) => "canary",
        }
    }
}

/// Configuration for rolling updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingConfig {
    /// Containers replaced per batch.
    pub batch_size: u32,
    /// Maximum containers unavailable during the rollout.
    pub max_unavailable: u32,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_unavailable: 1,
        }
    }
}

/// Configuration for canary rollouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Percentage of traffic routed to the canary (0-100).
    pub traffic_percent: u32,
    /// Seconds to observe the canary before promoting.
    pub observation_secs: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            traffic_percent: 10,
            observation_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_rolling() {
        match RolloutStrategy::default() {
            RolloutStrategy::Rolling(cfg) => {
                assert_eq!(cfg.batch_size, 1);
                assert_eq!(cfg.max_unavailable, 1);
            }
            other => panic!("expected rolling, got {other:?}"),
        }
    }

    #[test]
    fn canary_fills_missing_fields_from_defaults() {
        let strategy: RolloutStrategy =
            serde_json::from_str(r#"{"type":"canary","traffic_percent":25}"#).unwrap();
        match strategy {
            RolloutStrategy::Canary(cfg) => {
                assert_eq!(cfg.traffic_percent, 25);
                assert_eq!(cfg.observation_secs, 300);
            }
            other => panic!("expected canary, got {other:?}"),
        }
    }

    #[test]
    fn blue_green_tag() {
        let json = serde_json::to_string(&RolloutStrategy::BlueGreen).unwrap();
        assert_eq!(json, r#"{"type":"blue-green"}"#);
        assert_eq!(RolloutStrategy::BlueGreen.name(), "blue-green");
    }
}
