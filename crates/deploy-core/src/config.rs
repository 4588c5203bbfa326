//! deployd.toml configuration parser.
//!
//! Durations are written as strings ("5s", "500ms", "2m") and resolved
//! into [`PipelinePolicy`] / [`ActionPolicy`] before the orchestrator
//! starts. Every field has a default, so an empty file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Severity;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploydConfig {
    pub ledger: LedgerConfig,
    pub pipeline: PipelineConfig,
    pub health: HealthProbeConfig,
    pub actions: ActionsConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// redb file holding runs, actions, and releases.
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/deployd/ledger.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Lowest finding severity that blocks a release.
    pub gate_severity: Severity,
    pub retry_delay: String,
    pub scan_timeout: String,
    pub build_timeout: String,
    pub deploy_timeout: String,
    pub rollback_timeout: String,
    /// Bound on the repository metadata lookup that precedes the scan.
    pub metadata_timeout: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gate_severity: Severity::Critical,
            retry_delay: "2s".to_string(),
            scan_timeout: "5m".to_string(),
            build_timeout: "20m".to_string(),
            deploy_timeout: "10m".to_string(),
            rollback_timeout: "10m".to_string(),
            metadata_timeout: "10s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthProbeConfig {
    /// Timeout for a single probe inside the polling window.
    pub probe_timeout: String,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            probe_timeout: "2s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Deadline for a whole action.
    pub timeout: String,
    /// Pause between `describe` polls while waiting on an instance.
    pub poll_interval: String,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            timeout: "15m".to_string(),
            poll_interval: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Resolved timing and gate policy for the pipeline controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePolicy {
    pub gate: Severity,
    pub retry_delay: Duration,
    pub scan_timeout: Duration,
    pub build_timeout: Duration,
    pub deploy_timeout: Duration,
    pub rollback_timeout: Duration,
    pub metadata_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            gate: Severity::Critical,
            retry_delay: Duration::from_secs(2),
            scan_timeout: Duration::from_secs(300),
            build_timeout: Duration::from_secs(1200),
            deploy_timeout: Duration::from_secs(600),
            rollback_timeout: Duration::from_secs(600),
            metadata_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Resolved timing for the action runner.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl DeploydConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn pipeline_policy(&self) -> Result<PipelinePolicy, ConfigError> {
        let p = &self.pipeline;
        Ok(PipelinePolicy {
            gate: p.gate_severity,
            retry_delay: resolve("pipeline.retry_delay", &p.retry_delay)?,
            scan_timeout: resolve("pipeline.scan_timeout", &p.scan_timeout)?,
            build_timeout: resolve("pipeline.build_timeout", &p.build_timeout)?,
            deploy_timeout: resolve("pipeline.deploy_timeout", &p.deploy_timeout)?,
            rollback_timeout: resolve("pipeline.rollback_timeout", &p.rollback_timeout)?,
            metadata_timeout: resolve("pipeline.metadata_timeout", &p.metadata_timeout)?,
            probe_timeout: resolve("health.probe_timeout", &self.health.probe_timeout)?,
        })
    }

    pub fn action_policy(&self) -> Result<ActionPolicy, ConfigError> {
        Ok(ActionPolicy {
            timeout: resolve("actions.timeout", &self.actions.timeout)?,
            poll_interval: resolve("actions.poll_interval", &self.actions.poll_interval)?,
        })
    }
}

fn resolve(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
