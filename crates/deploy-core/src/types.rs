//! Domain types for deployd.
//!
//! These are the records the ledger persists (pipeline runs, action
//! executions, releases) and the payloads phases produce. All types are
//! JSON-serializable for storage in redb value columns.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::parse_duration;
use crate::error::{ErrorKind, ErrorRecord, ValidationError};
use crate::strategy::RolloutStrategy;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for a pipeline run.
pub type RunId = String;

/// Unique identifier for an action execution.
pub type ActionId = String;

// ── Deployment ─────────────────────────────────────────────────────

/// Identity and policy for one release attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub repository: RepositoryRef,
    /// Target compute instance reference.
    pub instance: String,
    #[serde(default)]
    pub strategy: RolloutStrategy,
    /// Environment tag ("production", "staging", ...).
    pub environment: String,
    /// Port the released container listens on.
    pub port: u16,
    pub health: HealthCheckSpec,
}

/// Source repository and the ref to release from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub url: String,
    /// Branch, tag, or commit.
    #[serde(rename = "ref")]
    pub reference: String,
}

impl std::fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.url, self.reference)
    }
}

/// Health verification parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// HTTP path to probe (e.g., "/healthz").
    pub path: String,
    /// Window the endpoint has to turn healthy (e.g., "2m").
    pub timeout: String,
    /// Pause between probes (e.g., "5s").
    #[serde(default = "default_health_interval")]
    pub interval: String,
    /// Consecutive 2xx answers required before the endpoint counts as healthy.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

fn default_health_interval() -> String {
    "5s".to_string()
}

fn default_healthy_threshold() -> u32 {
    1
}

impl HealthCheckSpec {
    pub fn timeout(&self) -> Option<Duration> {
        parse_duration(&self.timeout)
    }

    pub fn interval(&self) -> Option<Duration> {
        parse_duration(&self.interval)
    }
}

impl Deployment {
    /// Check the request before admission. Nothing external has been
    /// touched when this fails.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::new("id", "must not be empty"));
        }
        if self.repository.url.trim().is_empty() {
            return Err(ValidationError::new("repository.url", "must not be empty"));
        }
        if self.repository.reference.trim().is_empty() {
            return Err(ValidationError::new("repository.ref", "must not be empty"));
        }
        if self.instance.trim().is_empty() {
            return Err(ValidationError::new("instance", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ValidationError::new("port", "must be non-zero"));
        }
        if !self.health.path.starts_with('/') {
            return Err(ValidationError::new("health.path", "must start with '/'"));
        }
        match self.health.timeout() {
            Some(d) if !d.is_zero() => {}
            _ => {
                return Err(ValidationError::new(
                    "health.timeout",
                    format!("invalid duration {:?}", self.health.timeout),
                ));
            }
        }
        match self.health.interval() {
            Some(d) if !d.is_zero() => {}
            _ => {
                return Err(ValidationError::new(
                    "health.interval",
                    format!("invalid duration {:?}", self.health.interval),
                ));
            }
        }
        if self.health.healthy_threshold == 0 {
            return Err(ValidationError::new(
                "health.healthy_threshold",
                "must be at least 1",
            ));
        }
        if let RolloutStrategy::Canary(cfg) = &self.strategy {
            if cfg.traffic_percent > 100 {
                return Err(ValidationError::new(
                    "strategy.traffic_percent",
                    "must be between 0 and 100",
                ));
            }
        }
        Ok(())
    }

    /// Image tag for this release: `{deployment}:{ref}`.
    pub fn image_tag(&self) -> String {
        let reference: String = self
            .repository
            .reference
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
            .collect();
        format!("{}:{}", self.id, reference)
    }
}

// ── Phases ─────────────────────────────────────────────────────────

/// The closed set of pipeline phase kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    SecurityScan,
    Build,
    Deploy,
    HealthCheck,
    Rollback,
}

impl PhaseKind {
    /// Forward phases in execution order. Rollback only runs as compensation.
    pub const PIPELINE: [PhaseKind; 4] = [
        PhaseKind::SecurityScan,
        PhaseKind::Build,
        PhaseKind::Deploy,
        PhaseKind::HealthCheck,
    ];

    /// Whether a deadline expiring may be retried. Scans and health polls
    /// are idempotent; build, deploy, and rollback may have committed work.
    pub fn retryable_on_timeout(&self) -> bool {
        matches!(self, Self::SecurityScan | Self::HealthCheck)
    }

    /// Pipeline state while this phase is executing.
    pub fn running_state(&self) -> PipelineState {
        match self {
            Self::SecurityScan => PipelineState::ScanningSecurity,
            Self::Build => PipelineState::Building,
            Self::Deploy => PipelineState::Deploying,
            Self::HealthCheck => PipelineState::HealthChecking,
            Self::Rollback => PipelineState::RollingBack,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecurityScan => "security scan",
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::HealthCheck => "health check",
            Self::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finding severity reported by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::str::FromStr for Severity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(ValidationError::new("severity", format!("unknown severity {other:?}"))),
        }
    }
}

/// Scanner verdict and finding counts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub passed: bool,
    #[serde(default)]
    pub findings: BTreeMap<Severity, u32>,
}

impl ScanReport {
    /// Highest severity at or above `gate` with a non-zero count.
    pub fn worst_at_or_above(&self, gate: Severity) -> Option<(Severity, u32)> {
        self.findings
            .iter()
            .rev()
            .find(|(severity, count)| **severity >= gate && **count > 0)
            .map(|(severity, count)| (*severity, *count))
    }

    pub fn total(&self) -> u32 {
        self.findings.values().sum()
    }
}

/// Image produced by the build phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub image_reference: String,
    pub size_bytes: u64,
}

/// Container produced by a deploy (or rollback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedContainer {
    pub container_reference: String,
    pub url: String,
    pub image_reference: String,
}

/// Outcome of the health polling window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Last observed status code, if any probe got a response.
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    /// Number of probes issued.
    pub probes: u32,
}

/// Read-only repository facts used as run context.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    #[serde(default)]
    pub branches: Vec<String>,
    pub latest_commit: Option<String>,
    pub language: Option<String>,
    pub framework: Option<String>,
}

/// Structured payload of a successful phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhasePayload {
    Scan(ScanReport),
    Build(BuiltImage),
    Deploy(DeployedContainer),
    Health(HealthReport),
    Rollback(DeployedContainer),
}

/// Outcome of one phase, appended to its run in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    /// Position in the run, starting at 1.
    pub sequence: u32,
    pub phase: PhaseKind,
    pub started_at: u64,
    pub ended_at: u64,
    /// Adapter invocations, including the retry if one happened.
    pub attempts: u32,
    pub success: bool,
    pub payload: Option<PhasePayload>,
    pub error: Option<ErrorRecord>,
}

// ── Status ─────────────────────────────────────────────────────────

/// Lifecycle status shared by pipeline runs and action executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// State machine of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    ScanningSecurity,
    Building,
    Deploying,
    HealthChecking,
    RollingBack,
    Completed,
    RolledBack,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }

    /// Status implied by this state. A rolled back run did not ship its
    /// release, so it reports `Failed` with the `rolled_back` marker set.
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Pending => ExecutionStatus::Queued,
            Self::Completed => ExecutionStatus::Completed,
            Self::RolledBack | Self::Failed => ExecutionStatus::Failed,
            _ => ExecutionStatus::InProgress,
        }
    }
}

// ── Releases ───────────────────────────────────────────────────────

/// Last known healthy version of a deployment; the rollback target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub deployment_id: DeploymentId,
    pub image_reference: String,
    pub container_reference: String,
    pub url: String,
    pub run_id: RunId,
    pub recorded_at: u64,
}

// ── Pipeline runs ──────────────────────────────────────────────────

/// What happened to the compensating rollback, if anything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RollbackReport {
    pub attempted: bool,
    pub succeeded: bool,
    pub error: Option<ErrorRecord>,
}

/// Terminal outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub state: PipelineState,
    pub error: Option<ErrorRecord>,
    pub rollback: RollbackReport,
    /// Human-readable summary for operators.
    pub summary: String,
}

/// State-machine instance for one deployment release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub deployment: Deployment,
    pub state: PipelineState,
    pub status: ExecutionStatus,
    pub results: Vec<PhaseResult>,
    pub rolled_back: bool,
    /// Rollback target captured at admission.
    pub previous_release: Option<Release>,
    /// Repository facts gathered before scanning.
    pub repository: Option<RepositoryMetadata>,
    pub outcome: Option<RunOutcome>,
    /// URL of the new version once it is serving.
    pub url: Option<String>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl PipelineRun {
    /// A freshly admitted run, `Pending`/`Queued`.
    pub fn new(id: RunId, deployment: Deployment, previous_release: Option<Release>) -> Self {
        Self {
            id,
            deployment,
            state: PipelineState::Pending,
            status: ExecutionStatus::Queued,
            results: Vec::new(),
            rolled_back: false,
            previous_release,
            repository: None,
            outcome: None,
            url: None,
            created_at: crate::epoch_millis(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Sequence number the next appended result must carry.
    pub fn next_sequence(&self) -> u32 {
        self.results.len() as u32 + 1
    }

    pub fn result_for(&self, phase: PhaseKind) -> Option<&PhaseResult> {
        self.results.iter().find(|r| r.phase == phase)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.started_at?;
        let end = self.finished_at?;
        Some(end.saturating_sub(start))
    }
}

/// Compose the operator-facing summary for a terminal run.
pub fn summarize(
    deployment_id: &str,
    state: PipelineState,
    error: Option<&ErrorRecord>,
    rollback: &RollbackReport,
    url: Option<&str>,
) -> String {
    let mut summary = match (state, error) {
        (PipelineState::Completed, _) => match url {
            Some(url) => format!("{deployment_id}: released, serving at {url}"),
            None => format!("{deployment_id}: released"),
        },
        (_, Some(err)) => {
            let phase = err.phase.map(|p| p.as_str()).unwrap_or("admission");
            format!("{deployment_id}: {} at {phase}: {}", err.kind, err.message)
        }
        (state, None) => format!("{deployment_id}: ended in {state:?}"),
    };

    if state != PipelineState::Completed {
        if !rollback.attempted {
            summary.push_str("; no rollback attempted");
        } else if rollback.succeeded {
            summary.push_str("; rolled back to previous release");
        } else {
            let reason = rollback
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error");
            summary.push_str(&format!("; rollback failed: {reason}"));
        }
    }
    summary
}

// ── Actions ────────────────────────────────────────────────────────

/// The closed set of operator-triggered remediation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    ScaleInstance,
    StopIdleDeployments,
    TriggerSecurityScan,
    RestartInstance,
}

impl ActionKind {
    /// Destructive actions require `confirmed = true`.
    pub fn is_destructive(&self) -> bool {
        !matches!(self, Self::TriggerSecurityScan)
    }

    /// Parameters that must be present at admission.
    pub fn required_parameters(&self) -> &'static [&'static str] {
        match self {
            Self::ScaleInstance => &["instance_type"],
            Self::TriggerSecurityScan => &["repository"],
            Self::StopIdleDeployments | Self::RestartInstance => &[],
        }
    }

    /// Whether an action-level deadline expiring may be retried.
    pub fn retryable_on_timeout(&self) -> bool {
        !self.is_destructive()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScaleInstance => "scale-instance",
            Self::StopIdleDeployments => "stop-idle-deployments",
            Self::TriggerSecurityScan => "trigger-security-scan",
            Self::RestartInstance => "restart-instance",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deployment an action operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTarget {
    pub deployment_id: DeploymentId,
    /// Compute instance backing the deployment.
    pub instance: String,
}

/// A progress report as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPoint {
    pub percent: u8,
    pub step: String,
    pub at: u64,
}

/// Operator request for an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub targets: Vec<ActionTarget>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub confirmed: bool,
}

impl ActionRequest {
    /// Check the request before admission.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.targets.is_empty() {
            return Err(ValidationError::new("targets", "at least one target is required"));
        }
        for (i, target) in self.targets.iter().enumerate() {
            if target.deployment_id.trim().is_empty() || target.instance.trim().is_empty() {
                return Err(ValidationError::new(
                    format!("targets[{i}]"),
                    "deployment_id and instance must not be empty",
                ));
            }
        }
        if self.kind.is_destructive() && !self.confirmed {
            return Err(ValidationError::new(
                "confirmed",
                format!("{} is destructive and must be confirmed", self.kind),
            ));
        }
        for key in self.kind.required_parameters() {
            match self.parameters.get(*key) {
                Some(v) if !v.trim().is_empty() => {}
                _ => {
                    return Err(ValidationError::new(
                        format!("parameters.{key}"),
                        format!("required for {}", self.kind),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// State-machine instance for one ad-hoc action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecution {
    pub id: ActionId,
    pub kind: ActionKind,
    pub targets: Vec<ActionTarget>,
    pub parameters: BTreeMap<String, String>,
    pub confirmed: bool,
    pub status: ExecutionStatus,
    /// 0-100, never decreases.
    pub progress: u8,
    pub step: String,
    pub history: Vec<ProgressPoint>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorRecord>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl ActionExecution {
    pub fn new(id: ActionId, request: ActionRequest) -> Self {
        Self {
            id,
            kind: request.kind,
            targets: request.targets,
            parameters: request.parameters,
            confirmed: request.confirmed,
            status: ExecutionStatus::Queued,
            progress: 0,
            step: "queued".to_string(),
            history: Vec::new(),
            result: None,
            error: None,
            created_at: crate::epoch_millis(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether this execution acts on the given deployment.
    pub fn targets_deployment(&self, deployment_id: &str) -> bool {
        self.targets.iter().any(|t| t.deployment_id == deployment_id)
    }
}

/// Terminal outcome of an action as handed to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Completed(serde_json::Value),
    Failed(ErrorRecord),
}

impl ActionOutcome {
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed(ErrorRecord::new(kind, None, message))
    }
}
