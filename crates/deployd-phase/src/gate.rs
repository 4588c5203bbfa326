//! Gate, retry, and rollback policy.
//!
//! The scan gate is the only check allowed to veto a run before anything
//! external is mutated. Rollback only applies to failures after compute
//! has been touched, and only when a previous healthy release exists.

use deploy_core::{PhaseKind, Release, ScanReport, Severity};

use crate::contract::PhaseFailure;

/// Adapter invocations allowed per phase: the first try plus one retry.
pub const MAX_ATTEMPTS: u32 = 2;

/// Verdict of the scan gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Reject(String),
}

/// Apply the severity gate to a scan report.
pub fn evaluate_scan(report: &ScanReport, gate: Severity) -> GateVerdict {
    if let Some((severity, count)) = report.worst_at_or_above(gate) {
        return GateVerdict::Reject(format!(
            "{count} {severity:?} finding(s) at or above the {gate:?} gate"
        ));
    }
    if !report.passed {
        return GateVerdict::Reject(format!(
            "scanner reported failure ({} finding(s))",
            report.total()
        ));
    }
    GateVerdict::Pass
}

/// Whether a failed attempt should be tried again.
pub fn should_retry(failure: &PhaseFailure, attempts: u32) -> bool {
    failure.retryable && attempts < MAX_ATTEMPTS
}

/// What the controller does after a phase has failed for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureResponse {
    /// End the run as `Failed`.
    Fail,
    /// Redeploy the given release, then end as `RolledBack`.
    RollBack(Release),
}

/// Decide the response to a terminal phase failure.
pub fn on_failure(phase: PhaseKind, previous: Option<&Release>) -> FailureResponse {
    match (phase, previous) {
        (PhaseKind::Deploy | PhaseKind::HealthCheck, Some(release)) => {
            FailureResponse::RollBack(release.clone())
        }
        _ => FailureResponse::Fail,
    }
}
