//! Pipeline controller: drives one release through its phases.
//!
//! `launch` validates, takes the deployment's lease, persists the run as
//! `Pending`, and spawns a task that walks
//! `SecurityScan → Build → Deploy → HealthCheck`. Every phase result is
//! committed to the ledger before the next phase starts. Deploy and
//! health-check failures roll back to the last recorded release when one
//! exists. The lease is released only after the terminal write.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use deploy_core::{
    Deployment, DeployedContainer, ErrorKind, ErrorRecord, PhaseKind, PhasePayload, PhaseResult,
    PipelinePolicy, PipelineRun, PipelineState, Release, RollbackReport, RunId, RunOutcome,
    epoch_millis, summarize,
};
use deployd_ledger::{Ledger, LedgerError};
use deployd_phase::gate::{self, FailureResponse, GateVerdict};
use deployd_phase::pipeline::{self, PhaseContext, PhaseInput};
use deployd_phase::{Collaborators, Outcome, PhaseFailure};

use crate::bus::{EventBus, EventKind, ExecutionEvent};
use crate::error::AdmissionError;
use crate::guard::{ConcurrencyGuard, GuardKey, Lease};

/// Fallback health window when the deployment's own value is unusable.
/// Admission rejects such deployments, so this only guards direct callers.
const DEFAULT_HEALTH_WINDOW: Duration = Duration::from_secs(60);

/// Handle to a spawned run.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    task: JoinHandle<PipelineRun>,
}

impl RunHandle {
    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<PipelineRun, JoinError> {
        self.task.await
    }
}

#[derive(Clone)]
pub struct PipelineController {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: Arc<dyn Ledger>,
    guard: ConcurrencyGuard,
    bus: EventBus,
    collab: Collaborators,
    policy: PipelinePolicy,
}

/// How a run ends, before it is written.
struct Verdict {
    state: PipelineState,
    error: Option<ErrorRecord>,
    rollback: RollbackReport,
    url: Option<String>,
    release: Option<Release>,
}

impl Verdict {
    fn failed(error: ErrorRecord) -> Self {
        Self {
            state: PipelineState::Failed,
            error: Some(error),
            rollback: RollbackReport::default(),
            url: None,
            release: None,
        }
    }
}

impl PipelineController {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        guard: ConcurrencyGuard,
        bus: EventBus,
        collab: Collaborators,
        policy: PipelinePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                guard,
                bus,
                collab,
                policy,
            }),
        }
    }

    /// Admit a release and start it in the background.
    ///
    /// `Validation` and `Busy` are returned before anything is written.
    pub fn launch(&self, deployment: Deployment) -> Result<RunHandle, AdmissionError> {
        deployment.validate()?;
        let lease = self
            .inner
            .guard
            .try_acquire(GuardKey::Pipeline(deployment.id.clone()))?;

        let previous = self.inner.ledger.latest_release(&deployment.id)?;
        let run = PipelineRun::new(Uuid::new_v4().to_string(), deployment, previous);
        self.inner.ledger.create_run(&run)?;

        info!(
            run = %run.id,
            deployment = %run.deployment.id,
            reference = %run.deployment.repository.reference,
            strategy = run.deployment.strategy.name(),
            has_previous_release = run.previous_release.is_some(),
            "pipeline run admitted"
        );
        self.inner.publish(&run, EventKind::RunState { state: run.state });

        let run_id = run.id.clone();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.drive(run, lease).await });
        Ok(RunHandle { run_id, task })
    }
}

impl Inner {
    async fn drive(self: Arc<Self>, mut run: PipelineRun, lease: Lease) -> PipelineRun {
        let written = match self.advance(&mut run).await {
            Ok(verdict) => self.finish(&mut run, verdict),
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            self.abandon(&mut run, err);
        }

        if let Some(outcome) = &run.outcome {
            match run.state {
                PipelineState::Completed => {
                    info!(run = %run.id, deployment = %run.deployment.id, summary = %outcome.summary, "pipeline run completed")
                }
                _ => {
                    warn!(run = %run.id, deployment = %run.deployment.id, summary = %outcome.summary, "pipeline run failed")
                }
            }
            self.publish(
                &run,
                EventKind::RunFinished {
                    state: run.state,
                    summary: outcome.summary.clone(),
                },
            );
        }

        drop(lease);
        run
    }

    /// Walk the phases. Only ledger errors escape; every phase failure
    /// becomes a verdict.
    async fn advance(&self, run: &mut PipelineRun) -> Result<Verdict, LedgerError> {
        self.gather_context(run).await?;

        if let Err(error) = self.run_phase(run, PhaseInput::Scan).await? {
            return Ok(Verdict::failed(error));
        }

        let image = match self.run_phase(run, PhaseInput::Build).await? {
            Ok(PhasePayload::Build(image)) => image,
            Ok(other) => return Ok(Verdict::failed(unexpected(PhaseKind::Build, &other))),
            Err(error) => return Ok(Verdict::failed(error)),
        };

        let container = match self.run_phase(run, PhaseInput::Deploy { image }).await? {
            Ok(PhasePayload::Deploy(container)) => container,
            Ok(other) => return self.compensate(run, unexpected(PhaseKind::Deploy, &other)).await,
            Err(error) => return self.compensate(run, error).await,
        };

        let health = PhaseInput::HealthCheck {
            container: container.clone(),
            probe_timeout: self.policy.probe_timeout,
        };
        if let Err(error) = self.run_phase(run, health).await? {
            return self.compensate(run, error).await;
        }

        Ok(Verdict {
            state: PipelineState::Completed,
            error: None,
            rollback: RollbackReport::default(),
            url: Some(container.url.clone()),
            release: Some(release_from(run, &container)),
        })
    }

    /// Read repository metadata into the run. Never gates the run.
    async fn gather_context(&self, run: &mut PipelineRun) -> Result<(), LedgerError> {
        let describe = self.collab.repository.describe(&run.deployment.repository);
        match tokio::time::timeout(self.policy.metadata_timeout, describe).await {
            Ok(Ok(metadata)) => {
                debug!(
                    run = %run.id,
                    commit = ?metadata.latest_commit,
                    language = ?metadata.language,
                    framework = ?metadata.framework,
                    "repository context gathered"
                );
                self.ledger.set_run_context(&run.id, metadata.clone())?;
                run.repository = Some(metadata);
            }
            Ok(Err(err)) => {
                warn!(run = %run.id, error = %err, "repository metadata unavailable, continuing");
            }
            Err(_) => {
                warn!(run = %run.id, "repository metadata timed out, continuing");
            }
        }
        Ok(())
    }

    /// Execute one phase with at most one retry, commit its result, and
    /// return the payload or the classified error.
    async fn run_phase(
        &self,
        run: &mut PipelineRun,
        input: PhaseInput,
    ) -> Result<Result<PhasePayload, ErrorRecord>, LedgerError> {
        let phase = input.kind();
        *run = self.ledger.set_run_state(&run.id, phase.running_state())?;
        self.publish(run, EventKind::RunState { state: run.state });
        info!(run = %run.id, deployment = %run.deployment.id, phase = ?phase, "phase started");

        let ctx = PhaseContext {
            run_id: run.id.clone(),
            deployment: run.deployment.clone(),
            deadline: self.deadline_for(phase, &run.deployment),
            input,
        };

        let started_at = epoch_millis();
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match pipeline::execute(&ctx, &self.collab).await {
                Outcome::Failure(failure) if gate::should_retry(&failure, attempts) => {
                    warn!(
                        run = %run.id,
                        phase = ?phase,
                        attempt = attempts,
                        error = %failure.message,
                        "retryable phase failure, retrying"
                    );
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
                other => break other,
            }
        };

        let settled = match outcome {
            Outcome::Success(PhasePayload::Scan(report)) => {
                match gate::evaluate_scan(&report, self.policy.gate) {
                    GateVerdict::Pass => {
                        debug!(run = %run.id, findings = report.total(), "scan gate passed");
                        (Some(PhasePayload::Scan(report)), None)
                    }
                    GateVerdict::Reject(reason) => {
                        warn!(run = %run.id, reason = %reason, "scan gate rejected release");
                        let error = ErrorRecord::new(
                            ErrorKind::PolicyRejection,
                            Some(phase),
                            reason,
                        );
                        (Some(PhasePayload::Scan(report)), Some(error))
                    }
                }
            }
            Outcome::Success(payload) => (Some(payload), None),
            Outcome::Failure(failure) => (None, Some(classify(phase, failure))),
        };

        let (payload, error) = settled;
        let result = PhaseResult {
            sequence: run.next_sequence(),
            phase,
            started_at,
            ended_at: epoch_millis(),
            attempts,
            success: error.is_none(),
            payload: payload.clone(),
            error: error.clone(),
        };
        let (sequence, success) = (result.sequence, result.success);
        *run = self.ledger.append_result(&run.id, result)?;
        self.publish(
            run,
            EventKind::PhaseCommitted {
                phase,
                sequence,
                attempts,
                success,
            },
        );

        Ok(match (payload, error) {
            (_, Some(error)) => {
                warn!(run = %run.id, phase = ?phase, attempts, error = %error, "phase failed");
                Err(error)
            }
            (Some(payload), None) => Ok(payload),
            (None, None) => Err(ErrorRecord::new(
                ErrorKind::ExternalFailure,
                Some(phase),
                "phase returned no payload",
            )),
        })
    }

    /// Redeploy the previous release after a deploy or health failure.
    async fn compensate(
        &self,
        run: &mut PipelineRun,
        error: ErrorRecord,
    ) -> Result<Verdict, LedgerError> {
        let phase = error.phase.unwrap_or(PhaseKind::Deploy);
        let release = match gate::on_failure(phase, run.previous_release.as_ref()) {
            FailureResponse::Fail => {
                info!(run = %run.id, phase = ?phase, "no previous release, not rolling back");
                return Ok(Verdict::failed(error));
            }
            FailureResponse::RollBack(release) => release,
        };

        warn!(
            run = %run.id,
            deployment = %run.deployment.id,
            image = %release.image_reference,
            "rolling back to previous release"
        );
        let rollback = match self.run_phase(run, PhaseInput::Rollback { release }).await? {
            Ok(_) => RollbackReport {
                attempted: true,
                succeeded: true,
                error: None,
            },
            Err(rollback_error) => {
                error!(run = %run.id, error = %rollback_error, "rollback failed");
                RollbackReport {
                    attempted: true,
                    succeeded: false,
                    error: Some(rollback_error),
                }
            }
        };

        Ok(Verdict {
            state: PipelineState::RolledBack,
            error: Some(error),
            rollback,
            url: None,
            release: None,
        })
    }

    /// Write the terminal outcome. A new release is recorded first so a
    /// completed run always has its rollback target stored.
    fn finish(&self, run: &mut PipelineRun, verdict: Verdict) -> Result<(), LedgerError> {
        if let Some(release) = &verdict.release {
            self.ledger.record_release(release)?;
        }
        let summary = summarize(
            &run.deployment.id,
            verdict.state,
            verdict.error.as_ref(),
            &verdict.rollback,
            verdict.url.as_deref(),
        );
        let outcome = RunOutcome {
            state: verdict.state,
            error: verdict.error,
            rollback: verdict.rollback,
            summary,
        };
        *run = self.ledger.complete_run(&run.id, outcome, verdict.url)?;
        Ok(())
    }

    /// A ledger write failed: end the run `Failed` with no rollback.
    fn abandon(&self, run: &mut PipelineRun, err: LedgerError) {
        error!(run = %run.id, deployment = %run.deployment.id, error = %err, "ledger write failed, abandoning run");

        let error = ErrorRecord::new(
            ErrorKind::PersistenceFailure,
            phase_of(run.state),
            err.to_string(),
        );
        let rollback = RollbackReport::default();
        let summary = summarize(
            &run.deployment.id,
            PipelineState::Failed,
            Some(&error),
            &rollback,
            None,
        );
        let outcome = RunOutcome {
            state: PipelineState::Failed,
            error: Some(error),
            rollback,
            summary,
        };

        match self.ledger.complete_run(&run.id, outcome.clone(), None) {
            Ok(updated) => *run = updated,
            Err(again) => {
                error!(run = %run.id, error = %again, "terminal write failed, outcome kept in memory only");
                let now = epoch_millis();
                run.state = PipelineState::Failed;
                run.status = PipelineState::Failed.status();
                run.finished_at = Some(now);
                run.outcome = Some(outcome);
            }
        }
    }

    fn deadline_for(&self, phase: PhaseKind, deployment: &Deployment) -> Duration {
        match phase {
            PhaseKind::SecurityScan => self.policy.scan_timeout,
            PhaseKind::Build => self.policy.build_timeout,
            PhaseKind::Deploy => self.policy.deploy_timeout,
            PhaseKind::HealthCheck => deployment.health.timeout().unwrap_or(DEFAULT_HEALTH_WINDOW),
            PhaseKind::Rollback => self.policy.rollback_timeout,
        }
    }

    fn publish(&self, run: &PipelineRun, kind: EventKind) {
        self.bus.publish(ExecutionEvent::new(
            run.id.clone(),
            vec![run.deployment.id.clone()],
            kind,
        ));
    }
}

/// Map an adapter failure onto the error taxonomy.
fn classify(phase: PhaseKind, failure: PhaseFailure) -> ErrorRecord {
    let kind = match phase {
        PhaseKind::Rollback => ErrorKind::RollbackFailure,
        _ => ErrorKind::ExternalFailure,
    };
    ErrorRecord::new(kind, Some(phase), failure.message).retryable(failure.retryable)
}

fn unexpected(phase: PhaseKind, payload: &PhasePayload) -> ErrorRecord {
    ErrorRecord::new(
        ErrorKind::ExternalFailure,
        Some(phase),
        format!("unexpected payload from {phase}: {payload:?}"),
    )
}

fn phase_of(state: PipelineState) -> Option<PhaseKind> {
    match state {
        PipelineState::ScanningSecurity => Some(PhaseKind::SecurityScan),
        PipelineState::Building => Some(PhaseKind::Build),
        PipelineState::Deploying => Some(PhaseKind::Deploy),
        PipelineState::HealthChecking => Some(PhaseKind::HealthCheck),
        PipelineState::RollingBack => Some(PhaseKind::Rollback),
        _ => None,
    }
}

fn release_from(run: &PipelineRun, container: &DeployedContainer) -> Release {
    Release {
        deployment_id: run.deployment.id.clone(),
        image_reference: container.image_reference.clone(),
        container_reference: container.container_reference.clone(),
        url: container.url.clone(),
        run_id: run.id.clone(),
        recorded_at: epoch_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deployd_phase::FailureKind;

    #[test]
    fn rollback_failures_are_classified_separately() {
        let failure = PhaseFailure {
            kind: FailureKind::Timeout,
            message: "deploy did not finish".to_string(),
            retryable: false,
        };
        assert_eq!(
            classify(PhaseKind::Rollback, failure.clone()).kind,
            ErrorKind::RollbackFailure
        );
        let record = classify(PhaseKind::Deploy, failure);
        assert_eq!(record.kind, ErrorKind::ExternalFailure);
        assert_eq!(record.phase, Some(PhaseKind::Deploy));
        assert!(!record.retryable);
    }

    #[test]
    fn running_states_map_back_to_phases() {
        for phase in PhaseKind::PIPELINE {
            assert_eq!(phase_of(phase.running_state()), Some(phase));
        }
        assert_eq!(phase_of(PipelineState::Pending), None);
        assert_eq!(phase_of(PipelineState::Completed), None);
    }
}
