//! Remediation action adapters.
//!
//! Actions run against the same collaborators as the pipeline but are
//! operator-triggered and report fine-grained progress through a
//! [`ProgressSink`]. Multi-target actions split the 0-100 range evenly
//! across targets so reported progress only moves forward.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info};

use deploy_core::{ActionId, ActionKind, ActionTarget, RepositoryRef};

use crate::contract::{
    CollaboratorError, Collaborators, ComputeApi, InstanceState, Outcome, PhaseFailure,
};

/// Receives progress reports from a running action.
pub trait ProgressSink: Send + Sync {
    /// `percent` is 0-100 and never lower than a previous report.
    fn report(&self, percent: u8, step: &str);
}

/// Everything one action invocation sees.
pub struct ActionContext<'a> {
    pub action_id: ActionId,
    pub kind: ActionKind,
    pub targets: &'a [ActionTarget],
    pub parameters: &'a BTreeMap<String, String>,
    /// Upper bound on the whole action.
    pub deadline: Duration,
    /// Pause between `describe` polls while waiting on an instance.
    pub poll_interval: Duration,
    pub progress: &'a dyn ProgressSink,
}

impl ActionContext<'_> {
    fn param(&self, key: &str) -> Result<&str, PhaseFailure> {
        self.parameters
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| CollaboratorError::fatal(format!("missing parameter {key:?}")).into())
    }
}

/// Run one action to an outcome under its deadline. Never retries.
pub async fn execute(ctx: &ActionContext<'_>, collab: &Collaborators) -> Outcome<Value> {
    debug!(action_id = %ctx.action_id, kind = %ctx.kind, targets = ctx.targets.len(), "executing action");

    let run = async {
        match ctx.kind {
            ActionKind::ScaleInstance => scale(ctx, collab.compute.as_ref()).await,
            ActionKind::StopIdleDeployments => stop_idle(ctx, collab.compute.as_ref()).await,
            ActionKind::TriggerSecurityScan => trigger_scan(ctx, collab).await,
            ActionKind::RestartInstance => restart(ctx, collab.compute.as_ref()).await,
        }
    };

    match tokio::time::timeout(ctx.deadline, run).await {
        Ok(Ok(value)) => Outcome::Success(value),
        Ok(Err(failure)) => Outcome::Failure(failure),
        Err(_) => Outcome::Failure(PhaseFailure::timeout(
            ctx.kind.as_str(),
            ctx.deadline,
            ctx.kind.retryable_on_timeout(),
        )),
    }
}

/// Maps per-target progress onto the overall 0-100 range.
struct Span<'a> {
    sink: &'a dyn ProgressSink,
    index: usize,
    total: usize,
}

impl Span<'_> {
    fn report(&self, local: u8, step: &str) {
        let total = self.total.max(1) as u32;
        let overall = (self.index as u32 * 100 + local.min(100) as u32) / total;
        self.sink.report(overall as u8, step);
    }
}

fn spans<'a>(ctx: &'a ActionContext<'_>) -> impl Iterator<Item = (Span<'a>, &'a ActionTarget)> + 'a {
    let total = ctx.targets.len();
    ctx.targets.iter().enumerate().map(move |(index, target)| {
        (
            Span {
                sink: ctx.progress,
                index,
                total,
            },
            target,
        )
    })
}

/// Poll `describe` until the instance reaches `desired`.
async fn wait_for_state(
    compute: &dyn ComputeApi,
    instance: &str,
    desired: InstanceState,
    poll_interval: Duration,
) -> Result<(), PhaseFailure> {
    loop {
        let description = compute.describe(instance).await?;
        if description.state == desired {
            return Ok(());
        }
        debug!(instance, state = ?description.state, want = ?desired, "waiting on instance");
        tokio::time::sleep(poll_interval).await;
    }
}

async fn scale(ctx: &ActionContext<'_>, compute: &dyn ComputeApi) -> Result<Value, PhaseFailure> {
    let instance_type = ctx.param("instance_type")?;
    let mut resized = Vec::with_capacity(ctx.targets.len());

    for (span, target) in spans(ctx) {
        let instance = target.instance.as_str();
        span.report(5, &format!("describing {instance}"));
        let before = compute.describe(instance).await?;

        if before.instance_type == instance_type {
            span.report(100, &format!("{instance} already {instance_type}"));
            resized.push(json!({
                "deployment_id": target.deployment_id,
                "instance": instance,
                "from": before.instance_type,
                "to": instance_type,
                "changed": false,
            }));
            continue;
        }

        span.report(15, &format!("stopping {instance}"));
        compute.stop(instance).await?;
        wait_for_state(compute, instance, InstanceState::Stopped, ctx.poll_interval).await?;

        span.report(45, &format!("resizing {instance} to {instance_type}"));
        compute.resize(instance, instance_type).await?;

        span.report(65, &format!("starting {instance}"));
        compute.start(instance).await?;
        wait_for_state(compute, instance, InstanceState::Running, ctx.poll_interval).await?;

        let after = compute.describe(instance).await?;
        if after.instance_type != instance_type {
            return Err(CollaboratorError::fatal(format!(
                "{instance} reports {} after resize to {instance_type}",
                after.instance_type
            ))
            .into());
        }
        span.report(100, &format!("{instance} verified as {instance_type}"));
        info!(action_id = %ctx.action_id, instance, from = %before.instance_type, to = instance_type, "instance resized");

        resized.push(json!({
            "deployment_id": target.deployment_id,
            "instance": instance,
            "from": before.instance_type,
            "to": instance_type,
            "changed": true,
        }));
    }

    Ok(json!({ "instances": resized }))
}

async fn stop_idle(ctx: &ActionContext<'_>, compute: &dyn ComputeApi) -> Result<Value, PhaseFailure> {
    let mut stopped = Vec::new();
    let mut skipped = Vec::new();

    for (span, target) in spans(ctx) {
        let instance = target.instance.as_str();
        let description = compute.describe(instance).await?;
        if description.state == InstanceState::Stopped {
            skipped.push(target.deployment_id.clone());
            span.report(100, &format!("{} already stopped", target.deployment_id));
            continue;
        }

        span.report(10, &format!("stopping {}", target.deployment_id));
        compute.stop(instance).await?;
        wait_for_state(compute, instance, InstanceState::Stopped, ctx.poll_interval).await?;
        stopped.push(target.deployment_id.clone());
        span.report(100, &format!("stopped {}", target.deployment_id));
    }

    info!(action_id = %ctx.action_id, stopped = stopped.len(), skipped = skipped.len(), "idle deployments stopped");
    Ok(json!({ "stopped": stopped, "skipped": skipped }))
}

async fn trigger_scan(ctx: &ActionContext<'_>, collab: &Collaborators) -> Result<Value, PhaseFailure> {
    let target = RepositoryRef {
        url: ctx.param("repository")?.to_string(),
        reference: ctx
            .parameters
            .get("ref")
            .cloned()
            .unwrap_or_else(|| "HEAD".to_string()),
    };

    ctx.progress.report(10, &format!("scanning {target}"));
    let report = collab.scanner.scan(&target).await?;
    ctx.progress.report(100, "scan complete");

    Ok(json!({
        "repository": target.url,
        "ref": target.reference,
        "passed": report.passed,
        "findings": report.findings,
        "total": report.total(),
    }))
}

async fn restart(ctx: &ActionContext<'_>, compute: &dyn ComputeApi) -> Result<Value, PhaseFailure> {
    let mut restarted = Vec::with_capacity(ctx.targets.len());

    for (span, target) in spans(ctx) {
        let instance = target.instance.as_str();
        span.report(10, &format!("stopping {instance}"));
        compute.stop(instance).await?;
        wait_for_state(compute, instance, InstanceState::Stopped, ctx.poll_interval).await?;

        span.report(50, &format!("starting {instance}"));
        compute.start(instance).await?;
        wait_for_state(compute, instance, InstanceState::Running, ctx.poll_interval).await?;

        span.report(100, &format!("{instance} running"));
        restarted.push(target.deployment_id.clone());
    }

    Ok(json!({ "restarted": restarted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    use deploy_core::{
        BuiltImage, DeployedContainer, RepositoryMetadata, RolloutStrategy, ScanReport, Severity,
    };

    use crate::contract::{
        BoxFuture, CallResult, FailureKind, HealthProbe, HealthSample, ImageBuilder,
        InstanceDescription, RepositoryReader, Scanner,
    };

    /// In-memory compute where stop/start settle on the next describe.
    #[derive(Default)]
    struct FakeCompute {
        instances: Mutex<HashMap<String, (InstanceState, String)>>,
        calls: Mutex<Vec<String>>,
        stuck: bool,
    }

    impl FakeCompute {
        fn with(instances: &[(&str, InstanceState, &str)]) -> Self {
            let map = instances
                .iter()
                .map(|(i, s, t)| (i.to_string(), (*s, t.to_string())))
                .collect();
            Self {
                instances: Mutex::new(map),
                ..Self::default()
            }
        }

        fn set_state(&self, instance: &str, state: InstanceState) {
            if let Some(entry) = self.instances.lock().unwrap().get_mut(instance) {
                entry.0 = state;
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ComputeApi for FakeCompute {
        fn deploy<'a>(
            &'a self,
            _instance: &'a str,
            _image: &'a str,
            _port: u16,
            _strategy: &'a RolloutStrategy,
        ) -> BoxFuture<'a, CallResult<DeployedContainer>> {
            Box::pin(async { Err(CollaboratorError::fatal("not used")) })
        }

        fn stop<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, CallResult<()>> {
            self.calls.lock().unwrap().push(format!("stop {instance}"));
            if !self.stuck {
                self.set_state(instance, InstanceState::Stopped);
            }
            Box::pin(async { Ok(()) })
        }

        fn start<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, CallResult<()>> {
            self.calls.lock().unwrap().push(format!("start {instance}"));
            self.set_state(instance, InstanceState::Running);
            Box::pin(async { Ok(()) })
        }

        fn describe<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, CallResult<InstanceDescription>> {
            let found = self.instances.lock().unwrap().get(instance).cloned();
            Box::pin(async move {
                let (state, instance_type) =
                    found.ok_or_else(|| CollaboratorError::fatal(format!("no such instance {instance}")))?;
                Ok(InstanceDescription {
                    instance: instance.to_string(),
                    state,
                    instance_type,
                })
            })
        }

        fn resize<'a>(&'a self, instance: &'a str, instance_type: &'a str) -> BoxFuture<'a, CallResult<()>> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("resize {instance} {instance_type}"));
            if let Some(entry) = self.instances.lock().unwrap().get_mut(instance) {
                entry.1 = instance_type.to_string();
            }
            Box::pin(async { Ok(()) })
        }
    }

    struct FakeScanner;

    impl Scanner for FakeScanner {
        fn scan<'a>(&'a self, target: &'a RepositoryRef) -> BoxFuture<'a, CallResult<ScanReport>> {
            Box::pin(async move {
                assert_eq!(target.reference, "HEAD");
                Ok(ScanReport {
                    passed: true,
                    findings: BTreeMap::from([(Severity::Medium, 4)]),
                })
            })
        }
    }

    struct Unused;

    impl ImageBuilder for Unused {
        fn build<'a>(&'a self, _s: &'a RepositoryRef, _t: &'a str) -> BoxFuture<'a, CallResult<BuiltImage>> {
            Box::pin(async { Err(CollaboratorError::fatal("not used")) })
        }
    }

    impl HealthProbe for Unused {
        fn check<'a>(&'a self, _u: &'a str, _p: &'a str, _t: Duration) -> BoxFuture<'a, CallResult<HealthSample>> {
            Box::pin(async { Err(CollaboratorError::fatal("not used")) })
        }
    }

    impl RepositoryReader for Unused {
        fn describe<'a>(&'a self, _r: &'a RepositoryRef) -> BoxFuture<'a, CallResult<RepositoryMetadata>> {
            Box::pin(async { Err(CollaboratorError::fatal("not used")) })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        points: Mutex<Vec<(u8, String)>>,
    }

    impl ProgressSink for RecordingSink {
        fn report(&self, percent: u8, step: &str) {
            self.points.lock().unwrap().push((percent, step.to_string()));
        }
    }

    impl RecordingSink {
        fn percents(&self) -> Vec<u8> {
            self.points.lock().unwrap().iter().map(|(p, _)| *p).collect()
        }
    }

    fn collaborators(compute: Arc<FakeCompute>) -> Collaborators {
        Collaborators {
            scanner: Arc::new(FakeScanner),
            builder: Arc::new(Unused),
            compute,
            health: Arc::new(Unused),
            repository: Arc::new(Unused),
        }
    }

    fn targets(pairs: &[(&str, &str)]) -> Vec<ActionTarget> {
        pairs
            .iter()
            .map(|(d, i)| ActionTarget {
                deployment_id: d.to_string(),
                instance: i.to_string(),
            })
            .collect()
    }

    fn ctx<'a>(
        kind: ActionKind,
        targets: &'a [ActionTarget],
        parameters: &'a BTreeMap<String, String>,
        sink: &'a RecordingSink,
    ) -> ActionContext<'a> {
        ActionContext {
            action_id: "act-1".to_string(),
            kind,
            targets,
            parameters,
            deadline: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
            progress: sink,
        }
    }

    fn assert_monotonic(percents: &[u8]) {
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "not monotonic: {percents:?}");
    }

    #[tokio::test]
    async fn scale_stops_resizes_and_restarts() {
        let compute = Arc::new(FakeCompute::with(&[("i-1", InstanceState::Running, "small")]));
        let targets = targets(&[("shop-api", "i-1")]);
        let params = BTreeMap::from([("instance_type".to_string(), "large".to_string())]);
        let sink = RecordingSink::default();

        let out = execute(
            &ctx(ActionKind::ScaleInstance, &targets, &params, &sink),
            &collaborators(compute.clone()),
        )
        .await;

        let Outcome::Success(value) = out else {
            panic!("expected success");
        };
        assert_eq!(value["instances"][0]["from"], "small");
        assert_eq!(value["instances"][0]["to"], "large");
        assert_eq!(compute.calls(), ["stop i-1", "resize i-1 large", "start i-1"]);
        let percents = sink.percents();
        assert_monotonic(&percents);
        assert_eq!(percents.last(), Some(&100));
    }

    #[tokio::test]
    async fn scale_to_current_size_is_a_noop() {
        let compute = Arc::new(FakeCompute::with(&[("i-1", InstanceState::Running, "large")]));
        let targets = targets(&[("shop-api", "i-1")]);
        let params = BTreeMap::from([("instance_type".to_string(), "large".to_string())]);
        let sink = RecordingSink::default();

        let out = execute(
            &ctx(ActionKind::ScaleInstance, &targets, &params, &sink),
            &collaborators(compute.clone()),
        )
        .await;
        assert!(out.is_success());
        assert!(compute.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_idle_skips_stopped_and_spreads_progress() {
        let compute = Arc::new(FakeCompute::with(&[
            ("i-1", InstanceState::Running, "small"),
            ("i-2", InstanceState::Stopped, "small"),
        ]));
        let targets = targets(&[("a", "i-1"), ("b", "i-2")]);
        let params = BTreeMap::new();
        let sink = RecordingSink::default();

        let out = execute(
            &ctx(ActionKind::StopIdleDeployments, &targets, &params, &sink),
            &collaborators(compute.clone()),
        )
        .await;

        let Outcome::Success(value) = out else {
            panic!("expected success");
        };
        assert_eq!(value["stopped"], json!(["a"]));
        assert_eq!(value["skipped"], json!(["b"]));
        assert_eq!(compute.calls(), ["stop i-1"]);
        let percents = sink.percents();
        assert_monotonic(&percents);
        assert!(percents.contains(&50));
        assert_eq!(percents.last(), Some(&100));
    }

    #[tokio::test]
    async fn trigger_scan_defaults_ref_to_head() {
        let compute = Arc::new(FakeCompute::default());
        let targets = targets(&[("shop-api", "i-1")]);
        let params = BTreeMap::from([(
            "repository".to_string(),
            "https://git.example.com/shop/api".to_string(),
        )]);
        let sink = RecordingSink::default();

        let out = execute(
            &ctx(ActionKind::TriggerSecurityScan, &targets, &params, &sink),
            &collaborators(compute),
        )
        .await;
        let Outcome::Success(value) = out else {
            panic!("expected success");
        };
        assert_eq!(value["passed"], true);
        assert_eq!(value["findings"]["medium"], 4);
        assert_eq!(sink.percents(), [10, 100]);
    }

    #[tokio::test]
    async fn restart_cycles_each_target() {
        let compute = Arc::new(FakeCompute::with(&[("i-1", InstanceState::Running, "small")]));
        let targets = targets(&[("shop-api", "i-1")]);
        let params = BTreeMap::new();
        let sink = RecordingSink::default();

        let out = execute(
            &ctx(ActionKind::RestartInstance, &targets, &params, &sink),
            &collaborators(compute.clone()),
        )
        .await;
        assert!(out.is_success());
        assert_eq!(compute.calls(), ["stop i-1", "start i-1"]);
    }

    #[tokio::test]
    async fn stuck_instance_hits_deadline_without_retry() {
        let compute = Arc::new(FakeCompute {
            stuck: true,
            ..FakeCompute::with(&[("i-1", InstanceState::Running, "small")])
        });
        let targets = targets(&[("shop-api", "i-1")]);
        let params = BTreeMap::new();
        let sink = RecordingSink::default();
        let mut context = ctx(ActionKind::RestartInstance, &targets, &params, &sink);
        context.deadline = Duration::from_millis(60);

        match execute(&context, &collaborators(compute)).await {
            Outcome::Failure(f) => {
                assert_eq!(f.kind, FailureKind::Timeout);
                assert!(!f.retryable);
            }
            Outcome::Success(_) => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn unknown_instance_fails_external() {
        let compute = Arc::new(FakeCompute::default());
        let targets = targets(&[("shop-api", "i-missing")]);
        let params = BTreeMap::new();
        let sink = RecordingSink::default();

        match execute(
            &ctx(ActionKind::StopIdleDeployments, &targets, &params, &sink),
            &collaborators(compute),
        )
        .await
        {
            Outcome::Failure(f) => {
                assert_eq!(f.kind, FailureKind::External);
                assert!(f.message.contains("i-missing"));
            }
            Outcome::Success(_) => panic!("expected failure"),
        }
    }
}
