//! Collaborator contracts and the adapter outcome type.
//!
//! Collaborators are the external systems the core drives but never
//! implements: scanner, image builder, compute control plane, health
//! endpoint, and repository metadata. They are trait objects so the
//! orchestrator can be wired against real clients or test fakes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use deploy_core::{
    BuiltImage, DeployedContainer, RepositoryMetadata, RepositoryRef, RolloutStrategy, ScanReport,
};

/// Boxed future returned by collaborator methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A collaborator call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
    /// Whether the same call may be issued again safely.
    pub retryable: bool,
}

impl CollaboratorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

pub type CallResult<T> = Result<T, CollaboratorError>;

/// Vulnerability scanner.
pub trait Scanner: Send + Sync {
    fn scan<'a>(&'a self, target: &'a RepositoryRef) -> BoxFuture<'a, CallResult<ScanReport>>;
}

/// Container image builder.
pub trait ImageBuilder: Send + Sync {
    fn build<'a>(
        &'a self,
        source: &'a RepositoryRef,
        tag: &'a str,
    ) -> BoxFuture<'a, CallResult<BuiltImage>>;
}

/// Lifecycle state of a compute instance as reported by `describe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Unknown,
}

/// Result of `ComputeApi::describe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub instance: String,
    pub state: InstanceState,
    pub instance_type: String,
}

/// Compute control plane.
pub trait ComputeApi: Send + Sync {
    /// Run `image` on `instance`. Used for both deploy and rollback.
    fn deploy<'a>(
        &'a self,
        instance: &'a str,
        image: &'a str,
        port: u16,
        strategy: &'a RolloutStrategy,
    ) -> BoxFuture<'a, CallResult<DeployedContainer>>;

    fn stop<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, CallResult<()>>;

    fn start<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, CallResult<()>>;

    fn describe<'a>(&'a self, instance: &'a str) -> BoxFuture<'a, CallResult<InstanceDescription>>;

    /// Change the instance size. The instance must be stopped.
    fn resize<'a>(
        &'a self,
        instance: &'a str,
        instance_type: &'a str,
    ) -> BoxFuture<'a, CallResult<()>>;
}

/// One health probe response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSample {
    pub status_code: u16,
    pub latency: Duration,
}

impl HealthSample {
    pub fn is_healthy(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Health-check half of the compute contract.
pub trait HealthProbe: Send + Sync {
    /// Probe `url` + `path` once, giving up after `timeout`.
    fn check<'a>(
        &'a self,
        url: &'a str,
        path: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, CallResult<HealthSample>>;
}

/// Read-only repository metadata. Never gates a run.
pub trait RepositoryReader: Send + Sync {
    fn describe<'a>(
        &'a self,
        repository: &'a RepositoryRef,
    ) -> BoxFuture<'a, CallResult<RepositoryMetadata>>;
}

/// The set of collaborators adapters call through.
#[derive(Clone)]
pub struct Collaborators {
    pub scanner: Arc<dyn Scanner>,
    pub builder: Arc<dyn ImageBuilder>,
    pub compute: Arc<dyn ComputeApi>,
    pub health: Arc<dyn HealthProbe>,
    pub repository: Arc<dyn RepositoryReader>,
}

/// How a phase failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The deadline elapsed before the collaborator answered.
    Timeout,
    /// The collaborator answered with an error.
    External,
    /// The health endpoint never returned 2xx within the window.
    Unhealthy,
}

/// A classified phase failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl PhaseFailure {
    pub fn timeout(what: &str, deadline: Duration, retryable: bool) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("{what} did not finish within {deadline:?}"),
            retryable,
        }
    }
}

impl From<CollaboratorError> for PhaseFailure {
    fn from(err: CollaboratorError) -> Self {
        Self {
            kind: FailureKind::External,
            message: err.message,
            retryable: err.retryable,
        }
    }
}

/// What every adapter returns. No error crosses the adapter boundary
/// any other way.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failure(PhaseFailure),
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Success(v) => Outcome::Success(f(v)),
            Self::Failure(e) => Outcome::Failure(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Run `call` under `deadline`, classifying the result.
pub async fn bounded<T, F>(what: &str, deadline: Duration, retryable_on_timeout: bool, call: F) -> Outcome<T>
where
    F: Future<Output = CallResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(value)) => Outcome::Success(value),
        Ok(Err(err)) => Outcome::Failure(err.into()),
        Err(_) => Outcome::Failure(PhaseFailure::timeout(what, deadline, retryable_on_timeout)),
    }
}
