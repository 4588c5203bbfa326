//! Health verification window.
//!
//! After a deploy the endpoint is probed at a fixed interval until it
//! answers 2xx or the window elapses. Each probe has its own timeout so a
//! hung endpoint costs one probe, not the whole window.

use std::time::Duration;

use tracing::{debug, warn};

use deploy_core::HealthReport;

use crate::contract::{FailureKind, HealthProbe, HealthSample, Outcome, PhaseFailure};

/// Result of a single probe as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint returned 2xx.
    Healthy(HealthSample),
    /// The endpoint answered with a non-2xx status.
    Unhealthy(HealthSample),
    /// The probe could not be executed (connection error or probe timeout).
    Failed,
}

/// Tracks probe results across one verification window.
#[derive(Debug)]
pub struct HealthTracker {
    probes: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
    /// Successes in a row required to call the endpoint healthy.
    healthy_threshold: u32,
    last_sample: Option<HealthSample>,
}

impl HealthTracker {
    pub fn new(healthy_threshold: u32) -> Self {
        Self {
            probes: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            healthy_threshold: healthy_threshold.max(1),
            last_sample: None,
        }
    }

    /// Record a probe result. Returns true once the endpoint counts as healthy.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        self.probes += 1;
        match result {
            ProbeResult::Healthy(sample) => {
                self.last_sample = Some(sample);
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
            }
            ProbeResult::Unhealthy(sample) => {
                self.last_sample = Some(sample);
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
            }
            ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
            }
        }
        self.is_healthy()
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_successes >= self.healthy_threshold
    }

    pub fn probes(&self) -> u32 {
        self.probes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_status(&self) -> Option<u16> {
        self.last_sample.map(|s| s.status_code)
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status_code: self.last_status(),
            latency_ms: self
                .last_sample
                .map(|s| s.latency.as_millis() as u64)
                .unwrap_or_default(),
            probes: self.probes,
        }
    }
}

/// Parameters of one verification window.
#[derive(Debug, Clone)]
pub struct HealthWindow {
    pub url: String,
    pub path: String,
    /// Total time the endpoint has to turn healthy.
    pub window: Duration,
    /// Pause between probes.
    pub interval: Duration,
    /// Timeout of a single probe.
    pub probe_timeout: Duration,
    /// Consecutive 2xx answers required.
    pub healthy_threshold: u32,
}

/// Probe until healthy or until the window elapses.
///
/// Elapsing is reported as a retryable failure: polling has no side
/// effects, so another window is safe.
pub async fn poll_until_healthy(probe: &dyn HealthProbe, window: &HealthWindow) -> Outcome<HealthReport> {
    let mut tracker = HealthTracker::new(window.healthy_threshold);

    let polled = tokio::time::timeout(window.window, poll(probe, window, &mut tracker)).await;

    match polled {
        Ok(()) => {
            debug!(url = %window.url, probes = tracker.probes(), "endpoint healthy");
            Outcome::Success(tracker.report())
        }
        Err(_) => {
            let (kind, message) = match tracker.last_status() {
                Some(status) => (
                    FailureKind::Unhealthy,
                    format!(
                        "{}{} returned {status} on the last of {} probe(s) within {:?}",
                        window.url,
                        window.path,
                        tracker.probes(),
                        window.window
                    ),
                ),
                None => (
                    FailureKind::Timeout,
                    format!(
                        "{}{} never answered within {:?} ({} probe(s))",
                        window.url,
                        window.path,
                        window.window,
                        tracker.probes()
                    ),
                ),
            };
            warn!(url = %window.url, probes = tracker.probes(), "health window elapsed");
            Outcome::Failure(PhaseFailure {
                kind,
                message,
                retryable: true,
            })
        }
    }
}

async fn poll(probe: &dyn HealthProbe, window: &HealthWindow, tracker: &mut HealthTracker) {
    loop {
        let result = match tokio::time::timeout(
            window.probe_timeout,
            probe.check(&window.url, &window.path, window.probe_timeout),
        )
        .await
        {
            Ok(Ok(sample)) if sample.is_healthy() => ProbeResult::Healthy(sample),
            Ok(Ok(sample)) => {
                debug!(status = sample.status_code, url = %window.url, "health probe non-2xx");
                ProbeResult::Unhealthy(sample)
            }
            Ok(Err(err)) => {
                debug!(error = %err, url = %window.url, "health probe failed");
                ProbeResult::Failed
            }
            Err(_) => {
                debug!(url = %window.url, "health probe timed out");
                ProbeResult::Failed
            }
        };

        if tracker.record(result) {
            return;
        }
        if tracker.consecutive_failures() > 0 {
            debug!(
                url = %window.url,
                failures = tracker.consecutive_failures(),
                "endpoint not healthy yet"
            );
        }
        tokio::time::sleep(window.interval).await;
    }
}
