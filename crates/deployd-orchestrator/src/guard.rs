//! Concurrency guard.
//!
//! Admission keys are held in a process-wide set. A key is taken at
//! admission and given back when its [`Lease`] is dropped, which the
//! controller and runner do only after the terminal ledger write.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use deploy_core::{ActionKind, DeploymentId};

use crate::error::AdmissionError;

/// What a lease locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GuardKey {
    /// The single active pipeline for a deployment.
    Pipeline(DeploymentId),
    /// One action kind against one deployment.
    Action(DeploymentId, ActionKind),
}

impl fmt::Display for GuardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline(deployment) => write!(f, "pipeline for {deployment}"),
            Self::Action(deployment, kind) => write!(f, "{kind} on {deployment}"),
        }
    }
}

#[derive(Clone, Default)]
pub struct ConcurrencyGuard {
    held: Arc<Mutex<HashSet<GuardKey>>>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: GuardKey) -> Result<Lease, AdmissionError> {
        self.try_acquire_all(vec![key])
    }

    /// Take every key or none of them.
    pub fn try_acquire_all(&self, keys: Vec<GuardKey>) -> Result<Lease, AdmissionError> {
        let mut held = self.lock();
        if let Some(taken) = keys.iter().find(|k| held.contains(*k)) {
            return Err(AdmissionError::Busy(format!("{taken} is already active")));
        }
        let mut unique = Vec::with_capacity(keys.len());
        for key in keys {
            if held.insert(key.clone()) {
                unique.push(key);
            }
        }
        Ok(Lease {
            held: self.held.clone(),
            keys: unique,
        })
    }

    pub fn is_held(&self, key: &GuardKey) -> bool {
        self.lock().contains(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<GuardKey>> {
        // The set stays consistent even if a holder panicked mid-insert.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held admission keys. Released on drop.
#[must_use = "dropping the lease releases the keys immediately"]
pub struct Lease {
    held: Arc<Mutex<HashSet<GuardKey>>>,
    keys: Vec<GuardKey>,
}

impl Lease {
    pub fn keys(&self) -> &[GuardKey] {
        &self.keys
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for key in &self.keys {
            held.remove(key);
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("keys", &self.keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(id: &str) -> GuardKey {
        GuardKey::Pipeline(id.to_string())
    }

    #[test]
    fn second_acquire_is_busy_until_drop() {
        let guard = ConcurrencyGuard::new();
        let lease = guard.try_acquire(pipeline("shop-api")).unwrap();
        let err = guard.try_acquire(pipeline("shop-api")).unwrap_err();
        assert!(matches!(err, AdmissionError::Busy(_)));
        assert!(err.to_string().contains("pipeline for shop-api"));

        drop(lease);
        assert!(!guard.is_held(&pipeline("shop-api")));
        assert!(guard.try_acquire(pipeline("shop-api")).is_ok());
    }

    #[test]
    fn different_deployments_do_not_conflict() {
        let guard = ConcurrencyGuard::new();
        let _a = guard.try_acquire(pipeline("a")).unwrap();
        let _b = guard.try_acquire(pipeline("b")).unwrap();
    }

    #[test]
    fn action_and_pipeline_keys_are_separate() {
        let guard = ConcurrencyGuard::new();
        let _p = guard.try_acquire(pipeline("a")).unwrap();
        let _s = guard
            .try_acquire(GuardKey::Action("a".to_string(), ActionKind::ScaleInstance))
            .unwrap();
        let _r = guard
            .try_acquire(GuardKey::Action("a".to_string(), ActionKind::RestartInstance))
            .unwrap();
    }

    #[test]
    fn multi_key_acquire_is_all_or_nothing() {
        let guard = ConcurrencyGuard::new();
        let stop = |id: &str| GuardKey::Action(id.to_string(), ActionKind::StopIdleDeployments);
        let _b = guard.try_acquire(stop("b")).unwrap();

        let err = guard.try_acquire_all(vec![stop("a"), stop("b"), stop("c")]);
        assert!(err.is_err());
        assert!(!guard.is_held(&stop("a")));
        assert!(!guard.is_held(&stop("c")));
    }

    #[test]
    fn duplicate_keys_in_one_request_are_folded() {
        let guard = ConcurrencyGuard::new();
        let lease = guard.try_acquire_all(vec![pipeline("a"), pipeline("a")]).unwrap();
        assert_eq!(lease.keys().len(), 1);
        drop(lease);
        assert!(!guard.is_held(&pipeline("a")));
    }
}
