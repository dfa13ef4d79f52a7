//! Installation transactions
//!
//! Drives the provisioner across every service, one at a time, and
//! aggregates per-service outcomes into one result:
//! - Install/Repair/CleanReinstall continue past per-service failures
//! - Uninstall stops all services first, then attempts every deletion
//! - Nothing is deleted while its port is still held by a live process
//! - Cancellation is honoured between services, never mid-download

use crate::errors::{OrchestratorError, Result};
use crate::provisioner::{EnvironmentProvisioner, ProgressSink, ProvisionMode};
use crate::registry::{ServiceId, ServiceRegistry};
use crate::state::EnvironmentStatus;
use crate::supervisor::{port_is_bound, ProcessSupervisor, ServiceHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Exit code reported for a cancelled run
pub const EXIT_CANCELLED: i32 = 130;

/// Ordered list of services to process in one mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationPlan {
    pub mode: ProvisionMode,
    pub steps: Vec<ServiceId>,
}

impl InstallationPlan {
    /// Every registered service, in registry order
    pub fn for_all(registry: &ServiceRegistry, mode: ProvisionMode) -> Self {
        Self {
            mode,
            steps: registry.ids(),
        }
    }

    pub fn for_services(mode: ProvisionMode, services: Vec<ServiceId>) -> Self {
        Self { mode, steps: services }
    }
}

/// Lifecycle of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed | TransactionState::Failed | TransactionState::Cancelled
        )
    }

    /// Pending -> Running -> {Completed, Failed, Cancelled}
    pub fn transition(&self, to: TransactionState) -> Result<TransactionState> {
        use TransactionState::*;

        match (self, to) {
            (Pending, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled) => Ok(to),
            (from, to) => Err(OrchestratorError::InvalidTransition {
                from: format!("{:?}", from),
                to: format!("{:?}", to),
                reason: "transactions only move forward from Pending through Running".to_string(),
            }),
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared flag set from outside (Ctrl-C) and checked between steps
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceOutcome {
    pub service: ServiceId,
    /// Environment status after the step, or None if it never ran
    pub status: Option<EnvironmentStatus>,
    pub error: Option<String>,
}

impl ServiceOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.status.is_some()
    }
}

/// Aggregate result of a transaction
#[derive(Debug, Clone, Serialize)]
pub struct TransactionResult {
    pub id: Uuid,
    pub mode: ProvisionMode,
    pub state: TransactionState,
    pub outcomes: Vec<ServiceOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TransactionResult {
    /// Services this run left Ready without an error
    pub fn ready_services(&self) -> Vec<ServiceId> {
        self.outcomes
            .iter()
            .filter(|o| o.error.is_none() && o.status == Some(EnvironmentStatus::Ready))
            .map(|o| o.service)
            .collect()
    }

    pub fn failed_services(&self) -> Vec<ServiceId> {
        self.outcomes
            .iter()
            .filter(|o| o.error.is_some())
            .map(|o| o.service)
            .collect()
    }

    /// Process exit code for the provisioning entry point.
    ///
    /// Any Ready service makes an install run a success, cancelled or not;
    /// a cancelled run with nothing Ready reports [`EXIT_CANCELLED`].
    pub fn exit_code(&self) -> i32 {
        match self.mode {
            ProvisionMode::Uninstall => {
                if self.failed_services().is_empty() {
                    0
                } else {
                    1
                }
            }
            _ => {
                if !self.ready_services().is_empty() {
                    0
                } else if self.state == TransactionState::Cancelled {
                    EXIT_CANCELLED
                } else {
                    1
                }
            }
        }
    }

    /// The aggregated error for a run that did not fully succeed
    pub fn failure(&self) -> Option<OrchestratorError> {
        if self.state == TransactionState::Cancelled {
            return Some(OrchestratorError::Cancelled);
        }
        let failed = self.failed_services();
        if failed.is_empty() {
            return None;
        }
        Some(OrchestratorError::TransactionPartialFailure {
            failed,
            succeeded: self.ready_services(),
        })
    }
}

/// Coordinates one provisioning run across services
pub struct InstallationTransaction<'a> {
    registry: &'a ServiceRegistry,
    provisioner: &'a EnvironmentProvisioner,
    supervisor: Option<&'a ProcessSupervisor>,
    cancel: CancellationFlag,
    grace: Duration,
    state: TransactionState,
}

impl<'a> InstallationTransaction<'a> {
    pub fn new(registry: &'a ServiceRegistry, provisioner: &'a EnvironmentProvisioner) -> Self {
        Self {
            registry,
            provisioner,
            supervisor: None,
            cancel: CancellationFlag::new(),
            grace: Duration::from_secs(5),
            state: TransactionState::Pending,
        }
    }

    /// Services are stopped through this supervisor before uninstalling
    pub fn with_supervisor(mut self, supervisor: &'a ProcessSupervisor, grace: Duration) -> Self {
        self.supervisor = Some(supervisor);
        self.grace = grace;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Execute the plan. Only fatal errors (unwritable root, corrupt state)
    /// come back as `Err`; service failures are folded into the result.
    pub async fn run(mut self, plan: InstallationPlan, sink: &dyn ProgressSink) -> Result<TransactionResult> {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        self.state = self.state.transition(TransactionState::Running)?;
        info!(transaction = %id, mode = %plan.mode, services = plan.steps.len(), "transaction started");

        let outcomes = if plan.mode == ProvisionMode::Uninstall {
            self.run_uninstall(&plan, sink).await?
        } else {
            self.run_install(&plan, sink).await?
        };

        let cancelled = plan.mode != ProvisionMode::Uninstall
            && outcomes.iter().any(|o| o.status.is_none() && o.error.is_none());

        let final_state = if cancelled {
            TransactionState::Cancelled
        } else {
            let all_failed = !outcomes.is_empty() && outcomes.iter().all(|o| o.error.is_some());
            let any_failed = outcomes.iter().any(|o| o.error.is_some());
            if (plan.mode == ProvisionMode::Uninstall && any_failed) || all_failed {
                TransactionState::Failed
            } else {
                TransactionState::Completed
            }
        };
        self.state = self.state.transition(final_state)?;

        let result = TransactionResult {
            id,
            mode: plan.mode,
            state: self.state,
            outcomes,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            transaction = %id,
            state = %result.state,
            ready = result.ready_services().len(),
            failed = result.failed_services().len(),
            "transaction finished"
        );
        Ok(result)
    }

    /// Services whose environment may not be deleted yet, with the reason
    async fn blocked_by_live_process(
        &self,
        plan: &InstallationPlan,
        stop_failures: BTreeMap<ServiceId, String>,
    ) -> Result<BTreeMap<ServiceId, String>> {
        let mut blocked = stop_failures;
        for service in &plan.steps {
            if blocked.contains_key(service) {
                continue;
            }
            let descriptor = self.registry.require(*service)?;
            if port_is_bound(descriptor.port).await {
                // Not ours to stop; deleting under it would leave it half-broken
                let e = OrchestratorError::PortInUse {
                    service: *service,
                    port: descriptor.port,
                };
                warn!(service = %service, port = descriptor.port, "environment in use by an unsupervised process");
                blocked.insert(*service, e.to_string());
            }
        }
        Ok(blocked)
    }

    async fn run_install(&self, plan: &InstallationPlan, sink: &dyn ProgressSink) -> Result<Vec<ServiceOutcome>> {
        let mut outcomes = Vec::with_capacity(plan.steps.len());

        let blocked = if plan.mode == ProvisionMode::CleanReinstall {
            let mut stop_failures = BTreeMap::new();
            if let Some(supervisor) = self.supervisor {
                for service in &plan.steps {
                    if let Err(e) = supervisor.stop(&ServiceHandle::new(*service), self.grace).await {
                        stop_failures.insert(*service, e.to_string());
                    }
                }
            }
            self.blocked_by_live_process(plan, stop_failures).await?
        } else {
            BTreeMap::new()
        };

        for service in &plan.steps {
            if let Some(reason) = blocked.get(service) {
                outcomes.push(ServiceOutcome {
                    service: *service,
                    status: Some(self.provisioner.store().get(*service).status),
                    error: Some(reason.clone()),
                });
                continue;
            }

            if self.cancel.is_cancelled() {
                warn!(service = %service, "transaction cancelled before this service");
                outcomes.push(ServiceOutcome {
                    service: *service,
                    status: None,
                    error: None,
                });
                continue;
            }

            let descriptor = self.registry.require(*service)?;
            match self.provisioner.provision(descriptor, plan.mode, sink).await {
                Ok(state) => outcomes.push(ServiceOutcome {
                    service: *service,
                    status: Some(state.status),
                    error: None,
                }),
                Err(e) if e.is_fatal() => {
                    error!(service = %service, error = %e, "fatal error, aborting transaction");
                    return Err(e);
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "service failed, continuing with the rest");
                    outcomes.push(ServiceOutcome {
                        service: *service,
                        status: Some(self.provisioner.store().get(*service).status),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(outcomes)
    }

    /// Best effort over every service; cancellation is not honoured here
    async fn run_uninstall(&self, plan: &InstallationPlan, sink: &dyn ProgressSink) -> Result<Vec<ServiceOutcome>> {
        let mut stop_failures = BTreeMap::new();
        if let Some(supervisor) = self.supervisor {
            for (service, result) in supervisor.stop_all(self.grace).await {
                if let Err(e) = result {
                    stop_failures.insert(service, e.to_string());
                }
            }
        }
        let blocked = self.blocked_by_live_process(plan, stop_failures).await?;

        let mut outcomes = Vec::with_capacity(plan.steps.len());
        for service in &plan.steps {
            if let Some(reason) = blocked.get(service) {
                outcomes.push(ServiceOutcome {
                    service: *service,
                    status: Some(self.provisioner.store().get(*service).status),
                    error: Some(reason.clone()),
                });
                continue;
            }

            let descriptor = self.registry.require(*service)?;
            let outcome = match self.provisioner.provision(descriptor, ProvisionMode::Uninstall, sink).await {
                Ok(state) => ServiceOutcome {
                    service: *service,
                    status: Some(state.status),
                    error: None,
                },
                Err(e) => {
                    warn!(service = %service, error = %e, "uninstall failed, continuing with the rest");
                    ServiceOutcome {
                        service: *service,
                        status: Some(self.provisioner.store().get(*service).status),
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(service: ServiceId, status: Option<EnvironmentStatus>, error: Option<&str>) -> ServiceOutcome {
        ServiceOutcome {
            service,
            status,
            error: error.map(str::to_string),
        }
    }

    fn result(mode: ProvisionMode, state: TransactionState, outcomes: Vec<ServiceOutcome>) -> TransactionResult {
        TransactionResult {
            id: Uuid::new_v4(),
            mode,
            state,
            outcomes,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_machine() {
        let s = TransactionState::Pending;
        let s = s.transition(TransactionState::Running).unwrap();
        assert!(s.transition(TransactionState::Completed).unwrap().is_terminal());
        assert!(TransactionState::Pending.transition(TransactionState::Completed).is_err());
        assert!(TransactionState::Completed.transition(TransactionState::Running).is_err());
    }

    #[test]
    fn test_partial_success_exit_code() {
        let r = result(
            ProvisionMode::Install,
            TransactionState::Completed,
            vec![
                outcome(ServiceId::Gary, Some(EnvironmentStatus::Ready), None),
                outcome(ServiceId::Terry, Some(EnvironmentStatus::Broken), Some("checksum mismatch")),
                outcome(ServiceId::Jerry, Some(EnvironmentStatus::Ready), None),
            ],
        );
        assert_eq!(r.exit_code(), 0);
        assert!(matches!(
            r.failure(),
            Some(OrchestratorError::TransactionPartialFailure { ref failed, .. }) if failed == &vec![ServiceId::Terry]
        ));
    }

    #[test]
    fn test_total_failure_exit_code() {
        let r = result(
            ProvisionMode::Install,
            TransactionState::Failed,
            vec![outcome(ServiceId::Gary, Some(EnvironmentStatus::Missing), Some("missing credential"))],
        );
        assert_eq!(r.exit_code(), 1);
    }

    #[test]
    fn test_uninstall_exit_code_requires_no_failures() {
        let clean = result(
            ProvisionMode::Uninstall,
            TransactionState::Completed,
            vec![outcome(ServiceId::Gary, Some(EnvironmentStatus::Missing), None)],
        );
        assert_eq!(clean.exit_code(), 0);

        let dirty = result(
            ProvisionMode::Uninstall,
            TransactionState::Failed,
            vec![
                outcome(ServiceId::Gary, Some(EnvironmentStatus::Missing), None),
                outcome(ServiceId::Terry, Some(EnvironmentStatus::Ready), Some("permission denied")),
            ],
        );
        assert_eq!(dirty.exit_code(), 1);
    }

    #[test]
    fn test_cancelled_exit_code() {
        let r = result(
            ProvisionMode::Install,
            TransactionState::Cancelled,
            vec![outcome(ServiceId::Gary, None, None)],
        );
        assert_eq!(r.exit_code(), EXIT_CANCELLED);
    }

    #[test]
    fn test_cancelled_after_a_ready_service_succeeds() {
        let r = result(
            ProvisionMode::Install,
            TransactionState::Cancelled,
            vec![
                outcome(ServiceId::Gary, Some(EnvironmentStatus::Ready), None),
                outcome(ServiceId::Terry, None, None),
                outcome(ServiceId::Jerry, None, None),
            ],
        );
        assert_eq!(r.exit_code(), 0);
        assert!(matches!(r.failure(), Some(OrchestratorError::Cancelled)));
    }

    #[test]
    fn test_cancellation_flag_shared() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
