//! Control centre
//!
//! Long-running front end over the supervisor. Forwards start/stop
//! requests per service and aggregates environment and runtime status
//! into one view. A port that is bound while nothing is supervised is
//! reported as external and never touched.

pub mod commands;

pub use commands::ControlCommand;

use crate::errors::Result;
use crate::registry::{ServiceId, ServiceRegistry};
use crate::state::{EnvironmentStatus, StateStore};
use crate::supervisor::{port_is_bound, ProcessSupervisor, RuntimeStatus, ServiceHandle};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One line of the aggregated status view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRow {
    pub service: ServiceId,
    pub port: u16,
    pub environment: EnvironmentStatus,
    pub installed_version: Option<String>,
    pub runtime: RuntimeStatus,
    /// Port held by a process this control centre did not start
    pub external: bool,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
}

impl ServiceRow {
    /// Short status label for display
    pub fn label(&self) -> String {
        if self.external {
            "external".to_string()
        } else {
            self.runtime.to_string()
        }
    }
}

/// Rolled-up status across all services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverallStatus {
    /// Every installed service is serving
    AllRunning,
    /// Some services are serving
    Partial,
    /// Nothing is serving
    NoneRunning,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OverallStatus::AllRunning => "all services running",
            OverallStatus::Partial => "some services running",
            OverallStatus::NoneRunning => "no services running",
        };
        f.write_str(text)
    }
}

pub struct ControlCenter {
    registry: Arc<ServiceRegistry>,
    store: Arc<StateStore>,
    supervisor: Arc<ProcessSupervisor>,
    grace: Duration,
}

impl ControlCenter {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        store: Arc<StateStore>,
        supervisor: Arc<ProcessSupervisor>,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            supervisor,
            grace,
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub async fn start(&self, service: ServiceId) -> Result<ServiceHandle> {
        let descriptor = self.registry.require(service)?;
        self.supervisor.start(descriptor).await
    }

    pub async fn stop(&self, service: ServiceId) -> Result<()> {
        self.registry.require(service)?;
        self.supervisor.stop(&ServiceHandle::new(service), self.grace).await
    }

    pub async fn restart(&self, service: ServiceId) -> Result<ServiceHandle> {
        info!(service = %service, "restarting service");
        self.stop(service).await?;
        self.start(service).await
    }

    /// Start every Ready service; the others are reported, not attempted
    pub async fn start_all(&self) -> Vec<(ServiceId, Result<ServiceHandle>)> {
        let mut results = Vec::new();
        for service in self.registry.ids() {
            let result = self.start(service).await;
            if let Err(e) = &result {
                warn!(service = %service, error = %e, "start failed");
            }
            results.push((service, result));
        }
        results
    }

    pub async fn stop_all(&self) -> Vec<(ServiceId, Result<()>)> {
        self.supervisor.stop_all(self.grace).await
    }

    /// Aggregated view, re-probing ports of unsupervised services
    pub async fn snapshot(&self) -> Vec<ServiceRow> {
        let mut rows = Vec::with_capacity(self.registry.len());

        // Pick up installs and uninstalls run from the CLI meanwhile
        if let Err(e) = self.store.refresh() {
            warn!(error = %e, "cannot re-read environment state, showing last known");
        }

        for runtime in self.supervisor.statuses() {
            let Some(descriptor) = self.registry.get(runtime.service) else {
                continue;
            };
            let environment = self.store.get(runtime.service);
            let external = !runtime.status.is_active()
                && runtime.pid.is_none()
                && port_is_bound(descriptor.port).await;

            rows.push(ServiceRow {
                service: runtime.service,
                port: descriptor.port,
                environment: environment.status,
                installed_version: environment.installed_version,
                runtime: runtime.status,
                external,
                pid: runtime.pid,
                last_error: runtime.last_error.or(environment.last_error),
            });
        }

        rows
    }

    /// Roll rows up into one status
    pub fn overall(rows: &[ServiceRow]) -> OverallStatus {
        let serving = |r: &ServiceRow| r.runtime == RuntimeStatus::Running || r.external;
        let installed: Vec<&ServiceRow> = rows
            .iter()
            .filter(|r| r.environment == EnvironmentStatus::Ready || r.external)
            .collect();
        let running = rows.iter().filter(|r| serving(r)).count();

        if running == 0 {
            OverallStatus::NoneRunning
        } else if !installed.is_empty() && installed.iter().all(|r| serving(r)) {
            OverallStatus::AllRunning
        } else {
            OverallStatus::Partial
        }
    }

    /// Recent output lines of one service
    pub fn logs(&self, service: ServiceId) -> Result<Vec<String>> {
        Ok(self.supervisor.status(&ServiceHandle::new(service))?.log_tail)
    }
}
