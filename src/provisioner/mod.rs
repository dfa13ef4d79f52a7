//! Environment provisioning
//!
//! Brings one service environment to a verified, runnable state:
//! - Pre-flight checks (credential, disk space, writable root) before any write
//! - All-or-nothing dependency steps, skipped when the installed version
//!   matches and the directories they build are still on disk
//! - Per-artifact download with checksum verification and atomic rename
//!
//! Every status change is committed to the [`StateStore`] before the next
//! step begins, so an interrupted run resumes from the last verified file.

pub mod checksum;
pub mod disk;
pub mod download;
pub mod progress;
pub mod retry;
pub mod steps;

pub use disk::{DiskSpace, SysinfoDiskSpace};
pub use download::{ArtifactBody, ArtifactSource, HttpArtifactSource};
pub use progress::{NullSink, ProgressEvent, ProgressPhase, ProgressSink};
pub use retry::RetryManager;
pub use steps::{ProcessStepRunner, StepRunner};

use crate::config::Config;
use crate::errors::{OrchestratorError, Result};
use crate::registry::ServiceDescriptor;
use crate::state::{EnvironmentState, EnvironmentStatus, StateStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a provisioning run should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionMode {
    Install,
    Repair,
    CleanReinstall,
    Uninstall,
}

impl fmt::Display for ProvisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProvisionMode::Install => "install",
            ProvisionMode::Repair => "repair",
            ProvisionMode::CleanReinstall => "clean reinstall",
            ProvisionMode::Uninstall => "uninstall",
        };
        f.write_str(text)
    }
}

/// Creates, repairs and removes service environments
pub struct EnvironmentProvisioner {
    store: Arc<StateStore>,
    source: Arc<dyn ArtifactSource>,
    steps: Arc<dyn StepRunner>,
    space: Arc<dyn DiskSpace>,
    retry: RetryManager,
    credential: Option<String>,
    credential_var: String,
}

impl EnvironmentProvisioner {
    /// Provisioner wired to the network, real processes and real disks
    pub fn new(store: Arc<StateStore>, config: &Config) -> Result<Self> {
        let source = HttpArtifactSource::new(Duration::from_secs(config.download.timeout_secs))?;

        Ok(Self {
            store,
            source: Arc::new(source),
            steps: Arc::new(ProcessStepRunner),
            space: Arc::new(SysinfoDiskSpace),
            retry: RetryManager::from_config(&config.download),
            credential: config.credential(),
            credential_var: config.credentials.token_env.clone(),
        })
    }

    pub fn with_source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_step_runner(mut self, steps: Arc<dyn StepRunner>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_disk_space(mut self, space: Arc<dyn DiskSpace>) -> Self {
        self.space = space;
        self
    }

    pub fn with_retry(mut self, retry: RetryManager) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential;
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Run one provisioning pass for a service
    pub async fn provision(
        &self,
        descriptor: &ServiceDescriptor,
        mode: ProvisionMode,
        sink: &dyn ProgressSink,
    ) -> Result<EnvironmentState> {
        match mode {
            ProvisionMode::Uninstall => {
                self.uninstall(descriptor, sink).await?;
                Ok(EnvironmentState::missing())
            }
            ProvisionMode::CleanReinstall => {
                // Nothing is deleted unless the fresh install could start
                self.store.refresh()?;
                self.reinstall_preflight(descriptor)?;
                self.uninstall(descriptor, sink).await?;
                self.install(descriptor, mode, sink).await
            }
            ProvisionMode::Install | ProvisionMode::Repair => {
                self.install(descriptor, mode, sink).await
            }
        }
    }

    async fn install(
        &self,
        descriptor: &ServiceDescriptor,
        mode: ProvisionMode,
        sink: &dyn ProgressSink,
    ) -> Result<EnvironmentState> {
        let service = descriptor.id;
        self.store.refresh()?;
        let current = self.store.get(service);
        let missing_dirs = descriptor.missing_dependency_dirs();
        if current.installed_version.is_some() && !missing_dirs.is_empty() {
            warn!(
                service = %service,
                missing = ?missing_dirs,
                "dependency set recorded but not on disk, reinstalling"
            );
        }
        let version_current = current.installed_version.as_deref() == Some(descriptor.version.as_str())
            && missing_dirs.is_empty();

        if current.is_ready() && version_current {
            match self.reverify(descriptor, &current, sink).await {
                Ok(state) => return Ok(state),
                Err(reason) => {
                    warn!(service = %service, %reason, "ready environment failed re-verification, repairing");
                }
            }
        }

        self.preflight(descriptor, mode, &current, version_current)?;

        let mut state = current.clone();
        state.status = EnvironmentStatus::Provisioning;
        state.last_error = None;
        self.store.put(service, state.clone())?;

        info!(service = %service, mode = %mode, "provisioning environment");

        if !version_current {
            if let Err(e) = self.install_dependencies(descriptor, sink).await {
                // A new dependency set invalidates previously installed code.
                state.installed_version = None;
                return self.fail(descriptor, state, e);
            }
            state.installed_version = Some(descriptor.version.clone());
            self.store.put(service, state.clone())?;
        } else {
            sink.emit(ProgressEvent::skipped(service, "dependencies"));
        }

        debug!(
            service = %service,
            artifacts = descriptor.artifacts.len(),
            attempts = self.retry.max_attempts(),
            max_backoff_ms = self.retry.max_total_wait_time().as_millis() as u64,
            "checking artifacts"
        );
        for artifact in &descriptor.artifacts {
            let path = descriptor.artifact_path(artifact);

            if path.exists() {
                let actual = match checksum::sha256_file(&path).await {
                    Ok(digest) => digest,
                    Err(e) => return self.fail(descriptor, state, e.into()),
                };
                if checksum::digests_match(&artifact.sha256, &actual) {
                    state.verified_artifacts.insert(artifact.name.clone(), actual);
                    sink.emit(ProgressEvent::skipped(service, &artifact.name));
                    continue;
                }
                warn!(service = %service, artifact = %artifact.name, "on-disk artifact has wrong checksum, fetching again");
                state.verified_artifacts.remove(&artifact.name);
            }

            sink.emit(ProgressEvent::started(service, &artifact.name));
            let source = self.source.as_ref();
            let credential = self.credential.as_deref();
            let destination = path.as_path();
            let result = self
                .retry
                .execute_with_retry(move || {
                    download::download_artifact(source, service, artifact, destination, credential, sink)
                })
                .await;

            match result {
                Ok(digest) => {
                    state.verified_artifacts.insert(artifact.name.clone(), digest);
                    self.store.put(service, state.clone())?;
                    sink.emit(ProgressEvent::finished(service, &artifact.name));
                }
                Err(e) => return self.fail(descriptor, state, e),
            }
        }

        // Drop digests for artifacts no longer in the manifest
        state
            .verified_artifacts
            .retain(|name, _| descriptor.artifacts.iter().any(|a| &a.name == name));

        let ready = EnvironmentState::ready(descriptor.version.clone(), state.verified_artifacts);
        self.store.put(service, ready.clone())?;
        info!(service = %service, artifacts = descriptor.artifacts.len(), "environment ready");

        Ok(ready)
    }

    /// Cheap repair check for an environment already marked Ready
    async fn reverify(
        &self,
        descriptor: &ServiceDescriptor,
        current: &EnvironmentState,
        sink: &dyn ProgressSink,
    ) -> std::result::Result<EnvironmentState, String> {
        let mut verified = BTreeMap::new();

        for artifact in &descriptor.artifacts {
            let path = descriptor.artifact_path(artifact);
            let actual = checksum::sha256_file(&path)
                .await
                .map_err(|e| format!("{}: {}", artifact.name, e))?;
            if !checksum::digests_match(&artifact.sha256, &actual) {
                return Err(format!("{}: checksum changed on disk", artifact.name));
            }
            verified.insert(artifact.name.clone(), actual);
            sink.emit(ProgressEvent::skipped(descriptor.id, &artifact.name));
        }

        let mut state = current.clone();
        state.verified_artifacts = verified;
        state.last_verified_at = Some(Utc::now());
        self.store.put(descriptor.id, state.clone()).map_err(|e| e.to_string())?;

        info!(service = %descriptor.id, "environment verified");
        Ok(state)
    }

    /// Checks that must pass before anything is written for this service
    fn preflight(
        &self,
        descriptor: &ServiceDescriptor,
        mode: ProvisionMode,
        current: &EnvironmentState,
        version_current: bool,
    ) -> Result<()> {
        let service = descriptor.id;

        let needs_token = descriptor
            .artifacts
            .iter()
            .any(|a| a.gated && !descriptor.artifact_path(a).exists());
        if needs_token && self.credential.is_none() {
            return Err(OrchestratorError::MissingCredential {
                service,
                variable: self.credential_var.clone(),
            });
        }

        let fresh_install = matches!(mode, ProvisionMode::Install | ProvisionMode::CleanReinstall)
            && (!version_current || current.status == EnvironmentStatus::Missing);
        if fresh_install {
            if let Some(available) = self.space.available_bytes(&descriptor.environment_dir) {
                if available < descriptor.required_disk_bytes {
                    return Err(OrchestratorError::InsufficientDiskSpace {
                        service,
                        required: descriptor.required_disk_bytes,
                        available,
                    });
                }
            } else {
                warn!(service = %service, "could not determine free disk space, continuing");
            }
        }

        std::fs::create_dir_all(&descriptor.environment_dir).map_err(|e| {
            OrchestratorError::InstallRootUnwritable {
                path: descriptor.environment_dir.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(())
    }

    /// Checks for a clean reinstall, run while the old environment still exists
    fn reinstall_preflight(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        if descriptor.has_gated_artifacts() && self.credential.is_none() {
            return Err(OrchestratorError::MissingCredential {
                service: descriptor.id,
                variable: self.credential_var.clone(),
            });
        }

        let root = descriptor
            .environment_dir
            .parent()
            .unwrap_or(descriptor.environment_dir.as_path());
        std::fs::create_dir_all(root).map_err(|e| OrchestratorError::InstallRootUnwritable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        let marker = root.join(".gary4local_write_test");
        std::fs::write(&marker, b"").map_err(|e| OrchestratorError::InstallRootUnwritable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        let _ = std::fs::remove_file(&marker);
        Ok(())
    }

    async fn install_dependencies(
        &self,
        descriptor: &ServiceDescriptor,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        for step in &descriptor.dependencies {
            sink.emit(ProgressEvent::started(descriptor.id, &step.name));
            if let Some(dir) = &step.creates {
                match tokio::fs::remove_dir_all(dir).await {
                    Ok(()) => debug!(service = %descriptor.id, step = %step.name, path = %dir.display(), "removed leftover output"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(OrchestratorError::DependencyInstallFailed {
                            service: descriptor.id,
                            step: step.name.clone(),
                            reason: format!("cannot clear {}: {}", dir.display(), e),
                        })
                    }
                }
            }
            self.steps
                .run(step)
                .await
                .map_err(|reason| OrchestratorError::DependencyInstallFailed {
                    service: descriptor.id,
                    step: step.name.clone(),
                    reason,
                })?;
            sink.emit(ProgressEvent::finished(descriptor.id, &step.name));
        }
        Ok(())
    }

    /// Record a failed run as Broken and hand the error back
    fn fail(
        &self,
        descriptor: &ServiceDescriptor,
        mut state: EnvironmentState,
        error: OrchestratorError,
    ) -> Result<EnvironmentState> {
        warn!(service = %descriptor.id, error = %error, "provisioning failed");
        state.status = EnvironmentStatus::Broken;
        state.last_error = Some(error.to_string());
        self.store.put(descriptor.id, state)?;
        Err(error)
    }

    /// Remove the environment directory; already absent is success
    async fn uninstall(&self, descriptor: &ServiceDescriptor, sink: &dyn ProgressSink) -> Result<()> {
        let service = descriptor.id;
        self.store.refresh()?;
        sink.emit(ProgressEvent::started(service, "remove environment"));

        match tokio::fs::remove_dir_all(&descriptor.environment_dir).await {
            Ok(()) => info!(service = %service, path = %descriptor.environment_dir.display(), "environment removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(OrchestratorError::InstallRootUnwritable {
                    path: descriptor.environment_dir.clone(),
                    reason: e.to_string(),
                })
            }
        }

        self.store.remove(service)?;
        sink.emit(ProgressEvent::finished(service, "remove environment"));
        Ok(())
    }
}
