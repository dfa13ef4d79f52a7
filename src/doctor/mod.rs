//! Doctor command for system diagnostics
//!
//! Checks the host prerequisites for the three backends: the Python
//! toolchain, git, a GPU, free space under the services root, the access
//! token, the persisted environment record and backing services such as
//! gary's redis.

use crate::config::Config;
use crate::provisioner::{DiskSpace, SysinfoDiskSpace};
use crate::registry::{Requirement, ServiceRegistry};
use crate::state::StateStore;
use crate::supervisor::port_is_bound;
use colored::*;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::System;
use tokio::process::Command;
use tokio::time::timeout;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

const GIB: u64 = 1024 * 1024 * 1024;

/// Required interpreter series
const PYTHON_SERIES: (u32, u32) = (3, 11);

/// Health check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Pass,
    Warn(String),
    Fail(String),
}

/// Individual health check
#[derive(Debug)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
}

impl HealthCheck {
    fn new(name: &str, status: HealthStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
        }
    }
}

/// Doctor diagnostics system
pub struct Doctor {
    python: String,
    git: String,
    services_dir: PathBuf,
    state_file: PathBuf,
    token_env: String,
    credential_present: bool,
    needs_credential: bool,
    ports: Vec<u16>,
    requirements: Vec<Requirement>,
    /// Largest single environment and the sum of all of them
    disk_required: (u64, u64),
}

impl Doctor {
    pub fn new(config: &Config, registry: &ServiceRegistry) -> Self {
        let largest = registry.iter().map(|d| d.required_disk_bytes).max().unwrap_or(0);
        let total = registry.iter().map(|d| d.required_disk_bytes).sum();
        let mut requirements: Vec<Requirement> = Vec::new();
        for requirement in registry.iter().flat_map(|d| d.requirements.iter()) {
            if !requirements.iter().any(|r| r.name == requirement.name) {
                requirements.push(requirement.clone());
            }
        }

        Self {
            python: config.paths.python.clone(),
            git: config.paths.git.clone(),
            services_dir: config.services_dir(),
            state_file: config.state_file(),
            token_env: config.credentials.token_env.clone(),
            credential_present: config.credential().is_some(),
            needs_credential: registry.iter().any(|d| d.has_gated_artifacts()),
            ports: registry.iter().map(|d| d.port).collect(),
            requirements,
            disk_required: (largest, total),
        }
    }

    /// Run all health checks
    pub async fn run_diagnostics(&self) -> Vec<HealthCheck> {
        vec![
            self.check_python().await,
            self.check_git().await,
            self.check_gpu().await,
            self.check_disk_space(),
            self.check_memory(),
            self.check_permissions(),
            self.check_credential(),
            self.check_state_file(),
            self.check_ports().await,
            self.check_requirements().await,
        ]
    }

    async fn check_python(&self) -> HealthCheck {
        let name = "Python 3.11";
        match query_version(&self.python, &["--version"]).await {
            Some(output) => match parse_python_version(&output) {
                Some(version) if version == PYTHON_SERIES => HealthCheck::new(name, HealthStatus::Pass),
                Some((major, minor)) => HealthCheck::new(
                    name,
                    HealthStatus::Fail(format!(
                        "{} is Python {}.{}, environments need 3.11.x",
                        self.python, major, minor
                    )),
                ),
                None => HealthCheck::new(
                    name,
                    HealthStatus::Warn(format!("could not read version from '{}'", output.trim())),
                ),
            },
            None => HealthCheck::new(
                name,
                HealthStatus::Fail(format!("'{}' not found; install Python 3.11.9", self.python)),
            ),
        }
    }

    async fn check_git(&self) -> HealthCheck {
        match query_version(&self.git, &["--version"]).await {
            Some(_) => HealthCheck::new("Git", HealthStatus::Pass),
            None => HealthCheck::new(
                "Git",
                HealthStatus::Fail(format!("'{}' not found; needed to fetch service sources", self.git)),
            ),
        }
    }

    async fn check_gpu(&self) -> HealthCheck {
        match query_version("nvidia-smi", &["--query-gpu=name", "--format=csv,noheader"]).await {
            Some(_) => HealthCheck::new("NVIDIA GPU", HealthStatus::Pass),
            None => HealthCheck::new(
                "NVIDIA GPU",
                HealthStatus::Warn("nvidia-smi not available; generation will be slow on CPU".to_string()),
            ),
        }
    }

    fn check_disk_space(&self) -> HealthCheck {
        let (largest, total) = self.disk_required;
        match SysinfoDiskSpace.available_bytes(&self.services_dir) {
            Some(available) if available < largest => HealthCheck::new(
                "Disk Space",
                HealthStatus::Fail(format!(
                    "{} GB available, a single service needs up to {} GB",
                    available / GIB,
                    largest / GIB
                )),
            ),
            Some(available) if available < total => HealthCheck::new(
                "Disk Space",
                HealthStatus::Warn(format!(
                    "{} GB available, all services need {} GB",
                    available / GIB,
                    total / GIB
                )),
            ),
            Some(_) => HealthCheck::new("Disk Space", HealthStatus::Pass),
            None => HealthCheck::new(
                "Disk Space",
                HealthStatus::Warn("Could not determine disk space".to_string()),
            ),
        }
    }

    fn check_memory(&self) -> HealthCheck {
        let mut sys = System::new();
        sys.refresh_memory();

        let total_gb = sys.total_memory() / GIB;
        if total_gb < 8 {
            HealthCheck::new(
                "Memory",
                HealthStatus::Warn(format!("{} GB RAM; model loading may fail", total_gb)),
            )
        } else {
            HealthCheck::new("Memory", HealthStatus::Pass)
        }
    }

    fn check_permissions(&self) -> HealthCheck {
        if let Err(e) = std::fs::create_dir_all(&self.services_dir) {
            return HealthCheck::new(
                "Install Root",
                HealthStatus::Fail(format!("cannot create {}: {}", self.services_dir.display(), e)),
            );
        }

        let test_file = self.services_dir.join(".gary4local_write_test");
        match std::fs::write(&test_file, "test") {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_file);
                HealthCheck::new("Install Root", HealthStatus::Pass)
            }
            Err(e) => HealthCheck::new(
                "Install Root",
                HealthStatus::Fail(format!("{} is not writable: {}", self.services_dir.display(), e)),
            ),
        }
    }

    fn check_credential(&self) -> HealthCheck {
        if self.credential_present || !self.needs_credential {
            HealthCheck::new("Access Token", HealthStatus::Pass)
        } else {
            HealthCheck::new(
                "Access Token",
                HealthStatus::Warn(format!("{} is not set; gated models cannot be downloaded", self.token_env)),
            )
        }
    }

    fn check_state_file(&self) -> HealthCheck {
        match StateStore::open(&self.state_file) {
            Ok(_) => HealthCheck::new("State File", HealthStatus::Pass),
            Err(e) => HealthCheck::new("State File", HealthStatus::Fail(e.to_string())),
        }
    }

    async fn check_ports(&self) -> HealthCheck {
        let mut busy = Vec::new();
        for port in &self.ports {
            if port_is_bound(*port).await {
                busy.push(port.to_string());
            }
        }

        if busy.is_empty() {
            HealthCheck::new("Service Ports", HealthStatus::Pass)
        } else {
            HealthCheck::new(
                "Service Ports",
                HealthStatus::Warn(format!("already bound: {}", busy.join(", "))),
            )
        }
    }

    async fn check_requirements(&self) -> HealthCheck {
        let mut missing = Vec::new();
        for requirement in &self.requirements {
            if port_is_bound(requirement.port).await {
                continue;
            }
            let launchable = match &requirement.launch {
                Some(launch) => query_version(&launch.program.to_string_lossy(), &["--version"])
                    .await
                    .is_some(),
                None => false,
            };
            if !launchable {
                missing.push(format!("{} (port {})", requirement.name, requirement.port));
            }
        }

        if missing.is_empty() {
            HealthCheck::new("Requirements", HealthStatus::Pass)
        } else {
            HealthCheck::new(
                "Requirements",
                HealthStatus::Warn(format!(
                    "not running and cannot be launched: {}; dependent services will not start",
                    missing.join(", ")
                )),
            )
        }
    }

    /// Display diagnostics results
    pub fn display_results(checks: &[HealthCheck]) {
        println!("\n{}\n", "🔍 gary4local System Diagnostics".bold());
        println!("{:<20} Status", "Check");
        println!("{}", "=".repeat(60));

        for check in checks {
            let message = match &check.status {
                HealthStatus::Pass => format!("✅ {}", "PASS".green()),
                HealthStatus::Warn(msg) => format!("⚠️  {}", format!("WARN: {}", msg).yellow()),
                HealthStatus::Fail(msg) => format!("❌ {}", format!("FAIL: {}", msg).red()),
            };
            println!("{:<20} {}", check.name, message);
        }

        println!();
    }

    /// Get overall health status
    pub fn overall_status(checks: &[HealthCheck]) -> bool {
        !checks.iter().any(|c| matches!(c.status, HealthStatus::Fail(_)))
    }
}

/// Run `program args`, returning combined output on a zero exit
async fn query_version(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output();

    match timeout(VERSION_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Some(text)
        }
        _ => None,
    }
}

/// Extract `(major, minor)` from `Python 3.11.9`
fn parse_python_version(output: &str) -> Option<(u32, u32)> {
    let version = output
        .split_whitespace()
        .skip_while(|word| !word.eq_ignore_ascii_case("python"))
        .nth(1)?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
