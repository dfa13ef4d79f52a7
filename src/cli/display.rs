//! Terminal rendering: progress bars and status tables

use crate::control::{ControlCenter, ServiceRow};
use crate::provisioner::{ProgressEvent, ProgressPhase, ProgressSink};
use crate::registry::{ServiceId, ServiceRegistry};
use crate::state::{EnvironmentState, EnvironmentStatus};
use crate::supervisor::RuntimeStatus;
use crate::transaction::{TransactionResult, TransactionState};
use colored::*;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {prefix:.bold} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bytes_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:.bold} {msg} [{bar:30.green/blue}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Renders provisioning progress events as indicatif bars
pub struct ProgressBarSink {
    multi: MultiProgress,
    bars: Mutex<HashMap<(ServiceId, String), ProgressBar>>,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stdout()),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar(&self, service: ServiceId, step: &str) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(|p| p.into_inner());
        bars.entry((service, step.to_string()))
            .or_insert_with(|| {
                let pb = self.multi.add(ProgressBar::new_spinner());
                pb.set_style(spinner_style());
                pb.set_prefix(format!("[{}]", service));
                pb.set_message(step.to_string());
                pb.enable_steady_tick(Duration::from_millis(120));
                pb
            })
            .clone()
    }

    fn take(&self, service: ServiceId, step: &str) -> Option<ProgressBar> {
        let mut bars = self.bars.lock().unwrap_or_else(|p| p.into_inner());
        bars.remove(&(service, step.to_string()))
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressBarSink {
    fn emit(&self, event: ProgressEvent) {
        match event.phase {
            ProgressPhase::Started => {
                self.bar(event.service, &event.step);
            }
            ProgressPhase::Advanced => {
                let pb = self.bar(event.service, &event.step);
                if let Some(total) = event.bytes_total {
                    if pb.length() != Some(total) {
                        pb.set_length(total);
                        pb.set_style(bytes_style());
                    }
                }
                if let Some(done) = event.bytes_done {
                    pb.set_position(done);
                }
            }
            ProgressPhase::Finished => {
                if let Some(pb) = self.take(event.service, &event.step) {
                    pb.set_style(spinner_style());
                    pb.finish_with_message(format!("{} {}", event.step, "✅".green()));
                }
            }
            ProgressPhase::Skipped => {
                if let Some(pb) = self.take(event.service, &event.step) {
                    pb.finish_and_clear();
                }
                let _ = self.multi.println(format!(
                    "  {} [{}] {} (already verified)",
                    "⏭".dimmed(),
                    event.service,
                    event.step
                ));
            }
        }
    }
}

impl Drop for ProgressBarSink {
    fn drop(&mut self) {
        // Bars left open belong to a step that failed
        let bars = self.bars.get_mut().unwrap_or_else(|p| p.into_inner());
        for (_, pb) in bars.drain() {
            pb.abandon();
        }
    }
}

fn environment_label(status: EnvironmentStatus) -> ColoredString {
    match status {
        EnvironmentStatus::Ready => "ready".green(),
        EnvironmentStatus::Provisioning => "provisioning".yellow(),
        EnvironmentStatus::Broken => "broken".red(),
        EnvironmentStatus::Missing => "missing".dimmed(),
    }
}

fn runtime_label(status: RuntimeStatus) -> ColoredString {
    match status {
        RuntimeStatus::Running => "running".green(),
        RuntimeStatus::Starting => "starting".yellow(),
        RuntimeStatus::Stopping => "stopping".yellow(),
        RuntimeStatus::Crashed => "crashed".red(),
        RuntimeStatus::Stopped => "stopped".dimmed(),
    }
}

/// `--status` report: persisted environment state only
pub fn render_environment_report(registry: &ServiceRegistry, states: &BTreeMap<ServiceId, EnvironmentState>) {
    println!("\n{}\n", "📦 Installation Status".bold());
    println!(
        "{:<8} {:<6} {:<14} {:<36} {:<10} Verified",
        "Service", "Port", "Environment", "Version", "Artifacts"
    );
    println!("{}", "=".repeat(100));

    for descriptor in registry.iter() {
        let state = states.get(&descriptor.id).cloned().unwrap_or_default();
        let verified = state
            .last_verified_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<6} {:<14} {:<36} {:<10} {}",
            descriptor.id.as_str().bold(),
            descriptor.port,
            environment_label(state.status),
            state.installed_version.as_deref().unwrap_or("-"),
            format!("{}/{}", state.verified_artifacts.len(), descriptor.artifacts.len()),
            verified
        );
        if let Some(error) = &state.last_error {
            println!("         {}", error.red());
        }
    }
    println!();
}

/// Control centre table
pub fn render_status_table(rows: &[ServiceRow]) {
    println!(
        "{:<8} {:<6} {:<14} {:<10} {:<8}",
        "Service", "Port", "Environment", "Runtime", "PID"
    );
    println!("{}", "-".repeat(52));

    for row in rows {
        let runtime = if row.external {
            "external".magenta()
        } else {
            runtime_label(row.runtime)
        };
        println!(
            "{:<8} {:<6} {:<14} {:<10} {:<8}",
            row.service.as_str().bold(),
            row.port,
            environment_label(row.environment),
            runtime,
            row.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
        );
        if let Some(error) = &row.last_error {
            if row.runtime == RuntimeStatus::Crashed || row.environment == EnvironmentStatus::Broken {
                println!("         {}", error.red());
            }
        }
    }

    println!("\n{}", ControlCenter::overall(rows).to_string().cyan());
}

/// Summary after an install, repair, reinstall or uninstall run
pub fn render_transaction(result: &TransactionResult) {
    println!();
    for outcome in &result.outcomes {
        match (&outcome.error, outcome.status) {
            (Some(error), _) => println!("{} {}", "❌".red(), error),
            (None, Some(status)) => println!(
                "{} [{}] {}",
                "✅".green(),
                outcome.service,
                environment_label(status)
            ),
            (None, None) => println!("{} [{}] skipped (cancelled)", "⏹".yellow(), outcome.service),
        }
    }

    let summary = match result.state {
        TransactionState::Completed if result.failed_services().is_empty() => {
            format!("{} finished", result.mode).green()
        }
        TransactionState::Completed => format!(
            "{} finished with failures; other services were not affected",
            result.mode
        )
        .yellow(),
        TransactionState::Cancelled => format!("{} cancelled", result.mode).yellow(),
        _ => format!("{} failed", result.mode).red(),
    };
    println!("\n{}", summary.bold());

    if let Some(failure) = result.failure() {
        println!("{}", failure.to_string().dimmed());
    }
}
