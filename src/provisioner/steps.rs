//! Dependency step execution
//!
//! Steps run as argv arrays (no shell), each under its own timeout.
//! A non-zero exit, a spawn failure or a timeout all fail the step.

use crate::registry::DependencyStep;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Lines of stderr kept in a failure message
const FAILURE_TAIL_LINES: usize = 8;

/// Runs one dependency step
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Ok on success, otherwise a human-readable reason
    async fn run(&self, step: &DependencyStep) -> std::result::Result<(), String>;
}

/// Executes steps as child processes
#[derive(Debug, Default, Clone)]
pub struct ProcessStepRunner;

#[async_trait]
impl StepRunner for ProcessStepRunner {
    async fn run(&self, step: &DependencyStep) -> std::result::Result<(), String> {
        if step.program.is_empty() {
            return Err("step has no program".to_string());
        }

        let start = Instant::now();
        let mut cmd = Command::new(&step.program);
        cmd.args(&step.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(step = %step.name, program = %step.program, args = ?step.args, "running dependency step");

        match timeout(step.timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                debug!(
                    step = %step.name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    code = ?output.status.code(),
                    "dependency step finished"
                );
                if output.status.success() {
                    Ok(())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let tail = tail_lines(&stderr, FAILURE_TAIL_LINES);
                    let code = output
                        .status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    if tail.is_empty() {
                        Err(format!("exited with {}", code))
                    } else {
                        Err(format!("exited with {}: {}", code, tail))
                    }
                }
            }
            Ok(Err(e)) => Err(format!("failed to execute {}: {}", step.program, e)),
            Err(_) => Err(format!("timed out after {}s", step.timeout.as_secs())),
        }
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}
