//! Provisioning progress events
//!
//! The provisioner pushes events into a caller-supplied sink; nothing
//! polls it for status.

use crate::registry::ServiceId;
use tokio::sync::mpsc;

/// Where in a step an event was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Started,
    Advanced,
    Finished,
    Skipped,
}

/// One progress report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub service: ServiceId,
    pub step: String,
    pub phase: ProgressPhase,
    pub bytes_done: Option<u64>,
    pub bytes_total: Option<u64>,
}

impl ProgressEvent {
    pub fn started(service: ServiceId, step: impl Into<String>) -> Self {
        Self::phase(service, step, ProgressPhase::Started)
    }

    pub fn finished(service: ServiceId, step: impl Into<String>) -> Self {
        Self::phase(service, step, ProgressPhase::Finished)
    }

    pub fn skipped(service: ServiceId, step: impl Into<String>) -> Self {
        Self::phase(service, step, ProgressPhase::Skipped)
    }

    pub fn bytes(service: ServiceId, step: impl Into<String>, done: u64, total: Option<u64>) -> Self {
        Self {
            service,
            step: step.into(),
            phase: ProgressPhase::Advanced,
            bytes_done: Some(done),
            bytes_total: total,
        }
    }

    fn phase(service: ServiceId, step: impl Into<String>, phase: ProgressPhase) -> Self {
        Self {
            service,
            step: step.into(),
            phase,
            bytes_done: None,
            bytes_total: None,
        }
    }

    /// Fraction complete, when both byte counts are known
    pub fn fraction(&self) -> Option<f64> {
        match (self.bytes_done, self.bytes_total) {
            (Some(done), Some(total)) if total > 0 => Some((done as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

/// Receiver of progress events
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards everything
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forward into a channel; a closed receiver is not an error
impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}
