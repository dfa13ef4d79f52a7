//! Runtime state of a supervised service
//!
//! Finite state machine over the process lifecycle:
//!
//! ```text
//! Stopped  -> Starting  (Launch)
//! Starting -> Running   (HealthPassed)
//! Starting -> Crashed   (HealthExhausted | Exited)
//! Running  -> Crashed   (HealthLost | Exited)
//! Crashed  -> Starting  (Launch)
//! Starting | Running | Crashed -> Stopping (StopRequested)
//! Stopping -> Stopped   (StopCompleted)
//! Stopping -> Crashed   (StopFailed)
//! ```
//!
//! Never persisted; a fresh control process starts with every service Stopped.

use crate::errors::{OrchestratorError, Result};
use crate::registry::ServiceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Things that move a service between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// Child process spawned
    Launch,
    /// First successful health check
    HealthPassed,
    /// Startup attempt budget used up
    HealthExhausted,
    /// Consecutive health failures while running
    HealthLost,
    /// The child exited on its own
    Exited,
    StopRequested,
    StopCompleted,
    /// The child outlived a forced kill; it may still be alive
    StopFailed,
}

impl RuntimeStatus {
    /// Whether a child process may still be alive in this status
    pub fn is_active(&self) -> bool {
        matches!(self, RuntimeStatus::Starting | RuntimeStatus::Running | RuntimeStatus::Stopping)
    }

    pub fn transition(&self, event: RuntimeEvent) -> Result<RuntimeStatus> {
        use RuntimeEvent::*;
        use RuntimeStatus::*;

        let next = match (self, event) {
            (Stopped, Launch) | (Crashed, Launch) => Starting,

            (Starting, HealthPassed) => Running,
            (Starting, HealthExhausted) | (Starting, Exited) => Crashed,

            (Running, HealthLost) | (Running, Exited) => Crashed,

            // A crashed child may still be reaped after the watcher gave up on it
            (Crashed, Exited) | (Crashed, HealthLost) => Crashed,

            (Starting, StopRequested) | (Running, StopRequested) | (Crashed, StopRequested) => Stopping,
            (Stopping, Exited) => Stopping,
            (Stopping, StopCompleted) => Stopped,
            (Stopping, StopFailed) => Crashed,

            (from, event) => {
                return Err(OrchestratorError::InvalidTransition {
                    from: format!("{:?}", from),
                    to: format!("(via {:?})", event),
                    reason: format!("No valid transition from {:?} on {:?}", from, event),
                });
            }
        };

        Ok(next)
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RuntimeStatus::Stopped => "stopped",
            RuntimeStatus::Starting => "starting",
            RuntimeStatus::Running => "running",
            RuntimeStatus::Stopping => "stopping",
            RuntimeStatus::Crashed => "crashed",
        };
        f.write_str(text)
    }
}

/// Read-only snapshot handed to the control centre
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRuntimeState {
    pub service: ServiceId,
    pub status: RuntimeStatus,
    /// OS process id; referenced, never owned
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub log_tail: Vec<String>,
}

impl ServiceRuntimeState {
    pub fn stopped(service: ServiceId) -> Self {
        Self {
            service,
            status: RuntimeStatus::Stopped,
            pid: None,
            started_at: None,
            last_health_check_at: None,
            last_exit_code: None,
            last_error: None,
            log_tail: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RuntimeEvent::*;
    use RuntimeStatus::*;

    #[test]
    fn test_happy_path() {
        let s = Stopped.transition(Launch).unwrap();
        assert_eq!(s, Starting);
        let s = s.transition(HealthPassed).unwrap();
        assert_eq!(s, Running);
        let s = s.transition(StopRequested).unwrap();
        assert_eq!(s, Stopping);
        assert_eq!(s.transition(StopCompleted).unwrap(), Stopped);
    }

    #[test]
    fn test_crash_paths() {
        assert_eq!(Starting.transition(HealthExhausted).unwrap(), Crashed);
        assert_eq!(Starting.transition(Exited).unwrap(), Crashed);
        assert_eq!(Running.transition(HealthLost).unwrap(), Crashed);
        assert_eq!(Crashed.transition(StopRequested).unwrap(), Stopping);
        assert_eq!(Crashed.transition(Launch).unwrap(), Starting);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(Stopped.transition(HealthPassed).is_err());
        assert!(Stopped.transition(StopRequested).is_err());
        assert!(Running.transition(Launch).is_err());
        assert!(Stopping.transition(HealthPassed).is_err());
    }

    #[test]
    fn test_failed_stop_can_be_retried() {
        let s = Running.transition(StopRequested).unwrap();
        let s = s.transition(StopFailed).unwrap();
        assert_eq!(s, Crashed);
        assert_eq!(s.transition(StopRequested).unwrap(), Stopping);
        assert_eq!(s.transition(Launch).unwrap(), Starting);
        assert!(Running.transition(StopFailed).is_err());
    }

    #[test]
    fn test_is_active() {
        assert!(Running.is_active());
        assert!(Stopping.is_active());
        assert!(!Stopped.is_active());
        assert!(!Crashed.is_active());
    }
}
