//! gary4local - lifecycle orchestrator for the gary4juce local backends
//!
//! Provisions isolated environments for the three inference services
//! (gary on 8000, terry on 8002, jerry on 8005), supervises their
//! processes and exposes one control surface over all of them.
//!
//! # Architecture
//!
//! - **registry**: static service table
//! - **provisioner**: idempotent, resumable environment installs
//! - **supervisor**: per-service process lifecycle and health watching
//! - **transaction**: install/repair/reinstall/uninstall across services
//! - **control**: aggregated status and start/stop front end

pub mod errors;
pub mod config;
pub mod logging;
pub mod registry;
pub mod state;

pub mod provisioner;
pub mod supervisor;
pub mod transaction;
pub mod control;

pub mod doctor;
pub mod cli;

// Re-export commonly used types
pub use errors::{OrchestratorError, Result};
pub use registry::{ServiceDescriptor, ServiceId, ServiceRegistry};
