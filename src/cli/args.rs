//! Command-line argument parsing for gary4local
//!
//! With no subcommand the binary provisions the environments: plain runs
//! install or repair, `--clean` reinstalls from scratch, `--uninstall`
//! removes everything and `--status` only reports.

use crate::provisioner::ProvisionMode;
use crate::registry::ServiceId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// gary4local - local backends for the gary4juce plugin
#[derive(Parser, Debug)]
#[command(name = "gary4local")]
#[command(version)]
#[command(about = "Install, launch and supervise the gary, terry and jerry local backends", long_about = None)]
pub struct Args {
    /// Delete each environment and install it again from scratch
    #[arg(long, conflicts_with_all = ["uninstall", "status"])]
    pub clean: bool,

    /// Stop all services and delete every environment
    #[arg(long, conflicts_with = "status")]
    pub uninstall: bool,

    /// Show installation status without changing anything
    #[arg(long)]
    pub status: bool,

    /// Limit provisioning to these services (repeatable; default all)
    #[arg(long = "service", value_name = "SERVICE")]
    pub services: Vec<ServiceId>,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbosity level: default (info), -v (debug), -vv (trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (warnings and errors only, no progress bars)
    #[arg(short, long)]
    pub quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive control centre: start, stop, restart and watch services
    Control {
        /// Start every ready service on entry
        #[arg(long)]
        autostart: bool,
    },

    /// Start services in the foreground until Ctrl-C
    Start {
        /// gary, terry, jerry or all
        #[arg(value_name = "SERVICE", default_value = "all")]
        target: String,
    },

    /// Run system diagnostics and health checks
    Doctor,

    /// Display current configuration
    Config,
}

impl Args {
    /// Provisioning mode selected by the top-level flags
    pub fn mode(&self) -> ProvisionMode {
        if self.uninstall {
            ProvisionMode::Uninstall
        } else if self.clean {
            ProvisionMode::CleanReinstall
        } else {
            ProvisionMode::Install
        }
    }

    /// Services named with `--service`, or every service
    pub fn selected_services(&self) -> Vec<ServiceId> {
        if self.services.is_empty() {
            ServiceId::ALL.to_vec()
        } else {
            let mut selected: Vec<ServiceId> = ServiceId::ALL
                .iter()
                .copied()
                .filter(|id| self.services.contains(id))
                .collect();
            selected.dedup();
            selected
        }
    }
}
