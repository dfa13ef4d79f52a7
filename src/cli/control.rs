//! Interactive control centre prompt
//!
//! Line editing runs on its own thread (rustyline blocks); lines are
//! forwarded to the async loop over a channel.

use super::display;
use crate::control::{ControlCenter, ControlCommand};
use crate::registry::ServiceId;
use anyhow::Result;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::warn;

const PROMPT: &str = "gary4local> ";

/// Spawn the line reader; EOF and Ctrl-C both become `quit`
fn spawn_reader(history: Option<PathBuf>) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                warn!(error = %e, "line editor unavailable");
                let _ = tx.send("quit".to_string());
                return;
            }
        };
        if let Some(path) = &history {
            let _ = editor.load_history(path);
        }

        loop {
            match editor.readline(PROMPT) {
                Ok(line) => {
                    let trimmed = line.trim().to_string();
                    if !trimmed.is_empty() {
                        let _ = editor.add_history_entry(trimmed.as_str());
                    }
                    let quitting = matches!(ControlCommand::parse(&trimmed), ControlCommand::Quit);
                    if tx.send(trimmed).is_err() || quitting {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                    let _ = tx.send("quit".to_string());
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "readline error");
                    let _ = tx.send("quit".to_string());
                    break;
                }
            }
        }

        if let Some(path) = &history {
            let _ = editor.save_history(path);
        }
    });

    rx
}

fn history_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".gary4juce").join("control_history"))
}

/// Run the prompt until `quit`, then stop everything that was started
pub async fn run(center: &ControlCenter, autostart: bool) -> Result<()> {
    println!("{}", "🎛  gary4local control centre".bold());
    println!("Type {} for available commands\n", "help".cyan());

    if autostart {
        start_services(center, &ServiceId::ALL).await;
    }
    display::render_status_table(&center.snapshot().await);

    let mut lines = spawn_reader(history_path());

    loop {
        let line = tokio::select! {
            line = lines.recv() => line.unwrap_or_else(|| "quit".to_string()),
            _ = tokio::signal::ctrl_c() => "quit".to_string(),
        };

        if !execute(center, ControlCommand::parse(&line)).await {
            break;
        }
    }

    println!("{}", "Stopping services...".yellow());
    for (service, result) in center.stop_all().await {
        if let Err(e) = result {
            println!("{} [{}] {}", "❌".red(), service, e);
        }
    }
    println!("{}", "Goodbye!".green());
    Ok(())
}

/// Execute a command; false means leave the prompt
pub async fn execute(center: &ControlCenter, command: ControlCommand) -> bool {
    match command {
        ControlCommand::Help => show_help(),
        ControlCommand::Status => display::render_status_table(&center.snapshot().await),
        ControlCommand::Start(target) => start_services(center, &target.services()).await,
        ControlCommand::Stop(target) => {
            for service in target.services() {
                match center.stop(service).await {
                    Ok(()) => println!("{} [{}] stopped", "⏹".yellow(), service),
                    Err(e) => println!("{} {}", "❌".red(), e),
                }
            }
        }
        ControlCommand::Restart(target) => {
            for service in target.services() {
                match center.restart(service).await {
                    Ok(_) => println!("{} [{}] restarting", "🔄".cyan(), service),
                    Err(e) => println!("{} {}", "❌".red(), e),
                }
            }
        }
        ControlCommand::Logs { service, lines } => match center.logs(service) {
            Ok(log) => {
                let skip = log.len().saturating_sub(lines);
                for line in &log[skip..] {
                    println!("{} {}", format!("[{}]", service).dimmed(), line);
                }
            }
            Err(e) => println!("{} {}", "❌".red(), e),
        },
        ControlCommand::Quit => return false,
        ControlCommand::Empty => {}
        ControlCommand::Unknown { input } => {
            println!("{}", format!("Unknown command: {}", input).red());
            println!("Type {} for available commands", "help".cyan());
        }
    }
    true
}

async fn start_services(center: &ControlCenter, services: &[ServiceId]) {
    for service in services {
        match center.start(*service).await {
            Ok(_) => println!("{} [{}] starting on port {}", "▶".green(), service, service.port()),
            Err(e) => println!("{} {}", "❌".red(), e),
        }
    }
}

fn show_help() {
    println!("\n{}", "Commands:".bold());
    println!("  {:<26} {}", "status".cyan(), "Show all services");
    println!("  {:<26} {}", "start [service|all]".cyan(), "Launch services");
    println!("  {:<26} {}", "stop [service|all]".cyan(), "Stop services");
    println!("  {:<26} {}", "restart [service|all]".cyan(), "Stop then start");
    println!("  {:<26} {}", "logs <service> [lines]".cyan(), "Recent output of one service");
    println!("  {:<26} {}", "quit".cyan(), "Stop everything and exit");
    println!("\nServices: gary (8000), terry (8002), jerry (8005)\n");
}
