//! gary4local - main CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use gary4local::{
    cli::{control, display, Args, Commands, ProgressBarSink},
    config::Config,
    control::ControlCenter,
    doctor::Doctor,
    logging,
    provisioner::{EnvironmentProvisioner, NullSink, ProgressSink},
    state::StateStore,
    supervisor::{HttpHealthChecker, ProcessSupervisor, SupervisorSettings},
    transaction::{CancellationFlag, InstallationPlan, InstallationTransaction},
    OrchestratorError, ServiceId, ServiceRegistry,
};
use std::sync::Arc;

/// Exit code for errors that abort the whole run
const EXIT_FATAL: i32 = 2;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(args.verbose, args.quiet);

    let code = match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<OrchestratorError>() {
                Some(inner) if inner.is_fatal() => {
                    eprintln!("{} {}", "❌ Fatal:".red().bold(), inner);
                    eprintln!("   No service was changed after this error; fix it and run again.");
                }
                _ => eprintln!("{} {:#}", "❌".red(), e),
            }
            EXIT_FATAL
        }
    };

    std::process::exit(code);
}

async fn run(args: &Args) -> Result<i32> {
    let config = Config::load(args.config.clone())?;
    let registry = Arc::new(ServiceRegistry::builtin(&config));

    match &args.command {
        Some(Commands::Doctor) => return run_doctor(&config, &registry).await,
        Some(Commands::Config) => {
            show_config(&config)?;
            return Ok(0);
        }
        _ => {}
    }

    let store = Arc::new(StateStore::open(config.state_file())?);

    if args.status {
        display::render_environment_report(&registry, &store.snapshot());
        return Ok(0);
    }

    let supervisor = Arc::new(ProcessSupervisor::new(
        &registry,
        store.clone(),
        Arc::new(HttpHealthChecker::new()?),
        SupervisorSettings::from_config(&config),
    ));

    match &args.command {
        Some(Commands::Control { autostart }) => {
            let center = ControlCenter::new(registry.clone(), store, supervisor, config.grace_timeout());
            control::run(&center, *autostart).await?;
            Ok(0)
        }
        Some(Commands::Start { target }) => {
            let center = ControlCenter::new(registry.clone(), store, supervisor, config.grace_timeout());
            run_foreground(&center, target).await
        }
        _ => run_transaction(args, &config, &registry, store, &supervisor).await,
    }
}

async fn run_transaction(
    args: &Args,
    config: &Config,
    registry: &ServiceRegistry,
    store: Arc<StateStore>,
    supervisor: &ProcessSupervisor,
) -> Result<i32> {
    let mode = args.mode();
    let services = args.selected_services();

    let provisioner = EnvironmentProvisioner::new(store, config)?;

    let cancel = CancellationFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Cancelling after the current step...".yellow());
            on_interrupt.cancel();
        }
    });

    let sink: Box<dyn ProgressSink> = if args.quiet {
        Box::new(NullSink)
    } else {
        Box::new(ProgressBarSink::new())
    };

    println!("{} {}", "📦".bold(), format!("gary4local {}", mode).bold());

    let result = InstallationTransaction::new(registry, &provisioner)
        .with_supervisor(supervisor, config.grace_timeout())
        .with_cancellation(cancel)
        .run(InstallationPlan::for_services(mode, services), sink.as_ref())
        .await?;
    drop(sink);

    display::render_transaction(&result);
    Ok(result.exit_code())
}

/// Start services and keep supervising them until Ctrl-C
async fn run_foreground(center: &ControlCenter, target: &str) -> Result<i32> {
    let services: Vec<ServiceId> = if target.eq_ignore_ascii_case("all") {
        center.registry().ids()
    } else {
        vec![target.parse::<ServiceId>()?]
    };

    let mut started = 0;
    for service in &services {
        match center.start(*service).await {
            Ok(_) => {
                started += 1;
                println!("{} [{}] starting on port {}", "▶".green(), service, service.port());
            }
            Err(e) => println!("{} {}", "❌".red(), e),
        }
    }

    if started == 0 {
        return Ok(1);
    }

    println!("Press Ctrl-C to stop.\n");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    display::render_status_table(&center.snapshot().await);
    println!("{}", "Stopping services...".yellow());
    let mut failed = false;
    for (service, result) in center.stop_all().await {
        if let Err(e) = result {
            failed = true;
            println!("{} [{}] {}", "❌".red(), service, e);
        }
    }

    Ok(if failed { 1 } else { 0 })
}

async fn run_doctor(config: &Config, registry: &ServiceRegistry) -> Result<i32> {
    let doctor = Doctor::new(config, registry);
    let checks = doctor.run_diagnostics().await;
    Doctor::display_results(&checks);

    Ok(if Doctor::overall_status(&checks) { 0 } else { 1 })
}

fn show_config(config: &Config) -> Result<()> {
    println!("\n{}\n", "gary4local Configuration".bold());

    println!("Paths:");
    println!("  Services:    {}", config.services_dir().display());
    println!("  State file:  {}", config.state_file().display());
    println!("  Python:      {}", config.paths.python);
    println!("  Git:         {}", config.paths.git);
    println!("  Redis:       {}", config.paths.redis_server);
    println!();

    println!("Health:");
    println!("  Interval:          {} ms", config.health.interval_ms);
    println!("  Startup attempts:  {}", config.health.startup_attempts);
    println!("  Failure threshold: {}", config.health.failure_threshold);
    println!("  Stop grace:        {} s", config.health.grace_timeout_secs);
    println!();

    println!("Downloads:");
    println!("  Attempts:  {}", config.download.max_retries);
    println!("  Timeout:   {} s", config.download.timeout_secs);
    println!(
        "  Token:     {} ({})",
        config.credentials.token_env,
        if config.credential().is_some() { "set" } else { "not set" }
    );
    println!();

    println!("Artifacts:");
    for id in ServiceId::ALL {
        let count = config.artifacts.get(id.as_str()).map(Vec::len).unwrap_or(0);
        println!("  {:<6} {}", id.as_str(), count);
    }
    println!();

    if let Ok(path) = Config::config_path() {
        println!("Config file: {}", path.display());
    }
    Ok(())
}
