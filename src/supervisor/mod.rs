//! Process supervision
//!
//! One slot per service, each with its own lifecycle lock, its own exit
//! reaper and its own health watcher. Slots share nothing; the control
//! centre only ever reads snapshots.
//!
//! Backing services a descriptor requires (redis for gary) are reused when
//! their port already answers, otherwise launched once and kept until
//! [`ProcessSupervisor::stop_all`].

pub mod log_tail;
pub mod health;
pub mod runtime;

pub use log_tail::LogTail;
pub use health::{port_is_bound, HealthChecker, HttpHealthChecker};
pub use runtime::{RuntimeEvent, RuntimeStatus, ServiceRuntimeState};

use crate::config::Config;
use crate::errors::{OrchestratorError, Result};
use crate::registry::{Requirement, ServiceDescriptor, ServiceId, ServiceRegistry};
use crate::state::StateStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, Signal, System};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// How long to wait for a force-killed child to be reaped
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Port poll interval while a requirement comes up
const REQUIREMENT_POLL: Duration = Duration::from_millis(100);

/// Exit status published by the reaper; outer `None` while alive
type ExitState = Option<Option<i32>>;

/// Health watcher budget
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub health_interval: Duration,
    pub startup_attempts: u32,
    pub failure_threshold: u32,
    pub tail_lines: usize,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            health_interval: config.health_interval(),
            startup_attempts: config.health.startup_attempts,
            failure_threshold: config.health.failure_threshold,
            tail_lines: config.log.tail_lines,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Reference to a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    service: ServiceId,
}

impl ServiceHandle {
    pub fn new(service: ServiceId) -> Self {
        Self { service }
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }
}

/// Mutable runtime fields, guarded by the slot's state mutex
#[derive(Debug)]
struct RuntimeRecord {
    status: RuntimeStatus,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_health_check_at: Option<DateTime<Utc>>,
    last_exit_code: Option<i32>,
    last_error: Option<String>,
}

/// Handles to a live child and its helper tasks
struct RunningProcess {
    pid: Option<u32>,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<ExitState>,
    cancel_tx: watch::Sender<bool>,
    /// Taken on the first stop attempt so a retry never awaits it twice
    watcher: Option<JoinHandle<()>>,
    reaper: JoinHandle<()>,
}

struct ServiceSlot {
    descriptor: ServiceDescriptor,
    record: Mutex<RuntimeRecord>,
    tail: Arc<LogTail>,
    /// Per-service lifecycle lock; start and stop never interleave
    control: tokio::sync::Mutex<Option<RunningProcess>>,
}

impl ServiceSlot {
    fn new(descriptor: ServiceDescriptor, tail_lines: usize) -> Self {
        Self {
            descriptor,
            record: Mutex::new(RuntimeRecord {
                status: RuntimeStatus::Stopped,
                pid: None,
                started_at: None,
                last_health_check_at: None,
                last_exit_code: None,
                last_error: None,
            }),
            tail: Arc::new(LogTail::new(tail_lines)),
            control: tokio::sync::Mutex::new(None),
        }
    }

    fn id(&self) -> ServiceId {
        self.descriptor.id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeRecord> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status(&self) -> RuntimeStatus {
        self.lock().status
    }

    /// Apply one event under the state lock
    fn apply(&self, event: RuntimeEvent) -> Result<RuntimeStatus> {
        let mut record = self.lock();
        let next = record.status.transition(event)?;
        if next != record.status {
            debug!(service = %self.id(), from = %record.status, to = %next, ?event, "runtime transition");
        }
        record.status = next;
        Ok(next)
    }

    /// Crash with a recorded reason, unless the service already left the given status
    fn crash_from(&self, expected: RuntimeStatus, event: RuntimeEvent, reason: String) -> bool {
        let mut record = self.lock();
        if record.status != expected {
            return false;
        }
        match record.status.transition(event) {
            Ok(next) => {
                warn!(service = %self.id(), %reason, "service crashed");
                record.status = next;
                record.last_error = Some(reason);
                true
            }
            Err(_) => false,
        }
    }

    /// A kill that did not take. The pid stays recorded since the child
    /// may still be alive; a later stop or start tries again.
    fn stop_failed(&self, reason: String) {
        let mut record = self.lock();
        match record.status.transition(RuntimeEvent::StopFailed) {
            Ok(next) => record.status = next,
            Err(e) => debug!(service = %self.id(), error = %e, "stop failure outside Stopping"),
        }
        warn!(service = %self.id(), %reason, "service did not stop");
        record.last_error = Some(reason);
    }

    fn snapshot(&self) -> ServiceRuntimeState {
        let record = self.lock();
        ServiceRuntimeState {
            service: self.id(),
            status: record.status,
            pid: record.pid,
            started_at: record.started_at,
            last_health_check_at: record.last_health_check_at,
            last_exit_code: record.last_exit_code,
            last_error: record.last_error.clone(),
            log_tail: self.tail.lines(),
        }
    }
}

/// Launches, watches and stops the service processes
pub struct ProcessSupervisor {
    store: Arc<StateStore>,
    checker: Arc<dyn HealthChecker>,
    settings: SupervisorSettings,
    slots: BTreeMap<ServiceId, Arc<ServiceSlot>>,
    /// Requirement processes we launched, by requirement name
    requirements: tokio::sync::Mutex<BTreeMap<String, Child>>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: &ServiceRegistry,
        store: Arc<StateStore>,
        checker: Arc<dyn HealthChecker>,
        settings: SupervisorSettings,
    ) -> Self {
        let slots = registry
            .iter()
            .map(|d| (d.id, Arc::new(ServiceSlot::new(d.clone(), settings.tail_lines))))
            .collect();

        Self {
            store,
            checker,
            settings,
            slots,
            requirements: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    fn slot(&self, service: ServiceId) -> Result<&Arc<ServiceSlot>> {
        self.slots
            .get(&service)
            .ok_or_else(|| OrchestratorError::Config(format!("service '{}' is not registered", service)))
    }

    pub fn handle(&self, service: ServiceId) -> Option<ServiceHandle> {
        self.slots.get(&service).map(|_| ServiceHandle::new(service))
    }

    pub fn services(&self) -> Vec<ServiceId> {
        self.slots.keys().copied().collect()
    }

    /// Launch a service whose environment is Ready and whose port is free
    pub async fn start(&self, descriptor: &ServiceDescriptor) -> Result<ServiceHandle> {
        let slot = self.slot(descriptor.id)?.clone();
        let service = slot.id();
        let mut control = slot.control.lock().await;

        if control.is_some() {
            if slot.status().is_active() {
                debug!(service = %service, "already running");
                return Ok(ServiceHandle::new(service));
            }
            // Crashed child left behind: reap it before relaunching
            self.shutdown(&slot, &mut control, Duration::ZERO).await?;
        }

        // An installer in another process may have changed the record
        self.store.refresh()?;
        let environment = self.store.get(service);
        if !environment.is_ready() {
            return Err(OrchestratorError::EnvironmentNotReady {
                service,
                status: environment.status.to_string(),
            });
        }

        if port_is_bound(descriptor.port).await {
            return Err(OrchestratorError::PortInUse {
                service,
                port: descriptor.port,
            });
        }

        for requirement in &descriptor.requirements {
            self.ensure_requirement(service, requirement).await?;
        }

        let launch = &descriptor.launch;
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .current_dir(&launch.working_dir)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| OrchestratorError::LaunchFailed {
            service,
            reason: format!("{}: {}", launch.program.display(), e),
        })?;
        let pid = child.id();

        slot.tail.clear();
        {
            let mut record = slot.lock();
            record.status = record.status.transition(RuntimeEvent::Launch)?;
            record.pid = pid;
            record.started_at = Some(Utc::now());
            record.last_health_check_at = None;
            record.last_exit_code = None;
            record.last_error = None;
        }
        info!(service = %service, pid = ?pid, port = descriptor.port, "service launched");

        let log_file = open_log(descriptor).await;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(stdout, slot.tail.clone(), log_file.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(stderr, slot.tail.clone(), log_file));
        }

        let (kill_tx, kill_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let reaper = tokio::spawn(reap(slot.clone(), child, kill_rx, exit_tx));
        let watcher = tokio::spawn(watch_health(
            slot.clone(),
            self.checker.clone(),
            self.settings.clone(),
            cancel_rx,
            exit_rx.clone(),
            kill_tx.clone(),
        ));

        *control = Some(RunningProcess {
            pid,
            kill_tx,
            exit_rx,
            cancel_tx,
            watcher: Some(watcher),
            reaper,
        });

        Ok(ServiceHandle::new(service))
    }

    /// Stop a service: polite request, then force after `grace`
    pub async fn stop(&self, handle: &ServiceHandle, grace: Duration) -> Result<()> {
        let slot = self.slot(handle.service())?.clone();
        let mut control = slot.control.lock().await;

        if control.is_some() {
            return self.shutdown(&slot, &mut control, grace).await;
        }

        // Nothing alive; a crash record still resolves to Stopped
        if slot.status() == RuntimeStatus::Crashed {
            slot.apply(RuntimeEvent::StopRequested)?;
            slot.apply(RuntimeEvent::StopCompleted)?;
        }
        Ok(())
    }

    /// Tear down a child while holding its lifecycle lock.
    ///
    /// The process handles are only released once the child is gone; a
    /// failed kill leaves them in place and the slot Crashed.
    async fn shutdown(
        &self,
        slot: &ServiceSlot,
        control: &mut Option<RunningProcess>,
        grace: Duration,
    ) -> Result<()> {
        let service = slot.id();
        let Some(process) = control.as_mut() else {
            return Ok(());
        };
        slot.apply(RuntimeEvent::StopRequested)?;

        // Watcher goes first so it cannot observe the port being released
        if let Some(watcher) = process.watcher.take() {
            let _ = process.cancel_tx.send(true);
            let _ = watcher.await;
        }

        let already_exited = process.exit_rx.borrow().is_some();

        if !already_exited {
            let polite = !grace.is_zero() && process.pid.map(request_terminate).unwrap_or(false);
            let exited_in_grace = polite && timeout(grace, wait_exit(&mut process.exit_rx)).await.is_ok();

            if !exited_in_grace {
                debug!(service = %service, "forcing termination");
                let _ = process.kill_tx.send(()).await;
                if timeout(KILL_WAIT, wait_exit(&mut process.exit_rx)).await.is_err() {
                    let reason = format!("process {:?} did not exit after kill", process.pid);
                    slot.stop_failed(reason.clone());
                    return Err(OrchestratorError::StopFailed { service, reason });
                }
            }
        }

        if let Some(process) = control.take() {
            let _ = process.reaper.await;
        }
        slot.apply(RuntimeEvent::StopCompleted)?;
        info!(service = %service, "service stopped");
        Ok(())
    }

    /// Reuse a listening requirement, or launch it and wait for its port
    async fn ensure_requirement(&self, service: ServiceId, requirement: &Requirement) -> Result<()> {
        let unavailable = |reason: String| OrchestratorError::RequirementUnavailable {
            service,
            requirement: requirement.name.clone(),
            reason,
        };

        if port_is_bound(requirement.port).await {
            debug!(service = %service, requirement = %requirement.name, port = requirement.port, "requirement already listening");
            return Ok(());
        }

        let Some(launch) = &requirement.launch else {
            return Err(unavailable(format!("nothing listens on port {}", requirement.port)));
        };

        let mut children = self.requirements.lock().await;
        let alive = children
            .get_mut(&requirement.name)
            .map(|child| matches!(child.try_wait(), Ok(None)))
            .unwrap_or(false);

        if !alive {
            let child = Command::new(&launch.program)
                .args(&launch.args)
                .current_dir(&launch.working_dir)
                .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| unavailable(format!("{}: {}", launch.program.display(), e)))?;
            info!(service = %service, requirement = %requirement.name, pid = ?child.id(), "requirement launched");
            children.insert(requirement.name.clone(), child);
        }

        let deadline = Instant::now() + requirement.timeout;
        loop {
            if port_is_bound(requirement.port).await {
                return Ok(());
            }

            let exited = children
                .get_mut(&requirement.name)
                .and_then(|child| child.try_wait().ok().flatten());
            if let Some(status) = exited {
                children.remove(&requirement.name);
                return Err(unavailable(format!("{} exited with {}", launch.program.display(), status)));
            }

            if Instant::now() >= deadline {
                if let Some(mut child) = children.remove(&requirement.name) {
                    let _ = child.start_kill();
                }
                return Err(unavailable(format!(
                    "port {} not bound after {}s",
                    requirement.port,
                    requirement.timeout.as_secs_f32()
                )));
            }

            sleep(REQUIREMENT_POLL).await;
        }
    }

    /// Stop requirement processes this supervisor launched
    async fn stop_requirements(&self, grace: Duration) {
        let mut children = self.requirements.lock().await;
        for (name, mut child) in std::mem::take(&mut *children) {
            if let Some(pid) = child.id() {
                if !grace.is_zero() && request_terminate(pid) && timeout(grace, child.wait()).await.is_ok() {
                    info!(requirement = %name, "requirement stopped");
                    continue;
                }
            }
            let _ = child.start_kill();
            if timeout(KILL_WAIT, child.wait()).await.is_err() {
                warn!(requirement = %name, "requirement did not exit after kill");
            }
        }
    }

    /// Snapshot of one service
    pub fn status(&self, handle: &ServiceHandle) -> Result<ServiceRuntimeState> {
        Ok(self.slot(handle.service())?.snapshot())
    }

    /// Snapshots of every service
    pub fn statuses(&self) -> Vec<ServiceRuntimeState> {
        self.slots.values().map(|slot| slot.snapshot()).collect()
    }

    /// Stop everything, attempting every service even if one fails.
    /// Requirements we launched go last, once nothing uses them.
    pub async fn stop_all(&self, grace: Duration) -> Vec<(ServiceId, Result<()>)> {
        let stops = self.slots.keys().map(|id| async move {
            let handle = ServiceHandle::new(*id);
            (*id, self.stop(&handle, grace).await)
        });
        let results = futures_util::future::join_all(stops).await;
        self.stop_requirements(grace).await;
        results
    }
}

/// Ask the process to exit; false when no polite signal is available
fn request_terminate(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return false;
    }
    system
        .process(pid)
        .and_then(|process| process.kill_with(Signal::Term))
        .unwrap_or(false)
}

async fn wait_exit(exit_rx: &mut watch::Receiver<ExitState>) {
    while exit_rx.borrow().is_none() {
        if exit_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Owns the child: waits for exit, kills on request, publishes the exit code
async fn reap(
    slot: Arc<ServiceSlot>,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<ExitState>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(()) = kill_rx.recv() => {
                if let Err(e) = child.start_kill() {
                    warn!(service = %slot.id(), error = %e, "kill failed");
                }
            }
        }
    };

    let code = status.as_ref().ok().and_then(|s| s.code());
    {
        let mut record = slot.lock();
        record.last_exit_code = code;
        record.pid = None;
        if matches!(record.status, RuntimeStatus::Starting | RuntimeStatus::Running) {
            if let Ok(next) = record.status.transition(RuntimeEvent::Exited) {
                warn!(service = %slot.id(), code = ?code, "process exited unexpectedly");
                record.status = next;
                record.last_error = Some(match code {
                    Some(code) => format!("process exited with code {}", code),
                    None => "process terminated by signal".to_string(),
                });
            }
        }
    }

    let _ = exit_tx.send(Some(code));
}

/// Poll health until Running, then keep polling until failures pile up
async fn watch_health(
    slot: Arc<ServiceSlot>,
    checker: Arc<dyn HealthChecker>,
    settings: SupervisorSettings,
    mut cancel_rx: watch::Receiver<bool>,
    mut exit_rx: watch::Receiver<ExitState>,
    kill_tx: mpsc::Sender<()>,
) {
    let service = slot.id();
    let spec = slot.descriptor.health.clone();
    let mut attempts: u32 = 0;
    let mut failures: u32 = 0;

    loop {
        let healthy = tokio::select! {
            _ = cancel_rx.changed() => return,
            _ = exit_rx.changed() => return,
            healthy = async {
                sleep(settings.health_interval).await;
                checker.check(&spec).await
            } => healthy,
        };

        slot.lock().last_health_check_at = Some(Utc::now());

        match slot.status() {
            RuntimeStatus::Starting => {
                attempts += 1;
                if healthy {
                    if slot.apply(RuntimeEvent::HealthPassed).is_err() {
                        return;
                    }
                    info!(service = %service, attempts, "service healthy");
                } else if attempts >= settings.startup_attempts {
                    let reason = OrchestratorError::HealthCheckTimeout { service, attempts }.to_string();
                    if slot.crash_from(RuntimeStatus::Starting, RuntimeEvent::HealthExhausted, reason) {
                        let _ = kill_tx.try_send(());
                    }
                    return;
                }
            }
            RuntimeStatus::Running => {
                if healthy {
                    failures = 0;
                    continue;
                }
                failures += 1;
                debug!(service = %service, failures, "health check failed");
                if failures >= settings.failure_threshold {
                    let reason = format!("{} consecutive health checks failed", failures);
                    if slot.crash_from(RuntimeStatus::Running, RuntimeEvent::HealthLost, reason) {
                        let _ = kill_tx.try_send(());
                    }
                    return;
                }
            }
            _ => return,
        }
    }
}

type SharedLog = Option<Arc<tokio::sync::Mutex<tokio::fs::File>>>;

async fn open_log(descriptor: &ServiceDescriptor) -> SharedLog {
    let path = descriptor.log_path();
    match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(file) => Some(Arc::new(tokio::sync::Mutex::new(file))),
        Err(e) => {
            warn!(service = %descriptor.id, path = %path.display(), error = %e, "cannot open service log");
            None
        }
    }
}

/// Keep the pipe empty so the child never blocks on output
async fn drain_output<R>(reader: R, tail: Arc<LogTail>, log: SharedLog)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(file) = &log {
                    let mut file = file.lock().await;
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                }
                tail.push(line);
            }
            Ok(None) => break,
            // Non-UTF-8 output; skip the line and keep draining
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => continue,
            Err(_) => break,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::{HealthCheckSpec, LaunchSpec, Requirement};
    use crate::state::EnvironmentState;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct SwitchChecker(AtomicBool);

    #[async_trait]
    impl HealthChecker for SwitchChecker {
        async fn check(&self, _spec: &HealthCheckSpec) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn descriptor(dir: &Path, port: u16, script: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            id: ServiceId::Jerry,
            port,
            environment_id: "stable-audio".to_string(),
            environment_dir: dir.to_path_buf(),
            version: "test".to_string(),
            launch: LaunchSpec {
                program: "sh".into(),
                args: vec!["-c".to_string(), script.to_string()],
                working_dir: dir.to_path_buf(),
                env: vec![("PYTHONIOENCODING".to_string(), "utf-8".to_string())],
            },
            health: HealthCheckSpec {
                url: format!("http://127.0.0.1:{}/health", port),
                expected_status: 200,
                timeout: Duration::from_millis(100),
            },
            required_disk_bytes: 0,
            artifacts: Vec::new(),
            dependencies: Vec::new(),
            requirements: Vec::new(),
        }
    }

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            health_interval: Duration::from_millis(20),
            startup_attempts: 10,
            failure_threshold: 3,
            tail_lines: 50,
        }
    }

    fn supervisor(
        temp: &TempDir,
        descriptor: &ServiceDescriptor,
        healthy: bool,
        ready: bool,
    ) -> (ProcessSupervisor, Arc<SwitchChecker>) {
        let store = Arc::new(StateStore::open(temp.path().join("state.json")).unwrap());
        if ready {
            store
                .put(descriptor.id, EnvironmentState::ready("test", BTreeMap::new()))
                .unwrap();
        }
        let checker = Arc::new(SwitchChecker(AtomicBool::new(healthy)));
        let registry = ServiceRegistry::from_descriptors(vec![descriptor.clone()]);
        (
            ProcessSupervisor::new(&registry, store, checker.clone(), settings()),
            checker,
        )
    }

    async fn wait_for(supervisor: &ProcessSupervisor, handle: &ServiceHandle, status: RuntimeStatus) -> bool {
        for _ in 0..200 {
            if supervisor.status(handle).unwrap().status == status {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_reaches_running_then_stops() {
        let temp = TempDir::new().unwrap();
        let d = descriptor(temp.path(), free_port().await, "echo ready; exec sleep 30");
        let (supervisor, _) = supervisor(&temp, &d, true, true);

        let handle = supervisor.start(&d).await.unwrap();
        assert!(wait_for(&supervisor, &handle, RuntimeStatus::Running).await);

        let snapshot = supervisor.status(&handle).unwrap();
        assert!(snapshot.pid.is_some());
        assert!(snapshot.last_health_check_at.is_some());

        supervisor.stop(&handle, Duration::from_secs(2)).await.unwrap();
        let snapshot = supervisor.status(&handle).unwrap();
        assert_eq!(snapshot.status, RuntimeStatus::Stopped);
        assert!(snapshot.pid.is_none());
        assert!(snapshot.log_tail.contains(&"ready".to_string()));
        assert!(std::fs::read_to_string(d.log_path()).unwrap().contains("ready"));
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let temp = TempDir::new().unwrap();
        let d = descriptor(temp.path(), free_port().await, "exec sleep 30");
        let (supervisor, _) = supervisor(&temp, &d, true, true);

        let handle = ServiceHandle::new(ServiceId::Jerry);
        supervisor.stop(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(supervisor.status(&handle).unwrap().status, RuntimeStatus::Stopped);
    }

    #[tokio::test]
    async fn test_refuses_when_environment_not_ready() {
        let temp = TempDir::new().unwrap();
        let d = descriptor(temp.path(), free_port().await, "exec sleep 30");
        let (supervisor, _) = supervisor(&temp, &d, true, false);

        let err = supervisor.start(&d).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::EnvironmentNotReady { ref status, .. } if status == "missing"));
    }

    #[tokio::test]
    async fn test_refuses_foreign_port_holder() {
        let temp = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let d = descriptor(temp.path(), port, "exec sleep 30");
        let (supervisor, _) = supervisor(&temp, &d, true, true);

        let err = supervisor.start(&d).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PortInUse { port: p, .. } if p == port));
        assert_eq!(
            supervisor.status(&ServiceHandle::new(ServiceId::Jerry)).unwrap().status,
            RuntimeStatus::Stopped
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_health_budget_exhausted_crashes() {
        let temp = TempDir::new().unwrap();
        let d = descriptor(temp.path(), free_port().await, "exec sleep 30");
        let (supervisor, _) = supervisor(&temp, &d, false, true);

        let handle = supervisor.start(&d).await.unwrap();
        assert!(wait_for(&supervisor, &handle, RuntimeStatus::Crashed).await);

        let snapshot = supervisor.status(&handle).unwrap();
        assert!(snapshot.last_error.unwrap().contains("health check did not pass"));

        supervisor.stop(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(supervisor.status(&handle).unwrap().status, RuntimeStatus::Stopped);
    }

    #[tokio::test]
    async fn test_lost_health_while_running_crashes() {
        let temp = TempDir::new().unwrap();
        let d = descriptor(temp.path(), free_port().await, "exec sleep 30");
        let (supervisor, checker) = supervisor(&temp, &d, true, true);

        let handle = supervisor.start(&d).await.unwrap();
        assert!(wait_for(&supervisor, &handle, RuntimeStatus::Running).await);

        checker.0.store(false, Ordering::SeqCst);
        assert!(wait_for(&supervisor, &handle, RuntimeStatus::Crashed).await);
        assert!(supervisor
            .status(&handle)
            .unwrap()
            .last_error
            .unwrap()
            .contains("consecutive"));

        supervisor.stop(&handle, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_records_code() {
        let temp = TempDir::new().unwrap();
        let d = descriptor(temp.path(), free_port().await, "exit 3");
        let (supervisor, _) = supervisor(&temp, &d, false, true);

        let handle = supervisor.start(&d).await.unwrap();
        assert!(wait_for(&supervisor, &handle, RuntimeStatus::Crashed).await);
        assert_eq!(supervisor.status(&handle).unwrap().last_exit_code, Some(3));

        // A crashed service can be started again
        let handle = supervisor.start(&d).await.unwrap();
        assert!(wait_for(&supervisor, &handle, RuntimeStatus::Crashed).await);
        supervisor.stop(&handle, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let temp = TempDir::new().unwrap();
        let mut d = descriptor(temp.path(), free_port().await, "");
        d.launch.program = temp.path().join("missing-python");
        let (supervisor, _) = supervisor(&temp, &d, true, true);

        let err = supervisor.start(&d).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LaunchFailed { .. }));
    }

    fn requirement(port: u16, program: Option<&Path>) -> Requirement {
        Requirement {
            name: "redis".to_string(),
            port,
            launch: program.map(|p| LaunchSpec {
                program: p.to_path_buf(),
                args: vec!["--port".to_string(), port.to_string()],
                working_dir: std::env::temp_dir(),
                env: Vec::new(),
            }),
            timeout: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn test_listening_requirement_is_reused() {
        let temp = TempDir::new().unwrap();
        let redis = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let redis_port = redis.local_addr().unwrap().port();

        let missing = temp.path().join("no-such-redis");
        let mut d = descriptor(temp.path(), free_port().await, "exec sleep 30");
        d.requirements = vec![requirement(redis_port, Some(missing.as_path()))];
        let (supervisor, _) = supervisor(&temp, &d, true, true);

        let handle = supervisor.start(&d).await.unwrap();
        assert!(wait_for(&supervisor, &handle, RuntimeStatus::Running).await);
        for (_, result) in supervisor.stop_all(Duration::from_secs(1)).await {
            result.unwrap();
        }
        // Not ours, so never stopped
        assert!(redis.local_addr().is_ok());
    }

    #[tokio::test]
    async fn test_unlaunchable_requirement_blocks_start() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("no-such-redis");
        let mut d = descriptor(temp.path(), free_port().await, "exec sleep 30");
        d.requirements = vec![requirement(free_port().await, Some(missing.as_path()))];
        let (supervisor, _) = supervisor(&temp, &d, true, true);

        let err = supervisor.start(&d).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::RequirementUnavailable { ref requirement, .. } if requirement == "redis"
        ));
        let snapshot = supervisor.status(&ServiceHandle::new(ServiceId::Jerry)).unwrap();
        assert_eq!(snapshot.status, RuntimeStatus::Stopped);
        assert!(snapshot.pid.is_none());
    }

    #[tokio::test]
    async fn test_requirement_that_never_listens_times_out() {
        let temp = TempDir::new().unwrap();
        let mut d = descriptor(temp.path(), free_port().await, "exec sleep 30");
        let mut redis = requirement(free_port().await, Some(Path::new("sleep")));
        if let Some(launch) = redis.launch.as_mut() {
            launch.args = vec!["30".to_string()];
        }
        d.requirements = vec![redis];
        let (supervisor, _) = supervisor(&temp, &d, true, true);

        let err = supervisor.start(&d).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RequirementUnavailable { ref reason, .. } if reason.contains("not bound")));
        assert!(supervisor.requirements.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_use_only_requirement_must_be_listening() {
        let temp = TempDir::new().unwrap();
        let mut d = descriptor(temp.path(), free_port().await, "exec sleep 30");
        d.requirements = vec![requirement(free_port().await, None)];
        let (supervisor, _) = supervisor(&temp, &d, true, true);

        let err = supervisor.start(&d).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RequirementUnavailable { ref reason, .. } if reason.contains("nothing listens")));
    }

    #[test]
    fn test_failed_stop_leaves_service_crashed_and_restartable() {
        let temp = TempDir::new().unwrap();
        let d = descriptor(temp.path(), 1, "exec sleep 30");
        let slot = ServiceSlot::new(d, 10);

        slot.apply(RuntimeEvent::Launch).unwrap();
        slot.lock().pid = Some(4242);
        slot.apply(RuntimeEvent::StopRequested).unwrap();
        slot.stop_failed("process Some(4242) did not exit after kill".to_string());

        let snapshot = slot.snapshot();
        assert_eq!(snapshot.status, RuntimeStatus::Crashed);
        assert_eq!(snapshot.pid, Some(4242));
        assert!(snapshot.last_error.unwrap().contains("did not exit"));
        assert_eq!(slot.apply(RuntimeEvent::Launch).unwrap(), RuntimeStatus::Starting);
    }

    #[tokio::test]
    async fn test_start_sees_install_from_another_process() {
        let temp = TempDir::new().unwrap();
        let d = descriptor(temp.path(), free_port().await, "exec sleep 30");
        let (supervisor, _) = supervisor(&temp, &d, true, false);
        assert!(supervisor.start(&d).await.is_err());

        // An installer run elsewhere writes the shared record
        let installer = StateStore::open(temp.path().join("state.json")).unwrap();
        installer
            .put(d.id, EnvironmentState::ready("test", BTreeMap::new()))
            .unwrap();

        let handle = supervisor.start(&d).await.unwrap();
        assert!(wait_for(&supervisor, &handle, RuntimeStatus::Running).await);
        supervisor.stop(&handle, Duration::from_secs(1)).await.unwrap();
    }
}
