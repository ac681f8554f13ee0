//! The supervisor itself: startup, per-child monitors, the restart worker,
//! the orphan reaper, signal dispatch, and graceful shutdown.

use crate::config::{Config, RestartPolicy, Service};
use crate::error::StartError;
use crate::ipc;
use crate::output::OutputCapture;
use crate::privilege::{CredentialGate, Elevated};
use crate::spawn::{spawn_service, SpawnedChild};
use crate::table::ServiceTable;
use anyhow::Context as _;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{geteuid, getpid, Pid};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const RESTART_QUEUE_CAPACITY: usize = 100;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const KILL_GRACE: Duration = Duration::from_secs(2);
const REAP_INTERVAL: Duration = Duration::from_secs(1);

const ENV_APP_USER: &str = "PEI_APP_USER";
const ENV_APP_GROUP: &str = "PEI_APP_GROUP";
const DEFAULT_APP_USER: &str = "appuser";

#[derive(Debug, Clone, Copy)]
pub enum StartKind {
    Initial,
    Restart,
}

impl StartKind {
    fn as_str(&self) -> &'static str {
        match self {
            StartKind::Initial => "start",
            StartKind::Restart => "restart",
        }
    }
}

/// A desire to (re)start a service, produced by monitor tasks and the
/// control channel, consumed by the restart worker.
#[derive(Debug)]
pub struct RestartRequest {
    pub service: Service,
    pub kind: StartKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Queued,
    QueueFull,
    UnknownService,
}

pub struct Daemon {
    table: ServiceTable,
    gate: CredentialGate,
    restart_tx: mpsc::Sender<RestartRequest>,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(
        config: &Config,
        gate: CredentialGate,
        restart_tx: mpsc::Sender<RestartRequest>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            table: ServiceTable::new(config),
            gate,
            restart_tx,
            shutdown,
        }
    }

    pub fn table(&self) -> &ServiceTable {
        &self.table
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Enqueue a restart. The request is a desire, not an obligation: the
    /// bounded queue may be full, in which case the caller is told so.
    pub fn request_restart(&self, name: &str) -> RestartOutcome {
        let Some(service) = self.table.service(name) else {
            return RestartOutcome::UnknownService;
        };
        match self.restart_tx.try_send(RestartRequest {
            service,
            kind: StartKind::Restart,
        }) {
            Ok(()) => RestartOutcome::Queued,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => RestartOutcome::QueueFull,
        }
    }

    /// Deliver one signal to one pid under a scoped elevation.
    pub async fn signal_pid(&self, pid: i32, sig: Signal) -> anyhow::Result<()> {
        let elevated = self.gate.elevated().await?;
        let result = kill(Pid::from_raw(pid), sig).map_err(|e| crate::error::SignalError {
            pid,
            source: e,
        });
        drop(elevated);
        result.map_err(Into::into)
    }

    /// Forward one signal to every running child under a single elevation
    /// window. A refused delivery does not stop the loop.
    pub async fn forward_signal(&self, sig: Signal) {
        let live = self.table.running_children();
        if live.is_empty() {
            return;
        }
        let elevated = match self.gate.elevated().await {
            Ok(g) => g,
            Err(e) => {
                error!(signal = %sig, error = %e, "failed to elevate privileges for signal forwarding");
                return;
            }
        };
        for (name, pid) in live {
            info!(signal = %sig, service = %name, pid, "forwarding signal to service");
            if let Err(e) = kill(Pid::from_raw(pid), sig) {
                error!(signal = %sig, service = %name, pid, error = %e, "failed to send signal to service");
            }
        }
        drop(elevated);
    }

    /// TERM everything, wait up to 30 s, KILL survivors, short grace, then
    /// remove the control socket.
    pub async fn shutdown_services(&self) {
        info!("starting graceful shutdown of all services");
        let _ = self.shutdown.send(true);

        let live = self.table.running_children();
        if !live.is_empty() {
            match self.gate.elevated().await {
                Ok(elevated) => {
                    for (name, pid) in &live {
                        info!(service = %name, pid, "sending SIGTERM to service");
                        if let Err(e) = kill(Pid::from_raw(*pid), Signal::SIGTERM) {
                            error!(service = %name, pid, error = %e, "failed to send SIGTERM to service");
                        }
                    }
                    drop(elevated);
                }
                Err(e) => error!(error = %e, "failed to elevate privileges for shutdown"),
            }

            let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
            loop {
                if self.table.running_children().is_empty() {
                    info!("all services shutdown gracefully");
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("shutdown timeout reached, force killing remaining services");
                    if let Ok(elevated) = self.gate.elevated().await {
                        for (name, pid) in self.table.running_children() {
                            info!(service = %name, pid, "force killing service");
                            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                                error!(service = %name, pid, error = %e, "failed to force kill service");
                            }
                        }
                        drop(elevated);
                    }
                    sleep(KILL_GRACE).await;
                    break;
                }
                sleep(Duration::from_millis(100)).await;
            }
        }

        let _ = std::fs::remove_file(ipc::SOCKET_PATH);
        info!("service shutdown complete");
    }
}

/// Spawn a service and wire up its capture and monitor. The single entry
/// point for initial starts and restarts; `kind` only changes logging.
/// Caller must hold the elevation.
fn start_service(
    daemon: &Arc<Daemon>,
    elevated: &Elevated<'_>,
    svc: &Service,
    kind: StartKind,
) -> Result<(), StartError> {
    let SpawnedChild {
        pid,
        child,
        stdout,
        stderr,
    } = spawn_service(elevated, svc)?;

    info!(
        service = %svc.name,
        user = %svc.user,
        group = %svc.group,
        pid,
        kind = kind.as_str(),
        "service started"
    );

    let capture = OutputCapture::start(svc, pid, stdout, stderr);
    daemon.table.mark_started(&svc.name, pid, Some(capture));
    tokio::spawn(monitor_service(Arc::clone(daemon), svc.clone(), child));
    Ok(())
}

/// Resolve immediately if shutdown was already requested, otherwise wait
/// for the flag to flip.
async fn wait_shutdown(mut rx: watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    let _ = rx.changed().await;
}

/// Sync entry point; the daemon is tokio end-to-end behind it.
pub fn run(config: Config) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run_async(config))
}

pub async fn run_async(config: Config) -> anyhow::Result<()> {
    if getpid().as_raw() != 1 {
        anyhow::bail!("pei daemon must run as PID 1");
    }
    if !geteuid().is_root() {
        anyhow::bail!("pei must be run with root privileges");
    }

    let app_user = non_empty_env(ENV_APP_USER).unwrap_or_else(|| DEFAULT_APP_USER.to_string());
    let app_group = non_empty_env(ENV_APP_GROUP).unwrap_or_else(|| DEFAULT_APP_USER.to_string());
    let gate = CredentialGate::new(&app_user, &app_group)
        .with_context(|| format!("resolve application identity {app_user}:{app_group}"))?;

    info!(
        build_time = %crate::build_info::build_time_pretty(),
        build_host = crate::build_info::build_host(),
        "starting pei"
    );

    // The socket is created while still root so later access is governed by
    // the path's filesystem permissions.
    let sock = PathBuf::from(ipc::SOCKET_PATH);
    let listener = ipc::bind(&sock)?;

    let (restart_tx, restart_rx) = mpsc::channel(RESTART_QUEUE_CAPACITY);
    let daemon = Arc::new(Daemon::new(&config, gate, restart_tx));

    tokio::spawn(ipc::serve(listener, Arc::clone(&daemon)));

    // Initial starts happen in dependency order under the startup elevation;
    // releasing the guard afterwards is the daemon-wide privilege drop.
    {
        let elevated = daemon
            .gate
            .elevated()
            .await
            .context("establish startup credentials")?;
        for name in config.start_order() {
            let svc = &config.services[&name];
            info!(service = %name, "starting service");
            if let Err(e) = start_service(&daemon, &elevated, svc, StartKind::Initial) {
                error!(service = %name, error = %e, "failed to start service");
            }
        }
    }
    info!(user = %app_user, group = %app_group, "dropped privileges");

    tokio::spawn(restart_worker(Arc::clone(&daemon), restart_rx));
    tokio::spawn(reaper(Arc::clone(&daemon)));

    handle_signals(&daemon).await
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// One task per live child: await the exit, settle the table, apply the
/// restart policy, and hand any respawn desire to the restart worker.
async fn monitor_service(daemon: Arc<Daemon>, svc: Service, mut child: Child) {
    let exit_ok = match child.wait().await {
        Ok(status) => {
            if status.success() {
                info!(service = %svc.name, "service exited successfully");
            } else {
                info!(service = %svc.name, status = %status, "service exited with error");
            }
            status.success()
        }
        Err(e) => {
            // The reaper may collect the exit first; the status is gone, so
            // assume failure.
            info!(service = %svc.name, error = %e, "service exited with error");
            false
        }
    };

    if let Some(capture) = daemon.table.mark_stopped(&svc.name) {
        capture.stop();
    }

    match decide_restart(&svc, exit_ok, daemon.table.restarts(&svc.name)) {
        Decision::Done => {
            if svc.oneshot {
                info!(service = %svc.name, "oneshot service completed, no interval specified");
            }
        }
        Decision::GiveUp => {
            info!(
                service = %svc.name,
                max_restarts = svc.max_restarts,
                restart_count = daemon.table.restarts(&svc.name),
                "service exceeded max restarts, giving up"
            );
        }
        Decision::Respawn {
            delay,
            count_restart,
        } => {
            if count_restart {
                daemon.table.increment_restarts(&svc.name);
            } else {
                info!(
                    service = %svc.name,
                    interval_ms = delay.as_millis() as u64,
                    "oneshot service completed, scheduling next run"
                );
            }

            let shutdown = daemon.subscribe_shutdown();
            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_shutdown(shutdown.clone()) => return,
            }
            let req = RestartRequest {
                service: svc,
                kind: StartKind::Restart,
            };
            tokio::select! {
                r = daemon.restart_tx.send(req) => {
                    if r.is_err() {
                        return;
                    }
                }
                _ = wait_shutdown(shutdown) => {}
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decision {
    Done,
    GiveUp,
    Respawn {
        delay: Duration,
        count_restart: bool,
    },
}

/// The restart policy table of the monitor. Oneshot reruns bypass both the
/// restart counter and `max_restarts`; `max_restarts == 0` means unbounded.
pub(crate) fn decide_restart(svc: &Service, exit_ok: bool, restarts_so_far: u32) -> Decision {
    if svc.oneshot {
        if svc.interval > Duration::ZERO {
            return Decision::Respawn {
                delay: svc.interval,
                count_restart: false,
            };
        }
        return Decision::Done;
    }

    let wants_restart = match svc.restart {
        RestartPolicy::Always => true,
        RestartPolicy::OnFailure => !exit_ok,
        RestartPolicy::Never => false,
    };
    if !wants_restart {
        return Decision::Done;
    }
    if svc.max_restarts > 0 && restarts_so_far >= svc.max_restarts {
        return Decision::GiveUp;
    }
    Decision::Respawn {
        delay: svc.restart_delay,
        count_restart: true,
    }
}

/// Single consumer of the restart queue. Being alone here gives a total
/// order on spawns and keeps elevation windows from overlapping.
pub async fn restart_worker(daemon: Arc<Daemon>, mut rx: mpsc::Receiver<RestartRequest>) {
    let shutdown = daemon.subscribe_shutdown();
    loop {
        let req = tokio::select! {
            req = rx.recv() => match req {
                Some(r) => r,
                None => return,
            },
            _ = wait_shutdown(shutdown.clone()) => return,
        };

        let elevated = match daemon.gate.elevated().await {
            Ok(g) => g,
            Err(e) => {
                // Recoverable: this iteration is lost, the worker is not.
                error!(service = %req.service.name, error = %e, "failed to elevate privileges for restart");
                continue;
            }
        };
        if let Err(e) = start_service(&daemon, &elevated, &req.service, req.kind) {
            error!(service = %req.service.name, error = %e, "failed to restart service");
        }
        drop(elevated);
    }
}

/// Absorb zombies re-parented to pid 1. Monitors and the reaper race on
/// `wait`; either may observe any given exit.
async fn reaper(daemon: Arc<Daemon>) {
    let shutdown = daemon.subscribe_shutdown();
    loop {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        info!("Reaped orphaned child process PID {}", pid);
                    }
                }
                Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => {
                    warn!(error = %e, "error in global reaper");
                    break;
                }
            }
        }
        tokio::select! {
            _ = sleep(REAP_INTERVAL) => {}
            _ = wait_shutdown(shutdown.clone()) => return,
        }
    }
}

/// Signal policy for pid 1: TERM/INT/QUIT shut down, HUP/USR1/USR2 are
/// forwarded to every running child, CHLD and PIPE are no-ops.
async fn handle_signals(daemon: &Arc<Daemon>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut quit = signal(SignalKind::quit()).context("install SIGQUIT handler")?;
    let mut hup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    let mut usr1 = signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?;
    let mut usr2 = signal(SignalKind::user_defined2()).context("install SIGUSR2 handler")?;
    let mut pipe = signal(SignalKind::pipe()).context("install SIGPIPE handler")?;
    let mut chld = signal(SignalKind::child()).context("install SIGCHLD handler")?;

    loop {
        let fatal = tokio::select! {
            _ = term.recv() => Some("SIGTERM"),
            _ = int.recv() => Some("SIGINT"),
            _ = quit.recv() => Some("SIGQUIT"),
            _ = hup.recv() => {
                info!(signal = "SIGHUP", "forwarding signal to all services");
                daemon.forward_signal(Signal::SIGHUP).await;
                None
            }
            _ = usr1.recv() => {
                info!(signal = "SIGUSR1", "forwarding signal to all services");
                daemon.forward_signal(Signal::SIGUSR1).await;
                None
            }
            _ = usr2.recv() => {
                info!(signal = "SIGUSR2", "forwarding signal to all services");
                daemon.forward_signal(Signal::SIGUSR2).await;
                None
            }
            _ = chld.recv() => {
                debug!("received SIGCHLD (handled by reaper)");
                None
            }
            _ = pipe.recv() => {
                debug!("received SIGPIPE (ignored)");
                None
            }
        };
        if let Some(signal_name) = fatal {
            info!(signal = signal_name, "initiating graceful shutdown");
            daemon.shutdown_services().await;
            return Ok(());
        }
    }
}
