//! Command-line surface. With a subcommand, pei acts as a control-channel
//! client; with none it either becomes the daemon (pid 1, root) or falls
//! back to listing services from a running daemon.

use crate::config::{self, Config};
use crate::daemon;
use crate::ipc::{self, Request};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use nix::unistd::{geteuid, getpid};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::table::ServiceStatus;

#[derive(Debug, Parser)]
#[command(name = "pei", version, about = "pei - Process management for containers")]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "pei.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// List all services and their status
    List,
    /// Show detailed status for a service (or all if none given)
    Status { service: Option<String> },
    /// Restart a specific service
    Restart { service: String },
    /// Send a signal to a service, in service:signal form (e.g. echo:HUP)
    Signal { target: String },
}

pub fn run() -> anyhow::Result<()> {
    crate::logger::init();
    let args = Args::parse();

    match args.cmd {
        None => run_default(&args.config),
        Some(Cmd::List) => cmd_list(&args.config),
        Some(Cmd::Status { service }) => cmd_status(&args.config, service.as_deref()),
        Some(Cmd::Restart { service }) => cmd_restart(&service),
        Some(Cmd::Signal { target }) => cmd_signal(&target),
    }
}

fn run_default(config_path: &Path) -> anyhow::Result<()> {
    if getpid().as_raw() == 1 {
        if !geteuid().is_root() {
            anyhow::bail!("pei must be run with root privileges");
        }
        let cfg = config::load(config_path).context("failed to load configuration")?;
        return daemon::run(cfg);
    }

    // Not pid 1: behave like `list` when a daemon is reachable.
    if let Ok(resp) = ipc::client_call(Path::new(ipc::SOCKET_PATH), &Request::List) {
        if resp.ok {
            print_list(&resp.services.unwrap_or_default());
            return Ok(());
        }
    }

    println!("No pei daemon running. Available commands:");
    println!("  pei list                    List all services and their status");
    println!("  pei status [service]        Show detailed status for service");
    println!("  pei restart <service>       Restart a specific service");
    println!("  pei signal <service:signal> Send signal to service");
    println!("\nTo run as daemon: pei must be run as PID 1");
    std::process::exit(1);
}

fn cmd_list(config_path: &Path) -> anyhow::Result<()> {
    match ipc::client_call(Path::new(ipc::SOCKET_PATH), &Request::List) {
        Ok(resp) if resp.ok => {
            print_list(&resp.services.unwrap_or_default());
            Ok(())
        }
        Ok(resp) => anyhow::bail!("daemon error: {}", resp.message),
        Err(connect_err) => {
            // Daemon not running: list the configured services as stopped.
            let cfg = config::load(config_path).map_err(|cfg_err| {
                anyhow::anyhow!(
                    "failed to connect to daemon and load config: {connect_err}, {cfg_err}"
                )
            })?;
            print_config_list(&cfg);
            Ok(())
        }
    }
}

fn cmd_status(config_path: &Path, service: Option<&str>) -> anyhow::Result<()> {
    let Some(name) = service else {
        return cmd_list(config_path);
    };

    match ipc::client_call(
        Path::new(ipc::SOCKET_PATH),
        &Request::Status {
            service: Some(name.to_string()),
        },
    ) {
        Ok(resp) if resp.ok => {
            if let Some(status) = resp.service {
                print_status_detail(&status);
            }
            Ok(())
        }
        Ok(resp) => anyhow::bail!("daemon error: {}", resp.message),
        Err(_) => {
            let cfg = config::load(config_path)
                .map_err(|_| anyhow::anyhow!("no pei daemon running - cannot show service status"))?;
            print_config_status(&cfg, name)
        }
    }
}

fn cmd_restart(service: &str) -> anyhow::Result<()> {
    let resp = ipc::client_call(
        Path::new(ipc::SOCKET_PATH),
        &Request::Restart {
            service: service.to_string(),
        },
    )
    .map_err(|_| anyhow::anyhow!("no pei daemon running - cannot restart service"))?;
    if resp.ok {
        println!("{}", resp.message);
        Ok(())
    } else {
        anyhow::bail!("restart failed: {}", resp.message)
    }
}

fn cmd_signal(target: &str) -> anyhow::Result<()> {
    let (service, signal) = parse_signal_target(target)?;
    let resp = ipc::client_call(
        Path::new(ipc::SOCKET_PATH),
        &Request::Signal { service, signal },
    )
    .map_err(|_| anyhow::anyhow!("no pei daemon running - cannot send signal to service"))?;
    if resp.ok {
        println!("{}", resp.message);
        Ok(())
    } else {
        anyhow::bail!("signal failed: {}", resp.message)
    }
}

pub(crate) fn parse_signal_target(target: &str) -> anyhow::Result<(String, String)> {
    match target.split_once(':') {
        Some((service, signal)) if !service.is_empty() && !signal.is_empty() => {
            Ok((service.to_string(), signal.to_string()))
        }
        _ => anyhow::bail!("signal format should be service:signal (e.g. echo:HUP)"),
    }
}

fn print_list(services: &BTreeMap<String, ServiceStatus>) {
    println!(
        "{:<20} {:<10} {:<8} {:<12} {:<10}",
        "NAME", "STATUS", "PID", "RESTARTS", "UPTIME"
    );
    println!(
        "{:<20} {:<10} {:<8} {:<12} {:<10}",
        "----", "------", "---", "--------", "------"
    );
    for (name, status) in services {
        let (state, pid, uptime) = if status.running {
            (
                "running",
                status.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                status
                    .start_time
                    .map(format_uptime)
                    .unwrap_or_else(|| "-".into()),
            )
        } else {
            ("stopped", "-".to_string(), "-".to_string())
        };
        println!(
            "{:<20} {:<10} {:<8} {:<12} {:<10}",
            name, state, pid, status.restarts, uptime
        );
    }
}

fn print_config_list(cfg: &Config) {
    println!(
        "{:<20} {:<10} {:<8} {:<12} {:<10}",
        "NAME", "STATUS", "PID", "RESTARTS", "UPTIME"
    );
    println!(
        "{:<20} {:<10} {:<8} {:<12} {:<10}",
        "----", "------", "---", "--------", "------"
    );
    for name in cfg.services.keys() {
        println!("{:<20} {:<10} {:<8} {:<12} {:<10}", name, "stopped", "-", "-", "-");
    }
}

fn print_status_detail(status: &ServiceStatus) {
    println!("Service: {}", status.name);
    if status.running {
        println!("Status: running");
        if let Some(pid) = status.pid {
            println!("PID: {pid}");
        }
        if let Some(start) = status.start_time {
            println!("Started: {}", start.to_rfc3339());
            println!("Uptime: {}", format_uptime(start));
        }
        println!("Restarts: {}", status.restarts);
    } else {
        println!("Status: stopped");
    }
}

fn print_config_status(cfg: &Config, name: &str) -> anyhow::Result<()> {
    let Some(svc) = cfg.services.get(name) else {
        anyhow::bail!("Service '{name}' not found");
    };
    println!("Service: {name}");
    println!("Command: {:?}", svc.command);
    println!("User: {}", svc.user);
    println!("Group: {}", svc.group);
    println!("Restart Policy: {}", svc.restart.as_str());
    println!("Status: stopped");
    Ok(())
}

fn format_uptime(since: DateTime<Utc>) -> String {
    let secs = (Utc::now() - since).num_seconds().max(0) as u64;
    format_uptime_secs(secs)
}

pub(crate) fn format_uptime_secs(total: u64) -> String {
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let mins = (total % 3_600) / 60;
    let secs = total % 60;
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        format!("{secs}s")
    }
}
