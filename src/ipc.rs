//! Control channel: one JSON request per connection, one JSON response,
//! then close. Server half runs inside the daemon; client half is used by
//! the CLI subcommands.

use crate::daemon::{Daemon, RestartOutcome};
use crate::table::ServiceStatus;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
use tokio::net::{UnixListener, UnixStream as TokioUnixStream};
use tracing::warn;

pub const SOCKET_PATH: &str = "/tmp/pei.sock";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Request {
    List,
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
    },
    Restart {
        service: String,
    },
    Signal {
        service: String,
        signal: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<BTreeMap<String, ServiceStatus>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceStatus>,
}

impl Response {
    fn ok_message(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            ..Default::default()
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            ..Default::default()
        }
    }
}

pub fn parse_signal(token: &str) -> Option<Signal> {
    match token.trim().to_ascii_uppercase().as_str() {
        "HUP" | "SIGHUP" => Some(Signal::SIGHUP),
        "TERM" | "SIGTERM" => Some(Signal::SIGTERM),
        "KILL" | "SIGKILL" => Some(Signal::SIGKILL),
        "USR1" | "SIGUSR1" => Some(Signal::SIGUSR1),
        "USR2" | "SIGUSR2" => Some(Signal::SIGUSR2),
        _ => None,
    }
}

/// Bind the control socket, clearing a stale file first. A socket that
/// still accepts connections means another daemon owns it.
pub fn bind(sock: &Path) -> anyhow::Result<UnixListener> {
    if sock.exists() {
        match UnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "pei daemon already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => {
                std::fs::remove_file(sock).map_err(|e| {
                    anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display())
                })?;
            }
        }
    }
    UnixListener::bind(sock)
        .map_err(|e| anyhow::anyhow!("failed to bind control socket {}: {e}", sock.display()))
}

/// Accept loop. One task per connection; a bad connection never takes the
/// listener down.
pub async fn serve(listener: UnixListener, daemon: Arc<Daemon>) {
    let mut shutdown = daemon.subscribe_shutdown();
    if *shutdown.borrow() {
        return;
    }
    loop {
        tokio::select! {
            r = listener.accept() => match r {
                Ok((stream, _addr)) => {
                    let d = Arc::clone(&daemon);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(d, stream).await {
                            warn!(error = %e, "control channel connection error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control channel accept error");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn handle_connection(
    daemon: Arc<Daemon>,
    stream: TokioUnixStream,
) -> anyhow::Result<()> {
    let mut reader = TokioBufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line.trim().is_empty() {
        return Ok(());
    }
    let mut stream = reader.into_inner();

    let resp = match serde_json::from_str::<Request>(line.trim_end()) {
        Ok(req) => dispatch(&daemon, req).await,
        Err(_) => Response::err("Invalid request format"),
    };

    let mut out = serde_json::to_string(&resp)?;
    out.push('\n');
    stream.write_all(out.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn dispatch(daemon: &Daemon, req: Request) -> Response {
    match req {
        Request::List | Request::Status { service: None } => Response {
            ok: true,
            services: Some(daemon.table().statuses()),
            ..Default::default()
        },
        Request::Status {
            service: Some(name),
        } => match daemon.table().status(&name) {
            Some(status) => Response {
                ok: true,
                service: Some(status),
                ..Default::default()
            },
            None => Response::err(format!("Service '{name}' not found")),
        },
        Request::Restart { service } => match daemon.request_restart(&service) {
            RestartOutcome::Queued => {
                Response::ok_message(format!("Restart requested for service '{service}'"))
            }
            RestartOutcome::QueueFull => {
                Response::err("Restart queue is full, try again later")
            }
            RestartOutcome::UnknownService => {
                Response::err(format!("Service '{service}' not found"))
            }
        },
        Request::Signal { service, signal } => {
            let Some(sig) = parse_signal(&signal) else {
                return Response::err(format!("Unsupported signal: {signal}"));
            };
            if !daemon.table().contains(&service) {
                return Response::err(format!("Service '{service}' not found"));
            }
            let Some(pid) = daemon.table().running_pid(&service) else {
                return Response::err(format!("Service '{service}' not running"));
            };
            match daemon.signal_pid(pid, sig).await {
                Ok(()) => {
                    Response::ok_message(format!("Signal {signal} sent to service '{service}'"))
                }
                Err(e) => Response::err(format!("Failed to send signal: {e:#}")),
            }
        }
    }
}

/// Synchronous client half, used by the CLI.
pub fn client_call(sock: &Path, req: &Request) -> anyhow::Result<Response> {
    let mut stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!("failed to connect to pei daemon socket {}: {e}", sock.display())
    })?;

    let line = serde_json::to_string(req)? + "\n";
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut resp_line = String::new();
    reader.read_line(&mut resp_line)?;
    if resp_line.trim().is_empty() {
        anyhow::bail!("empty response from daemon");
    }
    Ok(serde_json::from_str(resp_line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_tokens_accept_sig_prefix() {
        assert_eq!(parse_signal("HUP"), Some(Signal::SIGHUP));
        assert_eq!(parse_signal("SIGHUP"), Some(Signal::SIGHUP));
        assert_eq!(parse_signal("kill"), Some(Signal::SIGKILL));
        assert_eq!(parse_signal("usr2"), Some(Signal::SIGUSR2));
        assert_eq!(parse_signal("STOP"), None);
        assert_eq!(parse_signal(""), None);
    }

    #[test]
    fn request_wire_shape_is_flat() {
        let req = Request::Signal {
            service: "echo".into(),
            signal: "HUP".into(),
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"command":"signal","service":"echo","signal":"HUP"}"#
        );
        let parsed: Request = serde_json::from_str(r#"{"command":"list"}"#).unwrap();
        assert!(matches!(parsed, Request::List));
    }

    #[test]
    fn response_omits_empty_fields() {
        let resp = Response::ok_message("done");
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"ok":true,"message":"done"}"#
        );
        let parsed: Response = serde_json::from_str(r#"{"ok":false}"#).unwrap();
        assert!(!parsed.ok);
        assert!(parsed.services.is_none());
    }
}
