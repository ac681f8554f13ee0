//! Control-channel tests against the real server and client over a
//! throwaway socket path. No root and no pid 1 required: the exercised
//! paths (list, status, restart enqueue, signal refusal) all settle before
//! any credential flip would happen.

use pei::config::{self, Config};
use pei::daemon::{Daemon, RestartRequest};
use pei::ipc::{self, Request, Response};
use pei::privilege::CredentialGate;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use users::{get_current_gid, get_current_uid, get_group_by_gid, get_user_by_uid};

const CATALOG: &str = r#"
version: "1.0"
services:
  echo:
    command: ["sh", "-c", "echo hi; sleep 3600"]
    user: nobody
    group: nobody
    restart: always
  crasher:
    command: ["sh", "-c", "exit 1"]
    user: nobody
    group: nobody
    restart: on-failure
    max_restarts: 3
    restart_delay: "1s"
  tick:
    command: ["sh", "-c", "date +%s"]
    user: nobody
    group: nobody
    oneshot: true
    interval: "2s"
"#;

struct TestEnv {
    _tmp: TempDir,
    sock: PathBuf,
    config: Config,
}

impl TestEnv {
    fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let config_path = tmp.path().join("pei.yaml");
        fs::write(&config_path, CATALOG).unwrap();
        let config = config::load(&config_path).expect("load catalog");
        Self {
            sock: tmp.path().join("pei.sock"),
            _tmp: tmp,
            config,
        }
    }

    /// Build a daemon around the current (unprivileged) identity.
    fn daemon(&self, queue_capacity: usize) -> (Arc<Daemon>, mpsc::Receiver<RestartRequest>) {
        let user = get_user_by_uid(get_current_uid())
            .expect("current user")
            .name()
            .to_string_lossy()
            .to_string();
        let group = get_group_by_gid(get_current_gid())
            .expect("current group")
            .name()
            .to_string_lossy()
            .to_string();
        let gate = CredentialGate::new(&user, &group).expect("resolve current identity");
        let (tx, rx) = mpsc::channel(queue_capacity);
        (Arc::new(Daemon::new(&self.config, gate, tx)), rx)
    }

    async fn serve(&self, daemon: Arc<Daemon>) {
        let listener = ipc::bind(&self.sock).expect("bind control socket");
        tokio::spawn(ipc::serve(listener, daemon));
    }
}

async fn call(sock: &Path, req: Request) -> Response {
    let sock = sock.to_path_buf();
    tokio::task::spawn_blocking(move || ipc::client_call(&sock, &req))
        .await
        .expect("join client call")
        .expect("client call")
}

#[tokio::test(flavor = "multi_thread")]
async fn list_reports_configured_services_as_stopped() {
    let env = TestEnv::new();
    let (daemon, _rx) = env.daemon(100);
    env.serve(daemon).await;

    let resp = call(&env.sock, Request::List).await;
    assert!(resp.ok);
    let services = resp.services.expect("services map");
    assert_eq!(services.len(), 3);
    for name in ["echo", "crasher", "tick"] {
        let st = &services[name];
        assert_eq!(st.name, name);
        assert!(!st.running);
        assert_eq!(st.pid, None);
        assert_eq!(st.restarts, 0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_list_is_idempotent() {
    let env = TestEnv::new();
    let (daemon, _rx) = env.daemon(100);
    env.serve(daemon).await;

    let a = call(&env.sock, Request::List).await;
    let b = call(&env.sock, Request::List).await;
    assert_eq!(a.services, b.services);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_returns_one_service_or_not_found() {
    let env = TestEnv::new();
    let (daemon, _rx) = env.daemon(100);
    env.serve(daemon).await;

    let resp = call(
        &env.sock,
        Request::Status {
            service: Some("crasher".into()),
        },
    )
    .await;
    assert!(resp.ok);
    let st = resp.service.expect("status entry");
    assert_eq!(st.name, "crasher");
    assert!(!st.running);

    let resp = call(
        &env.sock,
        Request::Status {
            service: Some("ghost".into()),
        },
    )
    .await;
    assert!(!resp.ok);
    assert!(resp.message.contains("not found"));
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_enqueues_into_the_worker_queue() {
    let env = TestEnv::new();
    let (daemon, mut rx) = env.daemon(100);
    env.serve(daemon).await;

    let resp = call(
        &env.sock,
        Request::Restart {
            service: "echo".into(),
        },
    )
    .await;
    assert!(resp.ok, "{}", resp.message);
    assert!(resp.message.contains("echo"));

    let req = rx.recv().await.expect("queued restart request");
    assert_eq!(req.service.name, "echo");

    let resp = call(
        &env.sock,
        Request::Restart {
            service: "ghost".into(),
        },
    )
    .await;
    assert!(!resp.ok);
    assert!(resp.message.contains("not found"));
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_reports_queue_full() {
    let env = TestEnv::new();
    let (daemon, _rx) = env.daemon(1);

    let first = ipc::dispatch(&daemon, Request::Restart { service: "echo".into() }).await;
    assert!(first.ok);
    let second = ipc::dispatch(&daemon, Request::Restart { service: "echo".into() }).await;
    assert!(!second.ok);
    assert!(second.message.contains("queue is full"));
}

#[tokio::test(flavor = "multi_thread")]
async fn signal_refuses_stopped_services_and_bad_tokens() {
    let env = TestEnv::new();
    let (daemon, _rx) = env.daemon(100);
    env.serve(daemon).await;

    let resp = call(
        &env.sock,
        Request::Signal {
            service: "echo".into(),
            signal: "HUP".into(),
        },
    )
    .await;
    assert!(!resp.ok);
    assert!(resp.message.contains("not running"));

    let resp = call(
        &env.sock,
        Request::Signal {
            service: "echo".into(),
            signal: "PWR".into(),
        },
    )
    .await;
    assert!(!resp.ok);
    assert!(resp.message.contains("Unsupported signal"));

    let resp = call(
        &env.sock,
        Request::Signal {
            service: "ghost".into(),
            signal: "HUP".into(),
        },
    )
    .await;
    assert!(!resp.ok);
    assert!(resp.message.contains("not found"));
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_requests_do_not_kill_the_listener() {
    let env = TestEnv::new();
    let (daemon, _rx) = env.daemon(100);
    env.serve(daemon).await;

    let sock = env.sock.clone();
    let resp: Response = tokio::task::spawn_blocking(move || {
        let mut stream = UnixStream::connect(&sock).unwrap();
        stream.write_all(b"this is not json\n").unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(line.trim_end()).unwrap()
    })
    .await
    .unwrap();
    assert!(!resp.ok);
    assert!(resp.message.contains("Invalid request"));

    // The listener is still alive for the next client.
    let resp = call(&env.sock, Request::List).await;
    assert!(resp.ok);
}
