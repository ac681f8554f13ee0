//! Credentialed child spawner.

use crate::config::Service;
use crate::error::StartError;
use crate::privilege::{lookup_uid_gid, Elevated};
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

pub struct SpawnedChild {
    pub pid: i32,
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Launch `svc` under its configured (uid, gid) with captured stdio. The
/// `Elevated` guard is the proof that the caller currently holds root; the
/// fork inherits it and the child switches identity before exec (gid first,
/// so the uid change cannot revoke the privilege the gid change needs —
/// `Command` orders the two that way in the forked child).
pub fn spawn_service(_elevated: &Elevated<'_>, svc: &Service) -> Result<SpawnedChild, StartError> {
    let (uid, gid) = lookup_uid_gid(&svc.user, &svc.group)?;

    let mut cmd = Command::new(&svc.command[0]);
    cmd.args(&svc.command[1..]);
    if let Some(dir) = &svc.working_dir {
        cmd.current_dir(dir);
    }
    // Supervisor environment overlaid with the service's own; service keys win.
    cmd.envs(&svc.environment);
    cmd.uid(uid).gid(gid);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let spawn_err = |source: std::io::Error| StartError::Spawn {
        argv0: svc.command[0].clone(),
        source,
    };

    let mut child = cmd.spawn().map_err(spawn_err)?;
    let pid = child
        .id()
        .map(|p| p as i32)
        .ok_or_else(|| spawn_err(std::io::Error::other("spawned child has no pid")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_err(std::io::Error::other("child stdout pipe missing")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_err(std::io::Error::other("child stderr pipe missing")))?;

    Ok(SpawnedChild {
        pid,
        child,
        stdout,
        stderr,
    })
}
