//! Typed errors for the per-service operational paths.
//!
//! Startup-fatal conditions (bad config, not pid 1, not root) propagate as
//! plain `anyhow` chains; the types here are the ones that cross component
//! boundaries while the daemon keeps running.

use thiserror::Error;

/// Credential flip failure. `Unrecoverable` means the gid change failed and
/// the uid could not be restored either, leaving the process in a mixed
/// identity; the supervisor must exit.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("setreuid failed: {0}")]
    SetUid(#[source] nix::Error),

    #[error("setregid failed: {0}")]
    SetGid(#[source] nix::Error),

    #[error("setregid failed ({original}) and uid restore failed ({restore})")]
    Unrecoverable {
        original: nix::Error,
        restore: nix::Error,
    },
}

impl CredentialError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CredentialError::Unrecoverable { .. })
    }
}

/// Failure to get a service process running. Per-service: logged and counted
/// toward the restart budget, never fatal to the daemon.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("unknown user or group {user}:{group}")]
    UserLookup { user: String, group: String },

    #[error("failed to spawn {argv0}: {source}")]
    Spawn {
        argv0: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Signal delivery refused by the kernel. Logged, not fatal.
#[derive(Debug, Error)]
#[error("failed to signal pid {pid}: {source}")]
pub struct SignalError {
    pub pid: i32,
    #[source]
    pub source: nix::Error,
}
