//! Credential gate.
//!
//! The pei binary is installed setuid-root, so at process entry the
//! effective uid is 0 while the real uid is the launching user. Dropping
//! moves the root identity into the real slot and the application identity
//! into the effective slot; re-elevation later swaps them back, which the
//! kernel permits because root never leaves the credential set.
//!
//! Credential changes are process-global. Every elevation goes through
//! [`CredentialGate::elevated`], which serializes holders on an internal
//! mutex and returns a guard that restores the application identity on
//! every exit path, panics included.

use crate::error::{CredentialError, StartError};
use nix::errno::Errno;
use nix::unistd::{getegid, geteuid, Gid, Uid};
use tokio::sync::{Mutex, MutexGuard};
use tracing::error;
use users::{get_group_by_name, get_user_by_name};

/// Resolve login names to ids. Start-time concern: a bad name fails the
/// service, not the catalog load.
pub fn lookup_uid_gid(user: &str, group: &str) -> Result<(u32, u32), StartError> {
    let lookup_err = || StartError::UserLookup {
        user: user.to_string(),
        group: group.to_string(),
    };
    let u = get_user_by_name(user).ok_or_else(lookup_err)?;
    let g = get_group_by_name(group).ok_or_else(lookup_err)?;
    Ok((u.uid(), g.gid()))
}

fn set_reuid(ruid: Uid, euid: Uid) -> Result<(), Errno> {
    // SAFETY: plain syscall, no pointers involved.
    Errno::result(unsafe { libc::setreuid(ruid.as_raw(), euid.as_raw()) }).map(drop)
}

fn set_regid(rgid: Gid, egid: Gid) -> Result<(), Errno> {
    // SAFETY: plain syscall, no pointers involved.
    Errno::result(unsafe { libc::setregid(rgid.as_raw(), egid.as_raw()) }).map(drop)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Elevated,
    Dropped,
}

#[derive(Debug)]
pub struct CredentialGate {
    root_uid: Uid,
    root_gid: Gid,
    app_uid: Uid,
    app_gid: Gid,
    state: Mutex<GateState>,
}

impl CredentialGate {
    /// Capture the current (root) identity and resolve the application
    /// identity. Must run before the first drop, while still effective-root.
    pub fn new(app_user: &str, app_group: &str) -> Result<Self, StartError> {
        let (app_uid, app_gid) = lookup_uid_gid(app_user, app_group)?;
        Ok(Self {
            root_uid: geteuid(),
            root_gid: getegid(),
            app_uid: Uid::from_raw(app_uid),
            app_gid: Gid::from_raw(app_gid),
            state: Mutex::new(GateState::Elevated),
        })
    }

    /// Acquire the elevation lock and switch the effective identity back to
    /// root. The returned guard drops to the application identity when it
    /// goes out of scope. At most one guard exists at any time.
    ///
    /// An unrecoverable half flip (gid change failed and the uid rollback
    /// failed too) terminates the supervisor: there is no identity left
    /// that is safe to keep running under.
    pub async fn elevated(&self) -> Result<Elevated<'_>, CredentialError> {
        let state = self.state.lock().await;
        if *state == GateState::Dropped {
            if let Err(e) = self.raise() {
                if e.is_fatal() {
                    error!(error = %e, "credential state is unrecoverable; exiting");
                    std::process::exit(1);
                }
                return Err(e);
            }
        }
        Ok(Elevated { gate: self, state })
    }

    /// Effective identity -> root. Caller holds the state lock.
    fn raise(&self) -> Result<(), CredentialError> {
        set_reuid(self.app_uid, self.root_uid).map_err(CredentialError::SetUid)?;
        if let Err(gid_err) = set_regid(self.app_gid, self.root_gid) {
            // Roll the uid back so we never report success from a half flip.
            return Err(match set_reuid(self.root_uid, self.app_uid) {
                Ok(()) => CredentialError::SetGid(gid_err),
                Err(restore) => CredentialError::Unrecoverable {
                    original: gid_err,
                    restore,
                },
            });
        }
        Ok(())
    }

    /// Effective identity -> application, keeping root in the real slot so
    /// the next elevation stays possible.
    fn lower(&self) -> Result<(), CredentialError> {
        set_reuid(self.root_uid, self.app_uid).map_err(CredentialError::SetUid)?;
        if let Err(gid_err) = set_regid(self.root_gid, self.app_gid) {
            return Err(match set_reuid(self.app_uid, self.root_uid) {
                Ok(()) => CredentialError::SetGid(gid_err),
                Err(restore) => CredentialError::Unrecoverable {
                    original: gid_err,
                    restore,
                },
            });
        }
        Ok(())
    }
}

/// Proof of elevation: the sole capability for credential-sensitive
/// operations. Restores the application identity on drop.
pub struct Elevated<'a> {
    gate: &'a CredentialGate,
    state: MutexGuard<'a, GateState>,
}

impl Drop for Elevated<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.gate.lower() {
            // A supervisor stuck with effective root must not keep running.
            error!(error = %e, "failed to drop privileges; exiting");
            std::process::exit(1);
        }
        *self.state = GateState::Dropped;
    }
}
