//! Identity switch planning for spawned children
//!
//! The child decides how to change uid/gid from three inputs: the requested
//! uid and gid (either may be absent) and the supervisor's own identity.
//! Planning happens in the parent so the forked child only executes a fixed
//! sequence of syscalls.

/// The supervisor's identity at spawn time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Real uid
    pub ruid: u32,
    /// Effective uid
    pub euid: u32,
    /// Effective gid
    pub egid: u32,
}

impl Identity {
    /// Query the calling process
    #[cfg(unix)]
    pub fn current() -> Self {
        Self {
            ruid: crate::util::get_uid(),
            euid: crate::util::get_euid(),
            egid: crate::util::get_egid(),
        }
    }
}

/// What the child must do with its identity before exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPlan {
    /// Keep the inherited identity
    Unchanged,
    /// Switch to `uid`/`gid`.
    ///
    /// When `reset_to_root` is set the supervisor was started by root and is
    /// running with a different effective identity; the child first regains
    /// root (`setuid(0)`, `setgid(0)`) so the final switch is permitted.
    Switch {
        uid: u32,
        gid: u32,
        reset_to_root: bool,
    },
}

impl IdentityPlan {
    /// Plan the switch. A missing half defaults to the effective id; a target
    /// equal to the effective identity is a no-op.
    pub fn resolve(uid: Option<u32>, gid: Option<u32>, current: Identity) -> Self {
        if uid.is_none() && gid.is_none() {
            return IdentityPlan::Unchanged;
        }

        let uid = uid.unwrap_or(current.euid);
        let gid = gid.unwrap_or(current.egid);
        if uid == current.euid && gid == current.egid {
            return IdentityPlan::Unchanged;
        }

        IdentityPlan::Switch {
            uid,
            gid,
            reset_to_root: current.ruid == 0,
        }
    }

    pub fn is_switch(&self) -> bool {
        matches!(self, IdentityPlan::Switch { .. })
    }
}
