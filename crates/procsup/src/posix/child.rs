//! Code that runs in the forked child before exec
//!
//! The parent prepares a [`ChildPlan`] with every string, pointer array and
//! descriptor number already in place. Between fork and exec the child only
//! walks the plan, so nothing here allocates.

use procsup_core::{ChildFailure, ChildStage, IdentityPlan};
use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::raw::c_char;

use super::sys::PosixSys;

/// Null-terminated `char *[]` over owned strings
#[derive(Debug)]
pub struct CStringArray {
    _items: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CStringArray {
    pub fn new(items: Vec<CString>) -> Self {
        let mut ptrs: Vec<*const c_char> = items.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Self {
            _items: items,
            ptrs,
        }
    }

    pub fn as_ptrs(&self) -> &[*const c_char] {
        &self.ptrs
    }

    pub fn len(&self) -> usize {
        self.ptrs.len() - 1
    }
}

#[derive(Debug)]
pub struct ChildPlan {
    pub program: CString,
    pub argv: CStringArray,
    pub envp: CStringArray,
    pub cwd: Option<CString>,
    /// Terminal slave to become the controlling tty of a new session
    pub controlling_tty: Option<RawFd>,
    pub identity: IdentityPlan,
    /// Supplementary groups applied with an identity switch
    pub groups: Vec<u32>,
    /// (descriptor in the parent, number it must have in the child)
    pub wiring: Vec<(RawFd, RawFd)>,
    /// Lowest number above every wiring target
    pub floor: RawFd,
    /// Descriptors open at fork time; all but the targets are closed
    pub inherited: Vec<RawFd>,
    /// Write end of the exec-status pipe, already above `floor`
    pub error_fd: RawFd,
    relocated: Vec<RawFd>,
}

impl ChildPlan {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: CString,
        argv: CStringArray,
        envp: CStringArray,
        cwd: Option<CString>,
        controlling_tty: Option<RawFd>,
        identity: IdentityPlan,
        groups: Vec<u32>,
        wiring: Vec<(RawFd, RawFd)>,
        inherited: Vec<RawFd>,
        error_fd: RawFd,
    ) -> Self {
        let relocated = vec![-1; wiring.len()];
        Self {
            program,
            argv,
            envp,
            cwd,
            controlling_tty,
            identity,
            groups,
            floor: wiring_floor(&wiring),
            wiring,
            inherited,
            error_fd,
            relocated,
        }
    }

    fn is_target(&self, fd: RawFd) -> bool {
        self.wiring.iter().any(|(_, target)| *target == fd)
    }
}

/// First descriptor number no child target can collide with
pub fn wiring_floor(wiring: &[(RawFd, RawFd)]) -> RawFd {
    wiring
        .iter()
        .map(|(_, target)| target + 1)
        .max()
        .unwrap_or(0)
        .max(3)
}

/// Run the plan and exec. On any failure the errno and stage are written
/// to the status pipe and the child exits with the stage's code.
pub fn run_child<S: PosixSys>(sys: &mut S, plan: &mut ChildPlan) -> ! {
    let failure = match prepare_and_exec(sys, plan) {
        Ok(never) => match never {},
        Err(failure) => failure,
    };
    sys.write_report(plan.error_fd, &failure.encode());
    sys.exit(failure.stage.exit_code())
}

fn at(stage: ChildStage) -> impl Fn(nix::errno::Errno) -> ChildFailure {
    move |errno| ChildFailure::new(stage, errno as i32)
}

fn prepare_and_exec<S: PosixSys>(
    sys: &mut S,
    plan: &mut ChildPlan,
) -> Result<Infallible, ChildFailure> {
    sys.reset_signals();

    if let Some(tty) = plan.controlling_tty {
        sys.setsid().map_err(at(ChildStage::Session))?;
        sys.set_controlling_tty(tty).map_err(at(ChildStage::Session))?;
    }

    if let IdentityPlan::Switch {
        uid,
        gid,
        reset_to_root,
    } = plan.identity
    {
        if reset_to_root {
            sys.setuid(0).map_err(at(ChildStage::Identity))?;
            sys.setgid(0).map_err(at(ChildStage::Identity))?;
        }
        sys.switch_uid(uid, gid, &plan.groups)
            .map_err(at(ChildStage::Identity))?;
    }

    if let Some(cwd) = &plan.cwd {
        sys.chdir(cwd).map_err(at(ChildStage::Chdir))?;
    }

    // Move every source out of the target range first so a dup2 never
    // clobbers a source another target still needs.
    for (slot, (source, _)) in plan.relocated.iter_mut().zip(&plan.wiring) {
        *slot = sys
            .dup_above(*source, plan.floor)
            .map_err(at(ChildStage::FdSetup))?;
    }
    for (relocated, (_, target)) in plan.relocated.iter().zip(&plan.wiring) {
        sys.dup2(*relocated, *target)
            .map_err(at(ChildStage::FdSetup))?;
    }
    for &fd in &plan.inherited {
        if fd != plan.error_fd && !plan.is_target(fd) {
            sys.close(fd);
        }
    }

    let errno = sys.execve(&plan.program, plan.argv.as_ptrs(), plan.envp.as_ptrs());
    Err(ChildFailure::new(ChildStage::Exec, errno as i32))
}
