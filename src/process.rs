use crate::error::{LaunchError, Result};
use nix::{
    errno::Errno,
    sys::{
        signal::Signal,
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, fork},
};
use std::fmt;

/// Which part of the launch a process plays after the forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Stays in the caller's pid namespace and waits on `NamespaceInit`.
    Reporter,
    /// Pid 1 of the new pid namespace; builds the mounts and waits on `Workload`.
    NamespaceInit,
    /// Execs the command.
    Workload,
}

impl ProcessRole {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Reporter => "reporter",
            Self::NamespaceInit => "namespace init",
            Self::Workload => "workload",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(Signal),
}

impl ExitOutcome {
    /// The status a supervisor forwards as its own, shell style for signals.
    pub fn code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(signal) => 128 + *signal as i32,
        }
    }
}

pub enum Forked {
    Parent(ChildHandle),
    Child,
}

/// Forks `role` off the current process.
///
/// The caller must be single threaded; the child continues with a copy of
/// the whole address space.
pub fn fork_role(role: ProcessRole) -> Result<Forked> {
    // SAFETY: burrow never spawns threads, so the child inherits no locks held elsewhere.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!(%role, pid = %child, "forked");
            Ok(Forked::Parent(ChildHandle::new(child, role)))
        }
        Ok(ForkResult::Child) => Ok(Forked::Child),
        Err(source) => Err(LaunchError::Fork {
            role: role.name(),
            source,
        }),
    }
}

/// The single direct child a supervisor is responsible for.
#[derive(Debug)]
pub struct ChildHandle {
    pid: Pid,
    role: ProcessRole,
}

impl ChildHandle {
    #[inline]
    fn new(pid: Pid, role: ProcessRole) -> Self {
        Self { pid, role }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Blocks until the child terminates.
    pub fn wait(self) -> Result<ExitOutcome> {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ExitOutcome::Exited(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return Ok(ExitOutcome::Signaled(signal));
                }
                Ok(status) => tracing::trace!(?status, "ignoring wait status"),
                Err(Errno::EINTR) => {}
                Err(source) => {
                    return Err(LaunchError::Wait {
                        role: self.role.name(),
                        source,
                    });
                }
            }
        }
    }
}

/// Leaves a forked test child without running the harness's exit handlers.
#[cfg(test)]
pub(crate) fn child_exit(code: i32) -> ! {
    // SAFETY: _exit only ends the calling process.
    unsafe { nix::libc::_exit(code) }
}
