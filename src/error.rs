use crate::report::Phase;
use nix::errno::Errno;
use std::{error::Error as _, fmt, io, path::PathBuf};
use thiserror::Error;

/// Exit code used when any step before the workload's exec fails.
pub const SETUP_FAILURE: i32 = 125;

/// Exit code for an exec failure other than "not found".
pub const EXEC_FAILURE: i32 = 126;

/// Exit code for a program that could not be found on the sandbox PATH.
pub const EXEC_NOT_FOUND: i32 = 127;

/// Which step of mount construction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStage {
    PropagationPrivate,
    RootBind,
    RootRemount,
    DeviceBind,
    ResolverBind,
    PseudoFs,
    UserBind,
}

impl fmt::Display for MountStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PropagationPrivate => "private propagation",
            Self::RootBind => "root bind",
            Self::RootRemount => "root remount",
            Self::DeviceBind => "device bind",
            Self::ResolverBind => "resolver bind",
            Self::PseudoFs => "pseudo-filesystem mount",
            Self::UserBind => "user bind",
        };
        f.write_str(name)
    }
}

/// Proc file written while mapping the user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingFile {
    SetGroups,
    UidMap,
    GidMap,
}

impl MappingFile {
    pub fn path(&self) -> &'static str {
        match self {
            Self::SetGroups => "/proc/self/setgroups",
            Self::UidMap => "/proc/self/uid_map",
            Self::GidMap => "/proc/self/gid_map",
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("kernel support check failed: {message}")]
    Preflight { message: String },

    #[error("failed to unshare {what} namespace")]
    Namespace {
        what: &'static str,
        #[source]
        source: Errno,
    },

    #[error("failed to write {}", .file.path())]
    MappingWrite {
        file: MappingFile,
        #[source]
        source: io::Error,
    },

    #[error("failed to assume {what} {id}")]
    PrivilegeDrop {
        what: &'static str,
        id: u32,
        #[source]
        source: Errno,
    },

    #[error("{stage} failed mounting {source_path} on {}", .target.display())]
    Mount {
        stage: MountStage,
        source_path: String,
        target: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("failed to {what} {}", .path.display())]
    RootTransition {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("failed to fork {role}")]
    Fork {
        role: &'static str,
        #[source]
        source: Errno,
    },

    #[error("failed to wait for {role}")]
    Wait {
        role: &'static str,
        #[source]
        source: Errno,
    },

    #[error("failed to execute {program}")]
    Exec {
        program: String,
        #[source]
        source: Errno,
    },

    #[error("failed to adjust capabilities: {message}")]
    Capabilities { message: String },

    #[error("report channel failure: {message}")]
    Report { message: String },
}

impl LaunchError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Preflight { .. } | Self::Namespace { .. } => Phase::Namespace,
            Self::MappingWrite { .. } => Phase::Mapping,
            Self::PrivilegeDrop { .. } => Phase::PrivilegeDrop,
            Self::Mount { .. } => Phase::Mount,
            Self::RootTransition { .. } => Phase::RootTransition,
            Self::Fork { .. } => Phase::Fork,
            Self::Wait { .. } => Phase::Wait,
            Self::Exec { .. } => Phase::Exec,
            Self::Capabilities { .. } => Phase::Capabilities,
            Self::Report { .. } => Phase::Report,
        }
    }

    /// Exit code a process reports when it dies of this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exec { source, .. } if *source == Errno::ENOENT => EXEC_NOT_FOUND,
            Self::Exec { .. } => EXEC_FAILURE,
            _ => SETUP_FAILURE,
        }
    }

    /// Renders the error with its full source chain on a single line.
    pub fn diagnostic(&self) -> String {
        let mut message = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;
