use crate::{
    context::HostContext,
    error::{LaunchError, MappingFile, Result},
    launch::LaunchSpec,
};
use nix::{
    sched::{CloneFlags, unshare},
    unistd::{Gid, Uid, setgid, setuid},
};
use std::{fmt, fs::OpenOptions, io::Write};

const SETGROUPS_DENY: &str = "deny";

/// A single-entry line of `uid_map` / `gid_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub inside: u32,
    pub outside: u32,
    pub count: u32,
}

impl IdMapping {
    pub fn single(inside: u32, outside: u32) -> Self {
        Self {
            inside,
            outside,
            count: 1,
        }
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.inside, self.outside, self.count)
    }
}

/// Moves the calling process into fresh user and pid namespaces as `spec.uid`/`spec.gid`.
///
/// The kernel fixes the order: `setgroups` must be denied before `gid_map` is
/// written, and both maps must exist before the ids can be assumed. The pid
/// namespace only applies to children forked afterwards.
pub fn enter(spec: &LaunchSpec, host: &HostContext) -> Result<()> {
    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID).map_err(|source| {
        LaunchError::Namespace {
            what: "user/pid",
            source,
        }
    })?;
    tracing::debug!("user and pid namespaces created");

    write_proc_file(MappingFile::SetGroups, SETGROUPS_DENY)?;

    let uid_map = IdMapping::single(spec.uid.as_raw(), host.euid().as_raw());
    write_proc_file(MappingFile::UidMap, &uid_map.to_string())?;

    let gid_map = IdMapping::single(spec.gid.as_raw(), host.egid().as_raw());
    write_proc_file(MappingFile::GidMap, &gid_map.to_string())?;

    tracing::debug!(%uid_map, %gid_map, "wrote id mappings");

    drop_privileges(spec.uid, spec.gid)
}

fn write_proc_file(file: MappingFile, contents: &str) -> Result<()> {
    let write = || -> std::io::Result<()> {
        let mut handle = OpenOptions::new().write(true).open(file.path())?;
        handle.write_all(contents.as_bytes())
    };

    write().map_err(|source| LaunchError::MappingWrite { file, source })
}

/// Assumes the mapped identity. The group goes first, while changing it is still permitted.
fn drop_privileges(uid: Uid, gid: Gid) -> Result<()> {
    setgid(gid).map_err(|source| LaunchError::PrivilegeDrop {
        what: "gid",
        id: gid.as_raw(),
        source,
    })?;

    setuid(uid).map_err(|source| LaunchError::PrivilegeDrop {
        what: "uid",
        id: uid.as_raw(),
        source,
    })?;

    tracing::debug!(%uid, %gid, "assumed sandbox identity");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_line_format() {
        let mapping = IdMapping::single(1000, 4242);
        assert_eq!(mapping.count, 1);
        assert_eq!(mapping.to_string(), "1000 4242 1");
    }

    #[test]
    fn test_root_mapping_line_format() {
        assert_eq!(IdMapping::single(0, 1000).to_string(), "0 1000 1");
    }
}
