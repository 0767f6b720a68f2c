use crate::error::{LaunchError, MountStage, Result};
use nix::{
    errno::Errno,
    mount::{MsFlags, mount},
    sys::statvfs::{FsFlags, statvfs},
    unistd::{chdir, chroot},
};
use std::path::Path;

const HOST_ROOT: &str = "/";

/// Recursively marks every mount in this namespace private so nothing we
/// mount from here on propagates back to the host.
pub fn set_mounts_private_recursive() -> Result<()> {
    let flags = MsFlags::MS_REC | MsFlags::MS_PRIVATE;
    mount::<str, str, str, str>(None, HOST_ROOT, None, flags, None).map_err(|source| {
        LaunchError::Mount {
            stage: MountStage::PropagationPrivate,
            source_path: "none".into(),
            target: HOST_ROOT.into(),
            source,
        }
    })
}

pub fn bind_mount(source: &Path, target: &Path, recursive: bool, stage: MountStage) -> Result<()> {
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags.insert(MsFlags::MS_REC);
    }

    mount::<Path, Path, str, str>(Some(source), target, None, flags, None).map_err(|errno| {
        LaunchError::Mount {
            stage,
            source_path: source.display().to_string(),
            target: target.to_path_buf(),
            source: errno,
        }
    })
}

/// Bind-mounts `path` onto itself so it becomes a mount point of its own.
pub fn bind_mount_self(path: &Path) -> Result<()> {
    bind_mount(path, path, false, MountStage::RootBind)
}

/// Flags a bind remount inside a user namespace has to carry over, because
/// the kernel locks them on mounts inherited from a more privileged namespace.
fn inherited_flags(path: &Path) -> std::result::Result<MsFlags, Errno> {
    let stat = statvfs(path)?;
    let fs_flags = stat.flags();

    let mut flags = MsFlags::empty();
    for (fs_flag, ms_flag) in [
        (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if fs_flags.contains(fs_flag) {
            flags.insert(ms_flag);
        }
    }

    Ok(flags)
}

/// Flags for the root remount, before any locked flags are merged in.
pub fn root_remount_flags(writable: bool) -> MsFlags {
    let mut flags =
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if !writable {
        flags.insert(MsFlags::MS_RDONLY);
    }
    flags
}

/// Remounts the (already self-bound) root `nosuid,nodev` and read-only unless `writable`.
pub fn remount_root(root: &Path, writable: bool) -> Result<()> {
    let to_error = |source| LaunchError::Mount {
        stage: MountStage::RootRemount,
        source_path: root.display().to_string(),
        target: root.to_path_buf(),
        source,
    };

    let flags = root_remount_flags(writable) | inherited_flags(root).map_err(to_error)?;
    mount::<Path, Path, str, str>(Some(root), root, None, flags, None).map_err(to_error)
}

/// Mounts a fresh instance of `fstype` at `target`.
pub fn mount_pseudo(fstype: &str, target: &Path) -> Result<()> {
    mount::<str, Path, str, str>(Some(fstype), target, Some(fstype), MsFlags::empty(), None)
        .map_err(|source| LaunchError::Mount {
            stage: MountStage::PseudoFs,
            source_path: fstype.to_string(),
            target: target.to_path_buf(),
            source,
        })
}

/// Makes `root` the process root and moves into it.
pub fn change_root(root: &Path) -> Result<()> {
    chroot(root).map_err(|source| LaunchError::RootTransition {
        what: "chroot into",
        path: root.to_path_buf(),
        source,
    })?;

    chdir(HOST_ROOT).map_err(|source| LaunchError::RootTransition {
        what: "chdir to",
        path: HOST_ROOT.into(),
        source,
    })?;

    tracing::debug!(root = %root.display(), "changed root");
    Ok(())
}

/// The process and its children are prevented from gaining new privileges via `execve()`
pub fn apply_no_new_privs() -> Result<()> {
    nix::sys::prctl::set_no_new_privs().map_err(|source| LaunchError::Capabilities {
        message: format!("PR_SET_NO_NEW_PRIVS failed: {source}"),
    })
}
