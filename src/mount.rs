use crate::{
    error::{LaunchError, MountStage, Result},
    hardener,
    launch::LaunchSpec,
};
use nix::sched::{CloneFlags, unshare};
use std::path::{Path, PathBuf};

/// Host device nodes re-exposed inside the sandbox.
pub const DEVICE_NODES: [&str; 6] = ["tty", "null", "zero", "full", "random", "urandom"];

const RESOLVER_CONFIG: &str = "etc/resolv.conf";

/// Moves the caller into its own mount namespace, detached from the host's propagation.
pub fn isolate() -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNS).map_err(|source| LaunchError::Namespace {
        what: "mount",
        source,
    })?;

    hardener::set_mounts_private_recursive()?;
    tracing::debug!("mount namespace created");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoFs {
    DevPts,
    Tmpfs,
    Proc,
}

impl PseudoFs {
    pub fn fstype(&self) -> &'static str {
        match self {
            Self::DevPts => "devpts",
            Self::Tmpfs => "tmpfs",
            Self::Proc => "proc",
        }
    }
}

/// Fresh pseudo-filesystem instances, relative to the sandbox root.
const PSEUDO_MOUNTS: [(PseudoFs, &str); 5] = [
    (PseudoFs::DevPts, "dev/pts"),
    (PseudoFs::Tmpfs, "dev/shm"),
    (PseudoFs::Tmpfs, "run"),
    (PseudoFs::Tmpfs, "tmp"),
    (PseudoFs::Proc, "proc"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOp {
    /// Bind the root onto itself, then remount it `nosuid,nodev` (and `ro` unless writable).
    RootSelfBind { root: PathBuf, writable: bool },
    /// Bind `/dev/<name>` onto `<root>/dev/<name>`.
    DeviceBind { source: PathBuf, target: PathBuf },
    /// Bind a single host file at the same path under the root.
    ResolverBind { source: PathBuf, target: PathBuf },
    PseudoFs { kind: PseudoFs, target: PathBuf },
    /// Recursive bind of a caller-supplied source.
    UserBind { source: PathBuf, target: PathBuf },
}

impl MountOp {
    pub fn apply(&self) -> Result<()> {
        match self {
            MountOp::RootSelfBind { root, writable } => {
                hardener::bind_mount_self(root)?;
                hardener::remount_root(root, *writable)
            }
            MountOp::DeviceBind { source, target } => {
                hardener::bind_mount(source, target, false, MountStage::DeviceBind)
            }
            MountOp::ResolverBind { source, target } => {
                hardener::bind_mount(source, target, false, MountStage::ResolverBind)
            }
            MountOp::PseudoFs { kind, target } => hardener::mount_pseudo(kind.fstype(), target),
            MountOp::UserBind { source, target } => {
                hardener::bind_mount(source, target, true, MountStage::UserBind)
            }
        }
    }
}

/// Ordered mount operations rebuilding the sandbox root.
///
/// The root self-bind always comes first: every later target lives beneath it
/// and must land on the new mount, not on the original one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    ops: Vec<MountOp>,
}

impl MountPlan {
    pub fn new(spec: &LaunchSpec) -> Self {
        let root = spec.root.as_path();
        let mut ops = vec![MountOp::RootSelfBind {
            root: root.to_path_buf(),
            writable: spec.root_writable,
        }];

        for name in DEVICE_NODES {
            let node = Path::new("dev").join(name);
            ops.push(MountOp::DeviceBind {
                source: Path::new("/").join(&node),
                target: root.join(node),
            });
        }

        if spec.bind_resolver {
            ops.push(MountOp::ResolverBind {
                source: Path::new("/").join(RESOLVER_CONFIG),
                target: root.join(RESOLVER_CONFIG),
            });
        }

        for (kind, target) in PSEUDO_MOUNTS {
            ops.push(MountOp::PseudoFs {
                kind,
                target: root.join(target),
            });
        }

        for mount in &spec.bind_mounts {
            ops.push(MountOp::UserBind {
                source: mount.source.clone(),
                target: mount.target_under(root),
            });
        }

        Self { ops }
    }

    #[cfg(test)]
    pub fn ops(&self) -> &[MountOp] {
        &self.ops
    }

    /// Applies every operation in order, stopping at the first failure.
    ///
    /// Nothing is rolled back: the mounts die with the mount namespace.
    pub fn execute(&self) -> Result<()> {
        for op in &self.ops {
            tracing::debug!(?op, "mounting");
            op.apply()?;
        }

        tracing::debug!(count = self.ops.len(), "mount plan applied");
        Ok(())
    }
}
