use crate::capabilities::has_any_permitted_capabilities;
use anyhow::{Result, bail};
use nix::unistd::{Gid, Uid, getegid, geteuid, getuid};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrivilegeLevel {
    Root,
    Rootless,
    Setuid,
    RootlessWithCapabilities,
}

/// The caller's identity, captured once before any namespace is created.
#[derive(Debug, Clone, Copy)]
pub struct HostContext {
    ruid: Uid,
    euid: Uid,
    egid: Gid,
    level: PrivilegeLevel,
}

impl HostContext {
    pub fn capture() -> Result<Self> {
        let ruid = getuid();
        let euid = geteuid();
        let egid = getegid();

        let level = if ruid != euid {
            PrivilegeLevel::Setuid
        } else if euid.is_root() {
            PrivilegeLevel::Root
        } else if has_any_permitted_capabilities()? {
            PrivilegeLevel::RootlessWithCapabilities
        } else {
            PrivilegeLevel::Rootless
        };

        Ok(Self {
            ruid,
            euid,
            egid,
            level,
        })
    }

    /// Refuses installations that would run the launch with inherited privileges.
    pub fn ensure_supported(&self) -> Result<()> {
        match self.level {
            PrivilegeLevel::Root | PrivilegeLevel::Rootless => Ok(()),
            PrivilegeLevel::Setuid => bail!(SETUID_ERROR_MESSAGE),
            PrivilegeLevel::RootlessWithCapabilities => bail!(FILE_CAPABILITY_ERROR_MESSAGE),
        }
    }

    #[inline]
    pub fn ruid(&self) -> Uid {
        self.ruid
    }

    #[inline]
    pub fn euid(&self) -> Uid {
        self.euid
    }

    #[inline]
    pub fn egid(&self) -> Gid {
        self.egid
    }

    #[inline]
    pub fn privilege_level(&self) -> PrivilegeLevel {
        self.level
    }
}

const SETUID_ERROR_MESSAGE: &str = "Unsupported configuration: burrow is installed setuid (real and effective uid differ). \
It only needs the capabilities granted inside its own user namespace; remove the setuid bit and retry.";

const FILE_CAPABILITY_ERROR_MESSAGE: &str = "Unsupported configuration: Detected permitted capabilities without root privileges. \
This may indicate that the binary carries file capabilities (setcap), which are not supported. \
Remove them and retry.";
