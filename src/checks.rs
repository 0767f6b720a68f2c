use crate::error::{LaunchError, Result};
use nix::sched::CloneFlags;
use std::{fs, path::Path};

const MAX_USER_NAMESPACES: &str = "/proc/sys/user/max_user_namespaces";

pub fn is_namespace_supported(flag: CloneFlags) -> bool {
    fn exists(ns: &str) -> bool {
        Path::new(&format!("/proc/self/ns/{}", ns)).exists()
    }

    match flag {
        CloneFlags::CLONE_NEWNS => exists("mnt"),
        CloneFlags::CLONE_NEWPID => exists("pid"),
        CloneFlags::CLONE_NEWUSER => exists("user"),
        _ => false,
    }
}

/// Parses a `/proc/sys` integer, `None` if it is not a number.
fn parse_limit(raw: &str) -> Option<u64> {
    raw.trim().parse().ok()
}

/// Verifies the kernel can give us the namespaces we need before anything is unshared.
pub fn preflight() -> Result<()> {
    for (flag, name) in [
        (CloneFlags::CLONE_NEWUSER, "user"),
        (CloneFlags::CLONE_NEWPID, "pid"),
        (CloneFlags::CLONE_NEWNS, "mount"),
    ] {
        if !is_namespace_supported(flag) {
            return Err(LaunchError::Preflight {
                message: format!("kernel doesn't support {name} namespaces"),
            });
        }
    }

    // Missing or unreadable means the sysctl doesn't exist on this kernel.
    if let Ok(raw) = fs::read_to_string(MAX_USER_NAMESPACES) {
        if parse_limit(&raw) == Some(0) {
            return Err(LaunchError::Preflight {
                message: format!("user namespaces are disabled ({MAX_USER_NAMESPACES} is 0)"),
            });
        }
    }

    tracing::debug!("kernel supports user, pid and mount namespaces");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit("0\n"), Some(0));
        assert_eq!(parse_limit(" 63470\n"), Some(63470));
        assert_eq!(parse_limit("garbage"), None);
    }

    #[test]
    fn test_unsupported_flags_report_false() {
        assert!(!is_namespace_supported(CloneFlags::CLONE_NEWNET));
    }
}
