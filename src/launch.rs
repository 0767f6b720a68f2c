use anyhow::{Result, bail};
use nix::unistd::{Gid, Uid};
use std::path::{Component, Path, PathBuf};

/// Validated, immutable description of one sandboxed launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub root: PathBuf,
    pub root_writable: bool,
    pub uid: Uid,
    pub gid: Gid,
    pub bind_mounts: Vec<BindMount>,
    pub env: EnvPolicy,
    pub bind_resolver: bool,
    pub no_new_privs: bool,
    pub command: Vec<String>,
}

impl LaunchSpec {
    #[inline]
    pub fn program(&self) -> &str {
        &self.command[0]
    }
}

/// A `source:target` pair; `target` is relative to the sandbox root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl BindMount {
    /// Parses `SOURCE:TARGET`, splitting at the first `:`.
    pub fn parse(input: &str) -> Result<Self> {
        let Some((source, target)) = input.split_once(':') else {
            bail!("mount points need to be provided in the 'source:target' format");
        };

        if source.is_empty() {
            bail!("mount source in '{input}' is empty");
        }

        let target = target.trim_start_matches('/');
        if target.is_empty() {
            bail!("mount target in '{input}' must be a non-empty path relative to the root");
        }

        let target = PathBuf::from(target);
        if target
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            bail!("mount target in '{input}' must not contain '..'");
        }

        Ok(Self {
            source: PathBuf::from(source),
            target,
        })
    }

    /// Where this mount lands on the host before the root is changed.
    pub fn target_under(&self, root: &Path) -> PathBuf {
        root.join(&self.target)
    }
}

/// A `KEY=VALUE` override for the workload environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOverride {
    pub key: String,
    pub value: String,
}

impl EnvOverride {
    /// Parses `KEY=VALUE`, splitting at the first `=`.
    pub fn parse(input: &str) -> Result<Self> {
        let Some((key, value)) = input.split_once('=') else {
            bail!("environment variables need to be provided in the 'key=value' format");
        };

        if key.is_empty() {
            bail!("environment variable name in '{input}' is empty");
        }

        if input.contains('\0') {
            bail!("environment variable '{key}' contains a NUL byte");
        }

        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// How the workload environment is derived from the caller's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvPolicy {
    pub clear: bool,
    pub unset: Vec<String>,
    pub overrides: Vec<EnvOverride>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_mount_splits_at_first_colon() -> Result<()> {
        let mount = BindMount::parse("/host/data:data")?;
        assert_eq!(mount.source, PathBuf::from("/host/data"));
        assert_eq!(mount.target, PathBuf::from("data"));

        let mount = BindMount::parse("/a:b:c")?;
        assert_eq!(mount.source, PathBuf::from("/a"));
        assert_eq!(mount.target, PathBuf::from("b:c"));
        Ok(())
    }

    #[test]
    fn test_bind_mount_target_made_relative() -> Result<()> {
        let mount = BindMount::parse("/src:/var/cache")?;
        assert_eq!(mount.target, PathBuf::from("var/cache"));
        assert_eq!(
            mount.target_under(Path::new("/tmp/root")),
            PathBuf::from("/tmp/root/var/cache")
        );
        Ok(())
    }

    #[test]
    fn test_bind_mount_rejects_bad_specs() {
        assert!(BindMount::parse("/src").is_err());
        assert!(BindMount::parse("/src:").is_err());
        assert!(BindMount::parse("/src:/").is_err());
        assert!(BindMount::parse(":data").is_err());
        assert!(BindMount::parse("/src:../escape").is_err());
    }

    #[test]
    fn test_env_override_keeps_equals_in_value() -> Result<()> {
        let env = EnvOverride::parse("FLAGS=-O2 -DX=1")?;
        assert_eq!(env.key, "FLAGS");
        assert_eq!(env.value, "-O2 -DX=1");

        let env = EnvOverride::parse("EMPTY=")?;
        assert_eq!(env.value, "");
        Ok(())
    }

    #[test]
    fn test_env_override_rejects_bad_specs() {
        assert!(EnvOverride::parse("NOVALUE").is_err());
        assert!(EnvOverride::parse("=value").is_err());
    }
}
