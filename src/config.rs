use crate::launch::{BindMount, EnvOverride, EnvPolicy, LaunchSpec};
use anyhow::{Context, Result, bail};
use clap::{Args, Parser};
use nix::unistd::{Gid, Uid};
use std::path::{Path, PathBuf};

const HEADING_ROOT: &str = "Root";
const HEADING_USER: &str = "User";
const HEADING_MOUNT: &str = "Mount";
const HEADING_ENVIRONMENT: &str = "Environment";
const HEADING_DEBUG: &str = "Debug";

const WRITABLE_MARKER: &str = "rw";

/// (uid_t)-1 means "no id" to the kernel and is refused in id maps.
const ID_LIMIT: i64 = u32::MAX as i64;

#[derive(Parser, Debug)]
#[command(
    name = "burrow",
    version,
    about = "Run a command inside an unprivileged user, pid and mount namespace sandbox"
)]
pub struct Config {
    #[command(flatten)]
    pub root: RootOptions,

    #[command(flatten)]
    pub user: UserOptions,

    #[command(flatten)]
    pub mount: MountOptions,

    #[command(flatten)]
    pub env: EnvOptions,

    #[command(flatten)]
    pub debug: DebugOptions,

    #[arg(
        last = true,
        required = true,
        value_name = "COMMAND",
        help = "Command and arguments to run inside the sandbox"
    )]
    pub command: Vec<String>,
}

impl Config {
    /// Validates the parsed arguments into an immutable `LaunchSpec`.
    ///
    /// Nothing here touches kernel state: a failure leaves the system exactly as it was.
    pub fn into_launch_spec(self) -> Result<LaunchSpec> {
        let (root, root_writable) = self.root.resolve()?;

        if self.command.is_empty() {
            bail!("at least one trailing argument is required");
        }

        for mount in &self.mount.mounts {
            if !mount.source.exists() {
                bail!("mount source {} does not exist", mount.source.display());
            }
        }

        Ok(LaunchSpec {
            root,
            root_writable,
            uid: Uid::from_raw(self.user.uid),
            gid: Gid::from_raw(self.user.gid),
            bind_mounts: self.mount.mounts,
            env: EnvPolicy {
                clear: self.env.clearenv,
                unset: self.env.unsetenv,
                overrides: self.env.envs,
            },
            bind_resolver: !self.mount.no_resolv,
            no_new_privs: self.user.no_new_privs,
            command: self.command,
        })
    }
}

#[derive(Args, Debug)]
pub struct RootOptions {
    #[arg(
        short = 'r',
        long = "root",
        required = true,
        num_args = 1..=2,
        value_names = ["PATH", "rw"],
        help = "Root file system path, optionally followed by 'rw' to mount it writable",
        help_heading = HEADING_ROOT
    )]
    pub root: Vec<String>,

    #[arg(
        long,
        help = "Mount the root file system writable (same as a trailing 'rw')",
        help_heading = HEADING_ROOT
    )]
    pub rw: bool,
}

impl RootOptions {
    fn resolve(&self) -> Result<(PathBuf, bool)> {
        let (path, writable) = match self.root.as_slice() {
            [path] => (path, self.rw),
            [path, marker] if marker == WRITABLE_MARKER => (path, true),
            [_, marker] => bail!("unexpected '{marker}' after root path, expected '{WRITABLE_MARKER}'"),
            _ => bail!("root file system path is required"),
        };

        let root = absolute_root(Path::new(path))?;
        Ok((root, writable))
    }
}

fn absolute_root(path: &Path) -> Result<PathBuf> {
    let root = std::path::absolute(path)
        .with_context(|| format!("failed to resolve root path {}", path.display()))?;

    if !root.is_dir() {
        bail!("root file system path {} is not a directory", root.display());
    }

    Ok(root)
}

#[derive(Args, Debug)]
pub struct UserOptions {
    #[arg(
        short = 'u',
        long,
        required = true,
        requires = "gid",
        value_parser = clap::value_parser!(u32).range(..ID_LIMIT),
        help = "User ID inside the sandbox",
        help_heading = HEADING_USER
    )]
    pub uid: u32,

    #[arg(
        short = 'g',
        long,
        required = true,
        requires = "uid",
        value_parser = clap::value_parser!(u32).range(..ID_LIMIT),
        help = "Group ID inside the sandbox",
        help_heading = HEADING_USER
    )]
    pub gid: u32,

    #[arg(
        long,
        help = "Prevent the command from gaining privileges through execve",
        help_heading = HEADING_USER
    )]
    pub no_new_privs: bool,
}

#[derive(Args, Debug)]
pub struct MountOptions {
    #[arg(
        short = 'm',
        long = "mount",
        value_name = "SOURCE:TARGET",
        value_parser = BindMount::parse,
        help = "Recursively bind SOURCE at TARGET (relative to the root)",
        help_heading = HEADING_MOUNT
    )]
    pub mounts: Vec<BindMount>,

    #[arg(
        long,
        help = "Do not bind the host's /etc/resolv.conf into the root",
        help_heading = HEADING_MOUNT
    )]
    pub no_resolv: bool,
}

#[derive(Args, Debug)]
pub struct EnvOptions {
    #[arg(
        short = 'e',
        long = "env",
        value_name = "KEY=VALUE",
        value_parser = EnvOverride::parse,
        help = "Set an environment variable for the command",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub envs: Vec<EnvOverride>,

    #[arg(
        long,
        help = "Start from an empty environment instead of inheriting it",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub clearenv: bool,

    #[arg(
        long,
        value_name = "KEY",
        help = "Unset an inherited environment variable",
        help_heading = HEADING_ENVIRONMENT
    )]
    pub unsetenv: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DebugOptions {
    #[arg(
        short,
        long,
        conflicts_with = "quiet",
        help = "Log every setup step to stderr",
        help_heading = HEADING_DEBUG
    )]
    pub verbose: bool,

    #[arg(
        short,
        long,
        help = "Do not print the init pid line on stdout",
        help_heading = HEADING_DEBUG
    )]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Result<Config> {
        Ok(Config::try_parse_from(
            std::iter::once("burrow").chain(args.iter().copied()),
        )?)
    }

    #[test]
    fn test_full_command_line() -> Result<()> {
        let root = TempDir::new()?;
        let data = TempDir::new()?;
        let root_arg = root.path().to_string_lossy().to_string();
        let mount_arg = format!("{}:data", data.path().display());

        let config = parse(&[
            "--root", &root_arg, "rw", "-u", "1000", "-g", "100", "-m", &mount_arg, "-e",
            "LANG=C", "--", "/bin/echo", "-n", "hello",
        ])?;
        let spec = config.into_launch_spec()?;

        assert_eq!(spec.root, root.path());
        assert!(spec.root_writable);
        assert_eq!(spec.uid, Uid::from_raw(1000));
        assert_eq!(spec.gid, Gid::from_raw(100));
        assert_eq!(spec.bind_mounts.len(), 1);
        assert_eq!(spec.bind_mounts[0].target, PathBuf::from("data"));
        assert_eq!(spec.env.overrides[0].key, "LANG");
        assert!(spec.bind_resolver);
        assert_eq!(spec.command, ["/bin/echo", "-n", "hello"]);
        Ok(())
    }

    #[test]
    fn test_root_defaults_to_read_only() -> Result<()> {
        let root = TempDir::new()?;
        let root_arg = root.path().to_string_lossy().to_string();

        let spec = parse(&["-r", &root_arg, "-u", "0", "-g", "0", "--", "true"])?
            .into_launch_spec()?;
        assert!(!spec.root_writable);

        let spec = parse(&["-r", &root_arg, "--rw", "-u", "0", "-g", "0", "--", "true"])?
            .into_launch_spec()?;
        assert!(spec.root_writable);
        Ok(())
    }

    #[test]
    fn test_unknown_root_marker_is_rejected() -> Result<()> {
        let root = TempDir::new()?;
        let root_arg = root.path().to_string_lossy().to_string();

        let config = parse(&["-r", &root_arg, "ro", "-u", "1", "-g", "1", "--", "true"])?;
        assert!(config.into_launch_spec().is_err());
        Ok(())
    }

    #[test]
    fn test_missing_command_fails() {
        assert!(parse(&["-r", "/", "-u", "1", "-g", "1"]).is_err());
        assert!(parse(&["-r", "/", "-u", "1", "-g", "1", "--"]).is_err());
    }

    #[test]
    fn test_ids_are_mutually_required() {
        assert!(parse(&["-r", "/", "-u", "1", "--", "true"]).is_err());
        assert!(parse(&["-r", "/", "-g", "1", "--", "true"]).is_err());
        assert!(parse(&["-r", "/", "-u", "-1", "-g", "1", "--", "true"]).is_err());
        assert!(parse(&["-r", "/", "-u", "abc", "-g", "1", "--", "true"]).is_err());
    }

    #[test]
    fn test_unmappable_id_fails_parsing() -> Result<()> {
        let max = u32::MAX.to_string();
        assert!(parse(&["-r", "/", "-u", &max, "-g", "1", "--", "true"]).is_err());
        assert!(parse(&["-r", "/", "-u", "1", "-g", &max, "--", "true"]).is_err());

        let highest = (u32::MAX - 1).to_string();
        let config = parse(&["-r", "/", "-u", &highest, "-g", &highest, "--", "true"])?;
        assert_eq!(config.user.uid, u32::MAX - 1);
        Ok(())
    }

    #[test]
    fn test_malformed_mount_and_env_fail_parsing() {
        assert!(parse(&["-r", "/", "-u", "1", "-g", "1", "-m", "/src", "--", "true"]).is_err());
        assert!(parse(&["-r", "/", "-u", "1", "-g", "1", "-e", "KEY", "--", "true"]).is_err());
    }

    #[test]
    fn test_root_must_be_a_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("file");
        std::fs::write(&file, b"")?;
        let file_arg = file.to_string_lossy().to_string();

        let config = parse(&["-r", &file_arg, "-u", "1", "-g", "1", "--", "true"])?;
        assert!(config.into_launch_spec().is_err());
        Ok(())
    }

    #[test]
    fn test_missing_mount_source_fails_validation() -> Result<()> {
        let root = TempDir::new()?;
        let root_arg = root.path().to_string_lossy().to_string();
        let mount_arg = format!("{}/missing:data", root.path().display());

        let config = parse(&[
            "-r", &root_arg, "-u", "1", "-g", "1", "-m", &mount_arg, "--", "true",
        ])?;
        assert!(config.into_launch_spec().is_err());
        Ok(())
    }
}
