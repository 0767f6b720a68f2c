//! End-to-end launches. They need a kernel that lets unprivileged users create
//! user namespaces, so they only run with `cargo test -- --ignored`.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Output},
};
use tempfile::TempDir;

const BURROW: &str = env!("CARGO_BIN_EXE_burrow");

/// Host directories the fixture borrows so that ordinary tools run inside it.
const HOST_TREES: [&str; 5] = ["usr", "bin", "lib", "lib64", "sbin"];

struct Fixture {
    root: TempDir,
    binds: Vec<String>,
}

impl Fixture {
    fn new() -> std::io::Result<Self> {
        let root = TempDir::new()?;
        let path = root.path();

        for dir in ["dev/pts", "dev/shm", "run", "tmp", "proc", "etc", "data"] {
            fs::create_dir_all(path.join(dir))?;
        }
        for node in ["tty", "null", "zero", "full", "random", "urandom"] {
            fs::write(path.join("dev").join(node), b"")?;
        }
        fs::write(path.join("etc/resolv.conf"), b"")?;

        let mut binds = Vec::new();
        for tree in HOST_TREES {
            if Path::new("/").join(tree).is_dir() {
                fs::create_dir_all(path.join(tree))?;
                binds.push(format!("/{tree}:{tree}"));
            }
        }

        Ok(Self { root, binds })
    }

    fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    fn run(&self, extra: &[&str], command: &[&str]) -> std::io::Result<Output> {
        self.run_as("1000", extra, command)
    }

    fn run_as(&self, id: &str, extra: &[&str], command: &[&str]) -> std::io::Result<Output> {
        let root = self.path();
        let mut cmd = Command::new(BURROW);
        cmd.arg("--quiet")
            .arg("--root")
            .arg(&root)
            .args(["--uid", id, "--gid", id]);
        for bind in &self.binds {
            cmd.args(["--mount", bind]);
        }
        cmd.args(extra).arg("--").args(command).output()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
#[ignore]
fn echo_prints_and_exits_zero() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let output = fixture.run(&[], &["/bin/echo", "hello"])?;

    assert_eq!(stdout(&output), "hello\n");
    assert_eq!(output.status.code(), Some(0));
    Ok(())
}

#[test]
#[ignore]
fn false_exits_one() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let output = fixture.run(&[], &["/bin/false"])?;

    assert_eq!(output.status.code(), Some(1));
    Ok(())
}

#[test]
#[ignore]
fn init_pid_line_is_printed_without_quiet() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let output = Command::new(BURROW)
        .arg("--root")
        .arg(fixture.path())
        .args(["-u", "1000", "-g", "1000", "--", "/nonexistent"])
        .output()?;

    assert!(stdout(&output).starts_with("burrow: init is "));
    Ok(())
}

#[test]
#[ignore]
fn identity_and_pid_are_namespaced() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let output = fixture.run(&[], &["sh", "-c", "id -u; id -g; echo $$"])?;

    assert_eq!(stdout(&output), "1000\n1000\n2\n");
    Ok(())
}

#[test]
#[ignore]
fn root_is_read_only_unless_requested() -> std::io::Result<()> {
    let fixture = Fixture::new()?;

    let output = fixture.run(&[], &["sh", "-c", "echo x > /data/file"])?;
    assert_ne!(output.status.code(), Some(0));
    assert!(!fixture.path().join("data/file").exists());

    let output = fixture.run(&["--rw"], &["sh", "-c", "echo x > /data/file"])?;
    assert_eq!(output.status.code(), Some(0));
    assert!(fixture.path().join("data/file").exists());
    Ok(())
}

#[test]
#[ignore]
fn bind_mount_exposes_host_directory() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let host_data = TempDir::new()?;
    fs::write(host_data.path().join("greeting"), b"hi from host\n")?;

    let bind = format!("{}:data", host_data.path().display());
    let output = fixture.run(&["--mount", &bind], &["cat", "/data/greeting"])?;

    assert_eq!(stdout(&output), "hi from host\n");
    Ok(())
}

#[test]
#[ignore]
fn device_nodes_work() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let output = fixture.run(
        &[],
        &["sh", "-c", "head -c 4 /dev/zero | od -An -tx1; echo discard > /dev/null"],
    )?;

    assert_eq!(stdout(&output).trim(), "00 00 00 00");
    assert_eq!(output.status.code(), Some(0));
    Ok(())
}

#[test]
#[ignore]
fn environment_overrides_apply() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let output = fixture.run(
        &["--env", "GREETING=one", "--env", "GREETING=two"],
        &["sh", "-c", "echo $GREETING; echo $PATH"],
    )?;

    assert_eq!(
        stdout(&output),
        "two\n/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n"
    );
    Ok(())
}

#[test]
#[ignore]
fn capabilities_follow_the_target_uid() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let command = ["sh", "-c", "grep CapEff /proc/self/status"];

    let output = fixture.run(&[], &command)?;
    assert_eq!(stdout(&output).trim(), "CapEff:\t0000000000000000");

    let output = fixture.run_as("0", &[], &command)?;
    assert!(stdout(&output).starts_with("CapEff:"));
    assert_ne!(stdout(&output).trim(), "CapEff:\t0000000000000000");
    Ok(())
}

#[test]
#[ignore]
fn file_without_interpreter_line_runs_through_sh() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let script = fixture.path().join("data/script");
    fs::write(&script, b"echo from-script\n")?;
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;

    let output = fixture.run(&[], &["/data/script"])?;
    assert_eq!(stdout(&output), "from-script\n");
    assert_eq!(output.status.code(), Some(0));
    Ok(())
}

#[test]
#[ignore]
fn missing_program_reports_exec_failure() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let output = fixture.run(&[], &["definitely-not-installed"])?;

    assert_eq!(output.status.code(), Some(127));
    assert!(String::from_utf8_lossy(&output.stderr).contains("burrow: exec:"));
    Ok(())
}

#[test]
#[ignore]
fn missing_mount_target_reports_setup_failure() -> std::io::Result<()> {
    let fixture = Fixture::new()?;
    let host_data = TempDir::new()?;
    let bind = format!("{}:nowhere", host_data.path().display());

    let output = fixture.run(&["--mount", &bind], &["/bin/true"])?;

    assert_eq!(output.status.code(), Some(125));
    assert!(String::from_utf8_lossy(&output.stderr).contains("user bind"));
    Ok(())
}

#[test]
fn missing_command_fails_before_launch() -> std::io::Result<()> {
    let root = TempDir::new()?;
    let output = Command::new(BURROW)
        .arg("--root")
        .arg(root.path())
        .args(["-u", "1000", "-g", "1000"])
        .output()?;

    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    Ok(())
}

#[test]
fn missing_gid_fails_before_launch() -> std::io::Result<()> {
    let root = TempDir::new()?;
    let output = Command::new(BURROW)
        .arg("--root")
        .arg(root.path())
        .args(["-u", "1000", "--", "/bin/true"])
        .output()?;

    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    Ok(())
}

#[test]
fn unmappable_uid_fails_before_launch() -> std::io::Result<()> {
    let root = TempDir::new()?;
    let output = Command::new(BURROW)
        .arg("--root")
        .arg(root.path())
        .args(["-u", "4294967295", "-g", "1000", "--", "/bin/true"])
        .output()?;

    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    Ok(())
}
