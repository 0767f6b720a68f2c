use crate::{
    error::{LaunchError, Result},
    launch::EnvPolicy,
};
use nix::{errno::Errno, unistd::execve};
use std::{
    ffi::{CStr, CString, OsStr, OsString},
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
};

/// Search path every workload starts with, before overrides.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const PATH_KEY: &str = "PATH";

/// Interpreter for executables the kernel does not recognise, as `execvp` does.
const FALLBACK_SHELL: &CStr = c"/bin/sh";

/// Ordered set of environment variables handed to the workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(OsString, OsString)>,
}

impl Environment {
    /// Derives the workload environment from `inherited` according to `policy`:
    /// unset, then PATH reset, then overrides in order.
    pub fn build<I>(policy: &EnvPolicy, inherited: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut env = Self::default();

        if !policy.clear {
            for (key, value) in inherited {
                env.set(key, value);
            }
        }

        for key in &policy.unset {
            env.remove(OsStr::new(key));
        }

        env.set(PATH_KEY.into(), DEFAULT_PATH.into());

        for entry in &policy.overrides {
            env.set((&entry.key).into(), (&entry.value).into());
        }

        env
    }

    pub fn from_host(policy: &EnvPolicy) -> Self {
        Self::build(policy, std::env::vars_os())
    }

    /// Sets `key`, replacing an earlier value in place.
    pub fn set(&mut self, key: OsString, value: OsString) {
        match self.vars.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.vars.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &OsStr) {
        self.vars.retain(|(existing, _)| existing != key);
    }

    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_os_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// `KEY=VALUE` strings in the form `execve` wants.
    pub fn to_envp(&self) -> Result<Vec<CString>> {
        self.vars
            .iter()
            .map(|(key, value)| {
                let mut entry = key.clone().into_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry).map_err(|_| LaunchError::Exec {
                    program: format!("(environment entry {})", key.to_string_lossy()),
                    source: Errno::EINVAL,
                })
            })
            .collect()
    }
}

/// Candidate paths for `program`, in the order `execvp` would try them.
pub fn search_candidates(program: &str, search_path: Option<&OsStr>) -> Vec<PathBuf> {
    if program.contains('/') {
        return vec![PathBuf::from(program)];
    }

    let search_path = search_path.unwrap_or(OsStr::new(DEFAULT_PATH));
    search_path
        .as_bytes()
        .split(|byte| *byte == b':')
        .map(|dir| match dir {
            b"" => Path::new(".").join(program),
            dir => Path::new(OsStr::from_bytes(dir)).join(program),
        })
        .collect()
}

fn to_cstring(value: &[u8], program: &str) -> Result<CString> {
    CString::new(value).map_err(|_| LaunchError::Exec {
        program: program.to_string(),
        source: Errno::EINVAL,
    })
}

/// Arguments for running a file without a recognised format through the shell.
fn script_argv(path: CString, argv: &[CString]) -> Vec<CString> {
    let mut script = Vec::with_capacity(argv.len() + 1);
    script.push(FALLBACK_SHELL.to_owned());
    script.push(path);
    script.extend(argv.iter().skip(1).cloned());
    script
}

/// Replaces the process image with `command`, resolving it against `env`'s PATH.
///
/// Only returns on failure.
pub fn exec(command: &[String], env: &Environment) -> LaunchError {
    let program = command[0].as_str();

    let prepared = (|| -> Result<(Vec<CString>, Vec<CString>)> {
        let argv = command
            .iter()
            .map(|arg| to_cstring(arg.as_bytes(), program))
            .collect::<Result<Vec<_>>>()?;
        Ok((argv, env.to_envp()?))
    })();

    let (argv, envp) = match prepared {
        Ok(prepared) => prepared,
        Err(error) => return error,
    };

    let mut denied = false;
    for candidate in search_candidates(program, env.get(PATH_KEY)) {
        let path = match to_cstring(candidate.as_os_str().as_bytes(), program) {
            Ok(path) => path,
            Err(error) => return error,
        };

        let Err(errno) = execve(&path, &argv, &envp);
        match errno {
            Errno::EACCES => denied = true,
            Errno::ENOEXEC => {
                let Err(source) = execve(FALLBACK_SHELL, &script_argv(path, &argv), &envp);
                tracing::debug!(%source, "no shell to run {program} with");
                return LaunchError::Exec {
                    program: program.to_string(),
                    source: Errno::ENOEXEC,
                };
            }
            Errno::ENOENT | Errno::ENOTDIR | Errno::ESTALE | Errno::ENODEV | Errno::ETIMEDOUT => {}
            source => {
                return LaunchError::Exec {
                    program: program.to_string(),
                    source,
                };
            }
        }
    }

    LaunchError::Exec {
        program: program.to_string(),
        source: if denied { Errno::EACCES } else { Errno::ENOENT },
    }
}
