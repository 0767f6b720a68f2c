use crate::error::LaunchError;
use anyhow::{Context, Result};
use nix::{
    sys::socket::{AddressFamily, SockFlag, SockType, socketpair},
    unistd::{read, write},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    fmt,
    marker::PhantomData,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
};

const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Launch step a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Namespace,
    Mapping,
    PrivilegeDrop,
    Mount,
    RootTransition,
    Fork,
    Wait,
    Exec,
    Capabilities,
    Report,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Namespace => "namespace",
            Self::Mapping => "id mapping",
            Self::PrivilegeDrop => "privilege drop",
            Self::Mount => "mount",
            Self::RootTransition => "chroot",
            Self::Fork => "fork",
            Self::Wait => "wait",
            Self::Exec => "exec",
            Self::Capabilities => "capabilities",
            Self::Report => "report",
        };
        f.write_str(name)
    }
}

/// Sent by a process inside the sandbox that failed before (or instead of) exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub phase: Phase,
    pub exit_code: i32,
    pub message: String,
}

impl From<&LaunchError> for FailureReport {
    fn from(error: &LaunchError) -> Self {
        Self {
            phase: error.phase(),
            exit_code: error.exit_code(),
            message: error.diagnostic(),
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.phase, self.message)
    }
}

/// Read end, kept by the process outside the sandbox.
pub struct Receiver<T>(OwnedFd, PhantomData<T>);

impl<T: DeserializeOwned> Receiver<T> {
    /// Collects every message until all senders are closed.
    ///
    /// Callers must drop their own `Sender` first or this never sees EOF.
    pub fn drain(&self) -> Result<Vec<T>> {
        let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
        let mut messages = Vec::new();

        loop {
            let n = read(self.as_fd(), &mut buf).context("failed to read from report channel")?;

            if n == 0 {
                break;
            }

            let (message, _) =
                bincode::serde::decode_from_slice(&buf[..n], bincode::config::standard())
                    .context("failed to decode report")?;
            messages.push(message);
        }

        Ok(messages)
    }
}

impl<T> AsFd for Receiver<T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Write end, inherited by every process inside the sandbox.
///
/// Close-on-exec, so a successful exec closes it without a word.
pub struct Sender<T>(OwnedFd, PhantomData<T>);

impl<T: Serialize> Sender<T> {
    pub fn send(&self, message: &T) -> Result<()> {
        let buf = bincode::serde::encode_to_vec(message, bincode::config::standard())
            .context("failed to encode report")?;
        write(self.as_fd(), buf.as_slice()).context("failed to write to report channel")?;
        Ok(())
    }
}

impl<T> AsFd for Sender<T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Creates a message-preserving, close-on-exec channel.
pub fn channel<T>() -> Result<(Receiver<T>, Sender<T>)> {
    let (read_end, write_end) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .context("failed to create socketpair")?;

    Ok((
        Receiver(read_end, PhantomData),
        Sender(write_end, PhantomData),
    ))
}
