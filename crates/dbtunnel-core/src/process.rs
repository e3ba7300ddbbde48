//! External client process launching.
//!
//! Database protocols are never spoken directly; every probe and session runs
//! an external client (`psql`, `mongosh`, `redis-cli`, ...) through a
//! [`ProcessLauncher`]. The production launcher uses `tokio::process`; tests
//! substitute a mock.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Flags whose value is a secret, either as `--flag=value` or as the next arg.
const SECRET_FLAGS: [&str; 2] = ["--password", "-a"];

const REDACTED: &str = "<redacted>";

/// A fully resolved command line.
///
/// Environment values may hold credentials, so they never appear in the
/// `Display` or `Debug` forms used for logging. Values of known password
/// flags are masked there too.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Arguments with secret flag values masked.
    pub fn redacted_args(&self) -> Vec<String> {
        let mut redacted = Vec::with_capacity(self.args.len());
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                redacted.push(REDACTED.to_string());
                mask_next = false;
                continue;
            }
            match arg.split_once('=') {
                Some((flag, _)) if SECRET_FLAGS.contains(&flag) => {
                    redacted.push(format!("{}={}", flag, REDACTED))
                }
                _ => {
                    mask_next = SECRET_FLAGS.contains(&arg.as_str());
                    redacted.push(arg.clone());
                }
            }
        }
        redacted
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.redacted_args() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.redacted_args())
            .field(
                "env",
                &self.env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Where the child's standard input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinSource {
    /// The operator's terminal
    Inherit,
    /// Bytes written in full, then closed
    Bytes(Vec<u8>),
    /// A file streamed byte-for-byte, then closed
    File(PathBuf),
    Null,
}

/// Where the child's standard output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdoutMode {
    Inherit,
    Capture,
}

/// Exit status and captured output of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    /// Exit code; `None` when terminated by a signal
    pub code: Option<i32>,
    /// Captured stdout, empty unless [`StdoutMode::Capture`] was used
    pub stdout: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Launches a command and waits for it to exit.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Run `command` to completion. Stderr always goes to the operator.
    async fn launch(
        &self,
        command: &CommandSpec,
        stdin: StdinSource,
        stdout: StdoutMode,
    ) -> Result<ProcessOutput>;
}

/// [`ProcessLauncher`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(
        &self,
        command: &CommandSpec,
        stdin: StdinSource,
        stdout: StdoutMode,
    ) -> Result<ProcessOutput> {
        debug!(command = %command, "Launching client process");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        cmd.stdin(match &stdin {
            StdinSource::Inherit => Stdio::inherit(),
            StdinSource::Bytes(_) | StdinSource::File(_) => Stdio::piped(),
            StdinSource::Null => Stdio::null(),
        });
        cmd.stdout(match stdout {
            StdoutMode::Inherit => Stdio::inherit(),
            StdoutMode::Capture => Stdio::piped(),
        });

        let mut child = cmd.spawn().map_err(|e| {
            Error::session(format!("failed to launch {}: {}", command.program, e), None)
        })?;

        let interrupts = matches!(stdin, StdinSource::Inherit).then(InterruptGuard::install);

        // Feed stdin from a separate task so a chatty child cannot fill its
        // stdout pipe while we are still writing.
        let writer = child.stdin.take().map(|mut pipe| {
            tokio::spawn(async move {
                let copied = match stdin {
                    StdinSource::Bytes(bytes) => {
                        pipe.write_all(&bytes).await.map(|_| bytes.len() as u64)
                    }
                    StdinSource::File(path) => match tokio::fs::File::open(&path).await {
                        Ok(mut file) => tokio::io::copy(&mut file, &mut pipe).await,
                        Err(e) => Err(e),
                    },
                    StdinSource::Inherit | StdinSource::Null => Ok(0),
                };
                let flushed = pipe.shutdown().await;
                copied.and_then(|n| flushed.map(|_| n))
            })
        });

        let output = child.wait_with_output().await;
        if let Some(guard) = &interrupts {
            guard.release();
        }
        let output = output.map_err(|e| {
            Error::session(format!("failed waiting for {}: {}", command.program, e), None)
        })?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(bytes)) => debug!(bytes, "Client input delivered"),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("Client closed its input early")
                }
                Ok(Err(e)) => {
                    return Err(Error::session(
                        format!("failed to write input to {}: {}", command.program, e),
                        output.status.code(),
                    ))
                }
                Err(e) => warn!(error = %e, "Input writer task failed"),
            }
        }

        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: output.stdout,
        })
    }
}

/// Exit status after an interrupt, as shells report SIGINT.
const INTERRUPTED_EXIT: i32 = 130;

/// What a Ctrl-C does at a given moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// The interactive client handles it
    PassToClient,
    /// Nothing else will, so stop the process
    Terminate,
}

/// Ctrl-C reaches the whole foreground process group. While an interactive
/// client runs it is left to the client. Once the client has exited the
/// handler stays registered, so it terminates the process itself.
struct InterruptGuard {
    client_active: Arc<AtomicBool>,
}

impl InterruptGuard {
    fn new() -> Self {
        Self {
            client_active: Arc::new(AtomicBool::new(true)),
        }
    }

    fn install() -> Self {
        let guard = Self::new();
        let client_active = guard.client_active.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                match Self::decide(&client_active) {
                    Interrupt::PassToClient => debug!("Interrupt left to interactive client"),
                    Interrupt::Terminate => {
                        warn!("Interrupted");
                        std::process::exit(INTERRUPTED_EXIT);
                    }
                }
            }
        });
        guard
    }

    fn decide(client_active: &AtomicBool) -> Interrupt {
        if client_active.load(Ordering::SeqCst) {
            Interrupt::PassToClient
        } else {
            Interrupt::Terminate
        }
    }

    #[cfg(test)]
    fn current(&self) -> Interrupt {
        Self::decide(&self.client_active)
    }

    /// The client has exited.
    fn release(&self) {
        self.client_active.store(false, Ordering::SeqCst);
    }
}
