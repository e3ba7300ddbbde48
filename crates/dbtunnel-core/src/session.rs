//! Client sessions over an open tunnel.

use std::path::PathBuf;

use tracing::info;

use crate::config::ClientRuntime;
use crate::credential::Credential;
use crate::engine::{ClientMode, EngineHandler};
use crate::process::{CommandSpec, ProcessLauncher, ProcessOutput, StdinSource, StdoutMode};
use crate::{Error, Result};

/// Input for a batch session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Command text given on the command line
    Inline(String),
    /// A script file streamed to the client unchanged
    File(PathBuf),
}

/// Launches the engine's client against a local tunnel port.
pub struct SessionRunner<'a> {
    handler: &'static dyn EngineHandler,
    launcher: &'a dyn ProcessLauncher,
    runtime: ClientRuntime,
}

impl<'a> SessionRunner<'a> {
    pub fn new(
        handler: &'static dyn EngineHandler,
        launcher: &'a dyn ProcessLauncher,
        runtime: ClientRuntime,
    ) -> Self {
        Self {
            handler,
            launcher,
            runtime,
        }
    }

    /// Interactive session on the operator's terminal. Returns when the
    /// client exits.
    pub async fn run(&self, local_port: u16, credential: Option<&Credential>) -> Result<()> {
        let command = self
            .handler
            .client(local_port, credential, ClientMode::Interactive)?
            .into_command(self.runtime, true);

        info!(engine = %self.handler.engine(), local_port, "Starting interactive session");
        let output = self
            .launcher
            .launch(&command, StdinSource::Inherit, StdoutMode::Inherit)
            .await?;
        check_exit(&command, &output)
    }

    /// Feed `payload` to the client's stdin and wait for it to finish.
    pub async fn apply(
        &self,
        local_port: u16,
        credential: Option<&Credential>,
        payload: &Payload,
    ) -> Result<()> {
        if !self.handler.supports_apply() {
            return Err(Error::unsupported(self.handler.engine().kind(), "apply"));
        }

        let command = self
            .handler
            .client(local_port, credential, ClientMode::Script)?
            .into_command(self.runtime, false);
        let stdin = match payload {
            Payload::Inline(text) => {
                StdinSource::Bytes(script_input(text, self.handler.statement_delimiter()))
            }
            Payload::File(path) => StdinSource::File(path.clone()),
        };

        info!(engine = %self.handler.engine(), local_port, "Applying script");
        let output = self
            .launcher
            .launch(&command, stdin, StdoutMode::Inherit)
            .await?;
        check_exit(&command, &output)
    }
}

/// Bytes written to the client for inline command text.
///
/// With a delimiter, each non-empty trimmed statement becomes its own line,
/// in order. Without one the text is passed through as a single script.
pub fn script_input(text: &str, delimiter: Option<char>) -> Vec<u8> {
    let mut input = match delimiter {
        Some(delimiter) => text
            .split(delimiter)
            .map(str::trim)
            .filter(|statement| !statement.is_empty())
            .fold(String::new(), |mut acc, statement| {
                acc.push_str(statement);
                acc.push('\n');
                acc
            }),
        None => text.to_string(),
    };
    if !input.is_empty() && !input.ends_with('\n') {
        input.push('\n');
    }
    input.into_bytes()
}

fn check_exit(command: &CommandSpec, output: &ProcessOutput) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    let status = match output.code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    };
    Err(Error::session(
        format!("{} terminated with {}", command.program, status),
        output.code,
    ))
}
