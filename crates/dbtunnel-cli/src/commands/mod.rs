//! CLI commands

use std::path::PathBuf;

use clap::{Args, Subcommand};
use dbtunnel_core::cluster::KubeClusterApi;
use dbtunnel_core::config::ClusterConfig;
use dbtunnel_core::engine::Engine;
use dbtunnel_core::process::TokioLauncher;
use dbtunnel_core::session::Payload;
use dbtunnel_core::tunnel::KubePortForwarder;
use dbtunnel_core::workflow::{Action, Outcome, Workflow};
use tracing::debug;

use crate::Result;

/// Arguments shared by every engine subcommand
#[derive(Args, Debug)]
pub struct DatabaseArgs {
    #[command(subcommand)]
    pub action: DatabaseAction,
}

#[derive(Subcommand, Debug)]
pub enum DatabaseAction {
    /// Open an interactive client session
    Connect(ConnectArgs),
    /// Run commands or a script file non-interactively
    Apply(ApplyArgs),
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Name of the database object
    pub name: String,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Name of the database object
    pub name: String,

    #[command(flatten)]
    pub input: ScriptInput,
}

/// Exactly one of a script file or inline command text
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct ScriptInput {
    /// Script file streamed to the client
    #[arg(long, short = 'f')]
    pub file: Option<PathBuf>,

    /// Inline commands; for Redis, separate commands with ';'
    #[arg(long, short = 'c')]
    pub command: Option<String>,
}

impl ScriptInput {
    fn into_payload(self) -> Payload {
        match (self.file, self.command) {
            (Some(path), _) => Payload::File(path),
            (None, command) => Payload::Inline(command.unwrap_or_default()),
        }
    }
}

impl DatabaseAction {
    /// The object name and the workflow action it maps to
    pub fn into_parts(self) -> (String, Action) {
        match self {
            DatabaseAction::Connect(args) => (args.name, Action::Connect),
            DatabaseAction::Apply(args) => (args.name, Action::Apply(args.input.into_payload())),
        }
    }
}

/// Run one invocation against the cluster.
pub async fn run(engine: Engine, namespace: &str, args: DatabaseArgs) -> Result<String> {
    let config = ClusterConfig::from_env()?;
    debug!(?config, "Loaded configuration");

    let client = config.client().await?;
    let api = KubeClusterApi::new(client.clone());
    let forwarder = KubePortForwarder::new(client);
    let launcher = TokioLauncher;

    let (name, action) = args.action.into_parts();
    let outcome = Workflow::new(&api, &forwarder, &launcher, &config)
        .execute(engine, namespace, &name, &action)
        .await?;

    Ok(confirmation(&outcome, &action))
}

fn confirmation(outcome: &Outcome, action: &Action) -> String {
    let target = format!(
        "{} {}/{} (pod {})",
        outcome.engine.kind(),
        outcome.namespace,
        outcome.database,
        outcome.pod
    );
    match action {
        Action::Connect => format!("Session with {} ended", target),
        Action::Apply(_) => format!("Applied to {}", target),
    }
}
