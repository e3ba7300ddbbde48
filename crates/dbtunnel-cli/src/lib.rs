//! dbtunnel CLI library

pub mod commands;

pub use dbtunnel_core::{Error, Result};

use clap::{Parser, Subcommand};
use dbtunnel_core::engine::Engine;

use commands::DatabaseArgs;

/// dbtunnel - Connect to KubeDB databases through pod tunnels
#[derive(Parser, Debug)]
#[command(name = "dbtunnel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Namespace of the database object
    #[arg(long, short = 'n', global = true, default_value = "default")]
    pub namespace: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// PostgreSQL databases
    #[command(alias = "pg")]
    Postgres(DatabaseArgs),
    /// MySQL databases
    Mysql(DatabaseArgs),
    /// MongoDB databases
    #[command(alias = "mg")]
    Mongodb(DatabaseArgs),
    /// Redis databases
    #[command(alias = "rd")]
    Redis(DatabaseArgs),
    /// Elasticsearch clusters
    #[command(alias = "es")]
    Elasticsearch(DatabaseArgs),
    /// Memcached instances
    #[command(alias = "mc")]
    Memcached(DatabaseArgs),
}

impl Commands {
    fn split(self) -> (Engine, DatabaseArgs) {
        match self {
            Commands::Postgres(args) => (Engine::Postgres, args),
            Commands::Mysql(args) => (Engine::MySql, args),
            Commands::Mongodb(args) => (Engine::MongoDb, args),
            Commands::Redis(args) => (Engine::Redis, args),
            Commands::Elasticsearch(args) => (Engine::Elasticsearch, args),
            Commands::Memcached(args) => (Engine::Memcached, args),
        }
    }
}

impl Cli {
    /// Run the CLI command, returning the confirmation line to print
    pub async fn run(self) -> Result<String> {
        let (engine, args) = self.command.split();
        commands::run(engine, &self.namespace, args).await
    }
}
