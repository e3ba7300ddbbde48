//! Supported database engines.
//!
//! [`Engine`] is a closed set; each variant maps to an [`EngineHandler`] that
//! knows the engine's topology fields, credential layout, client command
//! lines and primary probe.

use std::fmt;
use std::str::FromStr;

use kube::discovery::ApiResource;

use crate::config::ClientRuntime;
use crate::credential::Credential;
use crate::database::Topology;
use crate::process::CommandSpec;
use crate::{Error, Result};

mod elasticsearch;
mod memcached;
mod mongodb;
mod mysql;
mod postgres;
mod redis;

/// API group of KubeDB database resources
pub const KUBEDB_GROUP: &str = "kubedb.com";
/// API version of KubeDB database resources
pub const KUBEDB_VERSION: &str = "v1alpha2";

/// Loopback address every client connects to; the tunnel listens here.
pub(crate) const LOCALHOST: &str = "127.0.0.1";

/// Database engines with connect/apply support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Postgres,
    MySql,
    MongoDb,
    Redis,
    Elasticsearch,
    Memcached,
}

impl Engine {
    pub const ALL: [Engine; 6] = [
        Engine::Postgres,
        Engine::MySql,
        Engine::MongoDb,
        Engine::Redis,
        Engine::Elasticsearch,
        Engine::Memcached,
    ];

    /// The behaviour for this engine.
    pub fn handler(self) -> &'static dyn EngineHandler {
        match self {
            Engine::Postgres => &postgres::Postgres,
            Engine::MySql => &mysql::MySql,
            Engine::MongoDb => &mongodb::MongoDb,
            Engine::Redis => &redis::Redis,
            Engine::Elasticsearch => &elasticsearch::Elasticsearch,
            Engine::Memcached => &memcached::Memcached,
        }
    }

    /// Custom resource kind.
    pub fn kind(self) -> &'static str {
        match self {
            Engine::Postgres => "Postgres",
            Engine::MySql => "MySQL",
            Engine::MongoDb => "MongoDB",
            Engine::Redis => "Redis",
            Engine::Elasticsearch => "Elasticsearch",
            Engine::Memcached => "Memcached",
        }
    }

    /// Custom resource plural, as used in URLs and offshoot labels.
    pub fn plural(self) -> &'static str {
        match self {
            Engine::Postgres => "postgreses",
            Engine::MySql => "mysqls",
            Engine::MongoDb => "mongodbs",
            Engine::Redis => "redises",
            Engine::Elasticsearch => "elasticsearches",
            Engine::Memcached => "memcacheds",
        }
    }

    pub fn api_resource(self) -> ApiResource {
        ApiResource {
            group: KUBEDB_GROUP.to_string(),
            version: KUBEDB_VERSION.to_string(),
            api_version: format!("{}/{}", KUBEDB_GROUP, KUBEDB_VERSION),
            kind: self.kind().to_string(),
            plural: self.plural().to_string(),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

impl FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Engine::ALL
            .into_iter()
            .find(|e| e.kind().to_ascii_lowercase() == lower || e.plural() == lower)
            .ok_or_else(|| Error::validation(format!("unknown database kind: {}", s)))
    }
}

/// Secret field names holding the admin username and password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretFields {
    pub username: &'static str,
    pub password: &'static str,
}

/// `{username, password}`, used by most engines.
pub const BASIC_AUTH_FIELDS: SecretFields = SecretFields {
    username: "username",
    password: "password",
};

/// `{ADMIN_USERNAME, ADMIN_PASSWORD}`, used by Elasticsearch.
pub const ADMIN_FIELDS: SecretFields = SecretFields {
    username: "ADMIN_USERNAME",
    password: "ADMIN_PASSWORD",
};

/// What the client process is launched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    /// Attached to the operator's terminal
    Interactive,
    /// Reading a script from stdin
    Script,
}

/// Engine-specific description of a client launch, before the runtime
/// (docker or local binary) is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInvocation {
    /// Image used with [`ClientRuntime::Docker`]
    pub image: &'static str,
    /// Program run inside the image; `None` runs the image entrypoint
    pub image_program: Option<&'static str>,
    /// Program run with [`ClientRuntime::Local`]
    pub local_program: &'static str,
    pub args: Vec<String>,
    /// Passed through by name only on the docker command line
    pub env: Vec<(String, String)>,
}

impl ClientInvocation {
    pub fn new(image: &'static str, program: &'static str) -> Self {
        Self {
            image,
            image_program: Some(program),
            local_program: program,
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Resolve to a concrete command line for the given runtime.
    ///
    /// `tty` allocates a terminal for the docker container and only makes
    /// sense for interactive sessions.
    pub fn into_command(self, runtime: ClientRuntime, tty: bool) -> CommandSpec {
        match runtime {
            ClientRuntime::Local => CommandSpec {
                program: self.local_program.to_string(),
                args: self.args,
                env: self.env,
            },
            ClientRuntime::Docker => {
                let mut cmd = CommandSpec::new("docker").args(["run", "--rm", "-i"]);
                if tty {
                    cmd = cmd.arg("-t");
                }
                cmd = cmd.arg("--network=host");
                // `-e NAME` copies the value from docker's own environment,
                // keeping secrets off the command line.
                for (key, _) in &self.env {
                    cmd = cmd.arg("-e").arg(key.clone());
                }
                cmd = cmd.arg(self.image);
                if let Some(program) = self.image_program {
                    cmd = cmd.arg(program);
                }
                cmd.args.extend(self.args);
                cmd.env = self.env;
                cmd
            }
        }
    }
}

/// Engine capabilities used by topology resolution, probing and sessions.
pub trait EngineHandler: Send + Sync {
    fn engine(&self) -> Engine;

    /// Container port the database listens on.
    fn default_port(&self) -> u16;

    /// Derive the topology from the custom resource's `spec`.
    fn topology(&self, name: &str, spec: &serde_json::Value) -> Result<Topology>;

    /// Secret fields holding the admin credential; `None` when the engine
    /// runs without authentication.
    fn secret_fields(&self) -> Option<SecretFields>;

    /// Client launch for a session against `port` on localhost.
    fn client(
        &self,
        port: u16,
        credential: Option<&Credential>,
        mode: ClientMode,
    ) -> Result<ClientInvocation>;

    /// Client launch that prints this node's primary status; `None` when the
    /// engine has no replicated topology.
    fn probe_command(
        &self,
        _port: u16,
        _credential: Option<&Credential>,
    ) -> Result<Option<ClientInvocation>> {
        Ok(None)
    }

    /// Interpret the probe command's stdout.
    fn confirms_primary(&self, _stdout: &str) -> bool {
        false
    }

    /// Inline commands are split on this delimiter into one line each.
    fn statement_delimiter(&self) -> Option<char> {
        None
    }

    fn supports_apply(&self) -> bool {
        true
    }
}

/// Username and password from `credential` using `fields`.
pub(crate) fn basic_auth(
    engine: Engine,
    credential: Option<&Credential>,
    fields: SecretFields,
) -> Result<(String, String)> {
    let credential = credential.ok_or_else(|| {
        Error::validation(format!("{} sessions require a credential", engine))
    })?;
    Ok((
        credential.field(fields.username)?,
        credential.field(fields.password)?,
    ))
}

/// `spec.replicas`, tolerating its absence.
pub(crate) fn spec_replicas(spec: &serde_json::Value) -> Option<u32> {
    spec.get("replicas")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
}
