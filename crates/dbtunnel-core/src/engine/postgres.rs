use crate::credential::Credential;
use crate::database::Topology;
use crate::engine::{
    basic_auth, spec_replicas, ClientInvocation, ClientMode, Engine, EngineHandler, SecretFields,
    BASIC_AUTH_FIELDS, LOCALHOST,
};
use crate::Result;

const IMAGE: &str = "postgres:16";
const PORT: u16 = 5432;
const DEFAULT_DATABASE: &str = "postgres";

/// PostgreSQL, primary/standby streaming replication.
pub(super) struct Postgres;

impl Postgres {
    fn psql(&self, port: u16, credential: Option<&Credential>) -> Result<ClientInvocation> {
        let (user, password) = basic_auth(Engine::Postgres, credential, BASIC_AUTH_FIELDS)?;
        Ok(ClientInvocation::new(IMAGE, "psql")
            .arg(format!("--host={}", LOCALHOST))
            .arg(format!("--port={}", port))
            .arg(format!("--username={}", user))
            .arg(format!("--dbname={}", DEFAULT_DATABASE))
            .env("PGPASSWORD", password))
    }
}

impl EngineHandler for Postgres {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    fn default_port(&self) -> u16 {
        PORT
    }

    fn topology(&self, _name: &str, spec: &serde_json::Value) -> Result<Topology> {
        Ok(match spec_replicas(spec) {
            Some(replicas) if replicas > 1 => Topology::Replicated { replicas },
            _ => Topology::Standalone,
        })
    }

    fn secret_fields(&self) -> Option<SecretFields> {
        Some(BASIC_AUTH_FIELDS)
    }

    fn client(
        &self,
        port: u16,
        credential: Option<&Credential>,
        mode: ClientMode,
    ) -> Result<ClientInvocation> {
        let psql = self.psql(port, credential)?;
        Ok(match mode {
            ClientMode::Interactive => psql,
            ClientMode::Script => psql.arg("--set=ON_ERROR_STOP=1"),
        })
    }

    fn probe_command(
        &self,
        port: u16,
        credential: Option<&Credential>,
    ) -> Result<Option<ClientInvocation>> {
        Ok(Some(
            self.psql(port, credential)?
                .arg("--no-align")
                .arg("--tuples-only")
                .arg("--command=SELECT pg_is_in_recovery()"),
        ))
    }

    /// A primary is not in recovery.
    fn confirms_primary(&self, stdout: &str) -> bool {
        stdout.trim() == "f"
    }
}
