use crate::credential::Credential;
use crate::database::Topology;
use crate::engine::{
    basic_auth, spec_replicas, ClientInvocation, ClientMode, Engine, EngineHandler, SecretFields,
    BASIC_AUTH_FIELDS, LOCALHOST,
};
use crate::Result;

const IMAGE: &str = "mysql:8";
const PORT: u16 = 3306;

/// MySQL, standalone or group replication in single-primary mode.
pub(super) struct MySql;

impl MySql {
    fn mysql(&self, port: u16, credential: Option<&Credential>) -> Result<ClientInvocation> {
        let (user, password) = basic_auth(Engine::MySql, credential, BASIC_AUTH_FIELDS)?;
        Ok(ClientInvocation::new(IMAGE, "mysql")
            .arg(format!("--host={}", LOCALHOST))
            .arg(format!("--port={}", port))
            .arg("--protocol=TCP")
            .arg(format!("--user={}", user))
            .env("MYSQL_PWD", password))
    }
}

impl EngineHandler for MySql {
    fn engine(&self) -> Engine {
        Engine::MySql
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
        _mode: ClientMode,
    ) -> Result<ClientInvocation> {
        self.mysql(port, credential)
    }

    fn probe_command(
        &self,
        port: u16,
        credential: Option<&Credential>,
    ) -> Result<Option<ClientInvocation>> {
        Ok(Some(
            self.mysql(port, credential)?
                .arg("--skip-column-names")
                .arg("--batch")
                .arg("--execute=SELECT @@global.super_read_only"),
        ))
    }

    /// Group replication marks every secondary super-read-only.
    fn confirms_primary(&self, stdout: &str) -> bool {
        stdout.trim() == "0"
    }
}
