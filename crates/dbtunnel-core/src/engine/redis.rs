use crate::credential::Credential;
use crate::database::Topology;
use crate::engine::{
    spec_replicas, ClientInvocation, ClientMode, Engine, EngineHandler, SecretFields,
    BASIC_AUTH_FIELDS, LOCALHOST,
};
use crate::{Error, Result};

const IMAGE: &str = "redis:7";
const PORT: u16 = 6379;

/// Redis: standalone or sentinel-managed replicas. Cluster mode is rejected.
pub(super) struct Redis;

impl Redis {
    fn redis_cli(&self, port: u16, credential: Option<&Credential>) -> Result<ClientInvocation> {
        let mut cli = ClientInvocation::new(IMAGE, "redis-cli")
            .arg("-h")
            .arg(LOCALHOST)
            .arg("-p")
            .arg(port.to_string())
            .arg("-n")
            .arg("0");

        // Auth may be disabled, in which case there is no credential.
        if let Some(credential) = credential {
            if let Ok(user) = credential.field(BASIC_AUTH_FIELDS.username) {
                cli = cli.arg("--user").arg(user);
            }
            cli = cli.env("REDISCLI_AUTH", credential.field(BASIC_AUTH_FIELDS.password)?);
        }
        Ok(cli)
    }
}

impl EngineHandler for Redis {
    fn engine(&self) -> Engine {
        Engine::Redis
    }

    fn default_port(&self) -> u16 {
        PORT
    }

    fn topology(&self, name: &str, spec: &serde_json::Value) -> Result<Topology> {
        match spec.get("mode").and_then(|m| m.as_str()) {
            // Cluster redirects name in-cluster pod addresses, which a
            // client on the far side of a single tunnel cannot follow.
            Some("Cluster") => Err(Error::unsupported(
                format!("Redis {} in cluster mode", name),
                "sessions through a local tunnel",
            )),
            Some("Sentinel") => Ok(Topology::Replicated {
                replicas: spec_replicas(spec).unwrap_or(0),
            }),
            _ => Ok(Topology::Standalone),
        }
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
        self.redis_cli(port, credential)
    }

    fn probe_command(
        &self,
        port: u16,
        credential: Option<&Credential>,
    ) -> Result<Option<ClientInvocation>> {
        Ok(Some(self.redis_cli(port, credential)?.arg("ROLE")))
    }

    fn confirms_primary(&self, stdout: &str) -> bool {
        stdout.lines().next().map(str::trim) == Some("master")
    }

    fn statement_delimiter(&self) -> Option<char> {
        Some(';')
    }
}
