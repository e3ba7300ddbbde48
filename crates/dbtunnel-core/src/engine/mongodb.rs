use crate::credential::Credential;
use crate::database::{RouterSelector, Topology};
use crate::engine::{
    basic_auth, spec_replicas, ClientInvocation, ClientMode, Engine, EngineHandler, SecretFields,
    BASIC_AUTH_FIELDS, LOCALHOST,
};
use crate::Result;

const IMAGE: &str = "mongo:6";
const PORT: u16 = 27017;
const AUTH_DATABASE: &str = "admin";
const PASSWORD_ENV: &str = "DBTUNNEL_MONGO_PASSWORD";

/// mongosh has no password variable, so a shell splices it in from the
/// environment. The secret never reaches our own argv or logs.
const MONGOSH_WRAPPER: &str = r#"exec mongosh "$@" --password="$DBTUNNEL_MONGO_PASSWORD""#;

/// MongoDB: standalone, replica set, or sharded behind `mongos` routers.
pub(super) struct MongoDb;

impl MongoDb {
    fn mongosh(&self, port: u16, credential: Option<&Credential>) -> Result<ClientInvocation> {
        let (user, password) = basic_auth(Engine::MongoDb, credential, BASIC_AUTH_FIELDS)?;
        Ok(ClientInvocation::new(IMAGE, "sh")
            .arg("-c")
            .arg(MONGOSH_WRAPPER)
            .arg("mongosh")
            .arg(AUTH_DATABASE)
            .arg(format!("--host={}", LOCALHOST))
            .arg(format!("--port={}", port))
            .arg(format!("--authenticationDatabase={}", AUTH_DATABASE))
            .arg(format!("--username={}", user))
            .env(PASSWORD_ENV, password))
    }
}

impl EngineHandler for MongoDb {
    fn engine(&self) -> Engine {
        Engine::MongoDb
    }

    fn default_port(&self) -> u16 {
        PORT
    }

    fn topology(&self, name: &str, spec: &serde_json::Value) -> Result<Topology> {
        let present = |field: &str| spec.get(field).is_some_and(|v| !v.is_null());

        if present("shardTopology") {
            return Ok(Topology::Sharded {
                router: RouterSelector::NamePrefix(format!("{}-mongos", name)),
            });
        }
        if present("replicaSet") {
            // A replica set without a count stays zero and is rejected at
            // resolution time rather than silently treated as standalone.
            return Ok(Topology::Replicated {
                replicas: spec_replicas(spec).unwrap_or(0),
            });
        }
        Ok(Topology::Standalone)
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
        let mongosh = self.mongosh(port, credential)?;
        Ok(match mode {
            ClientMode::Interactive => mongosh,
            ClientMode::Script => mongosh.arg("--quiet"),
        })
    }

    fn probe_command(
        &self,
        port: u16,
        credential: Option<&Credential>,
    ) -> Result<Option<ClientInvocation>> {
        Ok(Some(
            self.mongosh(port, credential)?
                .arg("--quiet")
                .arg("--eval=db.isMaster().ismaster"),
        ))
    }

    fn confirms_primary(&self, stdout: &str) -> bool {
        stdout.lines().any(|line| line.trim() == "true")
    }
}
