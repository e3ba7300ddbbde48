//! End-to-end `connect` and `apply` invocations.
//!
//! An invocation moves through
//! `Resolving -> Probing (replicated only) -> Tunneling -> Session -> Closing`
//! and ends `Succeeded` or `Failed`. Any failure skips the remaining steps,
//! and a tunnel opened along the way is always closed before returning.

use std::fmt;

use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::config::ClusterConfig;
use crate::credential::{Credential, CredentialResolver};
use crate::database::{DatabaseObject, Topology};
use crate::engine::{Engine, EngineHandler};
use crate::probe::{ClientProbe, PrimaryProber};
use crate::process::ProcessLauncher;
use crate::session::{Payload, SessionRunner};
use crate::topology::TopologyResolver;
use crate::tunnel::{PortForwarder, TunnelTarget};
use crate::{Error, Result};

/// Where an invocation currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Probing,
    Tunneling,
    Session,
    Closing,
    Succeeded,
    Failed(String),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Resolving => write!(f, "resolving"),
            Stage::Probing => write!(f, "probing"),
            Stage::Tunneling => write!(f, "tunneling"),
            Stage::Session => write!(f, "session"),
            Stage::Closing => write!(f, "closing"),
            Stage::Succeeded => write!(f, "succeeded"),
            Stage::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// What to do once the tunnel is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect,
    Apply(Payload),
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Connect => "connect",
            Action::Apply(_) => "apply",
        }
    }
}

/// Summary of a successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub engine: Engine,
    pub namespace: String,
    pub database: String,
    /// The pod the session ran against
    pub pod: String,
}

/// Wires resolution, election, tunnelling and the client session together.
pub struct Workflow<'a> {
    api: &'a dyn ClusterApi,
    forwarder: &'a dyn PortForwarder,
    launcher: &'a dyn ProcessLauncher,
    config: &'a ClusterConfig,
}

impl<'a> Workflow<'a> {
    pub fn new(
        api: &'a dyn ClusterApi,
        forwarder: &'a dyn PortForwarder,
        launcher: &'a dyn ProcessLauncher,
        config: &'a ClusterConfig,
    ) -> Self {
        Self {
            api,
            forwarder,
            launcher,
            config,
        }
    }

    pub async fn execute(
        &self,
        engine: Engine,
        namespace: &str,
        name: &str,
        action: &Action,
    ) -> Result<Outcome> {
        info!(
            engine = %engine,
            namespace,
            name,
            action = action.name(),
            "Starting invocation"
        );

        let result = self.stages(engine, namespace, name, action).await;
        match &result {
            Ok(outcome) => enter(&Stage::Succeeded, &outcome.database),
            Err(e) => enter(&Stage::Failed(e.to_string()), name),
        }
        result
    }

    async fn stages(
        &self,
        engine: Engine,
        namespace: &str,
        name: &str,
        action: &Action,
    ) -> Result<Outcome> {
        let handler = engine.handler();
        check_action(handler, action)?;

        enter(&Stage::Resolving, name);
        let db = self.api.get_database(engine, namespace, name).await?;
        // The secret is read before the phase is checked, so a missing secret
        // is reported whatever state the object is in.
        let credential = self.credential(handler, &db).await?;
        let candidates = TopologyResolver::new(self.api).resolve(&db).await?;

        let port = handler.default_port();
        let pod = match db.topology {
            Topology::Replicated { .. } => {
                enter(&Stage::Probing, name);
                let probe = ClientProbe::new(
                    handler,
                    self.launcher,
                    credential.as_ref(),
                    self.config.client_runtime,
                );
                PrimaryProber::new(self.forwarder, namespace, port, self.config.probe_timeout)
                    .find_primary(&candidates, &probe)
                    .await?
            }
            Topology::Standalone | Topology::Sharded { .. } => {
                candidates.into_iter().next().ok_or_else(|| Error::PodNotFound {
                    namespace: namespace.to_string(),
                    name: db.ordinal_pod(0),
                })?
            }
        };

        enter(&Stage::Tunneling, name);
        let mut tunnel = self
            .forwarder
            .open(&TunnelTarget::new(namespace, &pod.pod_name, port))
            .await?;

        enter(&Stage::Session, name);
        let runner = SessionRunner::new(handler, self.launcher, self.config.client_runtime);
        let session = match action {
            Action::Connect => runner.run(tunnel.local_port(), credential.as_ref()).await,
            Action::Apply(payload) => {
                runner
                    .apply(tunnel.local_port(), credential.as_ref(), payload)
                    .await
            }
        };

        enter(&Stage::Closing, name);
        tunnel.close().await;
        session?;

        Ok(Outcome {
            engine,
            namespace: namespace.to_string(),
            database: name.to_string(),
            pod: pod.pod_name,
        })
    }

    async fn credential(
        &self,
        handler: &dyn EngineHandler,
        db: &DatabaseObject,
    ) -> Result<Option<Credential>> {
        if db.auth_disabled || handler.secret_fields().is_none() {
            debug!(name = %db.name, "Authentication disabled, no credential");
            return Ok(None);
        }
        CredentialResolver::new(self.api)
            .resolve(&db.namespace, &db.secret_name())
            .await
            .map(Some)
    }
}

/// Reject what cannot succeed before touching the cluster.
fn check_action(handler: &dyn EngineHandler, action: &Action) -> Result<()> {
    let Action::Apply(payload) = action else {
        return Ok(());
    };
    if !handler.supports_apply() {
        return Err(Error::unsupported(handler.engine().kind(), "apply"));
    }
    if let Payload::File(path) = payload {
        if !path.is_file() {
            return Err(Error::validation(format!(
                "script file not found: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

fn enter(stage: &Stage, name: &str) {
    match stage {
        Stage::Failed(_) => warn!(name, stage = %stage, "Invocation failed"),
        _ => info!(name, stage = %stage, "Stage"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::config::ClientRuntime;
    use crate::database::{Phase, RouterSelector};
    use crate::process::{MockProcessLauncher, ProcessOutput, StdinSource};
    use crate::tunnel::testing::{port_for, RecordingForwarder};

    fn config() -> ClusterConfig {
        ClusterConfig {
            client_runtime: ClientRuntime::Local,
            ..ClusterConfig::default()
        }
    }

    fn object(engine: Engine, name: &str, topology: Topology) -> DatabaseObject {
        DatabaseObject {
            engine,
            name: name.to_string(),
            namespace: "demo".to_string(),
            phase: Phase::Ready,
            topology,
            auth_secret: None,
            auth_disabled: false,
        }
    }

    fn api_for(db: DatabaseObject) -> MockClusterApi {
        let mut api = MockClusterApi::new();
        api.expect_get_database()
            .returning(move |_, _, _| Ok(db.clone()));
        api.expect_get_secret().returning(|_, _| {
            let fields: BTreeMap<String, Vec<u8>> = [
                ("username".to_string(), b"root".to_vec()),
                ("password".to_string(), b"pw".to_vec()),
            ]
            .into_iter()
            .collect();
            Ok(Some(fields))
        });
        api
    }

    fn exited(code: i32, stdout: &str) -> ProcessOutput {
        ProcessOutput {
            code: Some(code),
            stdout: stdout.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn replicated_connect_probes_then_connects_to_primary() {
        let api = api_for(object(
            Engine::MongoDb,
            "mydb",
            Topology::Replicated { replicas: 3 },
        ));
        let forwarder = RecordingForwarder::new();
        let primary_port = format!("--port={}", port_for("mydb-1"));
        let mut launcher = MockProcessLauncher::new();
        launcher.expect_launch().returning(move |cmd, stdin, _| {
            if stdin == StdinSource::Inherit {
                assert!(cmd.args.contains(&primary_port));
                return Ok(exited(0, ""));
            }
            let answer = if cmd.args.contains(&primary_port) {
                "true"
            } else {
                "false"
            };
            Ok(exited(0, answer))
        });

        let config = config();
        let outcome = Workflow::new(&api, &forwarder, &launcher, &config)
            .execute(Engine::MongoDb, "demo", "mydb", &Action::Connect)
            .await
            .unwrap();

        assert_eq!(outcome.pod, "mydb-1");
        // Two probe tunnels, then the session tunnel.
        assert_eq!(forwarder.opened_pods(), vec!["mydb-0", "mydb-1", "mydb-1"]);
        assert_eq!(forwarder.closed_count(), 3);
    }

    #[tokio::test]
    async fn session_error_still_closes_tunnel() {
        let api = api_for(object(Engine::Postgres, "pg-demo", Topology::Standalone));
        let forwarder = RecordingForwarder::new();
        let mut launcher = MockProcessLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|_, _, _| Ok(exited(3, "")));

        let config = config();
        let result = Workflow::new(&api, &forwarder, &launcher, &config)
            .execute(
                Engine::Postgres,
                "demo",
                "pg-demo",
                &Action::Apply(Payload::Inline("select 1;".to_string())),
            )
            .await;

        assert!(matches!(result, Err(Error::Session { code: Some(3), .. })));
        assert_eq!(forwarder.opened_pods(), vec!["pg-demo-0"]);
        assert_eq!(forwarder.closed_count(), 1);
    }

    #[tokio::test]
    async fn sharded_connects_to_router_without_probing() {
        let mut api = api_for(object(
            Engine::MongoDb,
            "x",
            Topology::Sharded {
                router: RouterSelector::NamePrefix("x-mongos".to_string()),
            },
        ));
        api.expect_list_pods().returning(|_, _| {
            Ok(["x-mongos-0", "x-shard0-0"]
                .into_iter()
                .map(|name| crate::database::PodInfo {
                    name: name.to_string(),
                    namespace: "demo".to_string(),
                    ready: true,
                    ..Default::default()
                })
                .collect())
        });
        let forwarder = RecordingForwarder::new();
        let mut launcher = MockProcessLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|_, _, _| Ok(exited(0, "")));

        let config = config();
        let outcome = Workflow::new(&api, &forwarder, &launcher, &config)
            .execute(Engine::MongoDb, "demo", "x", &Action::Connect)
            .await
            .unwrap();

        assert_eq!(outcome.pod, "x-mongos-0");
        assert_eq!(forwarder.open_count(), 1);
        assert_eq!(forwarder.closed_count(), 1);
    }

    #[tokio::test]
    async fn not_ready_opens_no_tunnel() {
        let mut db = object(Engine::Postgres, "pg-demo", Topology::Standalone);
        db.phase = Phase::Provisioning;
        let api = api_for(db);
        let forwarder = RecordingForwarder::new();
        let mut launcher = MockProcessLauncher::new();
        launcher.expect_launch().never();

        let config = config();
        let result = Workflow::new(&api, &forwarder, &launcher, &config)
            .execute(Engine::Postgres, "demo", "pg-demo", &Action::Connect)
            .await;

        assert!(matches!(result, Err(Error::ResourceNotReady { .. })));
        assert_eq!(forwarder.open_count(), 0);
    }

    #[tokio::test]
    async fn missing_script_file_fails_before_resolution() {
        let mut api = MockClusterApi::new();
        api.expect_get_database().never();
        let forwarder = RecordingForwarder::new();
        let launcher = MockProcessLauncher::new();

        let config = config();
        let result = Workflow::new(&api, &forwarder, &launcher, &config)
            .execute(
                Engine::Redis,
                "demo",
                "rd",
                &Action::Apply(Payload::File(PathBuf::from(
                    "/nonexistent/dbtunnel/seed.redis",
                ))),
            )
            .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[tokio::test]
    async fn redis_without_auth_reads_no_secret() {
        let mut db = object(Engine::Redis, "rd", Topology::Standalone);
        db.auth_disabled = true;
        let mut api = MockClusterApi::new();
        api.expect_get_database()
            .returning(move |_, _, _| Ok(db.clone()));
        api.expect_get_secret().never();
        let forwarder = RecordingForwarder::new();
        let mut launcher = MockProcessLauncher::new();
        launcher
            .expect_launch()
            .withf(|cmd, _, _| cmd.program == "redis-cli" && cmd.env.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(exited(0, "")));

        let config = config();
        let outcome = Workflow::new(&api, &forwarder, &launcher, &config)
            .execute(
                Engine::Redis,
                "demo",
                "rd",
                &Action::Apply(Payload::Inline("SET a 1;SET b 2".to_string())),
            )
            .await
            .unwrap();

        assert_eq!(outcome.pod, "rd-0");
        assert_eq!(forwarder.closed_count(), 1);
    }

    /// Secret lookups that suspend before answering, as a real API call does.
    struct SlowSecretApi {
        db: DatabaseObject,
    }

    #[async_trait::async_trait]
    impl ClusterApi for SlowSecretApi {
        async fn get_database(
            &self,
            _engine: Engine,
            _namespace: &str,
            _name: &str,
        ) -> Result<DatabaseObject> {
            Ok(self.db.clone())
        }

        async fn get_secret(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            Ok(None)
        }

        async fn list_pods(
            &self,
            _namespace: &str,
            _selector: &str,
        ) -> Result<Vec<crate::database::PodInfo>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn missing_secret_reported_even_when_not_ready() {
        let mut db = object(Engine::Postgres, "pg-demo", Topology::Standalone);
        db.phase = Phase::Provisioning;
        let api = SlowSecretApi { db };
        let forwarder = RecordingForwarder::new();
        let launcher = MockProcessLauncher::new();

        let config = config();
        let result = Workflow::new(&api, &forwarder, &launcher, &config)
            .execute(Engine::Postgres, "demo", "pg-demo", &Action::Connect)
            .await;

        assert!(matches!(
            result,
            Err(Error::SecretNotFound { ref name, .. }) if name == "pg-demo-auth"
        ));
        assert_eq!(forwarder.open_count(), 0);
    }

    #[tokio::test]
    async fn no_primary_found_closes_every_probe_tunnel() {
        let api = api_for(object(
            Engine::Postgres,
            "pg",
            Topology::Replicated { replicas: 2 },
        ));
        let forwarder = RecordingForwarder::new();
        let mut launcher = MockProcessLauncher::new();
        launcher
            .expect_launch()
            .times(2)
            .returning(|_, _, _| Ok(exited(0, "t\n")));

        let config = config();
        let result = Workflow::new(&api, &forwarder, &launcher, &config)
            .execute(Engine::Postgres, "demo", "pg", &Action::Connect)
            .await;

        assert!(matches!(result, Err(Error::NoPrimaryFound { .. })));
        assert_eq!(forwarder.open_count(), 2);
        assert_eq!(forwarder.closed_count(), 2);
    }
}
