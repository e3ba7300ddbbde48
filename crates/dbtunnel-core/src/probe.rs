//! Primary election over replica candidates.
//!
//! Candidates are probed one at a time in ascending ordinal order, each
//! through its own short-lived tunnel. Probe failures are logged and
//! skipped; only exhausting every candidate is an error.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::ClientRuntime;
use crate::credential::Credential;
use crate::database::Candidate;
use crate::engine::EngineHandler;
use crate::process::{ProcessLauncher, StdinSource, StdoutMode};
use crate::tunnel::{PortForwarder, TunnelTarget};
use crate::{Error, Result};

/// Asks one candidate, reachable on `local_port`, whether it is primary.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Probe: Send + Sync {
    async fn is_primary(&self, candidate: &Candidate, local_port: u16) -> Result<bool>;
}

/// What probing a single candidate produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Primary,
    NotPrimary,
    TimedOut,
    Failed(String),
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Primary => write!(f, "primary"),
            ProbeOutcome::NotPrimary => write!(f, "not primary"),
            ProbeOutcome::TimedOut => write!(f, "timed out"),
            ProbeOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// One line of the election record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub candidate: Candidate,
    pub outcome: ProbeOutcome,
}

/// Runs the election for one database.
pub struct PrimaryProber<'a> {
    forwarder: &'a dyn PortForwarder,
    namespace: String,
    remote_port: u16,
    timeout: Duration,
}

impl<'a> PrimaryProber<'a> {
    pub fn new(
        forwarder: &'a dyn PortForwarder,
        namespace: impl Into<String>,
        remote_port: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            forwarder,
            namespace: namespace.into(),
            remote_port,
            timeout,
        }
    }

    /// The lowest-ordinal candidate that confirms primary status.
    ///
    /// At most one tunnel is open at a time, and every tunnel opened here is
    /// closed before this returns.
    pub async fn find_primary(
        &self,
        candidates: &[Candidate],
        probe: &dyn Probe,
    ) -> Result<Candidate> {
        let mut ordered = candidates.to_vec();
        ordered.sort_by_key(|c| c.ordinal);

        let mut results = Vec::with_capacity(ordered.len());
        for candidate in ordered {
            let outcome = self.probe_one(&candidate, probe).await;
            let confirmed = outcome == ProbeOutcome::Primary;
            results.push(ProbeResult { candidate, outcome });

            if confirmed {
                let winner = &results[results.len() - 1].candidate;
                info!(pod = %winner, probed = results.len(), "Primary found");
                return Ok(winner.clone());
            }
        }

        warn!(
            results = ?results
                .iter()
                .map(|r| format!("{}: {}", r.candidate, r.outcome))
                .collect::<Vec<_>>(),
            "No candidate confirmed primary"
        );
        Err(Error::NoPrimaryFound {
            candidates: results
                .into_iter()
                .map(|r| r.candidate.pod_name)
                .collect(),
        })
    }

    async fn probe_one(&self, candidate: &Candidate, probe: &dyn Probe) -> ProbeOutcome {
        let target = TunnelTarget::new(&self.namespace, &candidate.pod_name, self.remote_port);

        let mut tunnel = match self.forwarder.open(&target).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(pod = %candidate, error = %e, "Could not open probe tunnel");
                return ProbeOutcome::Failed(e.to_string());
            }
        };

        let answer =
            tokio::time::timeout(self.timeout, probe.is_primary(candidate, tunnel.local_port()))
                .await;
        tunnel.close().await;

        let outcome = match answer {
            Ok(Ok(true)) => ProbeOutcome::Primary,
            Ok(Ok(false)) => ProbeOutcome::NotPrimary,
            Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
            Err(_) => ProbeOutcome::TimedOut,
        };
        match &outcome {
            ProbeOutcome::Primary | ProbeOutcome::NotPrimary => {
                debug!(pod = %candidate, outcome = %outcome, "Probed candidate")
            }
            _ => warn!(pod = %candidate, outcome = %outcome, "Probe failed, skipping candidate"),
        }
        outcome
    }
}

/// [`Probe`] that runs the engine's client with its primary-status query.
pub struct ClientProbe<'a> {
    handler: &'static dyn EngineHandler,
    launcher: &'a dyn ProcessLauncher,
    credential: Option<&'a Credential>,
    runtime: ClientRuntime,
}

impl<'a> ClientProbe<'a> {
    pub fn new(
        handler: &'static dyn EngineHandler,
        launcher: &'a dyn ProcessLauncher,
        credential: Option<&'a Credential>,
        runtime: ClientRuntime,
    ) -> Self {
        Self {
            handler,
            launcher,
            credential,
            runtime,
        }
    }
}

#[async_trait]
impl Probe for ClientProbe<'_> {
    async fn is_primary(&self, candidate: &Candidate, local_port: u16) -> Result<bool> {
        let invocation = self
            .handler
            .probe_command(local_port, self.credential)?
            .ok_or_else(|| {
                Error::probe(
                    &candidate.pod_name,
                    format!("{} has no primary probe", self.handler.engine()),
                )
            })?;
        let command = invocation.into_command(self.runtime, false);

        let output = self
            .launcher
            .launch(&command, StdinSource::Null, StdoutMode::Capture)
            .await
            .map_err(|e| Error::probe(&candidate.pod_name, e.to_string()))?;
        if !output.success() {
            return Err(Error::probe(
                &candidate.pod_name,
                format!("{} exited with {:?}", command.program, output.code),
            ));
        }

        Ok(self.handler.confirms_primary(&output.stdout_lossy()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rstest::rstest;

    use super::*;
    use crate::engine::Engine;
    use crate::process::{MockProcessLauncher, ProcessOutput};
    use crate::tunnel::testing::{port_for, RecordingForwarder};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn candidates(name: &str, n: u32) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate::new(format!("{}-{}", name, i), i))
            .collect()
    }

    fn prober(forwarder: &RecordingForwarder) -> PrimaryProber<'_> {
        PrimaryProber::new(forwarder, "demo", 27017, TIMEOUT)
    }

    #[rstest]
    #[case(1, 0)]
    #[case(2, 1)]
    #[case(3, 1)]
    #[case(3, 2)]
    #[case(5, 4)]
    #[tokio::test]
    async fn finds_the_single_primary(#[case] replicas: u32, #[case] primary: u32) {
        let forwarder = RecordingForwarder::new();
        let mut probe = MockProbe::new();
        probe
            .expect_is_primary()
            .returning(move |c, _| Ok(c.ordinal == primary));

        let winner = prober(&forwarder)
            .find_primary(&candidates("db", replicas), &probe)
            .await
            .unwrap();

        assert_eq!(winner.ordinal, primary);
        assert_eq!(forwarder.open_count(), primary as usize + 1);
        assert_eq!(forwarder.closed_count(), forwarder.open_count());
    }

    #[tokio::test]
    async fn lowest_ordinal_wins_ties() {
        let forwarder = RecordingForwarder::new();
        let mut probe = MockProbe::new();
        probe
            .expect_is_primary()
            .returning(|c, _| Ok(c.ordinal >= 1));

        let mut shuffled = candidates("db", 3);
        shuffled.reverse();
        let winner = prober(&forwarder)
            .find_primary(&shuffled, &probe)
            .await
            .unwrap();

        assert_eq!(winner.pod_name, "db-1");
        assert_eq!(forwarder.opened_pods(), vec!["db-0", "db-1"]);
    }

    #[tokio::test]
    async fn exhaustion_is_no_primary_found() {
        let forwarder = RecordingForwarder::new();
        let mut probe = MockProbe::new();
        probe.expect_is_primary().times(3).returning(|_, _| Ok(false));

        let result = prober(&forwarder)
            .find_primary(&candidates("db", 3), &probe)
            .await;

        match result {
            Err(Error::NoPrimaryFound { candidates }) => {
                assert_eq!(candidates, vec!["db-0", "db-1", "db-2"])
            }
            other => panic!("expected NoPrimaryFound, got {:?}", other),
        }
        assert_eq!(forwarder.open_count(), 3);
        assert_eq!(forwarder.closed_count(), 3);
    }

    #[tokio::test]
    async fn probe_errors_and_tunnel_failures_are_skipped() {
        let forwarder = RecordingForwarder::failing(&["mydb-0"]);
        let mut probe = MockProbe::new();
        probe.expect_is_primary().returning(|c, _| match c.ordinal {
            1 => Err(Error::probe(&c.pod_name, "connection refused")),
            _ => Ok(true),
        });

        let winner = prober(&forwarder)
            .find_primary(&candidates("mydb", 3), &probe)
            .await
            .unwrap();

        assert_eq!(winner.pod_name, "mydb-2");
        assert_eq!(forwarder.opened_pods(), vec!["mydb-1", "mydb-2"]);
        assert_eq!(forwarder.closed_count(), 2);
    }

    struct SlowProbe;

    #[async_trait]
    impl Probe for SlowProbe {
        async fn is_primary(&self, candidate: &Candidate, _local_port: u16) -> Result<bool> {
            if candidate.ordinal == 0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn timed_out_candidate_is_skipped_and_closed() {
        let forwarder = RecordingForwarder::new();
        let winner = PrimaryProber::new(&forwarder, "demo", 5432, Duration::from_millis(50))
            .find_primary(&candidates("pg", 2), &SlowProbe)
            .await
            .unwrap();

        assert_eq!(winner.pod_name, "pg-1");
        assert_eq!(forwarder.open_count(), 2);
        assert_eq!(forwarder.closed_count(), 2);
    }

    fn mongo_credential() -> Credential {
        let fields: BTreeMap<String, Vec<u8>> = [
            ("username".to_string(), b"root".to_vec()),
            ("password".to_string(), b"pw".to_vec()),
        ]
        .into_iter()
        .collect();
        Credential::new("mydb-auth", fields)
    }

    #[tokio::test]
    async fn mongodb_replica_set_election() {
        // mydb-0 answers false, mydb-1 is primary, mydb-2 is never asked.
        let primary_port = format!("--port={}", port_for("mydb-1"));
        let mut launcher = MockProcessLauncher::new();
        launcher
            .expect_launch()
            .times(2)
            .returning(move |cmd, stdin, stdout| {
                assert_eq!(stdin, StdinSource::Null);
                assert_eq!(stdout, StdoutMode::Capture);
                let answer = if cmd.args.contains(&primary_port) {
                    "true\n"
                } else {
                    "false\n"
                };
                Ok(ProcessOutput {
                    code: Some(0),
                    stdout: answer.as_bytes().to_vec(),
                })
            });

        let credential = mongo_credential();
        let probe = ClientProbe::new(
            Engine::MongoDb.handler(),
            &launcher,
            Some(&credential),
            ClientRuntime::Local,
        );
        let forwarder = RecordingForwarder::new();

        let winner = prober(&forwarder)
            .find_primary(&candidates("mydb", 3), &probe)
            .await
            .unwrap();

        assert_eq!(winner.pod_name, "mydb-1");
        assert_eq!(forwarder.opened_pods(), vec!["mydb-0", "mydb-1"]);
        assert_eq!(forwarder.closed_count(), 2);
    }

    #[tokio::test]
    async fn client_probe_failure_exit_is_probe_error() {
        let mut launcher = MockProcessLauncher::new();
        launcher.expect_launch().returning(|_, _, _| {
            Ok(ProcessOutput {
                code: Some(2),
                stdout: Vec::new(),
            })
        });

        let credential = mongo_credential();
        let probe = ClientProbe::new(
            Engine::MongoDb.handler(),
            &launcher,
            Some(&credential),
            ClientRuntime::Docker,
        );
        let result = probe.is_primary(&Candidate::new("mydb-0", 0), 40000).await;
        assert!(matches!(result, Err(Error::Probe { ref pod, .. }) if pod == "mydb-0"));
    }

    #[tokio::test]
    async fn engine_without_probe_is_probe_error() {
        let launcher = MockProcessLauncher::new();
        let probe = ClientProbe::new(
            Engine::Memcached.handler(),
            &launcher,
            None,
            ClientRuntime::Local,
        );
        let result = probe.is_primary(&Candidate::new("mc-0", 0), 40000).await;
        assert!(matches!(result, Err(Error::Probe { .. })));
    }
}
