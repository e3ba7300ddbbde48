//! Cluster access configuration, loaded once per invocation.
//!
//! Values come from the environment:
//! - `DBTUNNEL_KUBECONFIG`: kubeconfig path override; when unset the kube
//!   defaults apply (`KUBECONFIG` env / `~/.kube/config`)
//! - `DBTUNNEL_CLIENT_RUNTIME`: `docker` (default) or `local`
//! - `DBTUNNEL_PROBE_TIMEOUT`: per-candidate probe timeout in seconds
//!
//! The resulting [`ClusterConfig`] is read-only and passed by reference into
//! every component.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::{Error, Result};

const KUBECONFIG_ENV: &str = "DBTUNNEL_KUBECONFIG";
const CLIENT_RUNTIME_ENV: &str = "DBTUNNEL_CLIENT_RUNTIME";
const PROBE_TIMEOUT_ENV: &str = "DBTUNNEL_PROBE_TIMEOUT";

/// Probe timeout used when `DBTUNNEL_PROBE_TIMEOUT` is unset.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How external database clients are launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientRuntime {
    /// `docker run --network=host <image> ...`
    #[default]
    Docker,
    /// A client binary already installed on the operator's machine
    Local,
}

impl FromStr for ClientRuntime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(ClientRuntime::Docker),
            "local" => Ok(ClientRuntime::Local),
            other => Err(Error::config(format!(
                "invalid {}: '{}', expected docker or local",
                CLIENT_RUNTIME_ENV, other
            ))),
        }
    }
}

/// Per-invocation cluster access settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Explicit kubeconfig path; `None` uses the kube defaults.
    pub kubeconfig: Option<PathBuf>,
    pub client_runtime: ClientRuntime,
    pub probe_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            client_runtime: ClientRuntime::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl ClusterConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let kubeconfig = non_empty(KUBECONFIG_ENV).map(PathBuf::from);

        let client_runtime = match non_empty(CLIENT_RUNTIME_ENV) {
            Some(value) => value.parse()?,
            None => ClientRuntime::default(),
        };

        let probe_timeout = match non_empty(PROBE_TIMEOUT_ENV) {
            Some(value) => {
                let secs: u64 = value.trim().parse().map_err(|_| {
                    Error::config(format!(
                        "invalid {}: '{}', expected whole seconds",
                        PROBE_TIMEOUT_ENV, value
                    ))
                })?;
                if secs == 0 {
                    return Err(Error::config(format!(
                        "{} must be greater than zero",
                        PROBE_TIMEOUT_ENV
                    )));
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_PROBE_TIMEOUT,
        };

        Ok(Self {
            kubeconfig,
            client_runtime,
            probe_timeout,
        })
    }

    /// Build a kube [`Client`] from this configuration.
    pub async fn client(&self) -> Result<Client> {
        let Some(path) = &self.kubeconfig else {
            debug!("Using default kubeconfig resolution");
            return Ok(Client::try_default().await?);
        };

        debug!(path = %path.display(), "Loading kubeconfig");
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            Error::config(format!(
                "failed to read kubeconfig {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::config(format!("invalid kubeconfig {}: {}", path.display(), e)))?;
        Ok(Client::try_from(config)?)
    }
}
