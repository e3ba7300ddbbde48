//! Read-only views of the cluster objects a resolution works from.
//!
//! [`DatabaseObject`] is parsed out of a KubeDB custom resource, [`PodInfo`]
//! out of a listed `Pod`. Neither is cached beyond a single invocation.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::Deserialize;

use crate::engine::Engine;
use crate::{Error, Result};

/// Label KubeDB sets to the `<plural>.kubedb.com` resource name on every offshoot
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Label KubeDB sets to the owning database object's name
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

const CONDITION_READY: &str = "Ready";
const STATUS_TRUE: &str = "True";

/// Lifecycle phase reported in a database object's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Provisioning,
    DataRestoring,
    Ready,
    Critical,
    NotReady,
    Halted,
    Unknown(String),
}

impl Phase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Provisioning" => Phase::Provisioning,
            "DataRestoring" => Phase::DataRestoring,
            "Ready" => Phase::Ready,
            "Critical" => Phase::Critical,
            "NotReady" => Phase::NotReady,
            "Halted" => Phase::Halted,
            other => Phase::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Provisioning => write!(f, "Provisioning"),
            Phase::DataRestoring => write!(f, "DataRestoring"),
            Phase::Ready => write!(f, "Ready"),
            Phase::Critical => write!(f, "Critical"),
            Phase::NotReady => write!(f, "NotReady"),
            Phase::Halted => write!(f, "Halted"),
            Phase::Unknown(s) if s.is_empty() => write!(f, "Unknown"),
            Phase::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// How a router (entry-point) pod is picked from the live pod set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterSelector {
    /// Pod name starts with the prefix, e.g. `<name>-mongos`
    NamePrefix(String),
    /// Pod carries the label with the given value
    Label { key: String, value: String },
    /// Any pod of the object is an equivalent entry point
    Any,
}

impl RouterSelector {
    pub fn matches(&self, pod: &PodInfo) -> bool {
        match self {
            RouterSelector::NamePrefix(prefix) => pod.name.starts_with(prefix.as_str()),
            RouterSelector::Label { key, value } => pod.labels.get(key) == Some(value),
            RouterSelector::Any => true,
        }
    }
}

impl fmt::Display for RouterSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterSelector::NamePrefix(prefix) => write!(f, "name prefix {}", prefix),
            RouterSelector::Label { key, value } => write!(f, "label {}={}", key, value),
            RouterSelector::Any => write!(f, "any pod"),
        }
    }
}

/// Deployment shape of a database object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// A single instance named `<name>-0`
    Standalone,
    /// `replicas` ordinal-named instances, exactly one of which is primary
    Replicated { replicas: u32 },
    /// Stateless routers in front of the data nodes
    Sharded { router: RouterSelector },
}

/// A KubeDB database object as seen by this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseObject {
    pub engine: Engine,
    pub name: String,
    pub namespace: String,
    pub phase: Phase,
    pub topology: Topology,
    /// `spec.authSecret.name`, when set
    pub auth_secret: Option<String>,
    /// `spec.disableAuth`; no secret exists when set
    pub auth_disabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommonSpec {
    auth_secret: Option<LocalObjectRef>,
    #[serde(default)]
    disable_auth: bool,
}

#[derive(Debug, Default, Deserialize)]
struct LocalObjectRef {
    name: Option<String>,
}

impl DatabaseObject {
    /// Parse a KubeDB custom resource fetched as a [`DynamicObject`].
    pub fn from_dynamic(engine: Engine, obj: &DynamicObject) -> Result<Self> {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_default();

        let spec = obj
            .data
            .get("spec")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let phase = obj
            .data
            .pointer("/status/phase")
            .and_then(|v| v.as_str())
            .map(Phase::parse)
            .unwrap_or_else(|| Phase::Unknown(String::new()));

        let common: CommonSpec = if spec.is_null() {
            CommonSpec::default()
        } else {
            serde_json::from_value(spec.clone()).map_err(|e| {
                Error::validation(format!("{} {}/{}: invalid spec: {}", engine, namespace, name, e))
            })?
        };
        let topology = engine.handler().topology(&name, &spec)?;

        Ok(Self {
            engine,
            name,
            namespace,
            phase,
            topology,
            auth_secret: common
                .auth_secret
                .and_then(|r| r.name)
                .filter(|n| !n.is_empty()),
            auth_disabled: common.disable_auth,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Label selector matching every pod KubeDB created for this object.
    pub fn pod_selector(&self) -> String {
        format!(
            "{}={}.kubedb.com,{}={}",
            LABEL_NAME,
            self.engine.plural(),
            LABEL_INSTANCE,
            self.name
        )
    }

    /// Secret holding the admin credential: `spec.authSecret.name`, else `<name>-auth`.
    pub fn secret_name(&self) -> String {
        self.auth_secret
            .clone()
            .unwrap_or_else(|| format!("{}-auth", self.name))
    }

    /// Pod name for the given ordinal under the StatefulSet naming convention.
    pub fn ordinal_pod(&self, ordinal: u32) -> String {
        format!("{}-{}", self.name, ordinal)
    }
}

/// A pod listed for a database object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub ready: bool,
}

impl From<&Pod> for PodInfo {
    fn from(pod: &Pod) -> Self {
        let ready = pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
            })
            .unwrap_or(false);

        Self {
            name: pod.name_any(),
            namespace: pod.namespace().unwrap_or_default(),
            labels: pod.labels().clone(),
            ready,
        }
    }
}

/// A pod eligible to be considered the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub pod_name: String,
    pub ordinal: u32,
}

impl Candidate {
    pub fn new(pod_name: impl Into<String>, ordinal: u32) -> Self {
        Self {
            pod_name: pod_name.into(),
            ordinal,
        }
    }

    /// Build a candidate from a pod name, taking the ordinal from a trailing `-N`.
    pub fn from_pod_name(pod_name: &str) -> Self {
        let ordinal = pod_name
            .rsplit_once('-')
            .and_then(|(_, suffix)| suffix.parse().ok())
            .unwrap_or(0);
        Self::new(pod_name, ordinal)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pod_name)
    }
}
