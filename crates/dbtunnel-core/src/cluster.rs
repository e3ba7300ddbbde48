//! Control-plane reads.
//!
//! [`ClusterApi`] covers everything resolution needs from the API server:
//! the database custom resource, its secret and its pods. Port-forwarding
//! lives separately in [`crate::tunnel`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, DynamicObject, ListParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::database::{DatabaseObject, PodInfo};
use crate::engine::Engine;
use crate::error::is_not_found;
use crate::{Error, Result};

/// Read-only access to the objects a resolution works from.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch and parse a database object.
    async fn get_database(
        &self,
        engine: Engine,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseObject>;

    /// Secret data by field name, or `None` if the secret does not exist.
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>>;

    /// Pods matching a label selector.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>>;
}

/// [`ClusterApi`] backed by a kube [`Client`].
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_database(
        &self,
        engine: Engine,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseObject> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &engine.api_resource());

        debug!(kind = engine.kind(), namespace, name, "Fetching database object");
        let obj = api
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::DatabaseNotFound {
                kind: engine.kind().to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        DatabaseObject::from_dynamic(engine, &obj)
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = match api.get(name).await {
            Ok(secret) => secret,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut fields: BTreeMap<String, Vec<u8>> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();
        // stringData is write-only on the server, but honour it for secrets
        // returned by admission webhooks or fakes.
        for (k, v) in secret.string_data.unwrap_or_default() {
            fields.entry(k).or_insert_with(|| v.into_bytes());
        }
        Ok(Some(fields))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        debug!(namespace, selector, count = pods.items.len(), "Listed pods");
        Ok(pods.items.iter().map(PodInfo::from).collect())
    }
}
