use crate::credential::Credential;
use crate::database::{RouterSelector, Topology};
use crate::engine::{
    basic_auth, ClientInvocation, ClientMode, Engine, EngineHandler, SecretFields, ADMIN_FIELDS,
};
use crate::Result;

const IMAGE: &str = "rezoan/alpine-curl:latest";
const PORT: u16 = 9200;
const CLIENT_ROLE_LABEL: &str = "node.role.client";

/// Elasticsearch. Interactive sessions drop into a curl shell with the
/// address and admin credential exported.
pub(super) struct Elasticsearch;

impl EngineHandler for Elasticsearch {
    fn engine(&self) -> Engine {
        Engine::Elasticsearch
    }

    fn default_port(&self) -> u16 {
        PORT
    }

    /// With a dedicated topology, client nodes are the entry points.
    fn topology(&self, _name: &str, spec: &serde_json::Value) -> Result<Topology> {
        Ok(match spec.get("topology") {
            Some(t) if !t.is_null() => Topology::Sharded {
                router: RouterSelector::Label {
                    key: CLIENT_ROLE_LABEL.to_string(),
                    value: "set".to_string(),
                },
            },
            _ => Topology::Standalone,
        })
    }

    fn secret_fields(&self) -> Option<SecretFields> {
        Some(ADMIN_FIELDS)
    }

    fn client(
        &self,
        port: u16,
        credential: Option<&Credential>,
        _mode: ClientMode,
    ) -> Result<ClientInvocation> {
        let (user, password) = basic_auth(Engine::Elasticsearch, credential, ADMIN_FIELDS)?;
        Ok(ClientInvocation {
            image: IMAGE,
            image_program: None,
            local_program: "sh",
            args: Vec::new(),
            env: Vec::new(),
        }
        .env("USERNAME", user)
        .env("PASSWORD", password)
        .env("ADDRESS", format!("localhost:{}", port)))
    }

    fn supports_apply(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::config::ClientRuntime;

    #[test]
    fn dedicated_topology_routes_to_client_nodes() {
        let topology = Elasticsearch
            .topology("es", &json!({"topology": {"client": {"replicas": 1}}}))
            .unwrap();
        assert!(matches!(
            topology,
            Topology::Sharded { router: RouterSelector::Label { ref key, .. } } if key == "node.role.client"
        ));
        assert_eq!(
            Elasticsearch.topology("es", &json!({})).unwrap(),
            Topology::Standalone
        );
    }

    #[test]
    fn session_exports_admin_credential() {
        let credential = Credential::new(
            "es-auth",
            BTreeMap::from([
                ("ADMIN_USERNAME".to_string(), b"elastic".to_vec()),
                ("ADMIN_PASSWORD".to_string(), b"pw".to_vec()),
            ]),
        );
        let cmd = Elasticsearch
            .client(40200, Some(&credential), ClientMode::Interactive)
            .unwrap()
            .into_command(ClientRuntime::Docker, true);
        assert_eq!(
            cmd.args,
            vec![
                "run", "--rm", "-i", "-t", "--network=host", "-e", "USERNAME", "-e", "PASSWORD",
                "-e", "ADDRESS", "rezoan/alpine-curl:latest"
            ]
        );
        assert!(cmd
            .env
            .contains(&("ADDRESS".to_string(), "localhost:40200".to_string())));
        assert!(!Elasticsearch.supports_apply());
    }
}
