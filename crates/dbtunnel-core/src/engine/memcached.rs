use crate::credential::Credential;
use crate::database::{RouterSelector, Topology};
use crate::engine::{ClientInvocation, ClientMode, Engine, EngineHandler, SecretFields, LOCALHOST};
use crate::Result;

const IMAGE: &str = "rezoan/telnet-curl:latest";
const PORT: u16 = 11211;

/// Memcached. Pods are interchangeable and run without authentication.
pub(super) struct Memcached;

impl EngineHandler for Memcached {
    fn engine(&self) -> Engine {
        Engine::Memcached
    }

    fn default_port(&self) -> u16 {
        PORT
    }

    fn topology(&self, _name: &str, _spec: &serde_json::Value) -> Result<Topology> {
        Ok(Topology::Sharded {
            router: RouterSelector::Any,
        })
    }

    fn secret_fields(&self) -> Option<SecretFields> {
        None
    }

    fn client(
        &self,
        port: u16,
        _credential: Option<&Credential>,
        _mode: ClientMode,
    ) -> Result<ClientInvocation> {
        Ok(ClientInvocation {
            image: IMAGE,
            image_program: None,
            local_program: "telnet",
            args: vec![LOCALHOST.to_string(), port.to_string()],
            env: Vec::new(),
        })
    }

    fn supports_apply(&self) -> bool {
        false
    }
}
