//! Credential lookup from Kubernetes secrets.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::cluster::ClusterApi;
use crate::{Error, Result};

/// Authentication material read from a secret.
///
/// Field values are opaque bytes and never appear in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: String,
    fields: BTreeMap<String, Vec<u8>>,
}

impl Credential {
    pub fn new(secret: impl Into<String>, fields: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            fields,
        }
    }

    /// Name of the secret this credential came from.
    pub fn secret_name(&self) -> &str {
        &self.secret
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// A field decoded as UTF-8, trailing newlines trimmed.
    pub fn field(&self, name: &str) -> Result<String> {
        let bytes = self.get(name).ok_or_else(|| Error::MissingCredentialField {
            secret: self.secret.clone(),
            field: name.to_string(),
        })?;
        let value = String::from_utf8(bytes.to_vec()).map_err(|_| {
            Error::validation(format!(
                "secret {} field {} is not valid UTF-8",
                self.secret, name
            ))
        })?;
        Ok(value.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &self.secret)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Reads credentials through a [`ClusterApi`].
///
/// Independent of the database object's phase: a secret can be read before
/// the object is ready.
pub struct CredentialResolver<'a> {
    api: &'a dyn ClusterApi,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(api: &'a dyn ClusterApi) -> Self {
        Self { api }
    }

    pub async fn resolve(&self, namespace: &str, secret_name: &str) -> Result<Credential> {
        if secret_name.is_empty() {
            return Err(Error::validation("secret name must not be empty"));
        }

        debug!(namespace, secret = secret_name, "Resolving credential");
        match self.api.get_secret(namespace, secret_name).await? {
            Some(fields) => Ok(Credential::new(secret_name, fields)),
            None => Err(Error::SecretNotFound {
                namespace: namespace.to_string(),
                name: secret_name.to_string(),
            }),
        }
    }
}
