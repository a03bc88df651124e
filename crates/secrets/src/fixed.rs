//! In-memory secrets.

use std::collections::HashMap;

use async_trait::async_trait;
use polling::{CredentialError, CredentialResolver, Namespace, SecretName};

/// Resolves credentials from a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretResolver {
    secrets: HashMap<(Namespace, SecretName), HashMap<String, String>>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `key = value` to secret `name` in `namespace`.
    #[must_use]
    pub fn with_secret(
        mut self,
        namespace: Namespace,
        name: SecretName,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.insert(namespace, name, key, value);
        self
    }

    pub fn insert(
        &mut self,
        namespace: Namespace,
        name: SecretName,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.secrets
            .entry((namespace, name))
            .or_default()
            .insert(key.into(), value.into());
    }
}

#[async_trait]
impl CredentialResolver for StaticSecretResolver {
    async fn resolve(&self, namespace: &Namespace, name: &SecretName, key: &str) -> Result<String, CredentialError> {
        let secret = self
            .secrets
            .get(&(namespace.clone(), name.clone()))
            .ok_or_else(|| CredentialError::NotFound {
                namespace: namespace.clone(),
                name: name.clone(),
            })?;
        secret.get(key).cloned().ok_or_else(|| CredentialError::MissingKey {
            namespace: namespace.clone(),
            name: name.clone(),
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_known_keys_only() {
        let ns = Namespace::new("testing").unwrap();
        let name = SecretName::new("gh").unwrap();
        let resolver = StaticSecretResolver::new().with_secret(ns.clone(), name.clone(), "token", "abc123");

        assert_eq!(resolver.resolve(&ns, &name, "token").await.unwrap(), "abc123");
        assert!(matches!(
            resolver.resolve(&ns, &name, "password").await,
            Err(CredentialError::MissingKey { .. })
        ));
        assert!(matches!(
            resolver.resolve(&Namespace::default(), &name, "token").await,
            Err(CredentialError::NotFound { .. })
        ));
    }
}
