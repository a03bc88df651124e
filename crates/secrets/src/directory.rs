//! Secrets mounted as files: `{root}/{namespace}/{name}/{key}`.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use polling::{CredentialError, CredentialResolver, Namespace, SecretName};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Directory searched when none is configured.
pub const DEFAULT_SECRETS_DIRECTORY: &str = "/etc/gitpoller/secrets";

/// The `[secrets]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretsConfig {
    pub directory: PathBuf,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self { directory: PathBuf::from(DEFAULT_SECRETS_DIRECTORY) }
    }
}

/// Reads credentials from a directory tree laid out like mounted Kubernetes
/// secrets: one directory per secret, one file per key.
#[derive(Debug, Clone)]
pub struct DirectorySecretResolver {
    root: PathBuf,
}

impl DirectorySecretResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &SecretsConfig) -> Self {
        Self::new(&config.directory)
    }
}

/// Accepts only a single plain path component, so names cannot escape the root.
fn is_plain_component(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

#[async_trait]
impl CredentialResolver for DirectorySecretResolver {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn resolve(&self, namespace: &Namespace, name: &SecretName, key: &str) -> Result<String, CredentialError> {
        let not_found = || CredentialError::NotFound {
            namespace: namespace.clone(),
            name: name.clone(),
        };
        let missing_key = || CredentialError::MissingKey {
            namespace: namespace.clone(),
            name: name.clone(),
            key: key.to_string(),
        };

        if !is_plain_component(namespace.as_str()) || !is_plain_component(name.as_str()) {
            return Err(not_found());
        }
        let secret_dir = self.root.join(namespace.as_str()).join(name.as_str());
        match tokio::fs::metadata(&secret_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(not_found()),
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(err) => {
                return Err(CredentialError::Unreadable {
                    namespace: namespace.clone(),
                    name: name.clone(),
                    message: err.to_string(),
                })
            }
        }

        if !is_plain_component(key) {
            return Err(missing_key());
        }
        let value = match tokio::fs::read_to_string(secret_dir.join(key)).await {
            Ok(value) => value,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(missing_key()),
            Err(err) => {
                return Err(CredentialError::Unreadable {
                    namespace: namespace.clone(),
                    name: name.clone(),
                    message: err.to_string(),
                })
            }
        };

        debug!("secret resolved");
        Ok(value.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn ns(value: &str) -> Namespace {
        Namespace::new(value).unwrap()
    }

    fn secret(value: &str) -> SecretName {
        SecretName::new(value).unwrap()
    }

    fn write_secret(root: &Path, namespace: &str, name: &str, key: &str, value: &str) {
        let dir = root.join(namespace).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(key), value).unwrap();
    }

    #[tokio::test]
    async fn reads_the_key_file_and_trims_the_newline() {
        let root = tempdir().unwrap();
        write_secret(root.path(), "testing", "gh-token", "token", "abc123\n");
        let resolver = DirectorySecretResolver::new(root.path());

        let token = resolver.resolve(&ns("testing"), &secret("gh-token"), "token").await.unwrap();

        assert_eq!(token, "abc123");
    }

    #[tokio::test]
    async fn missing_secret_is_not_found() {
        let root = tempdir().unwrap();
        let resolver = DirectorySecretResolver::new(root.path());

        let err = resolver.resolve(&ns("testing"), &secret("gh-token"), "token").await.unwrap_err();

        assert!(matches!(err, CredentialError::NotFound { .. }));
        assert_eq!(err.to_string(), "error getting secret testing/gh-token: not found");
    }

    #[tokio::test]
    async fn secrets_are_scoped_to_their_namespace() {
        let root = tempdir().unwrap();
        write_secret(root.path(), "other", "gh-token", "token", "abc123");
        let resolver = DirectorySecretResolver::new(root.path());

        let err = resolver.resolve(&ns("testing"), &secret("gh-token"), "token").await.unwrap_err();

        assert!(matches!(err, CredentialError::NotFound { .. }));
    }

    #[tokio::test]
    async fn missing_key_names_the_key() {
        let root = tempdir().unwrap();
        write_secret(root.path(), "testing", "gh-token", "password", "abc123");
        let resolver = DirectorySecretResolver::new(root.path());

        let err = resolver.resolve(&ns("testing"), &secret("gh-token"), "token").await.unwrap_err();

        assert_eq!(err.to_string(), "secret invalid, no \"token\" key in testing/gh-token");
    }

    #[tokio::test]
    async fn names_cannot_escape_the_root() {
        let root = tempdir().unwrap();
        write_secret(root.path(), "testing", "gh-token", "token", "abc123");
        let resolver = DirectorySecretResolver::new(root.path().join("testing"));

        let err = resolver.resolve(&ns(".."), &secret("testing"), "token").await.unwrap_err();
        assert!(matches!(err, CredentialError::NotFound { .. }));

        let resolver = DirectorySecretResolver::new(root.path());
        let err = resolver
            .resolve(&ns("testing"), &secret("gh-token"), "../gh-token/token")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::MissingKey { .. }));
    }

    #[test]
    fn config_defaults_to_the_mount_point() {
        assert_eq!(SecretsConfig::default().directory, PathBuf::from("/etc/gitpoller/secrets"));
    }
}
