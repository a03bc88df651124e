//! TOML configuration file.
//!
//! ```toml
//! [controller]
//! error_backoff = "30s"
//! state_file = "/var/lib/gitpoller/state.json"
//!
//! [telemetry]
//! log_format = "json"
//!
//! [[repository]]
//! name = "go-demo"
//! namespace = "testing"
//! url = "https://github.com/bigkevmcd/go-demo.git"
//! ref = "main"
//! type = "github"
//! frequency = "5m"
//! endpoint = "https://example.com/testing"
//! auth = { secretRef = "gh-token" }
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use controller::ControllerConfig;
use dispatch::DispatchConfig;
use polling::admission;
use polling::duration::format_duration;
use polling::{Namespace, RecordKey, RecordName, WatchedRepository};
use secrets::SecretsConfig;
use serde::Deserialize;
use upstream::TransportConfig;

use crate::telemetry::TelemetryConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub upstream: TransportConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryEntry>,
}

/// One `[[repository]]` table: identity plus the desired state.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryEntry {
    pub name: RecordName,

    #[serde(default)]
    pub namespace: Namespace,

    #[serde(flatten)]
    pub spec: WatchedRepository,
}

impl RepositoryEntry {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.namespace.clone(), self.name.clone())
    }
}

impl Config {
    /// Reads and validates `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("loading configuration file {}", path.display()))
    }

    /// Parses and validates a configuration document.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch.delivery_timeout >= self.controller.reconcile_timeout {
            bail!(
                "dispatch.delivery_timeout ({}) must be shorter than controller.reconcile_timeout ({})",
                format_duration(self.dispatch.delivery_timeout),
                format_duration(self.controller.reconcile_timeout),
            );
        }

        let mut seen = HashSet::new();
        for entry in &self.repositories {
            let key = entry.key();
            admission::validate(&key, &entry.spec)?;
            if !seen.insert(key.clone()) {
                bail!("repository {key} is declared more than once");
            }
        }
        Ok(())
    }

    pub fn records(&self) -> impl Iterator<Item = (RecordKey, WatchedRepository)> + '_ {
        self.repositories.iter().map(|entry| (entry.key(), entry.spec.clone()))
    }

    pub fn find(&self, key: &RecordKey) -> Option<&RepositoryEntry> {
        self.repositories.iter().find(|entry| entry.key() == *key)
    }
}
