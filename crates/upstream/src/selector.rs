//! Kind-to-poller mapping and the shared HTTP transport.

use std::time::Duration;

use async_trait::async_trait;
use polling::{CommitPoller, PollError, PollStatus, Polled, PollerSelector, RepositoryId, UpstreamKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{GitHubPoller, GitLabPoller};

/// HTTP settings for upstream queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Upper bound on one poll request, connect to last byte.
    #[serde(with = "polling::duration::serde_str")]
    pub request_timeout: Duration,

    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("gitpoller/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TransportConfig {
    /// Builds the client every poller created by one selector shares.
    pub fn build_client(&self) -> Result<Client, reqwest::Error> {
        Client::builder()
            .timeout(self.request_timeout)
            .user_agent(self.user_agent.as_str())
            .build()
    }
}

/// A poller for one of the supported dialects.
#[derive(Debug, Clone)]
pub enum UpstreamPoller {
    GitHub(GitHubPoller),
    GitLab(GitLabPoller),
}

impl UpstreamPoller {
    /// Returns `None` for [`UpstreamKind::Unsupported`].
    pub fn for_kind(client: Client, kind: &UpstreamKind, endpoint: &str, token: &str) -> Option<Self> {
        match kind {
            UpstreamKind::GitHub => Some(Self::GitHub(GitHubPoller::new(client, endpoint, token))),
            UpstreamKind::GitLab => Some(Self::GitLab(GitLabPoller::new(client, endpoint, token))),
            UpstreamKind::Unsupported(_) => None,
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::GitHub(poller) => poller.endpoint(),
            Self::GitLab(poller) => poller.endpoint(),
        }
    }
}

#[async_trait]
impl CommitPoller for UpstreamPoller {
    async fn poll(&self, repository: &RepositoryId, previous: &PollStatus) -> Result<Polled, PollError> {
        match self {
            Self::GitHub(poller) => poller.poll(repository, previous).await,
            Self::GitLab(poller) => poller.poll(repository, previous).await,
        }
    }
}

/// [`PollerSelector`] backed by real HTTP pollers.
#[derive(Debug, Clone)]
pub struct HttpPollerSelector {
    client: Client,
}

impl HttpPollerSelector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self, reqwest::Error> {
        Ok(Self::new(config.build_client()?))
    }
}

impl PollerSelector for HttpPollerSelector {
    fn select(&self, kind: &UpstreamKind, endpoint: &str, token: &str) -> Option<Box<dyn CommitPoller>> {
        let poller = UpstreamPoller::for_kind(self.client.clone(), kind, endpoint, token)?;
        debug!(kind = %kind, endpoint = poller.endpoint(), "selected upstream poller");
        Some(Box::new(poller))
    }
}
