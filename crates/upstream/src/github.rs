//! GitHub-style polling: `GET {endpoint}/repos/{owner}/{repo}/commits/{ref}`.

use async_trait::async_trait;
use polling::{Commit, CommitPoller, PollError, PollStatus, Polled, RepositoryId};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{info, instrument};
use url::Url;

use crate::conditional::{ConditionalGet, Fetched};

/// Media type requested from the GitHub REST API.
pub const GITHUB_ACCEPT: &str = "application/vnd.github+json";

/// Polls the GitHub commits API for the tip of a ref.
#[derive(Debug, Clone)]
pub struct GitHubPoller {
    client: Client,
    endpoint: String,
    token: String,
}

impl GitHubPoller {
    /// `endpoint` is the API base, e.g. `https://api.github.com` or
    /// `https://ghe.example.com/api/v3`. An empty `token` polls anonymously.
    pub fn new(client: Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn commit_url(&self, repository: &RepositoryId, git_ref: &str) -> Result<Url, PollError> {
        let mut url = Url::parse(&self.endpoint).map_err(|err| PollError::InvalidUrl(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| PollError::InvalidUrl(format!("{} cannot be a base URL", self.endpoint)))?
            .pop_if_empty()
            .push("repos")
            .extend(repository.as_str().split('/'))
            .push("commits")
            .extend(git_ref.split('/'));
        Ok(url)
    }
}

#[async_trait]
impl CommitPoller for GitHubPoller {
    #[instrument(skip_all, fields(endpoint = %self.endpoint, repo = %repository))]
    async fn poll(&self, repository: &RepositoryId, previous: &PollStatus) -> Result<Polled, PollError> {
        let request = ConditionalGet {
            url: self.commit_url(repository, &previous.git_ref)?,
            accept: GITHUB_ACCEPT,
            credential: (!self.token.is_empty())
                .then(|| (AUTHORIZATION.as_str(), format!("token {}", self.token))),
            etag: &previous.etag,
        };

        let (bytes, etag) = match request.send(&self.client).await? {
            Fetched::NotModified => return Ok(Polled::not_modified(previous.clone())),
            Fetched::Body { bytes, etag } => (bytes, etag),
        };

        let commit: Map<String, Value> =
            serde_json::from_slice(&bytes).map_err(|err| PollError::Decode(err.to_string()))?;
        let commit = Commit::new(commit);
        let sha = commit
            .str_field("sha")
            .ok_or_else(|| PollError::Decode("commit has no \"sha\" field".to_string()))?
            .to_string();

        info!(git_ref = %previous.git_ref, %sha, "poll complete");
        Ok(Polled::fetched(PollStatus::new(previous.git_ref.clone(), sha, etag), commit))
    }
}
