//! GitLab-style polling:
//! `GET {endpoint}/api/v4/projects/{owner%2Frepo}/repository/commits?ref_name={ref}`.

use async_trait::async_trait;
use polling::{Commit, CommitPoller, PollError, PollStatus, Polled, RepositoryId};
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{info, instrument};
use url::Url;

use crate::conditional::{ConditionalGet, Fetched};

/// Endpoint used when none is configured.
pub const GITLAB_DEFAULT_ENDPOINT: &str = "https://gitlab.com";

pub const GITLAB_ACCEPT: &str = "application/json";

const TOKEN_HEADER: &str = "private-token";

/// Polls the GitLab commits API for the tip of a ref.
#[derive(Debug, Clone)]
pub struct GitLabPoller {
    client: Client,
    endpoint: String,
    token: String,
}

impl GitLabPoller {
    /// An empty `endpoint` means [`GITLAB_DEFAULT_ENDPOINT`]; an empty `token`
    /// polls anonymously.
    pub fn new(client: Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            client,
            endpoint: if endpoint.is_empty() {
                GITLAB_DEFAULT_ENDPOINT.to_string()
            } else {
                endpoint
            },
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    // The project path is a single segment, so its '/' is sent as %2F.
    fn commits_url(&self, repository: &RepositoryId, git_ref: &str) -> Result<Url, PollError> {
        let mut url = Url::parse(&self.endpoint).map_err(|err| PollError::InvalidUrl(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| PollError::InvalidUrl(format!("{} cannot be a base URL", self.endpoint)))?
            .pop_if_empty()
            .extend(["api", "v4", "projects"])
            .push(repository.as_str())
            .extend(["repository", "commits"]);
        url.query_pairs_mut().append_pair("ref_name", git_ref);
        Ok(url)
    }
}

#[async_trait]
impl CommitPoller for GitLabPoller {
    #[instrument(skip_all, fields(endpoint = %self.endpoint, repo = %repository))]
    async fn poll(&self, repository: &RepositoryId, previous: &PollStatus) -> Result<Polled, PollError> {
        let request = ConditionalGet {
            url: self.commits_url(repository, &previous.git_ref)?,
            accept: GITLAB_ACCEPT,
            credential: (!self.token.is_empty()).then(|| (TOKEN_HEADER, self.token.clone())),
            etag: &previous.etag,
        };

        let (bytes, etag) = match request.send(&self.client).await? {
            Fetched::NotModified => return Ok(Polled::not_modified(previous.clone())),
            Fetched::Body { bytes, etag } => (bytes, etag),
        };

        // Newest first; only the head of the list matters.
        let mut commits: Vec<Map<String, Value>> =
            serde_json::from_slice(&bytes).map_err(|err| PollError::Decode(err.to_string()))?;
        if commits.is_empty() {
            return Err(PollError::Decode(format!(
                "no commits returned for ref {:?}",
                previous.git_ref
            )));
        }
        let commit = Commit::new(commits.swap_remove(0));
        let sha = commit
            .str_field("id")
            .ok_or_else(|| PollError::Decode("commit has no \"id\" field".to_string()))?
            .to_string();

        info!(git_ref = %previous.git_ref, %sha, "poll complete");
        Ok(Polled::fetched(PollStatus::new(previous.git_ref.clone(), sha, etag), commit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeApi, TEST_ETAG, TEST_TOKEN};

    const COMMIT_SHA: &str = "ed899a2f4b50b4370feeea94676502b42383c746";

    fn commits_body() -> String {
        serde_json::json!([
            {
                "id": COMMIT_SHA,
                "short_id": "ed899a2f4b5",
                "title": "Replace sanitize with escape once",
                "author_name": "Example User",
                "message": "Replace sanitize with escape once"
            },
            {
                "id": "6104942438c14ec7bd21c6cd5bd995272b3faff6",
                "short_id": "6104942438c",
                "title": "Sanitize for network graph",
                "author_name": "randx",
                "message": "Sanitize for network graph"
            }
        ])
        .to_string()
    }

    fn api(expected_token: Option<&str>) -> FakeApi {
        FakeApi {
            path: "/api/v4/projects/testing%2Frepo/repository/commits",
            ref_name: Some("master"),
            auth_header: TOKEN_HEADER,
            expected_auth: expected_token.map(str::to_string),
            accept: GITLAB_ACCEPT,
            etag: TEST_ETAG,
            body: commits_body(),
        }
    }

    fn repo(id: &str) -> RepositoryId {
        RepositoryId::new(id).unwrap()
    }

    #[test]
    fn empty_endpoint_defaults_to_gitlab_com() {
        let poller = GitLabPoller::new(Client::new(), "", "");
        assert_eq!(poller.endpoint(), "https://gitlab.com");
    }

    #[test]
    fn commits_url_escapes_the_project_path() {
        let poller = GitLabPoller::new(Client::new(), "https://gitlab.example.com/", "");
        let url = poller.commits_url(&repo("group/sub/app"), "main").unwrap();
        assert_eq!(
            url.as_str(),
            "https://gitlab.example.com/api/v4/projects/group%2Fsub%2Fapp/repository/commits?ref_name=main"
        );
    }

    #[tokio::test]
    async fn unknown_etag_fetches_the_newest_commit() {
        let base = api(Some(TEST_TOKEN)).serve().await;
        let poller = GitLabPoller::new(Client::new(), base, TEST_TOKEN);

        let polled = poller.poll(&repo("testing/repo"), &PollStatus::for_ref("master")).await.unwrap();

        assert_eq!(polled.status, PollStatus::new("master", COMMIT_SHA, TEST_ETAG));
        let commit = polled.commit.expect("commit payload");
        assert_eq!(commit.str_field("title"), Some("Replace sanitize with escape once"));
    }

    #[tokio::test]
    async fn known_etag_returns_the_previous_state() {
        let base = api(Some(TEST_TOKEN)).serve().await;
        let poller = GitLabPoller::new(Client::new(), base, TEST_TOKEN);
        let previous = PollStatus::new("master", COMMIT_SHA, TEST_ETAG);

        let polled = poller.poll(&repo("testing/repo"), &previous).await.unwrap();

        assert_eq!(polled, Polled::not_modified(previous));
    }

    #[tokio::test]
    async fn unknown_project_is_a_server_error() {
        let base = api(Some(TEST_TOKEN)).serve().await;
        let poller = GitLabPoller::new(Client::new(), base, TEST_TOKEN);

        let err = poller
            .poll(&repo("testing/testing"), &PollStatus::new("master", "", TEST_ETAG))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "server error: 404");
    }

    #[tokio::test]
    async fn bad_authentication_is_indistinguishable_from_not_found() {
        let base = api(Some(TEST_TOKEN)).serve().await;
        let poller = GitLabPoller::new(Client::new(), base, "anotherToken");

        let err = poller
            .poll(&repo("testing/repo"), &PollStatus::new("master", "", TEST_ETAG))
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::Status { status: 404 }));
    }

    #[tokio::test]
    async fn no_token_sends_no_private_token_header() {
        let base = api(None).serve().await;
        let poller = GitLabPoller::new(Client::new(), base, "");

        let polled = poller.poll(&repo("testing/repo"), &PollStatus::for_ref("master")).await.unwrap();

        assert_eq!(polled.status.sha, COMMIT_SHA);
    }

    #[tokio::test]
    async fn empty_commit_list_is_a_decode_error() {
        let mut fake = api(None);
        fake.body = "[]".to_string();
        let base = fake.serve().await;
        let poller = GitLabPoller::new(Client::new(), base, "");

        let err = poller.poll(&repo("testing/repo"), &PollStatus::for_ref("master")).await.unwrap_err();

        assert!(matches!(err, PollError::Decode(_)));
    }

    #[tokio::test]
    async fn object_instead_of_list_is_a_decode_error() {
        let mut fake = api(None);
        fake.body = serde_json::json!({ "id": COMMIT_SHA }).to_string();
        let base = fake.serve().await;
        let poller = GitLabPoller::new(Client::new(), base, "");

        let err = poller.poll(&repo("testing/repo"), &PollStatus::for_ref("master")).await.unwrap_err();

        assert!(matches!(err, PollError::Decode(_)));
    }
}
