//! Derivation of the API endpoint and repository identifier from a declared URL.

use url::Url;

use crate::{ReconcileError, RepositoryId, UpstreamKind};

/// Where and what to poll for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryLocation {
    /// Repository identifier as the hosting API names it (`owner/repo`).
    pub repository: RepositoryId,

    /// Base URL of the hosting API, without a trailing slash.
    pub endpoint: String,
}

impl RepositoryLocation {
    /// Derives the location from a declared repository URL.
    ///
    /// The path loses its leading `/` and trailing `.git`. GitHub-style hosts
    /// are reached through the `api.` sub-domain; every other kind uses the
    /// declared host directly. A host already on `api.` is kept as is.
    pub fn from_url(raw: &str, kind: &UpstreamKind) -> Result<Self, ReconcileError> {
        let invalid = |reason: &str| ReconcileError::InvalidUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let parsed = Url::parse(raw).map_err(|err| invalid(&err.to_string()))?;
        let host = parsed.host_str().ok_or_else(|| invalid("URL has no host"))?;

        let host = match kind {
            UpstreamKind::GitHub if !host.starts_with("api.") => format!("api.{host}"),
            _ => host.to_string(),
        };
        let endpoint = match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        };

        let path = parsed.path();
        let path = path.strip_prefix('/').unwrap_or(path);
        let path = path.trim_end_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        let repository = RepositoryId::new(path).ok_or_else(|| invalid("URL has no repository path"))?;

        Ok(Self { repository, endpoint })
    }
}
