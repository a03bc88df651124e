//! Desired-state, observed-state and record types.
//!
//! The serialised field names follow the external record shape: `ref`,
//! `type`, `auth.secretRef`, `pollStatus`, `lastError`, `observedGeneration`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Generation, RecordKey, SecretName};

/// Poll frequency used when a repository does not declare one.
pub const DEFAULT_FREQUENCY: Duration = Duration::from_secs(5 * 60);

/// Secret key read when an [`AuthSecret`] does not name one.
pub const DEFAULT_SECRET_KEY: &str = "token";

// ---------------------------------------------------------------------------
// Upstream kind
// ---------------------------------------------------------------------------

/// Git-hosting API dialect a repository is polled through.
///
/// Unknown values are kept as [`UpstreamKind::Unsupported`] rather than
/// rejected at deserialisation, so that the reconciler can surface them as a
/// configuration error on the record itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UpstreamKind {
    /// GitHub REST API (`/repos/{owner}/{repo}/commits/{ref}`).
    GitHub,
    /// GitLab REST API v4 (`/api/v4/projects/{id}/repository/commits`).
    GitLab,
    /// Any other declared value.
    Unsupported(String),
}

impl UpstreamKind {
    /// Returns the declared string form.
    pub fn as_str(&self) -> &str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Unsupported(other) => other,
        }
    }

    /// Returns `true` for kinds a poller exists for.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

impl From<String> for UpstreamKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "github" => Self::GitHub,
            "gitlab" => Self::GitLab,
            _ => Self::Unsupported(value),
        }
    }
}

impl From<UpstreamKind> for String {
    fn from(kind: UpstreamKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Desired state
// ---------------------------------------------------------------------------

/// Reference to the secret holding the upstream credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSecret {
    /// Secret to read, in the record's namespace.
    pub secret_ref: SecretName,

    /// Key within the secret. Defaults to `"token"`.
    #[serde(default = "default_secret_key")]
    pub key: String,
}

impl AuthSecret {
    /// References `key` in `secret`; an empty key falls back to the default.
    pub fn new(secret: SecretName, key: impl Into<String>) -> Self {
        Self { secret_ref: secret, key: key.into() }
    }

    /// The key to read, substituting the default for an empty value.
    pub fn effective_key(&self) -> &str {
        if self.key.is_empty() {
            DEFAULT_SECRET_KEY
        } else {
            &self.key
        }
    }
}

fn default_secret_key() -> String {
    DEFAULT_SECRET_KEY.to_string()
}

fn default_frequency() -> Duration {
    DEFAULT_FREQUENCY
}

/// What to watch and where to notify. Read-only to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedRepository {
    /// Git repository URL, e.g. `https://github.com/owner/repo.git`.
    pub url: String,

    /// Branch or tag to track.
    #[serde(rename = "ref")]
    pub git_ref: String,

    /// API dialect of the upstream host.
    #[serde(rename = "type")]
    pub kind: UpstreamKind,

    /// Optional credential used when polling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSecret>,

    /// How often the upstream is polled.
    #[serde(default = "default_frequency", with = "crate::duration::serde_str")]
    pub frequency: Duration,

    /// Notification destination that commits are dispatched to.
    pub endpoint: String,
}

// ---------------------------------------------------------------------------
// Observed state
// ---------------------------------------------------------------------------

/// Last polled state of one repository ref.
///
/// Two values are equal only when ref, SHA and ETag all match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PollStatus {
    /// Ref the SHA was observed on.
    #[serde(rename = "ref", default)]
    pub git_ref: String,

    /// Commit identifier at the tip of the ref.
    #[serde(default)]
    pub sha: String,

    /// Cache validator returned with the SHA; replayed as `If-None-Match`.
    #[serde(default)]
    pub etag: String,
}

impl PollStatus {
    /// A status for `git_ref` with no SHA and no cache validator.
    pub fn for_ref(git_ref: impl Into<String>) -> Self {
        Self { git_ref: git_ref.into(), ..Self::default() }
    }

    /// Creates a fully populated status.
    pub fn new(git_ref: impl Into<String>, sha: impl Into<String>, etag: impl Into<String>) -> Self {
        Self { git_ref: git_ref.into(), sha: sha.into(), etag: etag.into() }
    }
}

impl std::fmt::Display for PollStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.git_ref, if self.sha.is_empty() { "<none>" } else { &self.sha })
    }
}

/// Observed state of a record, owned by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatus {
    /// Result of the last poll that reported a change.
    #[serde(default)]
    pub poll_status: PollStatus,

    /// Error text of the last failed cycle; empty when healthy.
    #[serde(default)]
    pub last_error: String,

    /// Generation of the desired state this status was reconciled against.
    #[serde(default)]
    pub observed_generation: Generation,
}

impl RepositoryStatus {
    /// The state to poll from for `declared_ref`.
    ///
    /// When the declared ref has moved away from the stored one, the stored
    /// SHA and ETag belong to another ref and polling restarts from scratch.
    pub fn poll_base(&self, declared_ref: &str) -> PollStatus {
        if self.poll_status.git_ref == declared_ref {
            self.poll_status.clone()
        } else {
            PollStatus::for_ref(declared_ref)
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A watched repository together with its observed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolledRepository {
    /// Identity of the record.
    pub key: RecordKey,

    /// Revision of `spec`; bumped by the store on every spec change.
    pub generation: Generation,

    /// Desired state.
    pub spec: WatchedRepository,

    /// Observed state.
    #[serde(default)]
    pub status: RepositoryStatus,
}

impl PolledRepository {
    /// Creates a record at the initial generation with an empty status.
    pub fn new(key: RecordKey, spec: WatchedRepository) -> Self {
        Self {
            key,
            generation: Generation::INITIAL,
            spec,
            status: RepositoryStatus::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Poll results
// ---------------------------------------------------------------------------

/// Upstream-specific commit payload, passed to the dispatcher unmodified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Commit(Map<String, Value>);

impl Commit {
    /// Wraps a decoded JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Returns `field` when it holds a non-empty string.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
    }
}

impl From<Map<String, Value>> for Commit {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Outcome of one successful poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Polled {
    /// State observed upstream. Equals the previous state on a cache hit.
    pub status: PollStatus,

    /// Decoded commit; `None` when the upstream answered "not modified".
    pub commit: Option<Commit>,
}

impl Polled {
    /// A cache hit: the previous state is returned as is.
    pub fn not_modified(previous: PollStatus) -> Self {
        Self { status: previous, commit: None }
    }

    /// A fresh observation with its commit payload.
    pub fn fetched(status: PollStatus, commit: Commit) -> Self {
        Self { status, commit: Some(commit) }
    }
}
