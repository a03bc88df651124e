//! Port traits implemented by infrastructure crates.
//!
//! | Trait | Implemented by |
//! |-------|----------------|
//! | [`CommitPoller`] / [`PollerSelector`] | `upstream` |
//! | [`CredentialResolver`] | `secrets` |
//! | [`EventDispatcher`] | `dispatch` |
//! | [`RecordStore`] | `controller` |

use async_trait::async_trait;

use crate::{
    Commit, CredentialError, DispatchError, Namespace, PollError, PollStatus, Polled,
    PolledRepository, RecordKey, RepositoryId, RepositoryStatus, SecretName, StoreError,
    UpstreamKind,
};

/// Checks an upstream hosting service for the current tip of a ref.
#[async_trait]
pub trait CommitPoller: Send + Sync {
    /// Issues one conditional query for `previous.git_ref` of `repository`.
    ///
    /// `previous.etag` is replayed as the cache validator when non-empty. A
    /// "not modified" answer returns `previous` unchanged and no commit.
    async fn poll(&self, repository: &RepositoryId, previous: &PollStatus) -> Result<Polled, PollError>;
}

/// Builds the poller for a declared upstream kind.
pub trait PollerSelector: Send + Sync {
    /// Returns `None` when no poller exists for `kind`.
    ///
    /// An empty `token` means the poller must send no credential header.
    fn select(&self, kind: &UpstreamKind, endpoint: &str, token: &str) -> Option<Box<dyn CommitPoller>>;
}

/// Resolves secret references to bearer tokens.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Returns the value stored under `key` in secret `name` of `namespace`.
    async fn resolve(&self, namespace: &Namespace, name: &SecretName, key: &str) -> Result<String, CredentialError>;
}

/// Delivers commit notifications to a record's endpoint.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Publishes `commit` for `record` to `record.spec.endpoint`.
    async fn dispatch(&self, record: &PolledRepository, commit: &Commit) -> Result<(), DispatchError>;
}

/// Persistence of reconciliation records.
///
/// Only the status is written through this port; desired state is owned by
/// whatever populates the store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Loads a record, or `None` when it has been deleted.
    async fn get(&self, key: &RecordKey) -> Result<Option<PolledRepository>, StoreError>;

    /// Replaces the status of an existing record in one atomic step.
    async fn update_status(&self, key: &RecordKey, status: RepositoryStatus) -> Result<(), StoreError>;
}
