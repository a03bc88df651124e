//! Reconciliation domain for gitpoller.
//!
//! This crate contains the record types, newtype identifiers, port traits and
//! error types shared by the workspace, plus the [`Reconciler`] that runs one
//! poll/compare/dispatch cycle. Infrastructure crates implement the ports;
//! they never add reconciliation rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`RecordKey`, `RepositoryId`, `Generation`, etc.) |
//! | [`types`] | Desired state, observed state, records and poll results |
//! | [`errors`] | Port errors, `ReconcileError` and `RetryPolicy` |
//! | [`duration`] | `"1h30m"`-style duration parsing |
//! | [`location`] | API endpoint and repository derivation from a declared URL |
//! | [`admission`] | Schema checks applied before records are stored |
//! | [`ports`] | Traits implemented by infrastructure crates |
//! | [`status`] | Pure observed-state transitions |
//! | [`reconciler`] | The reconcile cycle |

pub mod admission;
pub mod duration;
pub mod errors;
pub mod identifiers;
pub mod location;
pub mod ports;
pub mod reconciler;
pub mod status;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{
    CredentialError, DispatchError, PollError, ReconcileError, RetryPolicy, StoreError,
    ValidationError,
};
pub use identifiers::{
    Generation, Namespace, ReconcileId, RecordKey, RecordName, RepositoryId, SecretName,
};
pub use location::RepositoryLocation;
pub use ports::{CommitPoller, CredentialResolver, EventDispatcher, PollerSelector, RecordStore};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use types::{
    AuthSecret, Commit, PollStatus, Polled, PolledRepository, RepositoryStatus, UpstreamKind,
    WatchedRepository, DEFAULT_FREQUENCY, DEFAULT_SECRET_KEY,
};
