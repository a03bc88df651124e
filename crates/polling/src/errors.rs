//! Error and retry-policy types for the reconciliation domain.
//!
//! Each port has its own error enum ([`PollError`], [`CredentialError`],
//! [`DispatchError`], [`StoreError`]). [`ReconcileError`] wraps them at the
//! cycle boundary and decides, through [`RetryPolicy`], how the scheduler
//! follows up.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Namespace, RecordKey, SecretName, UpstreamKind};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether a failed cycle should be retried and, if so, after what delay.
///
/// - `Retryable`: upstream failures, missing credentials, delivery failures,
///   store failures.
/// - `NonRetryable`: configuration errors that only a change to the desired
///   state can fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The cycle may be retried.
    Retryable {
        /// Minimum delay before the next attempt. `None` means the scheduler's
        /// own error backoff applies.
        after: Option<Duration>,
    },
    /// Retrying without a desired-state change cannot succeed.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Port errors
// ---------------------------------------------------------------------------

/// Failure of a single upstream poll.
///
/// An unknown repository and a rejected credential produce the same
/// "not found"-class status upstream, so both surface as [`PollError::Status`].
#[derive(Debug, Error)]
pub enum PollError {
    /// The API endpoint and repository did not form a request URL.
    /// Produced by the pollers before any request is sent.
    #[error("failed to make the request URL: {0}")]
    InvalidUrl(String),

    /// The request did not complete: connection, TLS or timeout failure, or
    /// the body could not be read.
    #[error("failed to get current commit: {0}")]
    Transport(String),

    /// The API answered with a status of 400 or above.
    #[error("server error: {status}")]
    Status { status: u16 },

    /// The body was not the expected JSON shape, or lacked the commit id.
    #[error("failed to decode response body: {0}")]
    Decode(String),
}

/// Failure to turn a secret reference into a token.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No secret with that name exists in the record's namespace.
    #[error("error getting secret {namespace}/{name}: not found")]
    NotFound { namespace: Namespace, name: SecretName },

    /// The secret exists but holds no entry under the requested key.
    #[error("secret invalid, no {key:?} key in {namespace}/{name}")]
    MissingKey {
        namespace: Namespace,
        name: SecretName,
        key: String,
    },

    /// The secret exists but could not be read, e.g. a permission failure on
    /// the mounted file.
    #[error("error reading secret {namespace}/{name}: {message}")]
    Unreadable {
        namespace: Namespace,
        name: SecretName,
        message: String,
    },
}

/// Failure to deliver a commit notification.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The record's endpoint is not an absolute `http`/`https` URL. No
    /// attempt is made.
    #[error("invalid notification endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// The commit payload could not be serialised as the event body.
    #[error("failed to encode event: {0}")]
    Encode(String),

    /// No attempt was acknowledged. Either a non-retryable answer came back,
    /// the attempts ran out, or the delivery deadline passed.
    #[error("delivery to {endpoint} failed after {attempts} attempt(s): {message}")]
    Delivery {
        endpoint: String,
        attempts: u32,
        message: String,
    },
}

/// Failure of the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record was deleted between load and write.
    #[error("record {0} not found")]
    NotFound(RecordKey),

    /// The snapshot file could not be read, decoded or written. A failed
    /// status write leaves the stored status unchanged.
    #[error("failed to persist records: {0}")]
    Persistence(String),
}

// ---------------------------------------------------------------------------
// Cycle errors
// ---------------------------------------------------------------------------

/// Why a reconcile cycle did not complete.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The declared URL could not be turned into an API endpoint and repository.
    #[error("failed to parse repo from URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// No poller exists for the declared upstream kind.
    #[error("unsupported repository type {:?}", .0.as_str())]
    UnsupportedKind(UpstreamKind),

    /// Produced by [`crate::CredentialResolver`] implementations.
    #[error("failed to get auth token: {0}")]
    Credential(#[from] CredentialError),

    /// Produced by [`crate::CommitPoller`] implementations.
    #[error("repository poll failed: {0}")]
    Poll(#[from] PollError),

    /// Produced by [`crate::EventDispatcher`] implementations.
    #[error("failed to dispatch commit: {0}")]
    Dispatch(#[from] DispatchError),

    /// Produced by [`crate::RecordStore`] implementations. Never itself
    /// recorded on the record.
    #[error("unable to update repository status: {0}")]
    Store(#[from] StoreError),

    /// The cycle ran past the reconcile deadline and was abandoned.
    #[error("reconcile did not finish within {}", crate::duration::format_duration(*.0))]
    DeadlineExceeded(Duration),

    /// The cycle observed cancellation and stopped without writing.
    #[error("reconcile cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// How the scheduler should follow up on this failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        if self.is_configuration_error() {
            RetryPolicy::NonRetryable
        } else {
            RetryPolicy::Retryable { after: None }
        }
    }

    /// Returns `true` for errors caused by the desired state itself.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::InvalidUrl { .. } | Self::UnsupportedKind(_))
    }
}

/// A desired-state record that fails admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository {key}: {field}: {reason}")]
pub struct ValidationError {
    pub key: RecordKey,
    pub field: &'static str,
    pub reason: String,
}
