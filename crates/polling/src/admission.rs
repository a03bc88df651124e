//! Admission rules for desired-state records.
//!
//! The store accepts any record; loaders call [`validate`] before applying
//! declarations so that obviously broken records never reach the reconciler.

use crate::{RecordKey, RepositoryLocation, ValidationError, WatchedRepository};

/// Checks `spec` against the record schema.
///
/// Returns the first violation found.
pub fn validate(key: &RecordKey, spec: &WatchedRepository) -> Result<(), ValidationError> {
    let fail = |field: &'static str, reason: &str| ValidationError {
        key: key.clone(),
        field,
        reason: reason.to_string(),
    };

    if !spec.url.starts_with("https://") {
        return Err(fail("url", "must start with https://"));
    }
    if let Err(err) = RepositoryLocation::from_url(&spec.url, &spec.kind) {
        return Err(fail("url", &err.to_string()));
    }
    if spec.git_ref.trim().is_empty() {
        return Err(fail("ref", "is required"));
    }
    if !spec.kind.is_supported() {
        return Err(fail("type", &format!("{:?} is not one of github, gitlab", spec.kind.as_str())));
    }
    if spec.frequency.is_zero() {
        return Err(fail("frequency", "must be a positive duration"));
    }
    if !(spec.endpoint.starts_with("http://") || spec.endpoint.starts_with("https://")) {
        return Err(fail("endpoint", "must start with http:// or https://"));
    }

    Ok(())
}
