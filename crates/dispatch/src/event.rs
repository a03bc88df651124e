//! CloudEvents 1.0 envelope for a commit, in HTTP binary content mode.

use chrono::{DateTime, SecondsFormat, Utc};
use polling::{Commit, DispatchError, PolledRepository};
use uuid::Uuid;

pub const SPEC_VERSION: &str = "1.0";
pub const COMMIT_EVENT_TYPE: &str = "commit";
const CONTENT_TYPE: &str = "application/json";

/// Subject identifying the record that produced an event.
pub fn subject_for(record: &PolledRepository) -> String {
    format!(
        "/apis/polling.gitops.tools/v1alpha1/namespaces/{}/PolledRepository/{}",
        record.key.namespace, record.key.name
    )
}

/// One commit notification. Attributes travel as `ce-*` headers; the commit
/// JSON is the body.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub id: Uuid,
    pub subject: String,
    pub source: String,
    pub time: DateTime<Utc>,
    pub data: Vec<u8>,
}

impl CommitEvent {
    pub fn new(record: &PolledRepository, commit: &Commit) -> Result<Self, DispatchError> {
        let data = serde_json::to_vec(commit).map_err(|err| DispatchError::Encode(err.to_string()))?;
        Ok(Self {
            id: Uuid::new_v4(),
            subject: subject_for(record),
            source: record.spec.url.clone(),
            time: Utc::now(),
            data,
        })
    }

    /// Header name/value pairs for binary content mode.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ce-specversion", SPEC_VERSION.to_string()),
            ("ce-id", self.id.to_string()),
            ("ce-subject", self.subject.clone()),
            ("ce-source", self.source.clone()),
            ("ce-type", COMMIT_EVENT_TYPE.to_string()),
            ("ce-time", self.time.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ("content-type", CONTENT_TYPE.to_string()),
        ]
    }
}
