//! Conditional GET shared by every upstream dialect.

use polling::PollError;
use reqwest::header::{ACCEPT, ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use url::Url;

/// One "latest commit for ref" request.
pub(crate) struct ConditionalGet<'a> {
    pub url: Url,
    pub accept: &'static str,
    /// Header name and value; `None` sends no credential at all.
    pub credential: Option<(&'static str, String)>,
    /// Cache validator from the previous poll; empty sends no `If-None-Match`.
    pub etag: &'a str,
}

/// What the upstream answered.
pub(crate) enum Fetched {
    /// The cache validator still matches.
    NotModified,
    /// A fresh body and the validator that came with it.
    Body { bytes: Vec<u8>, etag: String },
}

impl ConditionalGet<'_> {
    pub(crate) async fn send(self, client: &Client) -> Result<Fetched, PollError> {
        info!(url = %self.url, "polling upstream repository");

        let mut request = client.get(self.url.clone()).header(ACCEPT, self.accept);
        if !self.etag.is_empty() {
            request = request.header(IF_NONE_MATCH, self.etag);
        }
        if let Some((name, value)) = self.credential {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|err| PollError::Transport(err.to_string()))?;

        let status = response.status();
        info!(status = status.as_u16(), "polled upstream repository");

        if status.as_u16() >= 400 {
            return Err(PollError::Status { status: status.as_u16() });
        }
        if status == StatusCode::NOT_MODIFIED {
            debug!("cache validator matched");
            return Ok(Fetched::NotModified);
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| PollError::Transport(err.to_string()))?;

        Ok(Fetched::Body { bytes: bytes.to_vec(), etag })
    }
}
