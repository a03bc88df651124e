//! HTTP delivery of [`CommitEvent`]s with exponential backoff.

use async_trait::async_trait;
use polling::duration::format_duration;
use polling::{Commit, DispatchError, EventDispatcher, PolledRepository};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{CommitEvent, DeliveryPolicy, DispatchConfig};

/// Why one delivery attempt was not acknowledged.
#[derive(Debug, Error)]
enum AttemptError {
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("endpoint answered {0}")]
    Rejected(StatusCode),
}

impl AttemptError {
    /// Transport failures, timeouts, throttling and server errors may clear
    /// up; any other answer will not.
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected(status) => {
                *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || status.is_server_error()
            }
        }
    }
}

/// Delivers commits to each record's endpoint as binary-mode CloudEvents.
#[derive(Debug, Clone)]
pub struct CloudEventDispatcher {
    client: Client,
    policy: DeliveryPolicy,
}

impl CloudEventDispatcher {
    /// Builds a dispatcher whose client opens a fresh connection per attempt.
    pub fn new(config: &DispatchConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(client, config.policy()))
    }

    pub fn with_client(client: Client, policy: DeliveryPolicy) -> Self {
        Self { client, policy }
    }

    async fn attempt(&self, target: &Url, event: &CommitEvent) -> Result<(), AttemptError> {
        let mut request = self.client.post(target.clone()).body(event.data.clone());
        for (name, value) in event.headers() {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(AttemptError::Transport)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AttemptError::Rejected(status))
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, DispatchError> {
    let invalid = |reason: String| DispatchError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let url = Url::parse(endpoint).map_err(|err| invalid(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme {other:?}"))),
    }
}

#[async_trait]
impl EventDispatcher for CloudEventDispatcher {
    #[instrument(skip_all, fields(endpoint = %record.spec.endpoint))]
    async fn dispatch(&self, record: &PolledRepository, commit: &Commit) -> Result<(), DispatchError> {
        let target = parse_endpoint(&record.spec.endpoint)?;
        let event = CommitEvent::new(record, commit)?;
        let attempts = self.policy.attempts();

        info!(event_id = %event.id, subject = %event.subject, "dispatching commit");

        let deadline = Instant::now() + self.policy.deadline;
        let gave_up = |attempts: u32, message: String| DispatchError::Delivery {
            endpoint: record.spec.endpoint.clone(),
            attempts,
            message,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout_at(deadline, self.attempt(&target, &event)).await {
                Ok(Ok(())) => {
                    debug!(event_id = %event.id, attempt, "event acknowledged");
                    return Ok(());
                }
                Ok(Err(err)) => err,
                Err(_) => {
                    return Err(gave_up(
                        attempt,
                        format!("no acknowledgement within {}", format_duration(self.policy.deadline)),
                    ));
                }
            };

            if !err.is_transient() || attempt >= attempts {
                return Err(gave_up(attempt, err.to_string()));
            }

            let delay = self.policy.delay_for_attempt(attempt - 1);
            if Instant::now() + delay >= deadline {
                return Err(gave_up(
                    attempt,
                    format!("{err}; retry would pass the {} delivery deadline", format_duration(self.policy.deadline)),
                ));
            }
            warn!(event_id = %event.id, attempt, error = %err, ?delay, "delivery failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
