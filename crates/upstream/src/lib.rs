//! gitpoller upstream adapters.
//!
//! Implements [`polling::CommitPoller`] and [`polling::PollerSelector`] over
//! the GitHub and GitLab REST APIs. Every query is a conditional `GET` that
//! replays the previous ETag as `If-None-Match`, so an unchanged ref costs a
//! `304 Not Modified` and no body.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain reconciliation rules.
//! URL layout, credential headers and response decoding live here; the
//! [`polling`] crate never sees them.
//!
//! ## Status Mapping
//!
//! | Upstream answer | Result |
//! |-----------------|--------|
//! | `304` | previous state, no commit |
//! | `2xx` | new state with the response `ETag`, commit payload |
//! | `>= 400` | `PollError::Status` (`"server error: {status}"`) |

mod conditional;
mod github;
mod gitlab;
mod selector;

#[cfg(test)]
mod test_support;

pub use github::{GitHubPoller, GITHUB_ACCEPT};
pub use gitlab::{GitLabPoller, GITLAB_ACCEPT, GITLAB_DEFAULT_ENDPOINT};
pub use selector::{HttpPollerSelector, TransportConfig, UpstreamPoller};
