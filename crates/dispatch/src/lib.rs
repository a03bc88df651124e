//! gitpoller notification adapter.
//!
//! Implements [`polling::EventDispatcher`] by POSTing each detected commit to
//! the record's endpoint as a CloudEvents 1.0 event in HTTP binary content
//! mode: event attributes travel as `ce-*` headers and the raw commit JSON is
//! the body.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Delivery retries happen here, inside one dispatch call.
//! The reconciler only sees the final outcome.
//!
//! ## Retry Classification
//!
//! | Outcome | Action |
//! |---------|--------|
//! | `2xx` | acknowledged |
//! | transport error, `408`, `429`, `5xx` | retried with [`DeliveryPolicy`] backoff |
//! | any other status | fails immediately |

mod dispatcher;
mod event;
mod policy;

pub use dispatcher::CloudEventDispatcher;
pub use event::{subject_for, CommitEvent, COMMIT_EVENT_TYPE, SPEC_VERSION};
pub use policy::{DeliveryPolicy, DispatchConfig};
