//! Observed-state transitions.
//!
//! These functions decide what the reconciler writes; they perform no I/O.
//! A write is only proposed when the resulting status differs from the stored
//! one, so repeated cycles against an unmoved upstream converge to zero writes.

use crate::{PollStatus, PolledRepository, RepositoryStatus};

/// What a successful poll means for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The upstream tip has not moved.
    ///
    /// `write` carries a status to persist when only bookkeeping changed (a
    /// cleared error or a newer observed generation).
    Unchanged { write: Option<RepositoryStatus> },

    /// The polled state differs from the stored one and must be persisted.
    Changed { status: RepositoryStatus },
}

/// Compares a poll result against the stored status of `record`.
pub fn after_poll(record: &PolledRepository, polled: &PollStatus) -> Transition {
    let stored = &record.status;
    let next = RepositoryStatus {
        poll_status: polled.clone(),
        last_error: String::new(),
        observed_generation: record.generation,
    };

    if *polled != stored.poll_status {
        return Transition::Changed { status: next };
    }

    Transition::Unchanged {
        write: (next != *stored).then_some(next),
    }
}

/// The status to persist after a failed cycle, if it differs from the stored one.
///
/// The observed state is left untouched; only the error text and the observed
/// generation move.
pub fn after_failure(record: &PolledRepository, error: &str) -> Option<RepositoryStatus> {
    let next = RepositoryStatus {
        poll_status: record.status.poll_status.clone(),
        last_error: error.to_string(),
        observed_generation: record.generation,
    };
    (next != record.status).then_some(next)
}
