//! gitpoller orchestration.
//!
//! Owns the records and decides *when* each one is reconciled; the
//! [`polling::Reconciler`] decides *what* a cycle does.
//!
//! ## Architectural Layer
//!
//! **Orchestration.** Depends on the [`polling`] ports only. The concrete
//! upstream, credential and dispatch adapters are wired in by the binary.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`store`] | `MemoryStore`, change events and the status snapshot file |
//! | [`scheduler`] | `Controller`: one worker per record, bounded concurrency |
//! | [`config`] | `ControllerConfig` |

pub mod config;
pub mod scheduler;
pub mod store;

pub use config::ControllerConfig;
pub use scheduler::Controller;
pub use store::{load_snapshot, MemoryStore, StoreEvent};
