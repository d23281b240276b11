//! Durable state: tasks, channels, webhook-event log, and quota counters.
//!
//! Every write is a short transaction; nothing here is ever held open
//! across a tool invocation or a planning-API call. Cross-worker
//! coordination happens entirely through row locks taken inside the claim
//! transaction — the transaction is the lease.

mod claim;
mod error;
mod schema;
mod store;

pub use error::StoreError;
pub use store::{NewTask, TaskFilter, TaskStore};
