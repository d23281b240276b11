//! Reconciliation between the task store and the planning database.
//!
//! Two independent activities share one rate-limited client: a push loop
//! that writes authoritative status outward every cycle, and a webhook
//! processor that ingests planning-side changes with replay protection.
//! When the two disagree, the task store wins; a manual planning-side
//! status edit survives at most one push cycle.

mod ingest;
mod push;

pub use ingest::{IngestOutcome, PagePatch, WebhookProcessor};
pub use push::{page_properties, PushLoop};
