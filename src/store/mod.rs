//! Durable issue store: one JSON document, one writer.

mod handle;
mod record;

pub use handle::{IssueStore, StoreHandle};
pub use record::{
    AcceptanceSummary, IssueRecord, IssueStatus, PhaseRecord, PrRef, StoreDocument, derive_status,
};
