//! Hearthlink Audit
//!
//! Append-only record of audited chat traffic. Entries are JSON lines grouped
//! into one file per local calendar month (`audit-YYYY-MM.jsonl`); files
//! older than the retention window are deleted by a background prune.

mod error;
mod journal;

pub use error::{AuditError, AuditResult};
pub use journal::{month_key, AuditLog, DEFAULT_QUERY_LIMIT, PRUNE_INTERVAL};
