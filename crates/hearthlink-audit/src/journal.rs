//! Month-partitioned JSONL audit log

use crate::error::{AuditError, AuditResult};
use chrono::{DateTime, Local, TimeZone, Utc};
use hearthlink_core::protocol::{AuditEntry, AuditQuery};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Entries returned by a query without an explicit limit
pub const DEFAULT_QUERY_LIMIT: usize = 50;

/// How often the background prune runs
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const DAY_MS: i64 = 86_400_000;
const PREFIX: &str = "audit-";
const SUFFIX: &str = ".jsonl";

/// `YYYY-MM` of the local calendar month containing `ts` (epoch milliseconds)
pub fn month_key(ts: i64) -> Option<String> {
    let local = Local
        .timestamp_millis_opt(ts)
        .earliest()
        .or_else(|| DateTime::<Utc>::from_timestamp_millis(ts).map(|utc| utc.with_timezone(&Local)))?;
    Some(local.format("%Y-%m").to_string())
}

/// Append-only audit log rooted at a directory
pub struct AuditLog {
    dir: PathBuf,
    retention_months: u32,
    writer: tokio::sync::Mutex<()>,
    prune_task: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    /// Open the log, creating `dir` and pruning old partitions
    pub fn open(dir: impl Into<PathBuf>, retention_months: u32) -> AuditResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let log = Self {
            dir,
            retention_months,
            writer: tokio::sync::Mutex::new(()),
            prune_task: Mutex::new(None),
        };
        log.prune();
        info!("Audit log at {:?} (retention {} months)", log.dir, retention_months);
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one entry to its month's partition and flush it
    ///
    /// Appends are serialized so concurrent lines never interleave.
    pub async fn append(&self, entry: &AuditEntry) -> AuditResult<()> {
        let key = month_key(entry.ts).ok_or(AuditError::InvalidTimestamp(entry.ts))?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.writer.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.partition_path(&key))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Matching entries, newest first
    ///
    /// Partitions are read newest to oldest and each one from its last line
    /// back. Unreadable partitions and malformed lines are skipped.
    pub async fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let mut results = Vec::new();

        for name in self.partitions().iter().rev() {
            if results.len() >= limit {
                break;
            }

            let contents = match tokio::fs::read_to_string(self.dir.join(name)).await {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("Skipping unreadable audit partition {}: {}", name, e);
                    continue;
                }
            };

            for line in contents.lines().rev() {
                if results.len() >= limit {
                    break;
                }
                if line.trim().is_empty() {
                    continue;
                }
                let entry: AuditEntry = match serde_json::from_str(line) {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Skipping malformed audit line in {}: {}", name, e);
                        continue;
                    }
                };
                if matches(query, &entry) {
                    results.push(entry);
                }
            }
        }

        results
    }

    /// Delete partitions older than the retention window; returns how many
    pub fn prune(&self) -> usize {
        self.prune_at(Utc::now().timestamp_millis())
    }

    /// [`prune`](Self::prune) as of `now` (epoch milliseconds)
    pub fn prune_at(&self, now: i64) -> usize {
        let window = i64::from(self.retention_months) * 30 * DAY_MS;
        let Some(cutoff) = month_key(now.saturating_sub(window)) else {
            return 0;
        };

        let mut removed = 0;
        for name in self.partitions() {
            let key = &name[PREFIX.len()..name.len() - SUFFIX.len()];
            if key >= cutoff.as_str() {
                continue;
            }
            match std::fs::remove_file(self.dir.join(&name)) {
                Ok(()) => {
                    info!("Pruned audit partition {}", name);
                    removed += 1;
                }
                Err(e) => debug!("Could not prune {}: {}", name, e),
            }
        }
        removed
    }

    /// Prune every [`PRUNE_INTERVAL`] in the background
    ///
    /// The task only holds a weak reference and ends once the log is dropped.
    pub fn schedule_pruning(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            // First tick completes immediately; open() already pruned
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(log) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = tokio::task::spawn_blocking(move || log.prune()).await {
                    warn!("Audit prune task failed: {}", e);
                }
            }
        });

        let mut task = self.prune_task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.prune_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop background pruning; safe to call more than once
    pub fn close(&self) {
        let mut task = self.prune_task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.take() {
            handle.abort();
            debug!("Audit prune schedule cancelled");
        }
    }

    fn partition_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{PREFIX}{key}{SUFFIX}"))
    }

    /// Partition file names, oldest first
    fn partitions(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with(PREFIX) && name.ends_with(SUFFIX))
            .filter(|name| name.len() > PREFIX.len() + SUFFIX.len())
            .collect();
        names.sort();
        names
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        self.close();
    }
}

fn matches(query: &AuditQuery, entry: &AuditEntry) -> bool {
    if let Some(id) = query.identity_filter.as_deref() {
        if entry.user_id != id {
            return false;
        }
    }
    if query.since.is_some_and(|since| entry.ts < since) {
        return false;
    }
    if query.until.is_some_and(|until| entry.ts > until) {
        return false;
    }
    true
}
