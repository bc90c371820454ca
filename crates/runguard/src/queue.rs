//! Durable mutation queue: an in-memory write-ahead buffer of pending state
//! writes.
//!
//! Every state mutation is buffered here before it is applied to the real
//! backing store, so that after a crash the unacknowledged writes can be
//! replayed. The queue is best-effort, not a guaranteed-delivery log:
//!
//! - Under the default [`OverflowPolicy::EvictOldest`], exceeding `max_size`
//!   silently drops the oldest entry. [`OverflowPolicy::Reject`] turns the
//!   queue into a bounded buffer that refuses new writes instead.
//! - [`MutationQueue::flush`] drains a point-in-time snapshot through a
//!   caller-supplied [`Drain`]. Failures bump the entry's retry count; an
//!   entry that reaches `max_retries` is removed and reported in
//!   [`FlushReport::errors`]. Nothing is ever thrown to the caller.
//!
//! Overlapping flushes (auto-flush timer plus a manual flush) may both drain
//! the same still-pending entry, so drains must be idempotent.

use crate::error::{GovernError, GovernResult};
use crate::ids::{next_entry_id, now_millis};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Process-unique id assigned by [`MutationQueue::enqueue`].
pub type EntryId = u64;

// ── Config ─────────────────────────────────────────────────────────

/// What happens when an enqueue would grow the queue past `max_size`.
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Accept the write and silently drop the oldest entry.
    #[default]
    EvictOldest,
    /// Refuse the write with [`GovernError::QueueFull`].
    Reject,
}

/// Configuration for a [`MutationQueue`].
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of buffered entries. Default: 1000.
    pub max_size: usize,
    /// Failed drain attempts before an entry is dropped. Default: 3.
    pub max_retries: u32,
    /// Auto-flush period in milliseconds. Default: 5000.
    pub flush_interval_ms: u64,
    /// Behaviour at capacity. Default: evict oldest.
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_retries: 3,
            flush_interval_ms: 5000,
            overflow: OverflowPolicy::EvictOldest,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

// ── Entries and reports ────────────────────────────────────────────

/// A buffered state write. Invariant: while queued, `retry_count < max_retries`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: EntryId,
    pub session_id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub timestamp_ms: i64,
    pub retry_count: u32,
}

/// An entry that exhausted its retries during a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushFailure {
    /// The entry as it was removed (with its final retry count).
    pub entry: QueueEntry,
    /// Error message from the last drain attempt.
    pub error: String,
}

/// Outcome of one [`MutationQueue::flush`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Entries drained and removed in this pass.
    pub succeeded: usize,
    /// Drain attempts that failed in this pass (retried or exhausted).
    pub failed: usize,
    /// Entries removed in this pass because they exhausted their retries.
    pub errors: Vec<FlushFailure>,
}

impl FlushReport {
    /// Ids of the mutations that were dropped after exhausting retries.
    pub fn failed_ids(&self) -> Vec<EntryId> {
        self.errors.iter().map(|f| f.entry.id).collect()
    }
}

// ── Drain contract ─────────────────────────────────────────────────

/// Boxed future returned by [`Drain::drain`].
pub type DrainFuture<'a> = BoxFuture<'a, Result<(), String>>;

/// Applies one buffered mutation to the real backing store.
///
/// Supplied by the durable-storage collaborator. Must be idempotent: two
/// overlapping flushes can hand it the same entry.
pub trait Drain: Send + Sync {
    fn drain<'a>(&'a self, entry: &'a QueueEntry) -> DrainFuture<'a>;
}

/// A [`Drain`] backed by an async closure.
///
/// ```ignore
/// let drain = FnDrain::new(|entry: QueueEntry| async move {
///     db.put(&entry.key, &entry.value).await.map_err(|e| e.to_string())
/// });
/// ```
pub struct FnDrain<F>(F);

impl<F, Fut> FnDrain<F>
where
    F: Fn(QueueEntry) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> Drain for FnDrain<F>
where
    F: Fn(QueueEntry) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn drain<'a>(&'a self, entry: &'a QueueEntry) -> DrainFuture<'a> {
        Box::pin((self.0)(entry.clone()))
    }
}

// ── MutationQueue ──────────────────────────────────────────────────

struct Inner {
    config: QueueConfig,
    /// Keyed by id, iterated in insertion order.
    entries: Mutex<IndexMap<EntryId, QueueEntry>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let timer = self.timer.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }
}

/// Write-ahead buffer of pending state mutations.
///
/// Cheap to clone: clones share the same buffer. All methods except
/// [`flush`](Self::flush) are synchronous and stay usable while a drain is
/// suspended.
#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<Inner>,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("size", &self.size())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl MutationQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(IndexMap::new()),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    fn entries(&self) -> MutexGuard<'_, IndexMap<EntryId, QueueEntry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Buffer a mutation and return its id.
    ///
    /// Never fails under [`OverflowPolicy::EvictOldest`]: if the queue grows
    /// past `max_size` the oldest entry is dropped without any signal.
    pub fn enqueue(
        &self,
        session_id: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> GovernResult<EntryId> {
        let max_size = self.inner.config.max_size;
        let mut entries = self.entries();

        if self.inner.config.overflow == OverflowPolicy::Reject && entries.len() >= max_size {
            return Err(GovernError::QueueFull { capacity: max_size });
        }

        let entry = QueueEntry {
            id: next_entry_id(),
            session_id: session_id.into(),
            key: key.into(),
            value,
            timestamp_ms: now_millis(),
            retry_count: 0,
        };
        let id = entry.id;
        debug!(id, session = %entry.session_id, key = %entry.key, "Mutation enqueued");
        entries.insert(id, entry);

        if entries.len() > max_size
            && let Some((evicted, entry)) = entries.shift_remove_index(0)
        {
            warn!(
                id = evicted,
                session = %entry.session_id,
                key = %entry.key,
                "Mutation queue over capacity; dropped oldest entry"
            );
        }

        Ok(id)
    }

    /// Remove an entry. No-op if it is already gone.
    pub fn ack(&self, id: EntryId) {
        if self.entries().shift_remove(&id).is_some() {
            debug!(id, "Mutation acknowledged");
        }
    }

    /// Snapshot of all pending entries in insertion order.
    pub fn pending(&self) -> Vec<QueueEntry> {
        self.entries().values().cloned().collect()
    }

    /// Snapshot of the pending entries for one session, in insertion order.
    pub fn pending_for_session(&self, session_id: &str) -> Vec<QueueEntry> {
        self.entries()
            .values()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn size(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drop every pending entry.
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Drain a snapshot of the current entries.
    ///
    /// Entries enqueued while this pass runs are left for the next pass.
    /// Drain failures are recorded, never propagated.
    pub async fn flush(&self, drain: &dyn Drain) -> FlushReport {
        let snapshot = self.pending();
        let mut report = FlushReport::default();

        for entry in snapshot {
            match drain.drain(&entry).await {
                Ok(()) => {
                    self.record_success(entry.id);
                    report.succeeded += 1;
                }
                Err(error) => {
                    report.failed += 1;
                    if let Some(failure) = self.record_failure(entry.id, error) {
                        report.errors.push(failure);
                    }
                }
            }
        }

        if report.succeeded > 0 || report.failed > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                exhausted = report.errors.len(),
                remaining = self.size(),
                "Mutation queue flushed"
            );
        }
        report
    }

    fn record_success(&self, id: EntryId) {
        self.entries().shift_remove(&id);
    }

    /// Bump the live entry's retry count, removing it once retries run out.
    /// Entries acknowledged or evicted while the drain was in flight are
    /// not reported.
    fn record_failure(&self, id: EntryId, error: String) -> Option<FlushFailure> {
        let max_retries = self.inner.config.max_retries;
        let mut entries = self.entries();
        let live = entries.get_mut(&id)?;
        live.retry_count += 1;

        if live.retry_count < max_retries {
            debug!(id, retry = live.retry_count, %error, "Drain failed; will retry");
            return None;
        }

        let entry = entries.shift_remove(&id)?;
        warn!(
            id,
            session = %entry.session_id,
            key = %entry.key,
            retries = entry.retry_count,
            %error,
            "Mutation dropped after exhausting retries"
        );
        Some(FlushFailure { entry, error })
    }

    // ── Auto-flush ─────────────────────────────────────────────────

    /// Flush periodically at the configured interval.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_auto_flush(&self, drain: Arc<dyn Drain>) {
        self.start_auto_flush_every(drain, self.inner.config.flush_interval());
    }

    /// Flush every `interval`, replacing any timer already running.
    ///
    /// Each tick with a non-empty queue spawns an independent flush and does
    /// not wait for it, so passes may overlap. The timer only holds a weak
    /// reference and exits once the last queue handle is dropped.
    /// A zero interval is raised to one millisecond.
    pub fn start_auto_flush_every(&self, drain: Arc<dyn Drain>, interval: Duration) {
        let interval = if interval.is_zero() {
            warn!("Auto-flush interval of zero raised to 1ms");
            Duration::from_millis(1)
        } else {
            interval
        };
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let queue = MutationQueue { inner };
                if queue.is_empty() {
                    continue;
                }
                let drain = Arc::clone(&drain);
                tokio::spawn(async move {
                    queue.flush(drain.as_ref()).await;
                });
            }
        });

        if let Some(previous) = self.timer().replace(handle) {
            previous.abort();
        }
        debug!(interval_ms = interval.as_millis() as u64, "Auto-flush started");
    }

    /// Cancel the auto-flush timer. An in-flight drain keeps running.
    pub fn stop_auto_flush(&self) {
        if let Some(handle) = self.timer().take() {
            handle.abort();
            debug!("Auto-flush stopped");
        }
    }

    pub fn is_auto_flushing(&self) -> bool {
        self.timer().as_ref().is_some_and(|h| !h.is_finished())
    }
}
