//! Durable FIFO queue of pending remote mutations.
//!
//! The outbox is backed by its own box (`__outbox`), so entries survive a
//! crash the same way any other record does. Keys are zero-padded sequence
//! numbers, which makes index order enqueue order.
//!
//! A flush pass walks Pending entries strictly in sequence. A transient
//! failure halts the pass, because submitting a later entry while an earlier
//! one retries would reorder mutations at the remote. Permanent failures and
//! retry exhaustion dead-letter the entry instead: it stays visible in
//! Failed state and is excluded from flushes until explicitly requeued,
//! never silently dropped.

use crate::{
    boxes::{BoxHandle, BoxStore},
    codec::{FieldKind, FieldLayout, TypeLayout},
    connectivity::{Connectivity, Link},
    error::Result,
    remote::{Action, RemoteError, RemoteSource},
    unix_millis, Error, Seq, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Name of the box backing the outbox.
pub const OUTBOX_BOX: &str = "__outbox";

/// Type id of outbox entries within that box.
pub const OUTBOX_ENTRY_TYPE: &str = "__outbox.entry";

fn entry_layout() -> TypeLayout {
    TypeLayout::new(
        OUTBOX_ENTRY_TYPE,
        vec![
            FieldLayout::required("seq", FieldKind::Int),
            FieldLayout::required("action", FieldKind::Json),
            FieldLayout::required("attemptCount", FieldKind::Int),
            FieldLayout::required("nextRetryAt", FieldKind::Int),
            FieldLayout::required("status", FieldKind::String),
        ],
    )
}

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Waiting for submission (possibly in backoff)
    Pending,
    /// Dead-lettered: permanent failure or retries exhausted
    Failed,
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Monotonic sequence number; enqueue order
    pub seq: Seq,
    /// The mutation to submit
    pub action: Action,
    /// Submissions attempted so far
    pub attempt_count: u32,
    /// Earliest time the next attempt may run (ms since epoch)
    pub next_retry_at: Timestamp,
    /// Pending or dead-lettered
    pub status: EntryStatus,
}

/// Whether same-resource entries coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SquashPolicy {
    /// Every mutation is replayed independently, in order (default)
    #[default]
    None,
    /// Enqueueing replaces the payload of an existing Pending entry for the
    /// same resource, keeping its position in the queue
    LastWriteWins,
}

/// Outbox tuning.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// First retry delay
    pub base_delay: Duration,
    /// Retry delay ceiling
    pub max_delay: Duration,
    /// Attempts before an entry dead-letters
    pub max_attempts: u32,
    /// Same-resource coalescing policy
    pub squash: SquashPolicy,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            squash: SquashPolicy::None,
        }
    }
}

/// Exponential backoff with a ceiling: `min(base * 2^prev_attempts, max)`.
pub(crate) fn backoff_delay(config: &OutboxConfig, prev_attempts: u32) -> Duration {
    let base_ms = config.base_delay.as_millis() as u64;
    let factor = 1u64 << prev_attempts.min(63);
    let delay_ms = base_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(config.max_delay.as_millis() as u64))
}

/// What one flush call did.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// The pass ran to its natural end
    Completed(FlushReport),
    /// Another flush held the queue; nothing was done
    AlreadyRunning,
}

/// Per-pass accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Entries acknowledged and removed
    pub submitted: Vec<Seq>,
    /// Entries dead-lettered by a permanent failure, with the error
    pub rejected: Vec<(Seq, RemoteError)>,
    /// Entries dead-lettered by retry exhaustion
    pub dead_lettered: Vec<Seq>,
    /// The entry the pass halted on, and when it becomes due
    pub backed_off: Option<(Seq, Timestamp)>,
}

/// Where [`Outbox::submit_or_enqueue`] put the mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitDisposition {
    /// Submitted directly and acknowledged
    Delivered,
    /// Queued for a later flush
    Enqueued(Seq),
}

/// Durable retrying mutation queue.
pub struct Outbox {
    queue: BoxHandle,
    remote: Arc<dyn RemoteSource>,
    connectivity: Arc<dyn Connectivity>,
    config: OutboxConfig,
    next_seq: AtomicU64,
    /// Mutual exclusion for flush passes; released on every exit path by
    /// guard drop, including cancellation
    flush_gate: Mutex<()>,
}

impl Outbox {
    /// Open the outbox over a store, registering its entry codec and
    /// replaying any persisted queue.
    pub fn open(
        store: &BoxStore,
        remote: Arc<dyn RemoteSource>,
        connectivity: Arc<dyn Connectivity>,
        config: OutboxConfig,
    ) -> Result<Self> {
        store.registry().register(entry_layout())?;
        let queue = store.open(OUTBOX_BOX)?;

        let next_seq = queue
            .keys()?
            .iter()
            .filter_map(|key| key.parse::<Seq>().ok())
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);

        Ok(Self {
            queue,
            remote,
            connectivity,
            config,
            next_seq: AtomicU64::new(next_seq),
            flush_gate: Mutex::new(()),
        })
    }

    fn entry_key(seq: Seq) -> String {
        format!("{seq:020}")
    }

    fn put_entry(&self, entry: &OutboxEntry) -> Result<()> {
        let value =
            serde_json::to_value(entry).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        self.queue
            .put(&Self::entry_key(entry.seq), OUTBOX_ENTRY_TYPE, &value)
    }

    fn read_entry(&self, seq: Seq) -> Result<Option<OutboxEntry>> {
        let Some(value) = self.queue.get(&Self::entry_key(seq))? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::Decode {
                type_id: OUTBOX_ENTRY_TYPE.to_string(),
                reason: e.to_string(),
            })
    }

    /// All entries, in sequence order.
    pub fn entries(&self) -> Result<Vec<OutboxEntry>> {
        let mut entries = Vec::new();
        for key in self.queue.keys()? {
            if let Some(value) = self.queue.get(&key)? {
                let entry: OutboxEntry = serde_json::from_value(value).map_err(|e| {
                    Error::Decode {
                        type_id: OUTBOX_ENTRY_TYPE.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Number of Pending entries.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self
            .entries()?
            .iter()
            .filter(|e| e.status == EntryStatus::Pending)
            .count())
    }

    /// The newest entry targeting a resource, if any.
    pub fn status(&self, resource: &str) -> Result<Option<OutboxEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.action.resource == resource)
            .last())
    }

    /// Append a mutation to the queue, durably.
    ///
    /// Safe to call while a flush is in progress; the entry is picked up on
    /// the next pass.
    pub fn enqueue(&self, action: Action) -> Result<Seq> {
        if self.config.squash == SquashPolicy::LastWriteWins {
            let existing = self
                .entries()?
                .into_iter()
                .filter(|e| {
                    e.status == EntryStatus::Pending && e.action.resource == action.resource
                })
                .last();
            if let Some(mut entry) = existing {
                tracing::debug!(seq = entry.seq, resource = %action.resource, "squashing entry");
                entry.action = action;
                entry.attempt_count = 0;
                entry.next_retry_at = 0;
                self.put_entry(&entry)?;
                return Ok(entry.seq);
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = OutboxEntry {
            seq,
            action,
            attempt_count: 0,
            next_retry_at: 0,
            status: EntryStatus::Pending,
        };
        self.put_entry(&entry)?;
        tracing::debug!(seq, resource = %entry.action.resource, "enqueued");
        Ok(seq)
    }

    /// Submit directly when that cannot reorder the queue, otherwise
    /// enqueue.
    ///
    /// Offline, or with Pending entries ahead, the mutation is queued. A
    /// transient direct failure also queues it; a permanent one is surfaced
    /// to the caller without queueing.
    pub async fn submit_or_enqueue(&self, action: Action) -> Result<SubmitDisposition> {
        let queue_busy = self.pending_count()? > 0;
        if self.connectivity.current() == Link::Offline || queue_busy {
            return Ok(SubmitDisposition::Enqueued(self.enqueue(action)?));
        }

        match self.remote.submit(&action).await {
            Ok(()) => Ok(SubmitDisposition::Delivered),
            Err(err) if err.is_transient() => {
                tracing::debug!(%err, "direct submit failed, queueing");
                Ok(SubmitDisposition::Enqueued(self.enqueue(action)?))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run one flush pass now.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        self.flush_at(unix_millis()).await
    }

    /// Run one flush pass against an explicit clock reading.
    ///
    /// Only one pass runs at a time; a concurrent call returns
    /// [`FlushOutcome::AlreadyRunning`] without touching the queue.
    pub async fn flush_at(&self, now: Timestamp) -> Result<FlushOutcome> {
        let _guard = match self.flush_gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(FlushOutcome::AlreadyRunning),
        };

        let mut report = FlushReport::default();

        for mut entry in self.entries()? {
            if entry.status == EntryStatus::Failed {
                continue;
            }
            if entry.next_retry_at > now {
                // An earlier entry is still backing off; anything behind it
                // must wait or the remote would see mutations out of order
                report.backed_off = Some((entry.seq, entry.next_retry_at));
                break;
            }

            let result = self.remote.submit(&entry.action).await;

            // A squash may have replaced the payload while the submit was in
            // flight. The stored mutation was never sent, so it must not be
            // deleted or overwritten with stale attempt state; keep it for
            // the next pass and halt so nothing behind it overtakes it.
            if let Some(current) = self.read_entry(entry.seq)? {
                if current.action != entry.action {
                    tracing::debug!(seq = entry.seq, "entry replaced during submit, keeping");
                    report.backed_off = Some((entry.seq, current.next_retry_at));
                    break;
                }
            }

            match result {
                Ok(()) => {
                    self.queue.delete(&Self::entry_key(entry.seq))?;
                    tracing::debug!(seq = entry.seq, "submitted");
                    report.submitted.push(entry.seq);
                }
                Err(err) if err.is_transient() => {
                    entry.attempt_count += 1;
                    if entry.attempt_count >= self.config.max_attempts {
                        entry.status = EntryStatus::Failed;
                        self.put_entry(&entry)?;
                        tracing::warn!(
                            seq = entry.seq,
                            attempts = entry.attempt_count,
                            "retries exhausted, dead-lettering"
                        );
                        report.dead_lettered.push(entry.seq);
                        continue;
                    }

                    let delay = backoff_delay(&self.config, entry.attempt_count - 1);
                    entry.next_retry_at = now + delay.as_millis() as u64;
                    self.put_entry(&entry)?;
                    tracing::warn!(
                        seq = entry.seq,
                        attempts = entry.attempt_count,
                        retry_in_ms = delay.as_millis() as u64,
                        %err,
                        "transient failure, backing off"
                    );
                    report.backed_off = Some((entry.seq, entry.next_retry_at));
                    break;
                }
                Err(err) => {
                    entry.attempt_count += 1;
                    entry.status = EntryStatus::Failed;
                    self.put_entry(&entry)?;
                    tracing::warn!(seq = entry.seq, %err, "permanent failure, dead-lettering");
                    report.rejected.push((entry.seq, err));
                }
            }
        }

        Ok(FlushOutcome::Completed(report))
    }

    /// Return a dead-lettered entry to the queue.
    pub fn requeue(&self, seq: Seq) -> Result<()> {
        let mut entry = self
            .read_entry(seq)?
            .ok_or(Error::UnknownOutboxEntry(seq))?;

        entry.status = EntryStatus::Pending;
        entry.attempt_count = 0;
        entry.next_retry_at = 0;
        self.put_entry(&entry)?;
        tracing::info!(seq, "requeued");
        Ok(())
    }

    /// Spawn a background task flushing whenever the link comes back up.
    pub fn spawn_flush_on_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
        let outbox = self.clone();
        let mut changes = self.connectivity.changes();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(Link::Online) => {
                        if let Err(err) = outbox.flush().await {
                            tracing::warn!(%err, "reconnect flush failed");
                        }
                    }
                    Ok(Link::Offline) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Spawn a background task flushing on a fixed interval.
    pub fn spawn_periodic_flush(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let outbox = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = outbox.flush().await {
                    tracing::warn!(%err, "periodic flush failed");
                }
            }
        })
    }
}
