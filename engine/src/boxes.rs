//! Boxes: named durable key-value containers.
//!
//! A [`BoxStore`] owns a directory of segment files and the table of open
//! boxes. Opening the same box twice shares one underlying container via a
//! reference count; the container is physically released only when the last
//! holder calls [`BoxStore::close`]. Handles never close on drop, so a
//! consumer resuming after an interruption finds its storage where it left
//! it.
//!
//! Writes are write-before-acknowledge: `put` does not return until the
//! record is fsynced. Reads are served from the in-memory index and never
//! touch the network or block on other boxes.

use crate::{
    codec::CodecRegistry,
    error::Result,
    segment::{RecordOp, Segment, StoredRecord},
    BoxName, Error, Fingerprint, Key, TypeId,
};
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

/// Capacity of each box's change-notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Compact on open once dead bytes pass this floor and outweigh live bytes.
const COMPACT_DEAD_BYTES_FLOOR: u64 = 4096;

/// Why a change notification was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    /// A local `put`
    LocalWrite,
    /// A write-back from a completed remote fetch
    RemoteRefresh,
    /// A `delete`
    Delete,
    /// A `clear`
    Clear,
}

/// A change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Key that changed
    pub key: Key,
    /// New value, `None` for deletes and clears
    pub value: Option<Value>,
    /// What triggered the change
    pub cause: ChangeCause,
}

/// A subscription to a box's change notifications.
///
/// Subscriptions are independent: each receives every event from its
/// creation onward, optionally filtered to a single key. Dropping the
/// subscription (or calling [`unsubscribe`](Subscription::unsubscribe))
/// stops delivery; it cannot fail.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    key: Option<Key>,
}

impl Subscription {
    /// Receive the next matching event. `None` once the box is released.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => match &self.key {
                    Some(key) if &event.key != key => continue,
                    _ => return Some(event),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "subscription lagged, skipping events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving events. Always succeeds.
    pub fn unsubscribe(self) {}
}

/// One live index entry. Payload bytes are kept in memory so reads never
/// contend on the file; the offset is tracked for compaction accounting.
#[derive(Debug, Clone)]
struct IndexEntry {
    type_id: TypeId,
    fingerprint: Fingerprint,
    #[allow(dead_code)]
    offset: u64,
    len: u64,
    payload: Arc<Vec<u8>>,
}

#[derive(Debug)]
struct BoxInner {
    segment: Segment,
    index: HashMap<Key, IndexEntry>,
    /// Type ids whose stored fingerprint disagrees with the registry
    mismatched: HashSet<TypeId>,
    live_bytes: u64,
    dead_bytes: u64,
}

#[derive(Debug)]
struct SharedBox {
    name: BoxName,
    refs: AtomicUsize,
    inner: RwLock<BoxInner>,
    events: broadcast::Sender<ChangeEvent>,
}

impl SharedBox {
    fn read(&self) -> RwLockReadGuard<'_, BoxInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BoxInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Manager of named durable boxes.
pub struct BoxStore {
    root: PathBuf,
    registry: Arc<CodecRegistry>,
    boxes: DashMap<BoxName, Arc<SharedBox>>,
}

impl BoxStore {
    /// Create a store rooted at a directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>, registry: Arc<CodecRegistry>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            registry,
            boxes: DashMap::new(),
        })
    }

    /// The codec registry this store encodes through.
    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    /// Open a box, creating its segment on first open.
    ///
    /// Idempotent: repeated opens of the same name share one container and
    /// bump its reference count. Fingerprint compatibility is checked here,
    /// once per type, against the segment's stored table.
    pub fn open(&self, name: &str) -> Result<BoxHandle> {
        match self.boxes.entry(name.to_string()) {
            Entry::Occupied(occupied) => {
                let shared = occupied.get().clone();
                shared.refs.fetch_add(1, Ordering::SeqCst);
                Ok(BoxHandle {
                    shared,
                    registry: self.registry.clone(),
                })
            }
            Entry::Vacant(vacant) => {
                let shared = Arc::new(self.load_box(name)?);
                vacant.insert(shared.clone());
                Ok(BoxHandle {
                    shared,
                    registry: self.registry.clone(),
                })
            }
        }
    }

    /// Close one reference to a box.
    ///
    /// Physical release (index dropped, file closed) happens only when the
    /// last holder closes. Outstanding handles then observe
    /// [`Error::BoxNotOpen`].
    pub fn close(&self, name: &str) -> Result<()> {
        let shared = self
            .boxes
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::BoxNotOpen(name.to_string()))?;

        let prev = shared
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| {
                refs.checked_sub(1)
            })
            .map_err(|_| Error::BoxNotOpen(name.to_string()))?;

        if prev == 1 {
            self.boxes
                .remove_if(name, |_, shared| shared.refs.load(Ordering::SeqCst) == 0);
            tracing::debug!(box_name = name, "box released");
        }
        Ok(())
    }

    /// Destroy a box's backing segment. Explicit recovery path only.
    ///
    /// Any outstanding handles observe [`Error::BoxNotOpen`] afterwards;
    /// the next [`open`](BoxStore::open) starts from an empty segment.
    pub fn wipe(&self, name: &str) -> Result<()> {
        if let Some((_, shared)) = self.boxes.remove(name) {
            shared.refs.store(0, Ordering::SeqCst);
        }
        match std::fs::remove_file(self.segment_path(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(box_name = name, "box wiped");
        Ok(())
    }

    /// Whether a box is currently open.
    pub fn is_open(&self, name: &str) -> bool {
        self.boxes.contains_key(name)
    }

    /// Current reference count of a box (0 when closed).
    pub fn ref_count(&self, name: &str) -> usize {
        self.boxes
            .get(name)
            .map(|entry| entry.refs.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Directory the store keeps its segments in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn segment_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.sbx"))
    }

    fn load_box(&self, name: &str) -> Result<SharedBox> {
        let path = self.segment_path(name);

        let (segment, records) = if path.exists() {
            Segment::open(&path, name)?
        } else {
            (Segment::create(&path, name)?, Vec::new())
        };

        let mut inner = BoxInner {
            segment,
            index: HashMap::new(),
            mismatched: HashSet::new(),
            live_bytes: 0,
            dead_bytes: 0,
        };
        for record in records {
            inner.replay(record);
        }

        // Compare stored fingerprints against the registry once, up front,
        // so schema drift surfaces at open rather than on arbitrary reads.
        for (type_id, stored) in inner.segment.table() {
            if let Ok(registered) = self.registry.fingerprint(type_id) {
                if registered != *stored {
                    tracing::warn!(
                        box_name = name,
                        type_id,
                        stored = format_args!("{stored:#010x}"),
                        registered = format_args!("{registered:#010x}"),
                        "stored layout fingerprint differs from registry"
                    );
                    inner.mismatched.insert(type_id.clone());
                }
            }
        }

        if inner.dead_bytes >= COMPACT_DEAD_BYTES_FLOOR && inner.dead_bytes > inner.live_bytes {
            tracing::debug!(
                box_name = name,
                dead_bytes = inner.dead_bytes,
                "compacting on open"
            );
            inner.compact()?;
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(SharedBox {
            name: name.to_string(),
            refs: AtomicUsize::new(1),
            inner: RwLock::new(inner),
            events,
        })
    }
}

impl BoxInner {
    fn replay(&mut self, record: StoredRecord) {
        match record.op {
            RecordOp::Put => {
                if let Some(old) = self.index.insert(
                    record.key.clone(),
                    IndexEntry {
                        type_id: record.type_id,
                        fingerprint: record.fingerprint,
                        offset: record.offset,
                        len: record.len,
                        payload: Arc::new(record.payload),
                    },
                ) {
                    self.dead_bytes += old.len;
                    self.live_bytes -= old.len;
                }
                self.live_bytes += record.len;
            }
            RecordOp::Delete => {
                self.dead_bytes += record.len;
                if let Some(old) = self.index.remove(&record.key) {
                    self.dead_bytes += old.len;
                    self.live_bytes -= old.len;
                }
            }
        }
    }

    fn compact(&mut self) -> Result<()> {
        let mut live: Vec<(Key, TypeId, Fingerprint, Vec<u8>)> = self
            .index
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    entry.type_id.clone(),
                    entry.fingerprint,
                    entry.payload.as_ref().clone(),
                )
            })
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));

        let offsets = self.segment.rewrite(&live)?;
        for (key, offset, len) in offsets {
            if let Some(entry) = self.index.get_mut(&key) {
                entry.offset = offset;
                entry.len = len;
            }
        }

        self.dead_bytes = 0;
        self.live_bytes = self.index.values().map(|e| e.len).sum();
        Ok(())
    }
}

/// Handle to an open box.
///
/// Cheap to clone; all clones address the same container. Dropping a handle
/// does not close the box; release is always an explicit
/// [`BoxStore::close`].
#[derive(Clone)]
pub struct BoxHandle {
    shared: Arc<SharedBox>,
    registry: Arc<CodecRegistry>,
}

impl BoxHandle {
    /// Name of the box.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    fn guard(&self) -> Result<()> {
        if self.shared.refs.load(Ordering::SeqCst) == 0 {
            return Err(Error::BoxNotOpen(self.shared.name.clone()));
        }
        Ok(())
    }

    /// Store a value durably under a key.
    ///
    /// Does not return until the record is persisted. Emits a
    /// [`ChangeCause::LocalWrite`] notification.
    pub fn put(&self, key: &str, type_id: &str, value: &Value) -> Result<()> {
        self.put_with_cause(key, type_id, value, ChangeCause::LocalWrite)
    }

    pub(crate) fn put_with_cause(
        &self,
        key: &str,
        type_id: &str,
        value: &Value,
        cause: ChangeCause,
    ) -> Result<()> {
        self.guard()?;
        let payload = self.registry.encode(type_id, value)?;
        let fingerprint = self.registry.fingerprint(type_id)?;

        let mut inner = self.shared.write();
        if inner.mismatched.contains(type_id) {
            let stored = inner.segment.table().get(type_id).copied().unwrap_or(0);
            return Err(Error::FingerprintMismatch {
                type_id: type_id.to_string(),
                stored,
                registered: fingerprint,
            });
        }

        let (offset, len) = inner
            .segment
            .append(RecordOp::Put, key, type_id, fingerprint, &payload)?;
        if let Some(old) = inner.index.insert(
            key.to_string(),
            IndexEntry {
                type_id: type_id.to_string(),
                fingerprint,
                offset,
                len,
                payload: Arc::new(payload),
            },
        ) {
            inner.dead_bytes += old.len;
            inner.live_bytes -= old.len;
        }
        inner.live_bytes += len;
        drop(inner);

        self.publish(ChangeEvent {
            key: key.to_string(),
            value: Some(value.clone()),
            cause,
        });
        Ok(())
    }

    /// Read and decode the value under a key, `None` if absent.
    ///
    /// Fails with [`Error::FingerprintMismatch`] when the stored layout for
    /// the record's type differs from the registry; recovery is an explicit
    /// [`BoxStore::wipe`] and reopen.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.guard()?;
        let inner = self.shared.read();
        let Some(entry) = inner.index.get(key) else {
            return Ok(None);
        };

        if inner.mismatched.contains(&entry.type_id) {
            return Err(Error::FingerprintMismatch {
                type_id: entry.type_id.clone(),
                stored: entry.fingerprint,
                registered: self.registry.fingerprint(&entry.type_id)?,
            });
        }

        self.registry.decode(&entry.type_id, &entry.payload).map(Some)
    }

    /// Read a value, falling back to a default when the key is absent.
    pub fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &str) -> Result<bool> {
        self.guard()?;
        let inner = self.shared.read();
        Ok(inner.index.contains_key(key))
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Result<Vec<Key>> {
        self.guard()?;
        let inner = self.shared.read();
        let mut keys: Vec<Key> = inner.index.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize> {
        self.guard()?;
        let inner = self.shared.read();
        Ok(inner.index.len())
    }

    /// Whether the box holds no live keys.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.guard()?;
        let mut inner = self.shared.write();
        let Some(old) = inner.index.remove(key) else {
            return Ok(false);
        };

        let (_, len) = inner
            .segment
            .append(RecordOp::Delete, key, &old.type_id, old.fingerprint, &[])?;
        inner.dead_bytes += old.len + len;
        inner.live_bytes -= old.len;
        drop(inner);

        self.publish(ChangeEvent {
            key: key.to_string(),
            value: None,
            cause: ChangeCause::Delete,
        });
        Ok(true)
    }

    /// Remove every record. Irreversible; reserved for explicit reset or
    /// logout flows.
    pub fn clear(&self) -> Result<()> {
        self.guard()?;
        let mut inner = self.shared.write();
        let keys: Vec<Key> = inner.index.keys().cloned().collect();

        inner.segment.reset()?;
        inner.index.clear();
        inner.mismatched.clear();
        inner.live_bytes = 0;
        inner.dead_bytes = 0;
        drop(inner);

        for key in keys {
            self.publish(ChangeEvent {
                key,
                value: None,
                cause: ChangeCause::Clear,
            });
        }
        Ok(())
    }

    /// Rewrite the segment keeping only live records, reclaiming space from
    /// overwritten and deleted keys.
    pub fn compact(&self) -> Result<()> {
        self.guard()?;
        let mut inner = self.shared.write();
        inner.compact()
    }

    /// Subscribe to all change notifications for this box.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.shared.events.subscribe(),
            key: None,
        }
    }

    /// Subscribe to change notifications for one key.
    pub fn subscribe_key(&self, key: &str) -> Subscription {
        Subscription {
            rx: self.shared.events.subscribe(),
            key: Some(key.to_string()),
        }
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }
}

impl std::fmt::Debug for BoxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxHandle")
            .field("name", &self.shared.name)
            .finish()
    }
}
