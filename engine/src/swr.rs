//! Stale-while-revalidate read orchestration.
//!
//! [`Orchestrator::load`] answers from the box immediately and, when the
//! link is up, refreshes in the background. The refreshed value lands back
//! in the box with a [`ChangeCause::RemoteRefresh`] notification, so
//! consumers observe the update instead of polling. Refresh failures keep
//! the cached value authoritative; they only mark the entry stale.
//!
//! Critical loads bypass the cache entirely: one-shot operations (payments
//! and the like) must not act on stale data, so they get a fresh value or
//! an explicit error.

use crate::{
    boxes::{BoxHandle, ChangeCause},
    connectivity::{Connectivity, Link},
    error::Result,
    remote::RemoteSource,
    unix_millis, Key, Timestamp, TypeId,
};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Result of a non-critical load.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    /// Last cached value, `None` when nothing has ever been stored
    pub value: Option<Value>,
    /// Whether the value is known stale (offline, or the last refresh failed)
    pub stale: bool,
}

#[derive(Debug, Clone)]
struct CacheMeta {
    type_id: TypeId,
    last_fetched: Option<Timestamp>,
    stale: bool,
}

/// Read-through cache over a box and a remote source.
///
/// Keys double as remote resource names.
pub struct Orchestrator {
    cache: BoxHandle,
    remote: Arc<dyn RemoteSource>,
    connectivity: Arc<dyn Connectivity>,
    meta: Arc<DashMap<Key, CacheMeta>>,
}

impl Orchestrator {
    /// Create an orchestrator over an open box.
    pub fn new(
        cache: BoxHandle,
        remote: Arc<dyn RemoteSource>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        Self {
            cache,
            remote,
            connectivity,
            meta: Arc::new(DashMap::new()),
        }
    }

    /// Load a value.
    ///
    /// Non-critical: returns the cached value (or `None`) without waiting on
    /// the network. When online, a concurrent refresh is triggered and its
    /// result is delivered through the box's change notifications. When
    /// offline, no fetch is attempted and the entry stays stale until the
    /// link returns.
    ///
    /// Critical: direct fetch, no cache read, no stale serve. The caller
    /// gets a fresh value (also written back) or an explicit error.
    pub async fn load(&self, key: &str, type_id: &str, critical: bool) -> Result<Loaded> {
        if critical {
            let value = self.refresh(key, type_id).await?;
            return Ok(Loaded {
                value: Some(value),
                stale: false,
            });
        }

        let cached = self.cache.get(key)?;

        let stale = match self.connectivity.current() {
            Link::Online => {
                self.spawn_refresh(key, type_id);
                self.is_stale(key)
            }
            Link::Offline => {
                self.mark_stale(key, type_id);
                true
            }
        };

        Ok(Loaded {
            value: cached,
            stale,
        })
    }

    /// Force a refresh of one key and wait for it.
    ///
    /// The cached value is untouched on failure; the entry is marked stale.
    pub async fn revalidate(&self, key: &str, type_id: &str) -> Result<Value> {
        self.refresh(key, type_id).await
    }

    /// Whether a key is currently marked stale.
    pub fn is_stale(&self, key: &str) -> bool {
        self.meta.get(key).map(|m| m.stale).unwrap_or(false)
    }

    /// When the key was last successfully fetched, if ever.
    pub fn last_fetched(&self, key: &str) -> Option<Timestamp> {
        self.meta.get(key).and_then(|m| m.last_fetched)
    }

    /// Spawn a background task that re-fetches stale keys whenever the link
    /// comes back up.
    pub fn spawn_reconnect_revalidation(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let mut changes = self.connectivity.changes();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(Link::Online) => {
                        let stale: Vec<(Key, TypeId)> = orchestrator
                            .meta
                            .iter()
                            .filter(|entry| entry.stale)
                            .map(|entry| (entry.key().clone(), entry.type_id.clone()))
                            .collect();
                        tracing::debug!(count = stale.len(), "revalidating stale keys");
                        for (key, type_id) in stale {
                            orchestrator.spawn_refresh(&key, &type_id);
                        }
                    }
                    Ok(Link::Offline) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_refresh(&self, key: &str, type_id: &str) {
        let cache = self.cache.clone();
        let remote = self.remote.clone();
        let meta = self.meta.clone();
        let key = key.to_string();
        let type_id = type_id.to_string();

        tokio::spawn(async move {
            if let Err(err) =
                refresh_into(&cache, remote.as_ref(), &meta, &key, &type_id).await
            {
                tracing::warn!(key, %err, "background refresh failed, serving stale");
            }
        });
    }

    async fn refresh(&self, key: &str, type_id: &str) -> Result<Value> {
        refresh_into(&self.cache, self.remote.as_ref(), &self.meta, key, type_id).await
    }

    fn mark_stale(&self, key: &str, type_id: &str) {
        self.meta
            .entry(key.to_string())
            .and_modify(|m| m.stale = true)
            .or_insert_with(|| CacheMeta {
                type_id: type_id.to_string(),
                last_fetched: None,
                stale: true,
            });
    }
}

/// Fetch, decode, and write back one key. Marks the entry stale on failure
/// and fresh on success; never discards the cached value.
async fn refresh_into(
    cache: &BoxHandle,
    remote: &dyn RemoteSource,
    meta: &DashMap<Key, CacheMeta>,
    key: &str,
    type_id: &str,
) -> Result<Value> {
    let mark_stale = || {
        meta.entry(key.to_string())
            .and_modify(|m| m.stale = true)
            .or_insert_with(|| CacheMeta {
                type_id: type_id.to_string(),
                last_fetched: None,
                stale: true,
            });
    };

    let bytes = match remote.fetch(key).await {
        Ok(bytes) => bytes,
        Err(err) => {
            mark_stale();
            return Err(err.into());
        }
    };

    // A fetch that cannot be decoded or stored leaves the entry stale too,
    // so reconnect revalidation keeps retrying it
    let value = match cache.registry().decode(type_id, &bytes) {
        Ok(value) => value,
        Err(err) => {
            mark_stale();
            return Err(err);
        }
    };
    if let Err(err) = cache.put_with_cause(key, type_id, &value, ChangeCause::RemoteRefresh) {
        mark_stale();
        return Err(err);
    }

    meta.insert(
        key.to_string(),
        CacheMeta {
            type_id: type_id.to_string(),
            last_fetched: Some(unix_millis()),
            stale: false,
        },
    );
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecRegistry, FieldKind, FieldLayout, TypeLayout};
    use crate::connectivity::SwitchedConnectivity;
    use crate::remote::{Action, RemoteError};
    use crate::BoxStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn items_layout() -> TypeLayout {
        TypeLayout::new(
            "items",
            vec![FieldLayout::required("list", FieldKind::Json)],
        )
    }

    /// Remote that always serves one value and counts fetches.
    struct FixedRemote {
        bytes: Vec<u8>,
        fetches: AtomicUsize,
    }

    impl FixedRemote {
        fn serving(registry: &CodecRegistry, value: &Value) -> Self {
            Self {
                bytes: registry.encode("items", value).unwrap(),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteSource for FixedRemote {
        async fn fetch(&self, _resource: &str) -> std::result::Result<Vec<u8>, RemoteError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.bytes.clone())
        }

        async fn submit(&self, _action: &Action) -> std::result::Result<(), RemoteError> {
            Ok(())
        }
    }

    /// Remote whose fetches always fail with the given error.
    struct DownRemote(RemoteError);

    #[async_trait]
    impl RemoteSource for DownRemote {
        async fn fetch(&self, _resource: &str) -> std::result::Result<Vec<u8>, RemoteError> {
            Err(self.0.clone())
        }

        async fn submit(&self, _action: &Action) -> std::result::Result<(), RemoteError> {
            Err(self.0.clone())
        }
    }

    fn cache_box(dir: &TempDir) -> BoxHandle {
        let registry = Arc::new(CodecRegistry::new());
        registry.register(items_layout()).unwrap();
        let store = BoxStore::new(dir.path(), registry).unwrap();
        store.open("cache").unwrap()
    }

    fn v1() -> Value {
        json!({"list": ["a"]})
    }

    fn v2() -> Value {
        json!({"list": ["a", "b"]})
    }

    #[tokio::test]
    async fn online_load_serves_cached_then_delivers_refresh() {
        let dir = TempDir::new().unwrap();
        let cache = cache_box(&dir);
        cache.put("items", "items", &v1()).unwrap();

        let remote = Arc::new(FixedRemote::serving(cache.registry(), &v2()));
        let connectivity = Arc::new(SwitchedConnectivity::new(Link::Online));
        let orchestrator = Orchestrator::new(cache.clone(), remote, connectivity);

        let mut sub = cache.subscribe_key("items");

        // First answer is the cached value, immediately
        let loaded = orchestrator.load("items", "items", false).await.unwrap();
        assert_eq!(loaded.value, Some(v1()));

        // Second answer arrives through the notification channel
        let event = sub.recv().await.unwrap();
        assert_eq!(event.cause, ChangeCause::RemoteRefresh);
        assert_eq!(event.value, Some(v2()));
        assert_eq!(cache.get("items").unwrap(), Some(v2()));
        assert!(!orchestrator.is_stale("items"));
        assert!(orchestrator.last_fetched("items").is_some());
    }

    #[tokio::test]
    async fn offline_load_serves_stale_without_fetching() {
        let dir = TempDir::new().unwrap();
        let cache = cache_box(&dir);
        cache.put("items", "items", &v1()).unwrap();

        let remote = Arc::new(FixedRemote::serving(cache.registry(), &v2()));
        let connectivity = Arc::new(SwitchedConnectivity::new(Link::Offline));
        let orchestrator = Orchestrator::new(cache.clone(), remote.clone(), connectivity);

        let loaded = orchestrator.load("items", "items", false).await.unwrap();
        assert_eq!(loaded.value, Some(v1()));
        assert!(loaded.stale);
        assert!(orchestrator.is_stale("items"));

        // No fetch was attempted
        tokio::task::yield_now().await;
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get("items").unwrap(), Some(v1()));
    }

    #[tokio::test]
    async fn critical_load_bypasses_cache() {
        let dir = TempDir::new().unwrap();
        let cache = cache_box(&dir);
        cache.put("items", "items", &v1()).unwrap();

        let remote = Arc::new(FixedRemote::serving(cache.registry(), &v2()));
        let connectivity = Arc::new(SwitchedConnectivity::new(Link::Online));
        let orchestrator = Orchestrator::new(cache.clone(), remote, connectivity);

        let loaded = orchestrator.load("items", "items", true).await.unwrap();
        assert_eq!(loaded.value, Some(v2()));
        assert!(!loaded.stale);
        // The fresh value was written back
        assert_eq!(cache.get("items").unwrap(), Some(v2()));
    }

    #[tokio::test]
    async fn critical_load_failure_is_explicit() {
        let dir = TempDir::new().unwrap();
        let cache = cache_box(&dir);
        cache.put("items", "items", &v1()).unwrap();

        let remote = Arc::new(DownRemote(RemoteError::Timeout));
        let connectivity = Arc::new(SwitchedConnectivity::new(Link::Online));
        let orchestrator = Orchestrator::new(cache.clone(), remote, connectivity);

        let result = orchestrator.load("items", "items", true).await;
        assert!(matches!(result, Err(crate::Error::Remote(RemoteError::Timeout))));
        // No stale serve on the critical path, and the cache is untouched
        assert_eq!(cache.get("items").unwrap(), Some(v1()));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_cache_and_marks_stale() {
        let dir = TempDir::new().unwrap();
        let cache = cache_box(&dir);
        cache.put("items", "items", &v1()).unwrap();

        let remote = Arc::new(DownRemote(RemoteError::Http(503)));
        let connectivity = Arc::new(SwitchedConnectivity::new(Link::Online));
        let orchestrator = Orchestrator::new(cache.clone(), remote, connectivity);

        let result = orchestrator.revalidate("items", "items").await;
        assert!(result.is_err());
        assert_eq!(cache.get("items").unwrap(), Some(v1()));
        assert!(orchestrator.is_stale("items"));
    }

    #[tokio::test]
    async fn undecodable_fetch_marks_stale() {
        /// Remote that serves bytes no layout can decode.
        struct GarbageRemote;

        #[async_trait]
        impl RemoteSource for GarbageRemote {
            async fn fetch(&self, _resource: &str) -> std::result::Result<Vec<u8>, RemoteError> {
                Ok(vec![1, 2, 3])
            }

            async fn submit(&self, _action: &Action) -> std::result::Result<(), RemoteError> {
                Ok(())
            }
        }

        let dir = TempDir::new().unwrap();
        let cache = cache_box(&dir);
        cache.put("items", "items", &v1()).unwrap();

        let connectivity = Arc::new(SwitchedConnectivity::new(Link::Online));
        let orchestrator = Orchestrator::new(cache.clone(), Arc::new(GarbageRemote), connectivity);

        let result = orchestrator.revalidate("items", "items").await;
        assert!(matches!(result, Err(crate::Error::Decode { .. })));

        // The cached value survives, and the entry stays marked for
        // revalidation so reconnect retries it
        assert_eq!(cache.get("items").unwrap(), Some(v1()));
        assert!(orchestrator.is_stale("items"));
    }

    #[tokio::test]
    async fn reconnect_revalidates_stale_keys() {
        let dir = TempDir::new().unwrap();
        let cache = cache_box(&dir);
        cache.put("items", "items", &v1()).unwrap();

        let remote = Arc::new(FixedRemote::serving(cache.registry(), &v2()));
        let connectivity = Arc::new(SwitchedConnectivity::new(Link::Offline));
        let orchestrator = Arc::new(Orchestrator::new(
            cache.clone(),
            remote,
            connectivity.clone(),
        ));
        let task = orchestrator.spawn_reconnect_revalidation();

        // Offline load marks the entry stale and emits nothing further
        let loaded = orchestrator.load("items", "items", false).await.unwrap();
        assert_eq!(loaded.value, Some(v1()));
        assert!(loaded.stale);

        let mut sub = cache.subscribe_key("items");
        connectivity.set(Link::Online);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.cause, ChangeCause::RemoteRefresh);
        assert_eq!(event.value, Some(v2()));

        task.abort();
    }
}
