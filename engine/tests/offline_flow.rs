//! End-to-end offline scenarios for satchel-engine
//!
//! These tests wire the box store, the read orchestrator, and the outbox
//! together against a scripted remote, exercising the full
//! offline → reconnect → drain cycle.

use async_trait::async_trait;
use satchel_engine::{
    Action, BoxStore, ChangeCause, CodecRegistry, Error, FieldKind, FieldLayout, Link,
    Orchestrator, Outbox, OutboxConfig, RemoteError, RemoteSource, SwitchedConnectivity,
    TypeLayout,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Remote that serves one encoded profile and records submitted actions.
/// While `down`, every call fails with a network error.
struct FakeBackend {
    profile: Mutex<Vec<u8>>,
    down: std::sync::atomic::AtomicBool,
    fetches: AtomicUsize,
    submitted: Mutex<Vec<Action>>,
}

impl FakeBackend {
    fn serving(profile: Vec<u8>) -> Self {
        Self {
            profile: Mutex::new(profile),
            down: std::sync::atomic::AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn set_profile(&self, profile: Vec<u8>) {
        *self.profile.lock().unwrap() = profile;
    }

    fn submitted_payloads(&self) -> Vec<Value> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.payload.clone())
            .collect()
    }
}

#[async_trait]
impl RemoteSource for FakeBackend {
    async fn fetch(&self, _resource: &str) -> Result<Vec<u8>, RemoteError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("backend unreachable".into()));
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.profile.lock().unwrap().clone())
    }

    async fn submit(&self, action: &Action) -> Result<(), RemoteError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("backend unreachable".into()));
        }
        self.submitted.lock().unwrap().push(action.clone());
        Ok(())
    }
}

fn profile_registry() -> Arc<CodecRegistry> {
    let registry = CodecRegistry::new();
    registry
        .register(TypeLayout::new(
            "profile",
            vec![
                FieldLayout::required("name", FieldKind::String),
                FieldLayout::optional("visits", FieldKind::Int),
            ],
        ))
        .unwrap();
    Arc::new(registry)
}

#[tokio::test]
async fn offline_reads_serve_stale_then_reconnect_refreshes() {
    let dir = TempDir::new().unwrap();
    let registry = profile_registry();
    let store = BoxStore::new(dir.path(), registry.clone()).unwrap();
    let cache = store.open("profiles").unwrap();

    let v1 = registry
        .encode("profile", &json!({"name": "Alice", "visits": 1}))
        .unwrap();
    let backend = Arc::new(FakeBackend::serving(v1));
    let connectivity = Arc::new(SwitchedConnectivity::new(Link::Online));

    let orchestrator = Arc::new(Orchestrator::new(
        cache.clone(),
        backend.clone(),
        connectivity.clone(),
    ));

    // First read online: nothing cached yet, refresh fills the box
    let mut sub = cache.subscribe_key("user_1");
    let loaded = orchestrator.load("user_1", "profile", false).await.unwrap();
    assert!(loaded.value.is_none());
    let event = sub.recv().await.unwrap();
    assert_eq!(event.cause, ChangeCause::RemoteRefresh);
    assert_eq!(event.value.unwrap()["name"], "Alice");

    // Link drops; the cached value is still served, flagged stale
    connectivity.set(Link::Offline);
    backend.set_down(true);
    let fetches_before = backend.fetches.load(Ordering::SeqCst);
    let loaded = orchestrator.load("user_1", "profile", false).await.unwrap();
    assert_eq!(loaded.value.unwrap()["name"], "Alice");
    assert!(loaded.stale);
    assert_eq!(backend.fetches.load(Ordering::SeqCst), fetches_before);

    // Reconnect: the revalidation task fetches the newer profile
    let v2 = registry
        .encode("profile", &json!({"name": "Alice", "visits": 2}))
        .unwrap();
    backend.set_profile(v2);
    backend.set_down(false);

    let task = orchestrator.spawn_reconnect_revalidation();
    let mut sub = cache.subscribe_key("user_1");
    connectivity.set(Link::Online);

    let event = sub.recv().await.unwrap();
    assert_eq!(event.value.unwrap()["visits"], 2);
    assert!(!orchestrator.is_stale("user_1"));
    task.abort();
}

#[tokio::test]
async fn critical_read_fails_offline_instead_of_serving_stale() {
    let dir = TempDir::new().unwrap();
    let registry = profile_registry();
    let store = BoxStore::new(dir.path(), registry.clone()).unwrap();
    let cache = store.open("profiles").unwrap();

    let bytes = registry
        .encode("profile", &json!({"name": "Alice"}))
        .unwrap();
    let backend = Arc::new(FakeBackend::serving(bytes));
    let connectivity = Arc::new(SwitchedConnectivity::new(Link::Online));
    let orchestrator = Orchestrator::new(cache.clone(), backend.clone(), connectivity.clone());

    // Seed the cache with a fresh critical read
    let loaded = orchestrator.load("user_1", "profile", true).await.unwrap();
    assert_eq!(loaded.value.unwrap()["name"], "Alice");
    assert!(cache.contains("user_1").unwrap());

    // Backend gone: the critical path must error, never fall back to cache
    backend.set_down(true);
    let result = orchestrator.load("user_1", "profile", true).await;
    assert!(matches!(result, Err(Error::Remote(RemoteError::Network(_)))));

    // The non-critical path still answers from the cache
    let loaded = orchestrator.load("user_1", "profile", false).await.unwrap();
    assert_eq!(loaded.value.unwrap()["name"], "Alice");
}

#[tokio::test]
async fn mutations_queued_offline_drain_in_order_on_reconnect() {
    let dir = TempDir::new().unwrap();
    let store = BoxStore::new(dir.path(), Arc::new(CodecRegistry::new())).unwrap();

    let backend = Arc::new(FakeBackend::serving(Vec::new()));
    backend.set_down(true);
    let connectivity = Arc::new(SwitchedConnectivity::new(Link::Offline));

    let outbox = Arc::new(
        Outbox::open(
            &store,
            backend.clone(),
            connectivity.clone(),
            OutboxConfig::default(),
        )
        .unwrap(),
    );

    // Offline edits pile up in order
    for step in 1..=3 {
        outbox
            .submit_or_enqueue(Action::new("cart", json!({"step": step})))
            .await
            .unwrap();
    }
    assert_eq!(outbox.pending_count().unwrap(), 3);
    assert!(backend.submitted_payloads().is_empty());

    // Reconnect drains the queue in the background
    let task = outbox.spawn_flush_on_reconnect();
    backend.set_down(false);
    connectivity.set(Link::Online);

    let drained = async {
        while outbox.pending_count().unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), drained)
        .await
        .expect("queue should drain after reconnect");

    assert_eq!(
        backend.submitted_payloads(),
        vec![json!({"step": 1}), json!({"step": 2}), json!({"step": 3})]
    );
    task.abort();
}

#[tokio::test]
async fn queued_mutations_survive_restart_and_drain_in_order() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::serving(Vec::new()));

    {
        let store = BoxStore::new(dir.path(), Arc::new(CodecRegistry::new())).unwrap();
        let connectivity = Arc::new(SwitchedConnectivity::new(Link::Offline));
        let outbox = Outbox::open(
            &store,
            backend.clone(),
            connectivity,
            OutboxConfig::default(),
        )
        .unwrap();
        outbox.enqueue(Action::new("cart", json!({"step": 1}))).unwrap();
        outbox.enqueue(Action::new("cart", json!({"step": 2}))).unwrap();
        // Process dies with the queue on disk
    }

    let store = BoxStore::new(dir.path(), Arc::new(CodecRegistry::new())).unwrap();
    let connectivity = Arc::new(SwitchedConnectivity::new(Link::Online));
    let outbox = Outbox::open(
        &store,
        backend.clone(),
        connectivity,
        OutboxConfig::default(),
    )
    .unwrap();

    outbox.enqueue(Action::new("cart", json!({"step": 3}))).unwrap();
    outbox.flush().await.unwrap();

    assert_eq!(
        backend.submitted_payloads(),
        vec![json!({"step": 1}), json!({"step": 2}), json!({"step": 3})]
    );
    assert_eq!(outbox.pending_count().unwrap(), 0);
}
