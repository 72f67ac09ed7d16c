//! Behavior of the runtime while dependencies fail and recover.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use warden_runtime::resilience::{CircuitBreakerConfig, CircuitState};
use warden_runtime::{
    CallError, JsonFileStore, MemoryStore, RuntimeError, StateManager, WardenConfig,
    WardenRuntime,
};

fn search_breaker_config() -> WardenConfig {
    let mut config = WardenConfig::default();
    config.breakers.overrides.insert(
        "search".to_string(),
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            ..Default::default()
        },
    );
    config
}

#[tokio::test(start_paused = true)]
async fn test_search_outage_and_recovery() {
    let runtime = WardenRuntime::builder()
        .config(search_breaker_config())
        .sweeper(false)
        .build()
        .unwrap();
    let search = runtime.breaker("search").unwrap();
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let result = search
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("503 from search backend")
            })
            .await;
        assert!(matches!(result, Err(CallError::Inner(_))));
    }
    assert_eq!(search.state(), CircuitState::Open);

    // Concurrent callers are rejected without reaching the backend
    let rejected = join_all((0..10).map(|_| {
        search.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        })
    }))
    .await;
    assert!(rejected.iter().all(|r| matches!(r, Err(CallError::Open { .. }))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let err: RuntimeError = search
        .call(|| async { Ok::<_, RuntimeError>(()) })
        .await
        .unwrap_err()
        .into();
    assert_eq!(err.user_message(), "service temporarily unavailable, retry later");

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(search.state(), CircuitState::HalfOpen);

    search.call(|| async { Ok::<_, &str>("results") }).await.unwrap();
    let snapshot = search.snapshot();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);

    // Other dependencies were never affected
    assert_eq!(runtime.breaker("llm").unwrap().state(), CircuitState::Closed);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_cache_survives_restart_through_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warden.json");
    let config = WardenConfig::default();

    {
        let store = Arc::new(JsonFileStore::open(&path).await.unwrap());
        let state = StateManager::new(config.state.clone(), store);
        state
            .set("search_results", "rust async", json!(["tokio.rs"]), None)
            .await
            .unwrap();
    }

    let store = Arc::new(JsonFileStore::open(&path).await.unwrap());
    let state = StateManager::new(config.state.clone(), store);
    assert_eq!(state.cached_entries(), 0);
    assert_eq!(
        state.get("search_results", "rust async").await.unwrap(),
        Some(json!(["tokio.rs"]))
    );
    // L2 hit repopulated L1
    assert_eq!(state.cached_entries(), 1);
}

#[tokio::test]
async fn test_store_outage_degrades_to_l1() {
    let store = Arc::new(MemoryStore::new());
    let runtime = WardenRuntime::builder()
        .store(store.clone())
        .sweeper(false)
        .build()
        .unwrap();
    let state = runtime.state();

    store.fail_writes(true);
    store.fail_reads(true);
    state.set("session", "ana", json!({ "turn": 3 }), None).await.unwrap();
    assert_eq!(state.get("session", "ana").await.unwrap(), Some(json!({ "turn": 3 })));
    assert_eq!(state.get("session", "bob").await.unwrap(), None);

    runtime.shutdown().await;
}
