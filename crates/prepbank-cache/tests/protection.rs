//! End-to-end tests for the cache guards over the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use prepbank_cache::{
    CacheError, CacheProtection, CacheProtectionConfig, CircuitBreakerConfig, CircuitState,
    RateGateConfig,
};
use prepbank_kv::{KvStore, MemoryKv, SetOptions};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn facade(store: Arc<MemoryKv>, config: CacheProtectionConfig) -> CacheProtection {
    CacheProtection::new(store, config)
}

#[tokio::test]
async fn null_protection_caches_absence() {
    let store = Arc::new(MemoryKv::new());
    let cache = facade(store.clone(), CacheProtectionConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let result: Option<String> = cache
            .get_with_null_protection("missing-question", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<Option<String>, BoxError>(None)
            })
            .await
            .unwrap();
        assert_eq!(result, None);
    }
    // The marker absorbed the repeat lookups.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn null_marker_has_short_ttl() {
    let store = Arc::new(MemoryKv::new());
    let cache = facade(store.clone(), CacheProtectionConfig::default());
    let _: Option<String> = cache
        .get_with_null_protection("gone", || async { Ok::<Option<String>, BoxError>(None) })
        .await
        .unwrap();
    let ttl = store.time_to_live("cache:gone").unwrap();
    assert!(ttl <= Duration::from_secs(300));
    assert!(ttl > Duration::from_secs(250));
}

#[tokio::test]
async fn cached_value_skips_compute() {
    let store = Arc::new(MemoryKv::new());
    let cache = facade(store, CacheProtectionConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = calls.clone();
        let result = cache
            .get_with_null_protection("q:42", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<Option<u64>, BoxError>(Some(42))
            })
            .await
            .unwrap();
        assert_eq!(result, Some(42));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn double_check_lock_computes_exactly_once_under_contention() {
    let store = Arc::new(MemoryKv::new());
    let cache = Arc::new(facade(store, CacheProtectionConfig::default()));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_with_double_check_lock("hot-question", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // Hold the lock long enough for every task to contend.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<Option<String>, BoxError>(Some("answer".to_string()))
                })
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Some("answer".to_string()));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn double_check_lock_honors_cached_null_marker() {
    let store = Arc::new(MemoryKv::new());
    let cache = facade(store, CacheProtectionConfig::default());

    let first: Option<String> = cache
        .get_with_null_protection("absent", || async { Ok::<Option<String>, BoxError>(None) })
        .await
        .unwrap();
    assert_eq!(first, None);

    // The locked read-through sees the marker as a hit, not as a value.
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let second: Option<String> = cache
        .get_with_double_check_lock("absent", move || async move {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok::<Option<String>, BoxError>(Some("wrong".to_string()))
        })
        .await
        .unwrap();
    assert_eq!(second, None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn lock_timeout_after_retry_budget() {
    let store = Arc::new(MemoryKv::new());
    // Someone else holds the lock and never releases it.
    store
        .set(
            "cache:lock:stuck",
            "foreign-token",
            SetOptions::new().ex(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    let config = CacheProtectionConfig {
        lock_retry_delay: Duration::from_millis(5),
        lock_max_attempts: 3,
        ..Default::default()
    };
    let cache = facade(store, config);
    let err = cache
        .get_with_double_check_lock("stuck", || async {
            Ok::<Option<String>, BoxError>(Some("never".to_string()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::LockTimeout { .. }));
}

#[tokio::test]
async fn random_ttl_lands_inside_the_jitter_band() {
    let store = Arc::new(MemoryKv::new());
    let cache = facade(store.clone(), CacheProtectionConfig::default());
    let result = cache
        .get_with_random_ttl(
            "jittered",
            Duration::from_secs(100),
            Duration::from_secs(30),
            || async { Ok::<Option<u32>, BoxError>(Some(7)) },
        )
        .await
        .unwrap();
    assert_eq!(result, Some(7));

    let ttl = store.time_to_live("cache:jittered").unwrap();
    assert!(ttl >= Duration::from_secs(69), "ttl too low: {ttl:?}");
    assert!(ttl <= Duration::from_secs(131), "ttl too high: {ttl:?}");
}

#[tokio::test]
async fn circuit_breaker_fails_fast_after_tripping() {
    let store = Arc::new(MemoryKv::new());
    let config = CacheProtectionConfig {
        circuit_breaker: Some(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }),
        ..Default::default()
    };
    let cache = facade(store, config);
    assert_eq!(cache.circuit_state(), Some(CircuitState::Closed));

    let err = cache
        .get_with_circuit_breaker("flaky", || async {
            Err::<Option<String>, BoxError>("backend down".into())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Compute(_)));
    assert_eq!(cache.circuit_state(), Some(CircuitState::Open));

    // Open breaker: compute is not even attempted.
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let err = cache
        .get_with_circuit_breaker("flaky", move || async move {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok::<Option<String>, BoxError>(Some("up again".to_string()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::CircuitOpen));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn without_breaker_config_the_guard_degrades_to_plain_lock() {
    let store = Arc::new(MemoryKv::new());
    let cache = facade(store, CacheProtectionConfig::default());
    assert_eq!(cache.circuit_state(), None);
    let result = cache
        .get_with_circuit_breaker("plain", || async {
            Ok::<Option<u32>, BoxError>(Some(1))
        })
        .await
        .unwrap();
    assert_eq!(result, Some(1));
}

#[tokio::test]
async fn rate_limit_guard_denies_over_the_window_budget() {
    let store = Arc::new(MemoryKv::new());
    let config = CacheProtectionConfig {
        rate_gate: Some(RateGateConfig {
            max_requests: 2,
            window: Duration::from_secs(60),
        }),
        ..Default::default()
    };
    let cache = facade(store, config);

    for _ in 0..2 {
        let result = cache
            .get_with_rate_limit("limited", || async {
                Ok::<Option<u32>, BoxError>(Some(5))
            })
            .await
            .unwrap();
        assert_eq!(result, Some(5));
    }
    let err = cache
        .get_with_rate_limit("limited", || async {
            Ok::<Option<u32>, BoxError>(Some(5))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::RateLimited { .. }));

    // Resetting the window admits the caller again.
    cache.reset_rate_gate("limited").await;
    let result = cache
        .get_with_rate_limit("limited", || async {
            Ok::<Option<u32>, BoxError>(Some(5))
        })
        .await
        .unwrap();
    assert_eq!(result, Some(5));
}

#[tokio::test]
async fn compute_error_propagates_and_nothing_is_cached() {
    let store = Arc::new(MemoryKv::new());
    let cache = facade(store.clone(), CacheProtectionConfig::default());
    let err = cache
        .get_with_double_check_lock("broken", || async {
            Err::<Option<String>, BoxError>("db timeout".into())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Compute(_)));
    assert!(!store.exists("cache:broken").await.unwrap());
    // The lock was released, so a later caller can compute.
    let result = cache
        .get_with_double_check_lock("broken", || async {
            Ok::<Option<String>, BoxError>(Some("recovered".to_string()))
        })
        .await
        .unwrap();
    assert_eq!(result, Some("recovered".to_string()));
}
