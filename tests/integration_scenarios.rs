//! Integration tests covering the literal scenarios in the testable
//! properties for this crate: single-flight coordination, stale-token
//! recovery, batch get with a partial cache hit, pattern finder threshold
//! behavior, and the retry engine's timing guarantee.

use cache_chain::kv::testing::InMemoryKv;
use cache_chain::{CacheChainBuilder, Finder, KvTierConfig, MemoryTierConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn kv_only_chain(config: KvTierConfig) -> (cache_chain::CacheChain, Arc<InMemoryKv>) {
    let kv = Arc::new(InMemoryKv::new());
    let chain = CacheChainBuilder::new()
        .with_kv_tier(kv.clone(), config)
        .unwrap()
        .build();
    (chain, kv)
}

#[tokio::test]
async fn two_concurrent_gets_single_flight_the_loader() {
    let (chain, _kv) = kv_only_chain(KvTierConfig::default());
    let chain = Arc::new(chain);
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    chain.set_fn_get_no_cache(Arc::new(move |_key| {
        let calls = calls_clone.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("v1".to_string())
        })
    }));

    let a = {
        let chain = chain.clone();
        tokio::spawn(async move { chain.get("u/1").await })
    };
    let b = {
        let chain = chain.clone();
        tokio::spawn(async move { chain.get("u/1").await })
    };

    let (result_a, result_b) = tokio::join!(a, b);
    let result_a = result_a.unwrap();
    let result_b = result_b.unwrap();

    assert_eq!(result_a.value.as_deref(), Some("v1"));
    assert_eq!(result_b.value.as_deref(), Some("v1"));
    assert!(result_a.exist);
    assert!(result_b.exist);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_token_is_cleared_and_a_fresh_loader_runs() {
    let (chain, kv) = kv_only_chain(KvTierConfig::default());
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    chain.set_fn_get_no_cache(Arc::new(move |_key| {
        let calls = calls_clone.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("fresh-value".to_string())
        })
    }));

    // Plant a stale token directly: the KvTier's default key prefix is
    // "cache:{}" and token prefix is "cache-token".
    use cache_chain::SharedKv;
    kv.cas("cache:u/1", "", "cache-token@deadbeef@0", Duration::from_secs(60))
        .await
        .unwrap();

    let result = chain.get("u/1").await;
    assert_eq!(result.value.as_deref(), Some("fresh-value"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_get_serves_cached_entry_and_batches_the_rest() {
    let (chain, kv) = kv_only_chain(KvTierConfig::default());
    use cache_chain::SharedKv;
    kv.cas("cache:b", "", "B", Duration::from_secs(60)).await.unwrap();

    let batch_calls = Arc::new(AtomicU32::new(0));
    let batch_calls_clone = batch_calls.clone();
    chain.set_fn_batch_get_no_cache(Arc::new(move |keys| {
        let batch_calls = batch_calls_clone.clone();
        Box::pin(async move {
            batch_calls.fetch_add(1, Ordering::SeqCst);
            let mut keys_sorted = keys.clone();
            keys_sorted.sort();
            assert_eq!(keys_sorted, vec!["a".to_string(), "c".to_string()]);
            Ok(keys
                .into_iter()
                .map(|k| (k.clone(), k.to_uppercase()))
                .collect())
        })
    }));

    let results = chain
        .batch_get(&["a".to_string(), "b".to_string(), "c".to_string()])
        .await;

    assert_eq!(results["a"].value.as_deref(), Some("A"));
    assert_eq!(results["b"].value.as_deref(), Some("B"));
    assert_eq!(results["c"].value.as_deref(), Some("C"));
    assert_eq!(batch_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn pattern_finder_collapses_two_independent_wildcards() {
    let finder = Finder::new(3, 1024);
    for id in 1..=4 {
        finder.record_api(&format!("/api/v1/users/{id}")).unwrap();
    }
    for id in 1..=3 {
        finder.record_api(&format!("/api/v1/posts/{id}")).unwrap();
    }

    let urls: std::collections::HashSet<String> =
        finder.scan_restful_pattern().unwrap().into_iter().collect();
    assert!(urls.contains("/api/v1/users/*"));
    assert!(urls.contains("/api/v1/posts/*"));
}

#[test]
fn pattern_finder_collapses_nested_variables_independently() {
    let finder = Finder::new(3, 1024);
    finder.record_api("/api/v1/users/1/profile").unwrap();
    finder.record_api("/api/v1/users/2/profile").unwrap();
    finder.record_api("/api/v1/users/3/profile").unwrap();
    finder.record_api("/api/v1/users/1/posts/1/comments").unwrap();
    finder.record_api("/api/v1/users/1/posts/2/comments").unwrap();
    finder.record_api("/api/v1/users/1/posts/3/comments").unwrap();

    let urls: std::collections::HashSet<String> =
        finder.scan_restful_pattern().unwrap().into_iter().collect();
    assert!(urls.contains("/api/v1/users/*/profile"));
    assert!(urls.contains("/api/v1/users/1/posts/*/comments"));
}

#[tokio::test]
async fn retry_engine_exhausts_three_attempts_over_at_least_one_second() {
    use cache_chain::{do_retry, CacheError, RetryConfig};

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    let config = RetryConfig::new(3, Duration::from_millis(500)).with_exponential(true);
    let start = std::time::Instant::now();

    let result = do_retry(config, move || {
        let calls = calls_clone.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CacheError::Loader("always fails".into()))
        }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_millis(1000));
}

#[tokio::test]
async fn chain_falls_through_memory_miss_to_kv_tier_to_loader() {
    let kv = Arc::new(InMemoryKv::new());
    let chain = CacheChainBuilder::new()
        .with_memory_tier(MemoryTierConfig::default())
        .unwrap()
        .with_kv_tier(kv, KvTierConfig::default())
        .unwrap()
        .build();

    chain.set_fn_get_no_cache(Arc::new(|key| {
        Box::pin(async move { Ok(format!("db-value-for-{key}")) })
    }));

    let result = chain.get("cold-key").await;
    assert_eq!(result.value.as_deref(), Some("db-value-for-cold-key"));
    assert_eq!(result.cache_name, Some("kv"));
}
