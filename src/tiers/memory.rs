//! In-process memory tier (§4.D).
//!
//! A thin wrapper over an in-process key-value mapping with TTL, grounded on
//! `original_source/cachechain/cache/memorycache.go` (functional-options
//! defaults, `fmt.Sprintf(keyPrefix, key)` physical-key formatting) and the
//! teacher's Moka-backed L1 cache for the actual storage engine.

use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{CacheError, ClearCacheResult, GetCacheResult, Result, SetCacheResult, Strategy};
use crate::tiers::{format_key, validate_key_prefix, BatchLoaderFn, CacheTier, LoaderFn};

const DEFAULT_EXPIRE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_KEY_PREFIX: &str = "memory-cache:{}";

/// Configuration mirroring `memorycache.go`'s functional options.
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    pub expire: Duration,
    pub key_prefix: String,
    pub strategy: Strategy,
    pub max_capacity: u64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            expire: DEFAULT_EXPIRE,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            strategy: Strategy::Retry,
            max_capacity: 100_000,
        }
    }
}

struct Mutable {
    key_prefix: String,
    loader: Option<LoaderFn>,
    batch_loader: Option<BatchLoaderFn>,
}

/// The in-process memory tier.
pub struct MemoryTier {
    cache: Cache<String, String>,
    strategy: Strategy,
    mutable: RwLock<Mutable>,
}

impl MemoryTier {
    pub fn new(config: MemoryTierConfig) -> Result<Self> {
        validate_key_prefix(&config.key_prefix)?;
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.expire)
            .build();
        Ok(Self {
            cache,
            strategy: config.strategy,
            mutable: RwLock::new(Mutable {
                key_prefix: config.key_prefix,
                loader: None,
                batch_loader: None,
            }),
        })
    }

    fn physical_key(&self, key: &str) -> String {
        format_key(&self.mutable.read().key_prefix, key)
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    async fn get_from_cache(&self, key: &str) -> GetCacheResult {
        let physical = self.physical_key(key);
        match self.cache.get(&physical).await {
            Some(value) => GetCacheResult::hit(value),
            None => GetCacheResult::miss(self.strategy),
        }
    }

    async fn batch_get_from_cache(&self, keys: &[String]) -> HashMap<String, GetCacheResult> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            out.insert(key.clone(), self.get_from_cache(key).await);
        }
        out
    }

    async fn set_cache(&self, key: &str, value: &str) -> SetCacheResult {
        let physical = self.physical_key(key);
        self.cache.insert(physical, value.to_string()).await;
        SetCacheResult::ok()
    }

    async fn batch_set_cache(&self, entries: &[(String, String)]) -> HashMap<String, SetCacheResult> {
        let mut out = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            out.insert(key.clone(), self.set_cache(key, value).await);
        }
        out
    }

    async fn clear_cache(&self, key: &str) -> ClearCacheResult {
        let physical = self.physical_key(key);
        self.cache.remove(&physical).await;
        ClearCacheResult::ok()
    }

    async fn batch_clear_cache(&self, keys: &[String]) -> HashMap<String, ClearCacheResult> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            out.insert(key.clone(), self.clear_cache(key).await);
        }
        out
    }

    // §9 Open Question: Retry* are placeholders returning Break, preserved
    // verbatim from the source's TODO stubs.
    async fn retry_get_from_cache(&self, _key: &str) -> GetCacheResult {
        GetCacheResult::err(CacheError::Kv("retry not implemented".into()), Strategy::Break)
    }

    async fn retry_set_cache(&self, _key: &str, _value: &str) -> SetCacheResult {
        SetCacheResult::err(CacheError::Kv("retry not implemented".into()), Strategy::Break)
    }

    async fn retry_clear_cache(&self, _key: &str) -> ClearCacheResult {
        ClearCacheResult::err(CacheError::Kv("retry not implemented".into()), Strategy::Break)
    }

    fn get_name(&self) -> &'static str {
        "memory"
    }

    fn set_fn_get_no_cache(&self, fn_: LoaderFn) {
        self.mutable.write().loader = Some(fn_);
    }

    fn set_fn_batch_get_no_cache(&self, fn_: BatchLoaderFn) {
        self.mutable.write().batch_loader = Some(fn_);
    }

    fn set_key_prefix(&self, prefix: &str) -> Result<()> {
        validate_key_prefix(prefix)?;
        self.mutable.write().key_prefix = prefix.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_then_set_then_hit() {
        let tier = MemoryTier::new(MemoryTierConfig::default()).unwrap();
        let miss = tier.get_from_cache("k1").await;
        assert!(!miss.exist);

        tier.set_cache("k1", "v1").await;
        let hit = tier.get_from_cache("k1").await;
        assert_eq!(hit.value.as_deref(), Some("v1"));
        assert!(hit.exist);
    }

    #[tokio::test]
    async fn clear_removes_value() {
        let tier = MemoryTier::new(MemoryTierConfig::default()).unwrap();
        tier.set_cache("k1", "v1").await;
        tier.clear_cache("k1").await;
        let miss = tier.get_from_cache("k1").await;
        assert!(!miss.exist);
    }

    #[tokio::test]
    async fn retry_variants_default_to_break() {
        let tier = MemoryTier::new(MemoryTierConfig::default()).unwrap();
        assert_eq!(tier.retry_get_from_cache("k").await.strategy, Strategy::Break);
        assert_eq!(tier.retry_set_cache("k", "v").await.strategy, Strategy::Break);
        assert_eq!(tier.retry_clear_cache("k").await.strategy, Strategy::Break);
    }

    #[test]
    fn rejects_malformed_key_prefix() {
        let mut config = MemoryTierConfig::default();
        config.key_prefix = "no-placeholder".to_string();
        assert!(MemoryTier::new(config).is_err());

        let mut config = MemoryTierConfig::default();
        config.key_prefix = "{}-and-{}".to_string();
        assert!(MemoryTier::new(config).is_err());
    }
}
