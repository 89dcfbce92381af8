//! Cache chain orchestrator (§4.F).
//!
//! Walks an ordered list of tiers for each operation, applying the
//! `Strategy` each tier reports on error, and falls back to the
//! caller-supplied loader once every tier has been exhausted. Grounded on
//! `original_source/cachechain/chain.go`'s `Get`; `BatchGet`/`Set`/
//! `BatchSet`/`Clear`/`BatchClear` generalize the same dispatch over
//! `cachechain/cache/interface.go`'s full `CacheInterface` surface, which
//! the original only stubs out in comments.
//!
//! The source's `IsSuccess()` check folds "no error" and "cache hit"
//! together, so a plain miss (empty value, no error) short-circuits the
//! chain instead of falling through to the next tier. This crate treats a
//! tier result as chain-terminating only when it is both error-free *and*
//! `exist`; a clean miss (no error, not `exist`) always falls through to the
//! next tier regardless of the tier's `Strategy` — `Strategy` dispatch
//! applies only when the tier reports an error. See DESIGN.md's Open
//! Question log.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{CacheError, Result, Strategy};
use crate::tiers::{BatchLoaderFn, CacheTier, LoaderFn};

/// The result of a chain-level `Get`, naming which tier (if any) served it.
#[derive(Debug, Clone)]
pub struct ChainGetResult {
    pub value: Option<String>,
    pub exist: bool,
    pub from_cache: bool,
    pub cache_name: Option<&'static str>,
    pub error: Option<CacheError>,
}

impl ChainGetResult {
    fn from_tier_hit(name: &'static str, value: String) -> Self {
        Self {
            value: Some(value),
            exist: true,
            from_cache: true,
            cache_name: Some(name),
            error: None,
        }
    }

    fn from_loader(value: Result<String>) -> Self {
        match value {
            Ok(v) => Self {
                value: Some(v),
                exist: true,
                from_cache: false,
                cache_name: None,
                error: None,
            },
            Err(e) => Self {
                value: None,
                exist: false,
                from_cache: false,
                cache_name: None,
                error: Some(e),
            },
        }
    }

    fn error(error: CacheError) -> Self {
        Self {
            value: None,
            exist: false,
            from_cache: false,
            cache_name: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChainSetResult {
    pub error: Option<CacheError>,
}

#[derive(Debug, Clone, Default)]
pub struct ChainClearResult {
    pub error: Option<CacheError>,
}

/// Whether a lower-tier hit is promoted (written back) into every tier
/// ahead of it in the chain. Off by default, matching the source, which
/// does not implement write-back either (§9 open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteBack {
    Disabled,
    Enabled,
}

pub struct CacheChain {
    tiers: Vec<Arc<dyn CacheTier>>,
    loader: RwLock<Option<LoaderFn>>,
    batch_loader: RwLock<Option<BatchLoaderFn>>,
    write_back: WriteBack,
}

impl CacheChain {
    pub fn new() -> Self {
        Self {
            tiers: Vec::new(),
            loader: RwLock::new(None),
            batch_loader: RwLock::new(None),
            write_back: WriteBack::Disabled,
        }
    }

    /// Enable write-back: a hit at tier `i` is copied into every tier
    /// `0..i` so the next lookup is served from the fastest tier.
    pub fn with_write_back(mut self) -> Self {
        self.write_back = WriteBack::Enabled;
        self
    }

    /// Append a tier, propagating whatever loader/batch loader is already
    /// registered on the chain.
    pub fn with_tier(self, tier: Arc<dyn CacheTier>) -> Self {
        if let Some(loader) = self.loader.read().clone() {
            tier.set_fn_get_no_cache(loader);
        }
        if let Some(batch_loader) = self.batch_loader.read().clone() {
            tier.set_fn_batch_get_no_cache(batch_loader);
        }
        let mut chain = self;
        chain.tiers.push(tier);
        chain
    }

    pub fn set_fn_get_no_cache(&self, fn_: LoaderFn) {
        for tier in &self.tiers {
            tier.set_fn_get_no_cache(fn_.clone());
        }
        *self.loader.write() = Some(fn_);
    }

    pub fn set_fn_batch_get_no_cache(&self, fn_: BatchLoaderFn) {
        for tier in &self.tiers {
            tier.set_fn_batch_get_no_cache(fn_.clone());
        }
        *self.batch_loader.write() = Some(fn_);
    }

    pub fn set_key_prefix(&self, prefix: &str) -> Result<()> {
        for tier in &self.tiers {
            tier.set_key_prefix(prefix)?;
        }
        Ok(())
    }

    async fn call_loader(&self, key: &str) -> Result<String> {
        let loader = self.loader.read().clone();
        match loader {
            Some(loader) => loader(key.to_string()).await,
            None => Err(CacheError::Loader(format!(
                "no loader registered for key {key}"
            ))),
        }
    }

    async fn call_batch_loader(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let loader = self.batch_loader.read().clone();
        match loader {
            Some(loader) => loader(keys.to_vec()).await,
            None => Err(CacheError::Loader(
                "no batch loader registered for chain".into(),
            )),
        }
    }

    async fn promote(&self, up_to: usize, key: &str, value: &str) {
        if self.write_back == WriteBack::Disabled {
            return;
        }
        for tier in &self.tiers[..up_to] {
            let result = tier.set_cache(key, value).await;
            if let Some(e) = result.error {
                warn!(tier = tier.get_name(), error = %e, "write-back promotion failed");
            }
        }
    }

    /// §4.F `Get`: iterate tiers, applying each one's strategy on a
    /// non-hit; fall back to the loader once every tier is exhausted.
    pub async fn get(&self, key: &str) -> ChainGetResult {
        if self.tiers.is_empty() {
            return ChainGetResult::error(CacheError::NoCacheSet);
        }

        for (idx, tier) in self.tiers.iter().enumerate() {
            let mut result = tier.get_from_cache(key).await;
            if result.error.is_none() && result.exist {
                if let Some(value) = result.value.clone() {
                    self.promote(idx, key, &value).await;
                }
                return ChainGetResult::from_tier_hit(tier.get_name(), result.value.unwrap_or_default());
            }

            // A clean miss (no error) always falls through to the next
            // tier; strategy dispatch applies only when the tier reports an
            // error.
            if result.error.is_none() {
                continue;
            }

            match result.strategy {
                Strategy::Continue | Strategy::Rollback => continue,
                Strategy::Break => {
                    return ChainGetResult::error(
                        result.error.unwrap_or(CacheError::Kv("tier reported break with no error".into())),
                    );
                }
                Strategy::Retry => {
                    result = tier.retry_get_from_cache(key).await;
                    if result.error.is_none() && result.exist {
                        if let Some(value) = result.value.clone() {
                            self.promote(idx, key, &value).await;
                        }
                        return ChainGetResult::from_tier_hit(
                            tier.get_name(),
                            result.value.unwrap_or_default(),
                        );
                    }
                    if result.strategy == Strategy::Break {
                        if let Some(e) = result.error {
                            return ChainGetResult::error(e);
                        }
                    }
                }
            }
        }

        ChainGetResult::from_loader(self.call_loader(key).await)
    }

    /// §4.F `BatchGet`: per the expansion, keys unresolved after one tier
    /// are carried to the next; the chain's batch loader resolves whatever
    /// remains once every tier has had a turn.
    pub async fn batch_get(&self, keys: &[String]) -> HashMap<String, ChainGetResult> {
        let mut results = HashMap::with_capacity(keys.len());
        if self.tiers.is_empty() {
            for key in keys {
                results.insert(key.clone(), ChainGetResult::error(CacheError::NoCacheSet));
            }
            return results;
        }

        let mut pending: Vec<String> = keys.to_vec();

        for (idx, tier) in self.tiers.iter().enumerate() {
            if pending.is_empty() {
                break;
            }
            let tier_results = tier.batch_get_from_cache(&pending).await;
            let mut next_pending = Vec::new();

            for key in pending {
                let Some(mut result) = tier_results.get(&key).cloned() else {
                    next_pending.push(key);
                    continue;
                };

                if result.error.is_none() && result.exist {
                    if let Some(value) = result.value.clone() {
                        self.promote(idx, &key, &value).await;
                    }
                    results.insert(
                        key,
                        ChainGetResult::from_tier_hit(tier.get_name(), result.value.unwrap_or_default()),
                    );
                    continue;
                }

                // A clean miss (no error) always falls through to the next
                // tier; strategy dispatch applies only when the tier
                // reports an error.
                if result.error.is_none() {
                    next_pending.push(key);
                    continue;
                }

                match result.strategy {
                    Strategy::Continue | Strategy::Rollback => next_pending.push(key),
                    Strategy::Break => {
                        results.insert(
                            key,
                            ChainGetResult::error(
                                result
                                    .error
                                    .unwrap_or(CacheError::Kv("tier reported break with no error".into())),
                            ),
                        );
                    }
                    Strategy::Retry => {
                        result = tier.retry_get_from_cache(&key).await;
                        if result.error.is_none() && result.exist {
                            if let Some(value) = result.value.clone() {
                                self.promote(idx, &key, &value).await;
                            }
                            results.insert(
                                key,
                                ChainGetResult::from_tier_hit(
                                    tier.get_name(),
                                    result.value.unwrap_or_default(),
                                ),
                            );
                        } else if result.strategy == Strategy::Break {
                            if let Some(e) = result.error {
                                results.insert(key, ChainGetResult::error(e));
                            } else {
                                next_pending.push(key);
                            }
                        } else {
                            next_pending.push(key);
                        }
                    }
                }
            }

            pending = next_pending;
        }

        if !pending.is_empty() {
            match self.call_batch_loader(&pending).await {
                Ok(mut values) => {
                    for key in pending {
                        match values.remove(&key) {
                            Some(value) => {
                                results.insert(key, ChainGetResult::from_loader(Ok(value)));
                            }
                            None => {
                                results.insert(
                                    key.clone(),
                                    ChainGetResult::error(CacheError::Loader(format!(
                                        "batch loader did not return a value for {key}"
                                    ))),
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    for key in pending {
                        results.insert(key, ChainGetResult::error(e.clone()));
                    }
                }
            }
        }

        results
    }

    /// §4.F `Set`: applied to every tier in order, short-circuiting on the
    /// first `Break`-strategy failure.
    pub async fn set(&self, key: &str, value: &str) -> ChainSetResult {
        for tier in &self.tiers {
            let result = tier.set_cache(key, value).await;
            if let Some(e) = result.error {
                if result.strategy == Strategy::Break {
                    return ChainSetResult { error: Some(e) };
                }
                warn!(tier = tier.get_name(), error = %e, "set_cache failed, continuing");
            }
        }
        ChainSetResult::default()
    }

    pub async fn batch_set(&self, entries: &[(String, String)]) -> HashMap<String, ChainSetResult> {
        let mut results = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            results.insert(key.clone(), self.set(key, value).await);
        }
        results
    }

    pub async fn clear(&self, key: &str) -> ChainClearResult {
        for tier in &self.tiers {
            let result = tier.clear_cache(key).await;
            if let Some(e) = result.error {
                if result.strategy == Strategy::Break {
                    return ChainClearResult { error: Some(e) };
                }
                warn!(tier = tier.get_name(), error = %e, "clear_cache failed, continuing");
            }
        }
        ChainClearResult::default()
    }

    pub async fn batch_clear(&self, keys: &[String]) -> HashMap<String, ChainClearResult> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            results.insert(key.clone(), self.clear(key).await);
        }
        results
    }
}

impl Default for CacheChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::testing::InMemoryKv;
    use crate::tiers::kv_tier::{KvTier, KvTierConfig};
    use crate::tiers::memory::{MemoryTier, MemoryTierConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn empty_chain_reports_no_cache_set() {
        let chain = CacheChain::new();
        let result = chain.get("k").await;
        assert!(matches!(result.error, Some(CacheError::NoCacheSet)));
    }

    #[tokio::test]
    async fn falls_through_memory_miss_to_loader() {
        let memory = Arc::new(MemoryTier::new(MemoryTierConfig::default()).unwrap());
        let chain = CacheChain::new().with_tier(memory);
        chain.set_fn_get_no_cache(Arc::new(|key| {
            Box::pin(async move { Ok(format!("loaded-{key}")) })
        }));

        let result = chain.get("k1").await;
        assert_eq!(result.value.as_deref(), Some("loaded-k1"));
        assert!(!result.from_cache);
    }

    #[tokio::test]
    async fn falls_through_memory_to_kv_tier_hit() {
        let memory = Arc::new(MemoryTier::new(MemoryTierConfig::default()).unwrap());
        let kv = Arc::new(InMemoryKv::new());
        let kv_tier = Arc::new(KvTier::new(kv, KvTierConfig::default()).unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        kv_tier.set_fn_get_no_cache(Arc::new(move |_key| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("from-db".to_string())
            })
        }));

        let chain = CacheChain::new().with_tier(memory).with_tier(kv_tier);
        let result = chain.get("k1").await;
        assert_eq!(result.value.as_deref(), Some("from-db"));
        assert_eq!(result.cache_name, Some("kv"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_back_promotes_lower_tier_hit() {
        let memory = Arc::new(MemoryTier::new(MemoryTierConfig::default()).unwrap());
        let kv = Arc::new(InMemoryKv::new());
        let kv_tier = Arc::new(KvTier::new(kv, KvTierConfig::default()).unwrap());
        kv_tier.set_fn_get_no_cache(Arc::new(|_key| {
            Box::pin(async move { Ok("from-db".to_string()) })
        }));

        let chain = CacheChain::new()
            .with_tier(memory.clone())
            .with_tier(kv_tier)
            .with_write_back();
        chain.get("k1").await;

        let promoted = memory.get_from_cache("k1").await;
        assert_eq!(promoted.value.as_deref(), Some("from-db"));
    }

    #[tokio::test]
    async fn batch_get_resolves_across_tiers_and_loader() {
        let memory = Arc::new(MemoryTier::new(MemoryTierConfig::default()).unwrap());
        memory.set_cache("cached", "already-here").await;
        let chain = CacheChain::new().with_tier(memory);
        chain.set_fn_batch_get_no_cache(Arc::new(|keys| {
            Box::pin(async move {
                Ok(keys
                    .into_iter()
                    .map(|k| (k.clone(), format!("loaded-{k}")))
                    .collect())
            })
        }));

        let results = chain
            .batch_get(&["cached".to_string(), "missing".to_string()])
            .await;
        assert_eq!(results["cached"].value.as_deref(), Some("already-here"));
        assert_eq!(results["missing"].value.as_deref(), Some("loaded-missing"));
    }

    #[tokio::test]
    async fn set_and_clear_apply_to_every_tier() {
        let memory = Arc::new(MemoryTier::new(MemoryTierConfig::default()).unwrap());
        memory.set_cache("k1", "v1").await;
        let chain = CacheChain::new().with_tier(memory.clone());

        chain.set("k1", "v2").await;
        // MemoryTier's set_cache is a true write-through (unlike kv_tier's
        // del-only Set), so the value is now v2.
        assert_eq!(memory.get_from_cache("k1").await.value.as_deref(), Some("v2"));

        chain.clear("k1").await;
        assert!(!memory.get_from_cache("k1").await.exist);
    }
}
