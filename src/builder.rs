//! Cache chain builder
//!
//! A fluent builder for assembling a [`CacheChain`] from concrete tiers,
//! modeled on the teacher crate's `CacheSystemBuilder` (`with_*` methods
//! returning `Self`, a terminal `build()`), generalized from that builder's
//! fixed L1/L2 shape to an arbitrary ordered tier list.
//!
//! # Example
//!
//! ```rust,no_run
//! use cache_chain::{CacheChainBuilder, MemoryTierConfig, KvTierConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let kv = Arc::new(cache_chain::NoopKv);
//! let chain = CacheChainBuilder::new()
//!     .with_memory_tier(MemoryTierConfig::default())?
//!     .with_kv_tier(kv, KvTierConfig::default())?
//!     .with_write_back()
//!     .build();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::chain::CacheChain;
use crate::error::Result;
use crate::kv::SharedKv;
use crate::tiers::kv_tier::{KvTier, KvTierConfig};
use crate::tiers::memory::{MemoryTier, MemoryTierConfig};
use crate::tiers::CacheTier;

/// Builder for constructing a [`CacheChain`] from concrete tiers.
pub struct CacheChainBuilder {
    chain: CacheChain,
}

impl CacheChainBuilder {
    pub fn new() -> Self {
        Self {
            chain: CacheChain::new(),
        }
    }

    /// Append the in-process memory tier.
    pub fn with_memory_tier(self, config: MemoryTierConfig) -> Result<Self> {
        let tier: Arc<dyn CacheTier> = Arc::new(MemoryTier::new(config)?);
        Ok(self.with_tier(tier))
    }

    /// Append the shared-KV tier backed by `kv`.
    pub fn with_kv_tier<K: SharedKv + 'static>(self, kv: Arc<K>, config: KvTierConfig) -> Result<Self> {
        let tier: Arc<dyn CacheTier> = Arc::new(KvTier::new(kv, config)?);
        Ok(self.with_tier(tier))
    }

    /// Append an arbitrary tier, for callers providing their own
    /// [`CacheTier`] implementation.
    pub fn with_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.chain = self.chain.with_tier(tier);
        self
    }

    /// Enable write-back promotion of lower-tier hits into earlier tiers.
    pub fn with_write_back(mut self) -> Self {
        self.chain = self.chain.with_write_back();
        self
    }

    pub fn build(self) -> CacheChain {
        self.chain
    }
}

impl Default for CacheChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::testing::InMemoryKv;

    #[tokio::test]
    async fn builds_a_two_tier_chain() {
        let kv = Arc::new(InMemoryKv::new());
        let chain = CacheChainBuilder::new()
            .with_memory_tier(MemoryTierConfig::default())
            .unwrap()
            .with_kv_tier(kv, KvTierConfig::default())
            .unwrap()
            .build();

        chain.set_fn_get_no_cache(Arc::new(|key| {
            Box::pin(async move { Ok(format!("v-{key}")) })
        }));

        let result = chain.get("k1").await;
        assert_eq!(result.value.as_deref(), Some("v-k1"));
    }

    #[test]
    fn rejects_malformed_memory_tier_prefix() {
        let mut config = MemoryTierConfig::default();
        config.key_prefix = "no-placeholder".to_string();
        assert!(CacheChainBuilder::new().with_memory_tier(config).is_err());
    }
}
