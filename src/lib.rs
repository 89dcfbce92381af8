//! Cache Chain
//!
//! A multi-tier cache orchestrator for Rust, featuring:
//! - **Memory tier**: in-process caching with Moka (sub-millisecond latency)
//! - **Shared-KV tier**: Redis-backed caching with CAS-based single-flight
//!   loading (at most one loader execution per key across every participant)
//! - **RESTful pattern finder**: infers `/users/*/profile`-style templates
//!   from observed request paths, grouping siblings that share a next hop
//! - **Durable retry-until-success queue**: a Redis-list-backed work queue
//!   for operations that must eventually succeed
//!
//! # Quick start
//!
//! ```rust,no_run
//! use cache_chain::{CacheChainBuilder, MemoryTierConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let chain = CacheChainBuilder::new()
//!         .with_memory_tier(MemoryTierConfig::default())?
//!         .build();
//!
//!     chain.set_fn_get_no_cache(std::sync::Arc::new(|key| {
//!         Box::pin(async move { Ok(format!("value-for-{key}")) })
//!     }));
//!
//!     let result = chain.get("user:1").await;
//!     println!("{:?}", result.value);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Get(key) -> memory tier -> shared-KV tier (CAS single-flight) -> loader
//!             ^ hit: return   ^ hit: return, no double-load        ^ miss: populate
//! ```

pub mod builder;
pub mod chain;
pub mod error;
pub mod finder;
pub mod kv;
pub mod retry;
pub mod tiers;

pub use builder::CacheChainBuilder;
pub use chain::{CacheChain, ChainClearResult, ChainGetResult, ChainSetResult};
pub use error::{CacheError, ClearCacheResult, GetCacheResult, Result, SetCacheResult, Strategy};
pub use finder::{finder, Finder, UrlWithLabel};
pub use kv::{NoopKv, RedisKv, SharedKv};
pub use retry::backoff::{do_retry, do_retry_return, RetryConfig};
pub use retry::queue::{RetryQueue, RetryTask};
pub use tiers::kv_tier::{KvTier, KvTierConfig};
pub use tiers::memory::{MemoryTier, MemoryTierConfig};
pub use tiers::CacheTier;

pub use async_trait::async_trait;
