//! Polymorphic cache tiers (§9): the capability set every tier implements,
//! and the two concrete tiers (memory, shared-KV-with-CAS) the chain
//! orchestrator composes.

pub mod kv_tier;
pub mod memory;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ClearCacheResult, GetCacheResult, Result, SetCacheResult};

/// Loader invoked by a tier when it wins the right to populate a key.
pub type LoaderFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Batch loader invoked by a tier when it wins the right to populate a set
/// of keys at once.
pub type BatchLoaderFn =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<HashMap<String, String>>> + Send + Sync>;

/// The capability set every cache tier implements (§9).
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get_from_cache(&self, key: &str) -> GetCacheResult;
    async fn batch_get_from_cache(&self, keys: &[String]) -> HashMap<String, GetCacheResult>;
    async fn set_cache(&self, key: &str, value: &str) -> SetCacheResult;
    async fn batch_set_cache(&self, entries: &[(String, String)]) -> HashMap<String, SetCacheResult>;
    async fn clear_cache(&self, key: &str) -> ClearCacheResult;
    async fn batch_clear_cache(&self, keys: &[String]) -> HashMap<String, ClearCacheResult>;

    async fn retry_get_from_cache(&self, key: &str) -> GetCacheResult;
    async fn retry_set_cache(&self, key: &str, value: &str) -> SetCacheResult;
    async fn retry_clear_cache(&self, key: &str) -> ClearCacheResult;

    fn get_name(&self) -> &'static str;
    fn set_fn_get_no_cache(&self, fn_: LoaderFn);
    fn set_fn_batch_get_no_cache(&self, fn_: BatchLoaderFn);
    fn set_key_prefix(&self, prefix: &str) -> Result<()>;
}

/// Validate a key-prefix template: exactly one `{}` placeholder (the Rust
/// realization of the source's single-`%s` printf template, §9).
pub fn validate_key_prefix(template: &str) -> Result<()> {
    let count = template.matches("{}").count();
    if count == 1 {
        Ok(())
    } else {
        Err(crate::error::CacheError::Kv(format!(
            "key prefix template must contain exactly one `{{}}` placeholder, found {count}: {template}"
        )))
    }
}

/// Substitute the logical key into a validated prefix template.
pub fn format_key(template: &str, key: &str) -> String {
    template.replacen("{}", key, 1)
}
