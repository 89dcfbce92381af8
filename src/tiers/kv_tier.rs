//! Shared-KV tier with single-flight CAS token coordination (§4.E).
//!
//! The hardest component: a CAS-based state machine (DoReadDB / Wait / OK)
//! that guarantees at most one loader execution per key across all
//! participants, grounded on `original_source/cachechain/cache/rediscache.go`.
//!
//! The DoReadDB/Wait/OK resolution loop described in §4.E.4 as "chain-level"
//! is implemented here, inside the tier, because [`CacheTier`]'s uniform
//! `GetCacheResult` return type carries no token for an outer orchestrator to
//! drive — see DESIGN.md Open Question 1.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::error::{CacheError, ClearCacheResult, GetCacheResult, Result, SetCacheResult, Strategy};
use crate::kv::SharedKv;
use crate::retry::backoff::RetryConfig;
use crate::tiers::{format_key, validate_key_prefix, BatchLoaderFn, CacheTier, LoaderFn};

const BATCH_CHUNK: usize = 1000;
const BATCH_CONCURRENCY: usize = 64;

/// Configuration for the shared-KV tier.
#[derive(Debug, Clone)]
pub struct KvTierConfig {
    pub key_prefix: String,
    pub token_prefix: String,
    pub expire: Duration,
    pub max_waiting_loop: u32,
    pub strategy: Strategy,
}

impl Default for KvTierConfig {
    fn default() -> Self {
        Self {
            key_prefix: "cache:{}".to_string(),
            token_prefix: "cache-token".to_string(),
            expire: Duration::from_secs(7 * 24 * 60 * 60),
            max_waiting_loop: 20,
            strategy: Strategy::Retry,
        }
    }
}

struct Mutable {
    key_prefix: String,
    loader: Option<LoaderFn>,
    batch_loader: Option<BatchLoaderFn>,
}

/// Internal classification of a key after a CAS round (§4.E.2).
enum Outcome {
    Ok(String),
    DoReadDb(String),
    Wait,
}

pub struct KvTier<K: SharedKv> {
    kv: Arc<K>,
    token_prefix: String,
    expire: Duration,
    max_waiting_loop: u32,
    strategy: Strategy,
    mutable: RwLock<Mutable>,
}

impl<K: SharedKv> KvTier<K> {
    pub fn new(kv: Arc<K>, config: KvTierConfig) -> Result<Self> {
        validate_key_prefix(&config.key_prefix)?;
        Ok(Self {
            kv,
            token_prefix: config.token_prefix,
            expire: config.expire,
            max_waiting_loop: config.max_waiting_loop,
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

    fn generate_token(&self) -> String {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let expire_unix = unix_now() + self.expire.as_secs() as i64;
        format!("{}@{}{}@{}", self.token_prefix, uuid, millis, expire_unix)
    }

    fn token_header(&self) -> String {
        format!("{}@", self.token_prefix)
    }

    /// Classify the pre-image string returned by a CAS win attempt, shared
    /// by the single-get and batch-get paths. A stale token triggers a
    /// best-effort CAS-clear before falling through to `Wait` (§4.E.2).
    async fn classify_cas_preimage(&self, physical_key: &str, preimage: String) -> Result<Outcome> {
        if preimage.is_empty() {
            return Ok(Outcome::DoReadDb(preimage));
        }
        if let Some(rest) = preimage.strip_prefix(&self.token_header()) {
            match parse_token_expiry(rest) {
                None => Err(CacheError::TokenInvalid(preimage)),
                Some(expire) if expire < unix_now() => {
                    let _ = self.kv.cas(physical_key, &preimage, "", self.expire).await;
                    Ok(Outcome::Wait)
                }
                Some(_) => Ok(Outcome::Wait),
            }
        } else {
            Ok(Outcome::Ok(preimage))
        }
    }

    /// §4.E.2 single get protocol: classify the current slot, winning a CAS
    /// if the slot is empty or holds a (possibly stale) token.
    async fn single_get_protocol(&self, physical_key: &str) -> Result<Outcome> {
        if let Some(value) = self.kv.get(physical_key).await? {
            if !value.starts_with(&self.token_header()) {
                return Ok(Outcome::Ok(value));
            }
        }

        let new_token = self.generate_token();
        let preimage = self
            .kv
            .cas(physical_key, "", &new_token, self.expire)
            .await?;

        if preimage.is_empty() {
            return Ok(Outcome::DoReadDb(new_token));
        }
        self.classify_cas_preimage(physical_key, preimage).await
    }

    async fn call_loader(&self, key: &str) -> Result<String> {
        let loader = self.mutable.read().loader.clone();
        match loader {
            Some(loader) => loader(key.to_string()).await,
            None => Err(CacheError::Loader(format!(
                "no loader registered for key {key}"
            ))),
        }
    }

    async fn call_batch_loader(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let batch_loader = self.mutable.read().batch_loader.clone();
        match batch_loader {
            Some(loader) => loader(keys.to_vec()).await,
            None => {
                // Fall back to per-key loader calls, concurrently.
                let loader = self.mutable.read().loader.clone().ok_or_else(|| {
                    CacheError::Loader("no loader registered for batch get".into())
                })?;
                let results: Vec<(String, Result<String>)> = stream::iter(keys.to_vec())
                    .map(|k| {
                        let loader = loader.clone();
                        async move {
                            let v = loader(k.clone()).await;
                            (k, v)
                        }
                    })
                    .buffer_unordered(BATCH_CONCURRENCY)
                    .collect()
                    .await;
                let mut out = HashMap::with_capacity(results.len());
                let mut first_err = None;
                for (k, v) in results {
                    match v {
                        Ok(value) => {
                            out.insert(k, value);
                        }
                        Err(e) => first_err = Some(CacheError::join_opt(first_err, e)),
                    }
                }
                if let Some(e) = first_err {
                    return Err(e);
                }
                Ok(out)
            }
        }
    }

    async fn resolve_do_read_db(&self, key: &str, physical: &str, token: &str) -> GetCacheResult {
        match self.call_loader(key).await {
            Err(e) => {
                let release_err = self.kv.cas(physical, token, "", self.expire).await.err();
                let joined = CacheError::join_opt(release_err, e);
                GetCacheResult::err(joined, self.strategy)
            }
            Ok(value) => match self.kv.cas(physical, token, &value, self.expire).await {
                Ok(_) => GetCacheResult::hit(value),
                Err(commit_err) => GetCacheResult {
                    value: Some(value),
                    exist: true,
                    error: Some(commit_err),
                    strategy: self.strategy,
                },
            },
        }
    }

    async fn escalate_to_direct_load(&self, key: &str, physical: &str) -> GetCacheResult {
        warn!(key = %key, "waiting loop exhausted, escalating to direct loader call");
        match self.call_loader(key).await {
            Err(e) => GetCacheResult::err(e, Strategy::Break),
            Ok(value) => {
                let _ = self.kv.cas(physical, "", &value, self.expire).await;
                GetCacheResult::hit(value)
            }
        }
    }

    fn waiting_delay(loop_n: u32) -> Duration {
        let exp = 10u64.saturating_pow(loop_n.saturating_sub(1));
        Duration::from_millis(20 + exp)
    }
}

fn parse_token_expiry(rest: &str) -> Option<i64> {
    // rest = "<uuid><millis>@<expireUnixSeconds>"; only the trailing
    // expiry is load-bearing for staleness checks.
    let (_, expire_str) = rest.rsplit_once('@')?;
    expire_str.parse().ok()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl<K: SharedKv> CacheTier for KvTier<K> {
    async fn get_from_cache(&self, key: &str) -> GetCacheResult {
        let physical = self.physical_key(key);
        let mut loop_n: u32 = 1;
        loop {
            match self.single_get_protocol(&physical).await {
                Err(e) => return GetCacheResult::err(e, self.strategy),
                Ok(Outcome::Ok(value)) => return GetCacheResult::hit(value),
                Ok(Outcome::DoReadDb(token)) => {
                    return self.resolve_do_read_db(key, &physical, &token).await;
                }
                Ok(Outcome::Wait) => {
                    if loop_n >= self.max_waiting_loop {
                        return self.escalate_to_direct_load(key, &physical).await;
                    }
                    tokio::time::sleep(Self::waiting_delay(loop_n)).await;
                    loop_n += 1;
                }
            }
        }
    }

    async fn batch_get_from_cache(&self, keys: &[String]) -> HashMap<String, GetCacheResult> {
        let mut results = HashMap::with_capacity(keys.len());
        let mut do_read_db: Vec<(String, String, String)> = Vec::new(); // (logical, physical, token)
        let mut wait_keys: Vec<String> = Vec::new();

        for chunk in keys.chunks(BATCH_CHUNK) {
            let gets: Vec<(String, String, Result<Option<String>>)> = stream::iter(chunk.to_vec())
                .map(|k| {
                    let physical = self.physical_key(&k);
                    async move {
                        let v = self.kv.get(&physical).await;
                        (k, physical, v)
                    }
                })
                .buffer_unordered(BATCH_CONCURRENCY)
                .collect()
                .await;

            let mut candidates: Vec<(String, String, String)> = Vec::new(); // (logical, physical, new_token)
            for (logical, physical, get_result) in gets {
                match get_result {
                    Err(e) => {
                        results.insert(logical, GetCacheResult::err(e, self.strategy));
                    }
                    Ok(Some(value)) if !value.starts_with(&self.token_header()) => {
                        results.insert(logical, GetCacheResult::hit(value));
                    }
                    Ok(_) => {
                        let token = self.generate_token();
                        candidates.push((logical, physical, token));
                    }
                }
            }

            if candidates.is_empty() {
                continue;
            }

            let cas_calls: Vec<(String, String, String, Duration)> = candidates
                .iter()
                .map(|(_, physical, token)| {
                    (physical.clone(), String::new(), token.clone(), self.expire)
                })
                .collect();
            let cas_results = match self.kv.cas_batch(&cas_calls).await {
                Ok(r) => r,
                Err(e) => {
                    for (logical, _, _) in &candidates {
                        results.insert(logical.clone(), GetCacheResult::err(e.clone(), self.strategy));
                    }
                    continue;
                }
            };

            for ((logical, physical, token), (_, cas_result)) in
                candidates.into_iter().zip(cas_results.into_iter())
            {
                let preimage = match cas_result {
                    Ok(p) => p,
                    Err(e) => {
                        results.insert(logical, GetCacheResult::err(e, self.strategy));
                        continue;
                    }
                };
                if preimage.is_empty() {
                    do_read_db.push((logical, physical, token));
                    continue;
                }
                match self.classify_cas_preimage(&physical, preimage).await {
                    Err(e) => {
                        results.insert(logical, GetCacheResult::err(e, self.strategy));
                    }
                    Ok(Outcome::DoReadDb(_)) => do_read_db.push((logical, physical, token)),
                    Ok(Outcome::Wait) => wait_keys.push(logical),
                    Ok(Outcome::Ok(value)) => {
                        results.insert(logical, GetCacheResult::hit(value));
                    }
                }
            }
        }

        if !do_read_db.is_empty() {
            let logical_keys: Vec<String> = do_read_db.iter().map(|(k, _, _)| k.clone()).collect();
            match self.call_batch_loader(&logical_keys).await {
                Err(e) => {
                    for (logical, physical, token) in &do_read_db {
                        let release_err = self.kv.cas(physical, token, "", self.expire).await.err();
                        let joined = CacheError::join_opt(release_err, e.clone());
                        results.insert(logical.clone(), GetCacheResult::err(joined, self.strategy));
                    }
                }
                Ok(mut values) => {
                    for (logical, physical, token) in do_read_db {
                        match values.remove(&logical) {
                            None => {
                                let release_err =
                                    self.kv.cas(&physical, &token, "", self.expire).await.err();
                                let joined = CacheError::join_opt(
                                    release_err,
                                    CacheError::Loader(format!(
                                        "batch loader did not return a value for {logical}"
                                    )),
                                );
                                results.insert(logical, GetCacheResult::err(joined, self.strategy));
                            }
                            Some(value) => {
                                match self.kv.cas(&physical, &token, &value, self.expire).await {
                                    Ok(_) => {
                                        results.insert(logical, GetCacheResult::hit(value));
                                    }
                                    Err(commit_err) => {
                                        results.insert(
                                            logical,
                                            GetCacheResult {
                                                value: Some(value),
                                                exist: true,
                                                error: Some(commit_err),
                                                strategy: self.strategy,
                                            },
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        // Wait keys resolve independently, reusing the single-key protocol's
        // own waiting loop (§4.E.3 "preserves per-key independence").
        if !wait_keys.is_empty() {
            let resolved: Vec<(String, GetCacheResult)> = stream::iter(wait_keys)
                .map(|k| async move { (k.clone(), self.get_from_cache(&k).await) })
                .buffer_unordered(BATCH_CONCURRENCY)
                .collect()
                .await;
            for (k, r) in resolved {
                results.insert(k, r);
            }
        }

        results
    }

    async fn set_cache(&self, key: &str, _value: &str) -> SetCacheResult {
        // §9: `SetCache` on the source's Redis tier performs `Del`, not a
        // write-through. Preserved: a mutator cannot safely overwrite a slot
        // that may hold a peer's in-flight token.
        let physical = self.physical_key(key);
        match self.kv.del(&[physical]).await {
            Ok(()) => SetCacheResult::ok(),
            Err(e) => SetCacheResult::err(e, self.strategy),
        }
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
        match self.kv.del(&[physical]).await {
            Ok(()) => ClearCacheResult::ok(),
            Err(e) => ClearCacheResult::err(e, self.strategy),
        }
    }

    async fn batch_clear_cache(&self, keys: &[String]) -> HashMap<String, ClearCacheResult> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            out.insert(key.clone(), self.clear_cache(key).await);
        }
        out
    }

    // §9 Open Question: a bounded exponential-backoff retry atop the same
    // CAS primitive, preserving Break as what the caller sees if it too
    // exhausts.
    async fn retry_get_from_cache(&self, key: &str) -> GetCacheResult {
        let config = RetryConfig::new(3, Duration::from_millis(100)).with_exponential(true);
        let result = crate::retry::backoff::do_retry_return(config, || async {
            let r = self.get_from_cache(key).await;
            if r.is_success() {
                Ok(r)
            } else {
                Err(r.error.clone().unwrap_or(CacheError::Kv("retry failed".into())))
            }
        })
        .await;
        match result {
            Ok(r) => r,
            Err(e) => GetCacheResult::err(e, Strategy::Break),
        }
    }

    async fn retry_set_cache(&self, key: &str, value: &str) -> SetCacheResult {
        let config = RetryConfig::new(3, Duration::from_millis(100)).with_exponential(true);
        let result = crate::retry::backoff::do_retry_return(config, || async {
            let r = self.set_cache(key, value).await;
            if r.is_success() {
                Ok(r)
            } else {
                Err(r.error.clone().unwrap_or(CacheError::Kv("retry failed".into())))
            }
        })
        .await;
        match result {
            Ok(r) => r,
            Err(e) => SetCacheResult::err(e, Strategy::Break),
        }
    }

    async fn retry_clear_cache(&self, key: &str) -> ClearCacheResult {
        let config = RetryConfig::new(3, Duration::from_millis(100)).with_exponential(true);
        let result = crate::retry::backoff::do_retry_return(config, || async {
            let r = self.clear_cache(key).await;
            if r.is_success() {
                Ok(r)
            } else {
                Err(r.error.clone().unwrap_or(CacheError::Kv("retry failed".into())))
            }
        })
        .await;
        match result {
            Ok(r) => r,
            Err(e) => ClearCacheResult::err(e, Strategy::Break),
        }
    }

    fn get_name(&self) -> &'static str {
        "kv"
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
