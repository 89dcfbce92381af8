//! Shared KV adapter
//!
//! A narrow polymorphic interface over a shared key-value store: `get`,
//! `del`, server-side atomic script evaluation (`eval`), pipelining, and the
//! list primitives (`lpush`/`rpop`) the durable retry queue needs. Tier E's
//! single-flight CAS protocol is built entirely on top of `eval`.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Reply from a server-side script evaluation. Narrow on purpose: the CAS
/// script and the retry-queue's list operations only ever produce a string,
/// nothing, or an integer count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalReply {
    Nil,
    Str(String),
    Int(i64),
}

impl EvalReply {
    pub fn into_string(self) -> String {
        match self {
            EvalReply::Nil => String::new(),
            EvalReply::Str(s) => s,
            EvalReply::Int(i) => i.to_string(),
        }
    }
}

/// The CAS script shared by single-key and pipelined batch callers.
///
/// Returns the pre-image unconditionally; the write only happens when the
/// pre-image equals `ARGV[1]`.
pub const CAS_SCRIPT: &str = r"
local current = redis.call('get', KEYS[1])
if not current then current = '' end
if current == ARGV[1] then
    redis.call('setex', KEYS[1], ARGV[3], ARGV[2])
    return current
else
    return current
end
";

/// A narrow polymorphic shared key-value store.
#[async_trait]
pub trait SharedKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn del(&self, keys: &[String]) -> Result<()>;
    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<EvalReply>;
    async fn lpush(&self, key: &str, value: &str) -> Result<()>;
    async fn rpop(&self, key: &str) -> Result<Option<String>>;

    /// Pipeline a batch of `eval` calls, one per key, returning results
    /// correlated with the key each command was issued against so batch
    /// callers can classify per-key outcomes without losing the mapping.
    async fn pipeline_eval(
        &self,
        script: &str,
        calls: &[(String, Vec<String>)],
    ) -> Result<Vec<(String, Result<EvalReply>)>>;

    /// Convenience wrapper around `eval` for the CAS primitive (§4.E.1):
    /// `cas(key, check, set)` writes `set` with TTL `expire` iff the current
    /// value equals `check`, returning the pre-image unconditionally.
    async fn cas(&self, key: &str, check: &str, set: &str, expire: Duration) -> Result<String> {
        let reply = self
            .eval(
                CAS_SCRIPT,
                &[key.to_string()],
                &[
                    check.to_string(),
                    set.to_string(),
                    expire.as_secs().to_string(),
                ],
            )
            .await?;
        Ok(reply.into_string())
    }

    /// Pipelined CAS for batch candidates (§4.E.3), correlated by key.
    async fn cas_batch(
        &self,
        calls: &[(String, String, String, Duration)],
    ) -> Result<Vec<(String, Result<String>)>> {
        let pipelined: Vec<(String, Vec<String>)> = calls
            .iter()
            .map(|(key, check, set, expire)| {
                (
                    key.clone(),
                    vec![check.clone(), set.clone(), expire.as_secs().to_string()],
                )
            })
            .collect();
        let results = self.pipeline_eval(CAS_SCRIPT, &pipelined).await?;
        Ok(results
            .into_iter()
            .map(|(key, reply)| (key, reply.map(EvalReply::into_string)))
            .collect())
    }
}

/// A Redis-backed [`SharedKv`], wrapping a `redis::aio::ConnectionManager`
/// the same way the teacher crate's `RedisCache` backend does.
pub struct RedisKv {
    conn: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub fn from_connection_manager(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

fn to_eval_reply(value: redis::Value) -> Result<EvalReply> {
    match value {
        redis::Value::Nil => Ok(EvalReply::Nil),
        redis::Value::Okay => Ok(EvalReply::Str("OK".to_string())),
        redis::Value::Int(i) => Ok(EvalReply::Int(i)),
        redis::Value::BulkString(bytes) => Ok(EvalReply::Str(
            String::from_utf8_lossy(&bytes).into_owned(),
        )),
        redis::Value::SimpleString(s) => Ok(EvalReply::Str(s)),
        other => Err(CacheError::Kv(format!(
            "unexpected redis reply shape: {other:?}"
        ))),
    }
}

#[async_trait]
impl SharedKv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Kv(e.to_string()))
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| CacheError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<EvalReply> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(script);
        let mut cmd = script.prepare_invoke();
        for key in keys {
            cmd.key(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        let value: redis::Value = cmd
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::Kv(e.to_string()))?;
        to_eval_reply(value)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| CacheError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("RPOP")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Kv(e.to_string()))
    }

    async fn pipeline_eval(
        &self,
        script: &str,
        calls: &[(String, Vec<String>)],
    ) -> Result<Vec<(String, Result<EvalReply>)>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let sha = redis::Script::new(script);
        let mut pipe = redis::pipe();
        for (key, args) in calls {
            let mut cmd = redis::cmd("EVALSHA");
            cmd.arg(sha.get_hash()).arg(1).arg(key).arg(args);
            pipe.add_command(cmd);
        }
        let values: Vec<redis::Value> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Kv(e.to_string()))?;
        Ok(calls
            .iter()
            .zip(values)
            .map(|((key, _), value)| (key.clone(), to_eval_reply(value)))
            .collect())
    }
}

/// A no-op adapter for tests, grounded on `original_source/redis.go`'s
/// `RedisDefault` stub. Every call is a harmless no-op / empty read.
#[derive(Debug, Default)]
pub struct NoopKv;

#[async_trait]
impl SharedKv for NoopKv {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn del(&self, _keys: &[String]) -> Result<()> {
        Ok(())
    }

    async fn eval(&self, _script: &str, _keys: &[String], _args: &[String]) -> Result<EvalReply> {
        Ok(EvalReply::Nil)
    }

    async fn lpush(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    async fn rpop(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn pipeline_eval(
        &self,
        _script: &str,
        calls: &[(String, Vec<String>)],
    ) -> Result<Vec<(String, Result<EvalReply>)>> {
        Ok(calls
            .iter()
            .map(|(key, _)| (key.clone(), Ok(EvalReply::Nil)))
            .collect())
    }
}

/// In-memory [`SharedKv`] test double that actually honors GET/SETEX/DEL,
/// list push/pop, and the CAS script's semantics, so tests can exercise the
/// single-flight protocol without a live Redis server.
pub mod testing {
    use super::{CacheError, EvalReply, Result, SharedKv, CAS_SCRIPT};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::time::{Duration, Instant};

    struct Slot {
        value: String,
        expires_at: Option<Instant>,
    }

    #[derive(Default)]
    pub struct InMemoryKv {
        strings: Mutex<HashMap<String, Slot>>,
        lists: Mutex<HashMap<String, VecDeque<String>>>,
    }

    impl InMemoryKv {
        pub fn new() -> Self {
            Self::default()
        }

        fn raw_get(&self, key: &str) -> Option<String> {
            let mut strings = self.strings.lock();
            let expired = strings
                .get(key)
                .and_then(|slot| slot.expires_at)
                .is_some_and(|at| Instant::now() >= at);
            if expired {
                strings.remove(key);
                return None;
            }
            strings.get(key).map(|slot| slot.value.clone())
        }

        fn cas_apply(&self, key: &str, check: &str, set: &str, expire_secs: u64) -> String {
            let current = self.raw_get(key).unwrap_or_default();
            if current == check {
                let mut strings = self.strings.lock();
                strings.insert(
                    key.to_string(),
                    Slot {
                        value: set.to_string(),
                        expires_at: Some(Instant::now() + Duration::from_secs(expire_secs)),
                    },
                );
            }
            current
        }
    }

    #[async_trait]
    impl SharedKv for InMemoryKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.raw_get(key))
        }

        async fn del(&self, keys: &[String]) -> Result<()> {
            let mut strings = self.strings.lock();
            for key in keys {
                strings.remove(key);
            }
            Ok(())
        }

        async fn eval(
            &self,
            script: &str,
            keys: &[String],
            args: &[String],
        ) -> Result<EvalReply> {
            if script != CAS_SCRIPT {
                return Err(CacheError::Kv("unsupported script in test double".into()));
            }
            let key = keys
                .first()
                .ok_or_else(|| CacheError::Kv("cas requires one key".into()))?;
            let check = args.first().map(String::as_str).unwrap_or("");
            let set = args.get(1).map(String::as_str).unwrap_or("");
            let expire: u64 = args
                .get(2)
                .and_then(|s| s.parse().ok())
                .unwrap_or(604_800);
            Ok(EvalReply::Str(self.cas_apply(key, check, set, expire)))
        }

        async fn lpush(&self, key: &str, value: &str) -> Result<()> {
            let mut lists = self.lists.lock();
            lists.entry(key.to_string()).or_default().push_front(value.to_string());
            Ok(())
        }

        async fn rpop(&self, key: &str) -> Result<Option<String>> {
            let mut lists = self.lists.lock();
            Ok(lists.get_mut(key).and_then(VecDeque::pop_back))
        }

        async fn pipeline_eval(
            &self,
            script: &str,
            calls: &[(String, Vec<String>)],
        ) -> Result<Vec<(String, Result<EvalReply>)>> {
            let mut out = Vec::with_capacity(calls.len());
            for (key, args) in calls {
                let reply = self.eval(script, &[key.clone()], args).await;
                out.push((key.clone(), reply));
            }
            Ok(out)
        }
    }
}
