//! Durable retry-until-success queue.
//!
//! Backed by the shared KV store's list primitive at a fixed key
//! (`retry_task`). Grounded on `original_source/retry/retry_until_success.go`;
//! the background loop's shutdown plumbing follows the teacher crate's
//! `InvalidationSubscriber` (`tracing`-logged `tokio::select!` against a
//! broadcast shutdown signal), since the original `Run()` is a bare infinite
//! loop with no cancellation path.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::error::{CacheError, Result};
use crate::kv::SharedKv;
use crate::retry::backoff::RetryConfig;

const RETRY_TASK_KEY: &str = "retry_task";

/// A durable unit of retry work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryTask {
    pub key: String,
    pub params: Vec<serde_json::Value>,
    #[serde(default)]
    pub retry_times: u32,
    #[serde(default)]
    pub start_retry_unix: i64,
}

/// A registered retry method: an async closure keyed by the task's `key`.
pub type RetryMethod = Arc<dyn Fn(Vec<serde_json::Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The retry-until-success durable queue.
pub struct RetryQueue<K: SharedKv> {
    kv: Arc<K>,
    config: RetryConfig,
    methods: DashMap<String, RetryMethod>,
    shutdown: broadcast::Sender<()>,
}

impl<K: SharedKv + 'static> RetryQueue<K> {
    pub fn new(kv: Arc<K>, config: RetryConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            kv,
            config,
            methods: DashMap::new(),
            shutdown,
        }
    }

    /// Register the function dispatched for tasks pushed under `key`.
    pub fn register(&self, key: impl Into<String>, method: RetryMethod) {
        self.methods.insert(key.into(), method);
    }

    /// `DoRetryWithParams`: push a new task with `retry_times = 0`.
    pub async fn do_retry_with_params(
        &self,
        key: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<()> {
        let task = RetryTask {
            key: key.to_string(),
            params,
            retry_times: 0,
            start_retry_unix: 0,
        };
        let payload =
            serde_json::to_string(&task).map_err(|e| CacheError::Kv(e.to_string()))?;
        self.kv.lpush(RETRY_TASK_KEY, &payload).await
    }

    fn retry_timeout(&self, retry_times: u32) -> Duration {
        self.config.delay_for(retry_times)
    }

    async fn requeue(&self, task: &RetryTask) -> Result<()> {
        let payload =
            serde_json::to_string(task).map_err(|e| CacheError::Kv(e.to_string()))?;
        self.kv.lpush(RETRY_TASK_KEY, &payload).await
    }

    /// One iteration of the background loop's body, split out so tests can
    /// drive it deterministically without spawning the loop.
    async fn tick(&self, now_unix: i64) -> Result<()> {
        let popped = self.kv.rpop(RETRY_TASK_KEY).await?;
        let Some(payload) = popped else {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return Ok(());
        };

        let mut task: RetryTask = match serde_json::from_str(&payload) {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, payload = %payload, "retry task payload invalid");
                tokio::time::sleep(Duration::from_secs(1)).await;
                return Ok(());
            }
        };

        if task.retry_times >= self.config.max_times {
            debug!(key = %task.key, "retry task exceeded max_times, dropping");
            return Ok(());
        }

        if task.start_retry_unix > now_unix {
            self.requeue(&task).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Ok(());
        }

        let Some(method) = self.methods.get(&task.key).map(|m| m.clone()) else {
            warn!(key = %task.key, "no retry method registered, dropping task");
            return Ok(());
        };

        if let Err(e) = method(task.params.clone()).await {
            error!(error = %e, key = %task.key, "retry method failed");
            task.retry_times += 1;
            task.start_retry_unix = now_unix + self.retry_timeout(task.retry_times).as_secs() as i64;
            self.requeue(&task).await?;
        }

        Ok(())
    }

    /// Run the background consumer loop until `shutdown()` is called.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            let now_unix = unix_now();
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!("retry queue shutting down");
                    return;
                }
                result = self.tick(now_unix) => {
                    if let Err(e) = result {
                        error!(error = %e, "retry queue kv error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    /// Signal the background loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::testing::InMemoryKv;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn due_task_dispatches_and_succeeds() {
        let kv = Arc::new(InMemoryKv::new());
        let queue = RetryQueue::new(kv.clone(), RetryConfig::new(3, Duration::from_millis(10)));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        queue.register(
            "send_email",
            Arc::new(move |_params| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        queue
            .do_retry_with_params("send_email", vec![serde_json::json!("a@b.com")])
            .await
            .unwrap();

        queue.tick(unix_now()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(kv.rpop(RETRY_TASK_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn not_yet_due_task_is_requeued_not_dispatched() {
        let kv = Arc::new(InMemoryKv::new());
        let queue = RetryQueue::new(kv.clone(), RetryConfig::new(3, Duration::from_millis(10)));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        queue.register(
            "job",
            Arc::new(move |_| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let future_task = RetryTask {
            key: "job".to_string(),
            params: vec![],
            retry_times: 0,
            start_retry_unix: unix_now() + 3600,
        };
        kv.lpush(RETRY_TASK_KEY, &serde_json::to_string(&future_task).unwrap())
            .await
            .unwrap();

        queue.tick(unix_now()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(kv.rpop(RETRY_TASK_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn exhausted_task_is_dropped() {
        let kv = Arc::new(InMemoryKv::new());
        let queue = RetryQueue::new(kv.clone(), RetryConfig::new(2, Duration::from_millis(10)));
        let exhausted = RetryTask {
            key: "job".to_string(),
            params: vec![],
            retry_times: 2,
            start_retry_unix: 0,
        };
        kv.lpush(RETRY_TASK_KEY, &serde_json::to_string(&exhausted).unwrap())
            .await
            .unwrap();

        queue.tick(unix_now()).await.unwrap();
        assert!(kv.rpop(RETRY_TASK_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_method_reschedules_with_incremented_retry_times() {
        let kv = Arc::new(InMemoryKv::new());
        let queue = RetryQueue::new(kv.clone(), RetryConfig::new(5, Duration::from_millis(10)));
        queue.register(
            "job",
            Arc::new(|_| Box::pin(async { Err(CacheError::Loader("down".into())) })),
        );

        queue
            .do_retry_with_params("job", vec![])
            .await
            .unwrap();
        queue.tick(unix_now()).await.unwrap();

        let requeued = kv.rpop(RETRY_TASK_KEY).await.unwrap().expect("requeued");
        let task: RetryTask = serde_json::from_str(&requeued).unwrap();
        assert_eq!(task.retry_times, 1);
        assert!(task.start_retry_unix > unix_now());
    }
}
