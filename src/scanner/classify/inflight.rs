//! 进行中请求合并
//!
//! 文本完全相同的并发分类请求共享同一个未完成的结果。条目在固定超时后失效，
//! 之后到达的调用方会自行发起新请求，不会无限等待。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::client::Classification;

/// 合并键：目标语言加上以 `|` 连接的全部文本
pub fn coalesce_key<'a>(target_language: &str, texts: impl Iterator<Item = &'a str>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(target_language.as_bytes());
    hasher.update(b"\n");
    for (index, text) in texts.enumerate() {
        if index > 0 {
            hasher.update(b"|");
        }
        hasher.update(text.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

struct InflightEntry {
    future: Shared<BoxFuture<'static, Classification>>,
    started: Instant,
    generation: u64,
}

/// 进行中的分类请求表
pub struct InflightRequests {
    entries: DashMap<String, InflightEntry>,
    timeout: Duration,
    next_generation: AtomicU64,
}

impl InflightRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 执行或加入一个请求
    ///
    /// 返回结果以及是否加入了他人的请求。
    pub async fn run<F>(&self, key: String, start: F) -> (Classification, bool)
    where
        F: FnOnce() -> BoxFuture<'static, Classification>,
    {
        let now = Instant::now();
        self.purge_expired(now);

        if let Some((future, started)) = self.join(&key) {
            let remaining = self.timeout.saturating_sub(now.duration_since(started));
            match tokio::time::timeout(remaining, future).await {
                Ok(classification) => {
                    debug!("合并到进行中的分类请求");
                    return (classification, true);
                }
                Err(_) => warn!("等待进行中的分类请求超时，重新发起"),
            }
        }

        let future = start().shared();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key.clone(),
            InflightEntry {
                future: future.clone(),
                started: Instant::now(),
                generation,
            },
        );

        let classification = future.await;
        self.entries
            .remove_if(&key, |_, entry| entry.generation == generation);
        (classification, false)
    }

    fn join(&self, key: &str) -> Option<(Shared<BoxFuture<'static, Classification>>, Instant)> {
        self.entries
            .get(key)
            .map(|entry| (entry.future.clone(), entry.started))
    }

    fn purge_expired(&self, now: Instant) {
        let timeout = self.timeout;
        self.entries
            .retain(|_, entry| now.duration_since(entry.started) < timeout);
    }
}
