//! 令牌估算与批次规划模块
//!
//! 本模块负责估算每段文本的分类成本，并把缓存未命中的元素分组为批次，
//! 让每个批次同时满足令牌上限、文本数上限和预估响应时间上限。
//!
//! ## 核心功能
//!
//! - **令牌估算**: 按 ASCII 占比选择每令牌字符数，含数字或符号时乘以复杂度系数
//! - **贪心分批**: 顺序累加，超出任一预算且当前批次非空时开启新批次
//! - **自适应预算**: 根据实际耗时放大或收缩预算，每个时间窗口最多调整一次并持久化
//!
//! ## 使用示例
//!
//! ```rust
//! use translateme::scanner::pipeline::batch::{estimate_tokens, AdaptiveBatchSettings, BatchPlanner};
//! use translateme::scanner::config::BatchConfig;
//!
//! let planner = BatchPlanner::new(BatchConfig::default());
//! let settings = AdaptiveBatchSettings::default();
//! let batches = planner.make_batches(vec!["Bonjour".to_string(), "Hallo".to_string()], &settings);
//! assert_eq!(batches.len(), 1);
//! assert!(estimate_tokens("Bonjour") > 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::extractor::ScannableElement;
use crate::scanner::clock::{elapsed_between, Clock};
use crate::scanner::config::constants::{
    ASCII_CHARS_PER_TOKEN, ASCII_RATIO_THRESHOLD, COMPLEXITY_FACTOR, MAX_TEXTS_PER_BATCH,
    MAX_TOKENS_PER_REQUEST, OTHER_CHARS_PER_TOKEN,
};
use crate::scanner::config::{AdaptiveConfig, BatchConfig};
use crate::scanner::storage::store::{write_quietly, KeyValueStore};

// ============================================================================
// 令牌估算
// ============================================================================

/// 估算文本令牌数
///
/// 字符数除以每令牌平均字符数（ASCII 占比超过 0.8 时为 4，否则为 2.5），
/// 含数字或标点符号时乘以 1.1，向上取整。空文本为 0。
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let total = text.chars().count();
    let ascii = text.chars().filter(char::is_ascii).count();
    let ascii_ratio = ascii as f64 / total as f64;

    let chars_per_token = if ascii_ratio > ASCII_RATIO_THRESHOLD {
        ASCII_CHARS_PER_TOKEN
    } else {
        OTHER_CHARS_PER_TOKEN
    };

    let has_complexity = text
        .chars()
        .any(|c| c.is_ascii_digit() || !(c.is_ascii_alphanumeric() || c == '_' || c.is_whitespace()));
    let factor = if has_complexity { COMPLEXITY_FACTOR } else { 1.0 };

    (total as f64 / chars_per_token * factor).ceil() as usize
}

// ============================================================================
// 批次
// ============================================================================

/// 可以放入批次的条目
pub trait BatchItem {
    fn batch_text(&self) -> &str;
}

impl BatchItem for ScannableElement {
    fn batch_text(&self) -> &str {
        &self.text
    }
}

impl BatchItem for String {
    fn batch_text(&self) -> &str {
        self
    }
}

/// 分类批次
#[derive(Debug, Clone)]
pub struct Batch<T> {
    /// 批次标识
    pub id: usize,
    /// 有序条目
    pub items: Vec<T>,
    /// 含提示词开销的令牌估算
    pub estimated_tokens: usize,
    /// 按吞吐量推算的处理时间
    pub estimated_duration: Duration,
}

impl<T: BatchItem> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 仅文本部分的令牌和（不含提示词开销）
    pub fn text_tokens(&self) -> usize {
        self.items
            .iter()
            .map(|item| estimate_tokens(item.batch_text()))
            .sum()
    }

    pub fn texts(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| item.batch_text().to_string())
            .collect()
    }
}

/// 批次统计
#[derive(Debug, Default)]
pub struct BatchStats {
    input_items: AtomicUsize,
    output_batches: AtomicUsize,
    oversized_items: AtomicUsize,
}

impl BatchStats {
    pub fn get_input_items(&self) -> usize {
        self.input_items.load(Ordering::Relaxed)
    }

    pub fn get_output_batches(&self) -> usize {
        self.output_batches.load(Ordering::Relaxed)
    }

    pub fn get_oversized_items(&self) -> usize {
        self.oversized_items.load(Ordering::Relaxed)
    }
}

// ============================================================================
// 批次规划器
// ============================================================================

/// 批次规划器
#[derive(Debug, Default)]
pub struct BatchPlanner {
    config: BatchConfig,
    stats: BatchStats,
    next_batch_id: AtomicUsize,
}

impl BatchPlanner {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            stats: BatchStats::default(),
            next_batch_id: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    /// 有效预算 = min(硬上限, 自适应设置)
    pub fn effective_limits(&self, settings: &AdaptiveBatchSettings) -> (usize, usize) {
        let max_tokens = self
            .config
            .max_tokens_per_request
            .min(settings.max_tokens.floor() as usize)
            .max(1);
        let max_texts = self
            .config
            .max_texts_per_batch
            .min(settings.max_texts.floor() as usize)
            .max(1);
        (max_tokens, max_texts)
    }

    fn estimated_ms(&self, tokens: usize) -> f64 {
        tokens as f64 / self.config.tokens_per_second * 1000.0
    }

    /// 贪心分批
    ///
    /// 加入下一个元素会超出令牌预算、文本数预算或预估时间上限，且当前批次非空时，
    /// 先封存当前批次。自身就超出预算的元素单独成批，不会被丢弃。
    pub fn make_batches<T: BatchItem>(
        &self,
        items: Vec<T>,
        settings: &AdaptiveBatchSettings,
    ) -> Vec<Batch<T>> {
        let (max_tokens, max_texts) = self.effective_limits(settings);
        let overhead = self.config.prompt_overhead_tokens;
        let item_count = items.len();

        let mut batches = Vec::new();
        let mut current: Vec<T> = Vec::new();
        let mut current_tokens = overhead;

        for item in items {
            let tokens = estimate_tokens(item.batch_text());
            let projected = current_tokens + tokens;

            let exceeds_tokens = projected > max_tokens;
            let exceeds_count = current.len() >= max_texts;
            let exceeds_time = self.estimated_ms(projected) > self.config.max_estimated_response_ms as f64;

            if (exceeds_tokens || exceeds_count || exceeds_time) && !current.is_empty() {
                batches.push(self.seal(std::mem::take(&mut current), current_tokens));
                current_tokens = overhead;
            }

            if overhead + tokens > max_tokens {
                self.stats.oversized_items.fetch_add(1, Ordering::Relaxed);
                debug!("单个文本超出令牌预算，将单独成批: {} tokens", tokens);
            }

            current.push(item);
            current_tokens += tokens;
        }

        if !current.is_empty() {
            batches.push(self.seal(current, current_tokens));
        }

        self.stats.input_items.fetch_add(item_count, Ordering::Relaxed);
        self.stats
            .output_batches
            .fetch_add(batches.len(), Ordering::Relaxed);

        debug!(
            "分批完成: {} 个文本 -> {} 个批次 (上限 {} tokens / {} 条)",
            item_count,
            batches.len(),
            max_tokens,
            max_texts
        );
        batches
    }

    fn seal<T>(&self, items: Vec<T>, tokens: usize) -> Batch<T> {
        Batch {
            id: self.next_batch_id.fetch_add(1, Ordering::Relaxed),
            items,
            estimated_tokens: tokens,
            estimated_duration: Duration::from_secs_f64(tokens as f64 / self.config.tokens_per_second),
        }
    }
}

// ============================================================================
// 自适应批次设置
// ============================================================================

/// 自适应批次设置（跨页面加载持久化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveBatchSettings {
    pub max_tokens: f64,
    pub max_texts: f64,
    pub last_updated: DateTime<Utc>,
}

impl AdaptiveBatchSettings {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            max_tokens: MAX_TOKENS_PER_REQUEST as f64,
            max_texts: MAX_TEXTS_PER_BATCH as f64,
            last_updated: now,
        }
    }
}

impl Default for AdaptiveBatchSettings {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

/// 自适应调节器
pub struct AdaptiveBatchTuner {
    settings: AdaptiveBatchSettings,
    config: AdaptiveConfig,
    store: Arc<dyn KeyValueStore>,
    storage_key: String,
    clock: Arc<dyn Clock>,
}

impl AdaptiveBatchTuner {
    pub fn new(
        config: AdaptiveConfig,
        store: Arc<dyn KeyValueStore>,
        storage_key: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings: AdaptiveBatchSettings::new(clock.now()),
            config,
            store,
            storage_key: storage_key.into(),
            clock,
        }
    }

    pub fn settings(&self) -> &AdaptiveBatchSettings {
        &self.settings
    }

    /// 从持久化存储恢复设置，读取失败时保留默认值
    pub async fn load(&mut self) {
        match self.store.get(&self.storage_key).await {
            Ok(Some(value)) => match serde_json::from_value::<AdaptiveBatchSettings>(value) {
                Ok(settings) => {
                    debug!(
                        "已恢复自适应批次设置: {:.0} tokens / {:.1} 条",
                        settings.max_tokens, settings.max_texts
                    );
                    self.settings = settings;
                }
                Err(e) => debug!("自适应批次设置格式无效，使用默认值: {}", e),
            },
            Ok(None) => {}
            Err(e) => debug!("读取自适应批次设置失败，使用默认值: {}", e),
        }
    }

    /// 记录一个批次的结果
    ///
    /// 距上次调整不足一个窗口时不做任何事并返回 `false`。
    /// 成功且快于阈值时放大，慢于阈值或失败时收缩；失败按固定耗时计。
    pub async fn record(&mut self, duration: Duration, success: bool) -> bool {
        let now = self.clock.now();
        let window = Duration::from_secs(self.config.window_secs);
        if elapsed_between(self.settings.last_updated, now) <= window {
            return false;
        }

        let elapsed_ms = if success {
            duration.as_millis() as u64
        } else {
            self.config.failed_batch_ms
        };

        let previous = self.settings.clone();
        if success && elapsed_ms < self.config.fast_ms {
            self.settings.max_tokens =
                (self.settings.max_tokens * self.config.growth).min(self.config.max_tokens_ceiling);
            self.settings.max_texts =
                (self.settings.max_texts * self.config.growth).min(self.config.max_texts_ceiling);
        } else if !success || elapsed_ms > self.config.slow_ms {
            self.settings.max_tokens =
                (self.settings.max_tokens * self.config.shrink).max(self.config.max_tokens_floor);
            self.settings.max_texts =
                (self.settings.max_texts * self.config.shrink).max(self.config.max_texts_floor);
        }
        self.settings.last_updated = now;

        if previous.max_tokens != self.settings.max_tokens || previous.max_texts != self.settings.max_texts {
            info!(
                "自适应批次调整: {:.0} -> {:.0} tokens, {:.1} -> {:.1} 条 (耗时 {}ms, 成功 {})",
                previous.max_tokens,
                self.settings.max_tokens,
                previous.max_texts,
                self.settings.max_texts,
                elapsed_ms,
                success
            );
        }

        match serde_json::to_value(&self.settings) {
            Ok(value) => write_quietly(self.store.as_ref(), &self.storage_key, value).await,
            Err(e) => debug!("序列化自适应批次设置失败: {}", e),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::clock::ManualClock;
    use crate::scanner::storage::store::MemoryStore;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        // 8 个 ASCII 字母 / 4
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        // 含数字：ceil(9 / 4 * 1.1) = 3
        assert_eq!(estimate_tokens("abcdefgh1"), 3);
        // 非 ASCII 为主：ceil(5 / 2.5 * 1.1) = 3（非 ASCII 字符计为符号）
        assert_eq!(estimate_tokens("日本語です"), 3);
    }

    #[test]
    fn test_batches_respect_count_budget() {
        let planner = BatchPlanner::new(BatchConfig::default());
        let settings = AdaptiveBatchSettings::default();
        let items: Vec<String> = (0..60).map(|i| format!("Texte numero {}", i)).collect();

        let batches = planner.make_batches(items, &settings);

        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() <= MAX_TEXTS_PER_BATCH));
        assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 60);
        assert_eq!(planner.stats().get_output_batches(), 3);
    }

    #[test]
    fn test_adaptive_settings_tighten_effective_limits() {
        let planner = BatchPlanner::new(BatchConfig::default());
        let settings = AdaptiveBatchSettings {
            max_tokens: 120_000.0,
            max_texts: 16.5,
            last_updated: Utc::now(),
        };

        assert_eq!(planner.effective_limits(&settings), (80_000, 16));
    }

    #[test]
    fn test_oversized_item_is_alone() {
        let config = BatchConfig {
            max_tokens_per_request: 600,
            ..BatchConfig::default()
        };
        let planner = BatchPlanner::new(config);
        let settings = AdaptiveBatchSettings::default();
        let items = vec![
            "short one".to_string(),
            "z".repeat(2000),
            "another short".to_string(),
        ];

        let batches = planner.make_batches(items, &settings);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(planner.stats().get_oversized_items(), 1);
    }

    #[test]
    fn test_time_budget_splits_batches() {
        // 15 秒 * 5000 tokens/s = 75000 tokens，小于 80000 的令牌上限
        let planner = BatchPlanner::new(BatchConfig::default());
        let settings = AdaptiveBatchSettings::default();
        let items: Vec<String> = (0..3).map(|_| "w".repeat(150_000)).collect();

        let batches = planner.make_batches(items, &settings);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[tokio::test]
    async fn test_tuner_grows_once_per_window() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let mut tuner = AdaptiveBatchTuner::new(
            AdaptiveConfig::default(),
            store.clone(),
            "adaptive",
            clock.clone(),
        );

        // 窗口内不调整
        assert!(!tuner.record(Duration::from_secs(2), true).await);

        clock.advance(Duration::from_secs(61));
        assert!(tuner.record(Duration::from_secs(2), true).await);
        assert!((tuner.settings().max_tokens - 88_000.0).abs() < 1e-6);
        assert!((tuner.settings().max_texts - 27.5).abs() < 1e-6);

        // 同一窗口内的第二次结果被忽略
        assert!(!tuner.record(Duration::from_secs(2), true).await);
        assert!(store.get("adaptive").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tuner_shrinks_on_failure_with_floor() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let mut tuner =
            AdaptiveBatchTuner::new(AdaptiveConfig::default(), store, "adaptive", clock.clone());

        for _ in 0..10 {
            clock.advance(Duration::from_secs(61));
            tuner.record(Duration::from_secs(1), false).await;
        }

        assert_eq!(tuner.settings().max_tokens, 40_000.0);
        assert_eq!(tuner.settings().max_texts, 15.0);
    }

    #[tokio::test]
    async fn test_tuner_loads_persisted_settings() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let saved = AdaptiveBatchSettings {
            max_tokens: 50_000.0,
            max_texts: 20.0,
            last_updated: clock.now(),
        };
        store
            .set("adaptive", serde_json::to_value(&saved).unwrap())
            .await
            .unwrap();

        let mut tuner = AdaptiveBatchTuner::new(AdaptiveConfig::default(), store, "adaptive", clock);
        tuner.load().await;
        assert_eq!(tuner.settings(), &saved);
    }
}
