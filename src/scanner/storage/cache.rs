//! 结果缓存
//!
//! 以稳定标识为键的两级缓存：内存映射是权威数据，每批变更后整体写入持久化存储。
//! 条目对源元素只持有弱引用，仅用于重新验证。

use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use markup5ever_rcdom::{Handle, Node};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::store::{remove_quietly, write_quietly, KeyValueStore};
use crate::dom;
use crate::scanner::classify::Verdict;
use crate::scanner::clock::{elapsed_between, Clock};
use crate::scanner::config::constants::CACHE_FORMAT_VERSION;
use crate::scanner::config::CacheConfig;
use crate::scanner::pipeline::extractor::ScannableElement;
use crate::scanner::pipeline::identity::{dom_path, IdentityAssigner, StableId};

/// 缓存条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub id: StableId,
    pub text: String,
    pub selector: String,
    pub tag_name: String,
    pub class_name: String,
    pub verdict: Verdict,
    pub issue_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// 源元素弱引用，不参与持久化
    #[serde(skip)]
    pub element: Option<Weak<Node>>,
}

impl CacheEntry {
    pub fn new(
        id: StableId,
        element: &ScannableElement,
        verdict: Verdict,
        issue_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            text: element.text.clone(),
            selector: element.selector.clone(),
            tag_name: element.tag_name.clone(),
            class_name: element.class_name.clone(),
            verdict,
            issue_id,
            timestamp,
            element: Some(Rc::downgrade(&element.node)),
        }
    }

    pub fn live_element(&self) -> Option<Handle> {
        self.element.as_ref().and_then(Weak::upgrade)
    }
}

/// 未命中原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NotCached,
    Expired,
    /// 刷新后的短窗口内过旧
    StaleAfterRefresh,
    Invalidated,
}

/// 查找结果
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss(MissReason),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub expired: usize,
    pub invalidated: usize,
    pub evicted: usize,
    pub superseded: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache {
    entries: HashMap<String, CacheEntry>,
    timestamp: DateTime<Utc>,
    version: String,
}

enum Validity {
    SameElement,
    Recomputed,
    ContentChanged,
    Different,
}

/// 结果缓存
pub struct ResultCache {
    entries: HashMap<StableId, CacheEntry>,
    config: CacheConfig,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    refresh_mode: bool,
    stats: CacheStats,
}

impl ResultCache {
    pub fn new(config: CacheConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            config,
            store,
            clock,
            refresh_mode: false,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &StableId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &StableId) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 刷新模式：条目新鲜度缩短到刷新窗口，强制重新验证
    pub fn set_refresh_mode(&mut self, enabled: bool) {
        if self.refresh_mode != enabled {
            debug!("缓存刷新模式: {}", enabled);
        }
        self.refresh_mode = enabled;
    }

    pub fn is_refresh_mode(&self) -> bool {
        self.refresh_mode
    }

    /// 查找并验证条目
    ///
    /// 过期、刷新窗口外或元素失效的条目会被删除并报告未命中。
    pub fn lookup(
        &mut self,
        id: &StableId,
        current: &ScannableElement,
        assigner: &IdentityAssigner,
    ) -> CacheLookup {
        let now = self.clock.now();

        let Some(entry) = self.entries.get(id) else {
            self.stats.misses += 1;
            return CacheLookup::Miss(MissReason::NotCached);
        };

        let age = elapsed_between(entry.timestamp, now);
        if age > self.config.ttl() {
            self.entries.remove(id);
            self.stats.expired += 1;
            self.stats.misses += 1;
            return CacheLookup::Miss(MissReason::Expired);
        }

        if self.refresh_mode && age > self.config.refresh_window() {
            debug!("刷新后条目过旧，重新验证: {}", current.selector);
            self.entries.remove(id);
            self.stats.misses += 1;
            return CacheLookup::Miss(MissReason::StaleAfterRefresh);
        }

        match Self::validity(entry, current, assigner) {
            Validity::SameElement => {}
            Validity::Recomputed => {
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.element = Some(Rc::downgrade(&current.node));
                    entry.timestamp = now;
                }
            }
            Validity::ContentChanged => {
                debug!("元素内容已变化，缓存失效: {}", current.selector);
                return self.reject(id);
            }
            Validity::Different => return self.reject(id),
        }

        self.stats.hits += 1;
        match self.entries.get(id) {
            Some(entry) => CacheLookup::Hit(entry.clone()),
            None => CacheLookup::Miss(MissReason::NotCached),
        }
    }

    fn reject(&mut self, id: &StableId) -> CacheLookup {
        self.entries.remove(id);
        self.stats.invalidated += 1;
        self.stats.misses += 1;
        CacheLookup::Miss(MissReason::Invalidated)
    }

    /// 同一引用、按当前元素重新计算的标识一致，或同路径但文本已变（视为失效）
    fn validity(
        entry: &CacheEntry,
        current: &ScannableElement,
        assigner: &IdentityAssigner,
    ) -> Validity {
        let cached_node = entry.live_element();
        if let Some(node) = &cached_node {
            if Rc::ptr_eq(node, &current.node) {
                return Validity::SameElement;
            }
        }

        if assigner.compute_id(&current.node, &current.text) == entry.id {
            return Validity::Recomputed;
        }

        if let Some(node) = &cached_node {
            let current_text = dom::text_content(node);
            if dom_path(node) == dom_path(&current.node) && current_text.trim() != entry.text {
                return Validity::ContentChanged;
            }
        }

        Validity::Different
    }

    /// 写入单个条目（不持久化）
    ///
    /// 同一活动元素已有旧标识的条目时，旧条目被替换。
    pub fn insert(&mut self, entry: CacheEntry) {
        if let Some(node) = entry.live_element() {
            let superseded: Vec<StableId> = self
                .entries
                .values()
                .filter(|existing| existing.id != entry.id)
                .filter(|existing| {
                    existing
                        .live_element()
                        .is_some_and(|other| Rc::ptr_eq(&other, &node))
                })
                .map(|existing| existing.id.clone())
                .collect();

            for id in superseded {
                self.entries.remove(&id);
                self.stats.superseded += 1;
            }
        }

        self.entries.insert(entry.id.clone(), entry);
    }

    /// 批量写入，随后淘汰并持久化
    pub async fn store_batch(&mut self, entries: Vec<CacheEntry>) {
        if entries.is_empty() {
            return;
        }
        for entry in entries {
            self.insert(entry);
        }
        self.evict(self.clock.now());
        self.persist().await;
    }

    /// 显式失效
    pub async fn invalidate(&mut self, ids: &[StableId]) -> usize {
        let removed = ids
            .iter()
            .filter(|id| self.entries.remove(*id).is_some())
            .count();

        if removed > 0 {
            self.stats.invalidated += removed;
            debug!("已失效 {} 个缓存条目", removed);
            self.persist().await;
        }
        removed
    }

    /// 删除过期条目并按时间淘汰超出容量的部分
    pub async fn evict_expired_and_over_capacity(&mut self) -> usize {
        let removed = self.evict(self.clock.now());
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.ttl();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| elapsed_between(entry.timestamp, now) <= ttl);
        let expired = before - self.entries.len();
        self.stats.expired += expired;

        let mut evicted = 0;
        if self.entries.len() > self.config.max_entries {
            let mut by_age: Vec<(DateTime<Utc>, StableId)> = self
                .entries
                .values()
                .map(|entry| (entry.timestamp, entry.id.clone()))
                .collect();
            by_age.sort();

            let excess = self.entries.len() - self.config.max_entries;
            for (_, id) in by_age.into_iter().take(excess) {
                self.entries.remove(&id);
            }
            evicted = excess;
            self.stats.evicted += evicted;
            debug!("容量淘汰 {} 个最旧的缓存条目", evicted);
        }

        expired + evicted
    }

    /// 位于某个区块子树内的条目
    pub fn entries_within(&self, section: &Handle) -> Vec<StableId> {
        self.entries
            .values()
            .filter(|entry| {
                entry
                    .live_element()
                    .is_some_and(|node| dom::contains(section, &node))
            })
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// 删除当前页面上已不存在的条目（页面刷新后）
    pub async fn prune_missing(&mut self, present: &HashSet<StableId>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, _| present.contains(id));
        let removed = before - self.entries.len();

        if removed > 0 {
            info!("清理页面上已不存在的缓存条目: {} 个", removed);
            self.persist().await;
        }
        removed
    }

    /// 从持久化存储加载，跳过已过期的条目
    pub async fn load(&mut self) -> usize {
        let value = match self.store.get(&self.config.storage_key).await {
            Ok(Some(value)) => value,
            Ok(None) => return 0,
            Err(e) => {
                debug!("读取持久化缓存失败，使用空缓存: {}", e);
                return 0;
            }
        };

        let persisted: PersistedCache = match serde_json::from_value(value) {
            Ok(persisted) => persisted,
            Err(e) => {
                debug!("持久化缓存格式无效，已忽略: {}", e);
                return 0;
            }
        };

        let now = self.clock.now();
        let ttl = self.config.ttl();
        let mut dropped = 0usize;
        for (_, entry) in persisted.entries {
            if elapsed_between(entry.timestamp, now) <= ttl {
                self.entries.insert(entry.id.clone(), entry);
            } else {
                dropped += 1;
            }
        }

        dropped += self.evict(now);
        info!(
            "已加载持久化缓存: {} 个条目，丢弃过期 {} 个",
            self.entries.len(),
            dropped
        );
        if dropped > 0 {
            self.persist().await;
        }
        self.entries.len()
    }

    /// 整体写入持久化存储
    pub async fn persist(&self) {
        let persisted = PersistedCache {
            entries: self
                .entries
                .iter()
                .map(|(id, entry)| (id.to_string(), entry.clone()))
                .collect(),
            timestamp: self.clock.now(),
            version: CACHE_FORMAT_VERSION.to_string(),
        };

        match serde_json::to_value(&persisted) {
            Ok(value) => write_quietly(self.store.as_ref(), &self.config.storage_key, value).await,
            Err(e) => debug!("序列化缓存失败: {}", e),
        }
    }

    /// 清空内存和持久化数据
    pub async fn clear(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        remove_quietly(self.store.as_ref(), &self.config.storage_key).await;
        info!("缓存已清空: {} 个条目", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::PageDocument;
    use crate::scanner::clock::ManualClock;
    use crate::scanner::pipeline::extractor::TextExtractor;
    use crate::scanner::storage::store::MemoryStore;
    use std::time::Duration;

    fn fixture() -> (PageDocument, Vec<ScannableElement>, IdentityAssigner) {
        let page = PageDocument::parse(
            "<body><p id='a'>Bonjour tout le monde</p><p id='b'>Hello there</p></body>",
            "https://example.com/",
        )
        .unwrap();
        let elements = TextExtractor::default().extract_candidates(&page.document());
        let assigner = IdentityAssigner::new(page.url());
        (page, elements, assigner)
    }

    fn cache_with(clock: Arc<ManualClock>, store: Arc<MemoryStore>) -> ResultCache {
        ResultCache::new(CacheConfig::default(), store, clock)
    }

    #[tokio::test]
    async fn test_hit_after_store() {
        let (_page, elements, assigner) = fixture();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let mut cache = cache_with(clock.clone(), store.clone());

        let id = assigner.compute_id(&elements[0].node, &elements[0].text);
        let entry = CacheEntry::new(id.clone(), &elements[0], Verdict::StaticIssue, None, clock.now());
        cache.store_batch(vec![entry]).await;

        assert!(cache.lookup(&id, &elements[0], &assigner).is_hit());
        assert_eq!(cache.stats().hits, 1);
        assert!(store.get("autoScanCache").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_mode_forces_revalidation() {
        let (_page, elements, assigner) = fixture();
        let clock = Arc::new(ManualClock::default());
        let mut cache = cache_with(clock.clone(), Arc::new(MemoryStore::new()));

        let id = assigner.compute_id(&elements[0].node, &elements[0].text);
        cache.insert(CacheEntry::new(id.clone(), &elements[0], Verdict::StaticIssue, None, clock.now()));
        cache.set_refresh_mode(true);
        clock.advance(Duration::from_secs(6));

        assert!(matches!(
            cache.lookup(&id, &elements[0], &assigner),
            CacheLookup::Miss(MissReason::StaleAfterRefresh)
        ));
        assert!(!cache.contains(&id));
    }

    #[tokio::test]
    async fn test_persisted_entry_revalidates_against_new_element() {
        let (_page, elements, assigner) = fixture();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());

        let id = assigner.compute_id(&elements[0].node, &elements[0].text);
        {
            let mut cache = cache_with(clock.clone(), store.clone());
            cache
                .store_batch(vec![CacheEntry::new(
                    id.clone(),
                    &elements[0],
                    Verdict::DynamicIssue,
                    Some("issue_0".into()),
                    clock.now(),
                )])
                .await;
        }

        // 重新加载页面：新的 DOM 节点，同样的结构与文本
        let (_page2, reloaded, _) = fixture();
        let mut cache = cache_with(clock.clone(), store);
        assert_eq!(cache.load().await, 1);

        match cache.lookup(&id, &reloaded[0], &assigner) {
            CacheLookup::Hit(entry) => {
                assert_eq!(entry.verdict, Verdict::DynamicIssue);
                assert!(entry.live_element().is_some());
            }
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_skips_expired_entries() {
        let (_page, elements, assigner) = fixture();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        {
            let mut cache = cache_with(clock.clone(), store.clone());
            let old = assigner.compute_id(&elements[0].node, &elements[0].text);
            cache.insert(CacheEntry::new(old, &elements[0], Verdict::StaticIssue, None, clock.now()));
            clock.advance(Duration::from_secs(23 * 3600));
            let fresh = assigner.compute_id(&elements[1].node, &elements[1].text);
            cache.insert(CacheEntry::new(fresh, &elements[1], Verdict::StaticNoIssue, None, clock.now()));
            cache.persist().await;
        }

        clock.advance(Duration::from_secs(2 * 3600));
        let mut cache = cache_with(clock, store);
        assert_eq!(cache.load().await, 1);
    }

    #[tokio::test]
    async fn test_superseded_entry_is_replaced() {
        let (page, elements, assigner) = fixture();
        let clock = Arc::new(ManualClock::default());
        let mut cache = cache_with(clock.clone(), Arc::new(MemoryStore::new()));

        let old_id = assigner.compute_id(&elements[0].node, &elements[0].text);
        cache.insert(CacheEntry::new(old_id.clone(), &elements[0], Verdict::StaticIssue, None, clock.now()));

        page.set_text(&elements[0].node, "Bonsoir tout le monde");
        let updated = TextExtractor::default()
            .inspect(&elements[0].node)
            .unwrap()
            .unwrap();
        let new_id = assigner.compute_id(&updated.node, &updated.text);
        assert_ne!(old_id, new_id);

        cache.insert(CacheEntry::new(new_id.clone(), &updated, Verdict::StaticIssue, None, clock.now()));
        assert!(!cache.contains(&old_id));
        assert!(cache.contains(&new_id));
        assert_eq!(cache.stats().superseded, 1);
    }

    #[tokio::test]
    async fn test_clear_removes_persisted_copy() {
        let (_page, elements, assigner) = fixture();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let mut cache = cache_with(clock.clone(), store.clone());

        let id = assigner.compute_id(&elements[0].node, &elements[0].text);
        cache
            .store_batch(vec![CacheEntry::new(id, &elements[0], Verdict::StaticIssue, None, clock.now())])
            .await;
        cache.clear().await;

        assert!(cache.is_empty());
        assert!(store.get("autoScanCache").await.unwrap().is_none());
    }
}
