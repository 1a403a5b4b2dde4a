//! 扫描编排器
//!
//! 一次扫描按固定顺序推进：提取 → 查缓存 → 分批 → 分类 → 合并 → 空闲。
//! 所有批次并发发出，结果按批次顺序合并，保证流式输出稳定。
//! 任何阶段的失败都不会越过编排器边界，结束时状态总是回到 `Idle`。

use std::cell::Cell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dom::PageDocument;
use crate::scanner::change::ChangeDetector;
use crate::scanner::classify::{
    Classification, ClassificationClient, ClassificationOracle, ClassifyItem, ClientStats,
    DataType, HttpOracle, Verdict,
};
use crate::scanner::clock::{Clock, SystemClock};
use crate::scanner::config::ScannerConfig;
use crate::scanner::detector::{LanguageDetector, ScriptDetector};
use crate::scanner::error::ScanResult;
use crate::scanner::host::{HostChannel, HostMessage, NullHost, ScanSummary};
use crate::scanner::pipeline::{
    AdaptiveBatchSettings, AdaptiveBatchTuner, Batch, BatchItem, BatchPlanner, IdentityAssigner,
    ScannableElement, StableId, TextExtractor,
};
use crate::scanner::storage::{
    CacheEntry, CacheLookup, Issue, IssueRegistry, IssueSource, KeyValueStore, MemoryStore,
    RedbStore, ResultCache,
};
use crate::scanner::usage::{ScanKind, UnlimitedUsage, UsageGate};

// ============================================================================
// 状态机
// ============================================================================

/// 扫描状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Extracting,
    CacheChecking,
    Batching,
    Classifying,
    Merging,
}

/// 扫描入口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTrigger {
    Manual,
    AutoTick,
}

impl ScanTrigger {
    pub fn is_auto(self) -> bool {
        self == ScanTrigger::AutoTick
    }

    fn kind(self) -> ScanKind {
        match self {
            ScanTrigger::Manual => ScanKind::Manual,
            ScanTrigger::AutoTick => ScanKind::Auto,
        }
    }
}

/// 扫描结果
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Completed(ScanSummary),
    /// 配额等外部限制阻止了扫描
    Blocked(String),
}

/// 可在扫描进行中读取的状态句柄
#[derive(Debug, Clone, Default)]
pub struct ScanStateHandle(Rc<Cell<ScanState>>);

impl ScanStateHandle {
    pub fn get(&self) -> ScanState {
        self.0.get()
    }

    pub fn is_idle(&self) -> bool {
        self.get() == ScanState::Idle
    }
}

/// 离开作用域时（包括扫描被取消）把状态复位为 `Idle`
struct StateGuard {
    state: ScanStateHandle,
}

impl StateGuard {
    fn enter(state: &ScanStateHandle) -> Self {
        state.0.set(ScanState::Extracting);
        Self {
            state: state.clone(),
        }
    }

    fn advance(&self, next: ScanState) {
        debug!("扫描状态: {:?} -> {:?}", self.state.get(), next);
        self.state.0.set(next);
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        self.state.0.set(ScanState::Idle);
    }
}

/// 等待分类的缓存未命中元素
struct PendingElement {
    id: StableId,
    element: ScannableElement,
}

impl BatchItem for PendingElement {
    fn batch_text(&self) -> &str {
        &self.element.text
    }
}

// ============================================================================
// 编排器
// ============================================================================

/// 扫描编排器，生命周期与扫描会话一致
pub struct ScanOrchestrator {
    page: Rc<PageDocument>,
    config: ScannerConfig,
    assigner: IdentityAssigner,
    extractor: TextExtractor,
    planner: BatchPlanner,
    tuner: AdaptiveBatchTuner,
    client: ClassificationClient,
    cache: ResultCache,
    detector: ChangeDetector,
    issues: IssueRegistry,
    language: Box<dyn LanguageDetector>,
    usage: Arc<dyn UsageGate>,
    host: Box<dyn HostChannel>,
    clock: Arc<dyn Clock>,
    state: ScanStateHandle,
    initialized: bool,
    passes: usize,
}

impl ScanOrchestrator {
    pub fn builder(page: Rc<PageDocument>, config: ScannerConfig) -> ScanOrchestratorBuilder {
        ScanOrchestratorBuilder::new(page, config)
    }

    pub fn page(&self) -> &Rc<PageDocument> {
        &self.page
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn issues(&self) -> &IssueRegistry {
        &self.issues
    }

    pub fn change_detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn client_stats(&self) -> &ClientStats {
        self.client.stats()
    }

    pub fn batch_settings(&self) -> &AdaptiveBatchSettings {
        self.tuner.settings()
    }

    pub fn state(&self) -> ScanState {
        self.state.get()
    }

    pub fn state_handle(&self) -> ScanStateHandle {
        self.state.clone()
    }

    /// 已完成的扫描次数
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// 会话开始：加载持久化状态，记录区块基线，恢复缓存中的问题
    ///
    /// 此时恢复的缓存问题记为手动扫描来源；由自动扫描隐式触发时见 [`Self::scan`]。
    pub async fn initialize(&mut self) {
        self.initialize_for(false).await;
    }

    async fn initialize_for(&mut self, auto: bool) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        self.cache.load().await;
        self.tuner.load().await;
        self.cache.set_refresh_mode(true);

        let document = self.page.document();
        self.detector.initialize(&document);

        let present: HashSet<StableId> = self
            .collect_candidates()
            .iter()
            .map(|element| self.assigner.compute_id(&element.node, &element.text))
            .collect();
        self.cache.prune_missing(&present).await;

        let restored = self.issues.restore().await;
        let cached_issues: Vec<CacheEntry> = self
            .cache
            .entries()
            .filter(|entry| entry.verdict.is_issue())
            .cloned()
            .collect();
        let from_cache = cached_issues
            .iter()
            .filter_map(|entry| self.restore_cached_issue(entry, auto))
            .count();

        if !self.issues.is_empty() {
            self.post_issues_update();
        }

        info!(
            "扫描会话已初始化: 缓存 {} 个条目，恢复问题 {} 个（缓存 {} 个）",
            self.cache.len(),
            restored + from_cache,
            from_cache
        );
    }

    /// 页面内部区块切换
    pub fn mark_navigation(&mut self) {
        self.detector.mark_navigation();
    }

    /// 清空结果缓存并通知宿主
    pub async fn clear_cache(&mut self) {
        self.cache.clear().await;
        self.host.post(HostMessage::CacheCleared);
    }

    /// 执行一次扫描
    pub async fn scan(&mut self, trigger: ScanTrigger) -> ScanOutcome {
        let auto = trigger.is_auto();
        self.initialize_for(auto).await;

        let started = Instant::now();
        let guard = StateGuard::enter(&self.state);

        if let Err(e) = self.usage.check().await {
            warn!("扫描被阻止: {}", e);
            let reason = e.to_string();
            self.host.post(HostMessage::ScanBlocked {
                reason: reason.clone(),
            });
            return ScanOutcome::Blocked(reason);
        }

        let url = self.page.url();
        if self.assigner.page_url() != url {
            debug!("页面地址变化: {} -> {}", self.assigner.page_url(), url);
            self.assigner.set_page_url(url.clone());
        }

        let mut summary = ScanSummary::default();

        let document = self.page.document();
        let changes = self.detector.detect_changes(&document);
        if !changes.is_empty() {
            summary.invalidated = self
                .detector
                .invalidate_for_changes(&changes, &mut self.cache)
                .await;
        }
        self.cache.evict_expired_and_over_capacity().await;

        let candidates = self.collect_candidates();
        summary.candidates = candidates.len();

        guard.advance(ScanState::CacheChecking);
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for element in candidates {
            let id = self.assigner.compute_id(&element.node, &element.text);
            if !seen.insert(id.clone()) {
                continue;
            }

            match self.cache.lookup(&id, &element, &self.assigner) {
                CacheLookup::Hit(entry) => {
                    summary.cache_hits += 1;
                    if let Some(issue) = self.restore_cached_issue(&entry, auto) {
                        summary.restored_issues += 1;
                        self.host.post(HostMessage::StreamingIssue { issue });
                    }
                }
                CacheLookup::Miss(reason) => {
                    debug!("缓存未命中 ({:?}): {}", reason, element.selector);
                    pending.push(PendingElement { id, element });
                }
            }
        }

        guard.advance(ScanState::Batching);
        let total = pending.len();
        let batches = self.planner.make_batches(pending, self.tuner.settings());
        summary.batches = batches.len();

        guard.advance(ScanState::Classifying);
        let target = self.config.target_language.code().to_string();
        let results = self.classify_all(&batches, &target).await;

        guard.advance(ScanState::Merging);
        let mut processed = 0usize;
        for (batch, (classification, elapsed)) in batches.into_iter().zip(results) {
            processed += batch.len();
            summary.classified += batch.len();
            if classification.fallback {
                summary.fallback_batches += 1;
            }
            summary.new_issues += self.merge_batch(batch, classification, elapsed, auto).await;

            self.host
                .post(HostMessage::ProgressUpdate { processed, total });
        }

        self.cache.set_refresh_mode(false);
        self.issues.persist().await;
        self.post_issues_update();

        summary.total_issues = self.issues.len();
        summary.duration_ms = started.elapsed().as_millis() as u64;
        self.usage
            .record_scan(trigger.kind(), &url, summary.candidates)
            .await;
        self.passes += 1;

        info!(
            "扫描完成 ({:?}): {} 个候选，缓存命中 {}，分类 {}（{} 批），新问题 {}，共 {} 个问题，耗时 {}ms",
            trigger,
            summary.candidates,
            summary.cache_hits,
            summary.classified,
            summary.batches,
            summary.new_issues,
            summary.total_issues,
            summary.duration_ms
        );

        self.host.post(HostMessage::ScanCompleted {
            summary: summary.clone(),
        });
        drop(guard);
        ScanOutcome::Completed(summary)
    }

    /// 文本过短的元素不参与扫描
    fn collect_candidates(&self) -> Vec<ScannableElement> {
        let min_chars = self.extractor.config().min_scan_text_chars;
        self.extractor
            .extract_candidates(&self.page.body())
            .into_iter()
            .filter(|element| element.text.chars().count() >= min_chars)
            .collect()
    }

    /// 并发分类全部批次，结果保持批次顺序
    async fn classify_all(
        &self,
        batches: &[Batch<PendingElement>],
        target: &str,
    ) -> Vec<(Classification, Duration)> {
        join_all(batches.iter().map(|batch| async move {
            let items: Vec<ClassifyItem> = batch
                .items
                .iter()
                .map(|pending| ClassifyItem::from(&pending.element))
                .collect();
            let started = Instant::now();
            let classification = self.client.classify(&items, target).await;
            (classification, started.elapsed())
        }))
        .await
    }

    /// 合并一个批次的结果，返回新问题数量
    ///
    /// 退化为默认结论的批次照常产生问题，但不写入缓存，下一次扫描会重新分类。
    async fn merge_batch(
        &mut self,
        batch: Batch<PendingElement>,
        classification: Classification,
        elapsed: Duration,
        auto: bool,
    ) -> usize {
        self.tuner
            .record(elapsed, classification.is_success())
            .await;

        let now = self.clock.now();
        let pacing = self.config.scan.streaming_delay();
        let mut entries = Vec::new();
        let mut new_issues = 0usize;

        for (pending, verdict) in batch.items.into_iter().zip(classification.verdicts) {
            let existing = verdict
                .is_issue()
                .then(|| {
                    self.issues
                        .find_matching(&self.page.url(), &pending.element.selector, &pending.element.text)
                        .map(|issue| issue.id.clone())
                })
                .flatten();

            let issue_id = if let Some(id) = existing {
                debug!("重新分类的元素已有问题记录: {}", id);
                Some(id)
            } else if verdict.is_issue() {
                let issue = self.new_issue(&pending.element, verdict, IssueSource::new(auto, false));
                let id = issue.id.clone();
                self.issues.insert(issue.clone());
                new_issues += 1;
                self.host.post(HostMessage::StreamingIssue { issue });
                if !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
                Some(id)
            } else {
                None
            };

            if !classification.fallback {
                entries.push(CacheEntry::new(
                    pending.id,
                    &pending.element,
                    verdict,
                    issue_id,
                    now,
                ));
            }
        }

        self.cache.store_batch(entries).await;
        new_issues
    }

    fn new_issue(&mut self, element: &ScannableElement, verdict: Verdict, source: IssueSource) -> Issue {
        Issue {
            id: self.issues.next_id(),
            text: element.text.clone(),
            selector: element.selector.clone(),
            url: self.page.url(),
            timestamp: self.clock.now(),
            data_type: verdict.data_type().unwrap_or(DataType::Static),
            html_tag: element.tag_name.clone(),
            class_name: element.class_name.clone(),
            source,
            language: Some(self.language.detect(&element.text)),
        }
    }

    /// 把缓存条目记录的问题放回问题表，已存在时返回 `None`
    fn restore_cached_issue(&mut self, entry: &CacheEntry, auto: bool) -> Option<Issue> {
        if !entry.verdict.is_issue() {
            return None;
        }
        let issue_id = entry.issue_id.as_ref()?;
        if self.issues.contains(issue_id) {
            return None;
        }

        let issue = Issue {
            id: issue_id.clone(),
            text: entry.text.clone(),
            selector: entry.selector.clone(),
            url: self.page.url(),
            timestamp: entry.timestamp,
            data_type: entry.verdict.data_type().unwrap_or(DataType::Static),
            html_tag: entry.tag_name.clone(),
            class_name: entry.class_name.clone(),
            source: IssueSource::new(auto, true),
            language: Some(self.language.detect(&entry.text)),
        };
        self.issues.insert(issue.clone());
        Some(issue)
    }

    fn post_issues_update(&self) {
        let issues = self.issues.issues();
        let count = issues.len();
        self.host.post(HostMessage::IssuesUpdate { issues, count });
    }
}

// ============================================================================
// 构建器
// ============================================================================

/// 编排器构建器，未指定的协作方使用默认实现
pub struct ScanOrchestratorBuilder {
    page: Rc<PageDocument>,
    config: ScannerConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    oracle: Option<Arc<dyn ClassificationOracle>>,
    clock: Option<Arc<dyn Clock>>,
    usage: Option<Arc<dyn UsageGate>>,
    host: Option<Box<dyn HostChannel>>,
    language: Option<Box<dyn LanguageDetector>>,
}

impl ScanOrchestratorBuilder {
    pub fn new(page: Rc<PageDocument>, config: ScannerConfig) -> Self {
        Self {
            page,
            config,
            store: None,
            oracle: None,
            clock: None,
            usage: None,
            host: None,
            language: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn ClassificationOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn usage(mut self, usage: Arc<dyn UsageGate>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn host(mut self, host: impl HostChannel + 'static) -> Self {
        self.host = Some(Box::new(host));
        self
    }

    pub fn language_detector(mut self, detector: impl LanguageDetector + 'static) -> Self {
        self.language = Some(Box::new(detector));
        self
    }

    pub fn build(self) -> ScanResult<ScanOrchestrator> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn KeyValueStore> = match (self.store, &config.cache.db_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(RedbStore::open(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let oracle: Arc<dyn ClassificationOracle> = match self.oracle {
            Some(oracle) => oracle,
            None => Arc::new(HttpOracle::new(config.oracle.clone())?),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        Ok(ScanOrchestrator {
            assigner: IdentityAssigner::new(self.page.url()),
            extractor: TextExtractor::new(config.extractor.clone()),
            planner: BatchPlanner::new(config.batch.clone()),
            tuner: AdaptiveBatchTuner::new(
                config.adaptive.clone(),
                Arc::clone(&store),
                config.cache.adaptive_storage_key.clone(),
                Arc::clone(&clock),
            ),
            client: ClassificationClient::new(oracle, config.scan.coalesce_timeout()),
            cache: ResultCache::new(config.cache.clone(), Arc::clone(&store), Arc::clone(&clock)),
            detector: ChangeDetector::new(config.change.clone(), Arc::clone(&clock)),
            issues: IssueRegistry::new(store, config.cache.issues_storage_key.clone()),
            language: self.language.unwrap_or_else(|| Box::new(ScriptDetector)),
            usage: self.usage.unwrap_or_else(|| Arc::new(UnlimitedUsage)),
            host: self.host.unwrap_or_else(|| Box::new(NullHost)),
            page: self.page,
            config,
            clock,
            state: ScanStateHandle::default(),
            initialized: false,
            passes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::clock::ManualClock;
    use crate::scanner::error::ScanError;
    use crate::scanner::usage::ScanQuota;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::unbounded_channel;

    /// 每个文本都判为 Static/Issue
    struct AllIssues {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClassificationOracle for AllIssues {
        async fn complete(&self, prompt: &str) -> ScanResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let count = prompt
                .lines()
                .filter(|line| line.contains("\" | <"))
                .count();
            Ok(vec!["Static/Issue"; count].join("\n"))
        }
    }

    struct Broken;

    #[async_trait]
    impl ClassificationOracle for Broken {
        async fn complete(&self, _prompt: &str) -> ScanResult<String> {
            Err(ScanError::ServiceUnavailable {
                status: 503,
                message: "down".to_string(),
            })
        }
    }

    fn config() -> ScannerConfig {
        let mut config = ScannerConfig::default();
        config.scan.streaming_delay_ms = 0;
        config
    }

    fn page(html: &str) -> Rc<PageDocument> {
        Rc::new(PageDocument::parse(html, "https://example.com/").unwrap())
    }

    #[tokio::test]
    async fn test_state_returns_to_idle_and_messages_are_ordered() {
        let (tx, mut rx) = unbounded_channel();
        let oracle = Arc::new(AllIssues {
            calls: AtomicUsize::new(0),
        });
        let mut orchestrator = ScanOrchestrator::builder(page("<body><p>Bonjour</p></body>"), config())
            .oracle(oracle.clone())
            .clock(Arc::new(ManualClock::default()))
            .host(tx)
            .build()
            .unwrap();

        let outcome = orchestrator.scan(ScanTrigger::Manual).await;
        assert!(matches!(outcome, ScanOutcome::Completed(ref s) if s.new_issues == 1));
        assert_eq!(orchestrator.state(), ScanState::Idle);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);

        let mut actions = Vec::new();
        while let Ok(message) = rx.try_recv() {
            actions.push(serde_json::to_value(&message).unwrap()["action"].clone());
        }
        assert_eq!(
            actions,
            vec!["streamingIssue", "progressUpdate", "issuesUpdate", "scanCompleted"]
        );
    }

    #[tokio::test]
    async fn test_fallback_batches_are_not_cached() {
        let mut orchestrator = ScanOrchestrator::builder(page("<body><p>Bonjour</p><p>Merci</p></body>"), config())
            .oracle(Arc::new(Broken))
            .clock(Arc::new(ManualClock::default()))
            .build()
            .unwrap();

        let ScanOutcome::Completed(summary) = orchestrator.scan(ScanTrigger::Manual).await else {
            panic!("scan should complete");
        };
        assert_eq!(summary.fallback_batches, 1);
        assert_eq!(summary.new_issues, 2);
        assert!(orchestrator.cache().is_empty());
        assert_eq!(orchestrator.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_blocks_without_touching_state() {
        let (tx, mut rx) = unbounded_channel();
        let mut orchestrator = ScanOrchestrator::builder(page("<body><p>Bonjour</p></body>"), config())
            .oracle(Arc::new(AllIssues {
                calls: AtomicUsize::new(0),
            }))
            .clock(Arc::new(ManualClock::default()))
            .usage(Arc::new(ScanQuota::new(1)))
            .host(tx)
            .build()
            .unwrap();

        assert!(matches!(
            orchestrator.scan(ScanTrigger::Manual).await,
            ScanOutcome::Completed(_)
        ));
        let cached = orchestrator.cache().len();
        while rx.try_recv().is_ok() {}

        assert!(matches!(
            orchestrator.scan(ScanTrigger::AutoTick).await,
            ScanOutcome::Blocked(_)
        ));
        assert_eq!(orchestrator.cache().len(), cached);
        assert_eq!(orchestrator.issues().len(), 1);
        assert_eq!(orchestrator.passes(), 1);
        assert_eq!(orchestrator.state(), ScanState::Idle);
        assert!(matches!(rx.try_recv(), Ok(HostMessage::ScanBlocked { .. })));
    }

    #[tokio::test]
    async fn test_short_texts_are_not_scanned() {
        let oracle = Arc::new(AllIssues {
            calls: AtomicUsize::new(0),
        });
        let mut orchestrator = ScanOrchestrator::builder(page("<body><p>OK</p><span>x</span></body>"), config())
            .oracle(oracle.clone())
            .clock(Arc::new(ManualClock::default()))
            .build()
            .unwrap();

        let ScanOutcome::Completed(summary) = orchestrator.scan(ScanTrigger::Manual).await else {
            panic!("scan should complete");
        };
        assert_eq!(summary.candidates, 0);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }
}
