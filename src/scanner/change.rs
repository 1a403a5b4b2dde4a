//! 变化检测与局部失效
//!
//! 为每个结构区块计算两个哈希：只含内容的哈希（标签、文本、子元素结构）和
//! 额外包含 class/style 的完整哈希。只有内容哈希变化才算真实变化，
//! 仅完整哈希变化视为导航带来的显示状态切换，忽略。
//!
//! 真实变化只失效该区块子树内的缓存条目，兄弟区块不受影响。
//! 区块嵌套时（如 `main > section`），只按最内层的变化区块失效。

use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use markup5ever_rcdom::{Handle, Node};
use tracing::{debug, info};

use crate::dom::{
    class_name, contains, descendant_elements, element_children, get_node_attr, get_node_name,
    has_class, text_content,
};
use crate::scanner::clock::{elapsed_between, Clock};
use crate::scanner::config::constants::{SECTION_CLASS, SECTION_TAGS};
use crate::scanner::config::ChangeConfig;
use crate::scanner::pipeline::identity::hash_string;
use crate::scanner::storage::cache::ResultCache;

/// 区块哈希
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHash {
    pub section_id: String,
    /// 不含 class/style
    pub content_hash: String,
    /// 含 class/style
    pub full_hash: String,
}

impl SectionHash {
    pub fn compute(section_id: String, section: &Handle) -> Self {
        let tag = get_node_name(section).unwrap_or_default();
        let text = text_content(section);
        let children = element_children(section);
        let child_tags = children
            .iter()
            .filter_map(|child| get_node_name(child))
            .collect::<Vec<_>>()
            .join(",");

        let content = format!("{}-{}-{}-{}", tag, text, children.len(), child_tags);
        let full = format!(
            "{}-{}-{}-{}-{}-{}-{}",
            tag,
            class_name(section),
            get_node_attr(section, "id").unwrap_or_default(),
            get_node_attr(section, "style").unwrap_or_default(),
            text,
            children.len(),
            child_tags
        );

        Self {
            section_id,
            content_hash: hash_string(&content),
            full_hash: hash_string(&full),
        }
    }
}

/// 一次真实的内容变化
#[derive(Debug, Clone)]
pub struct SectionChange {
    pub section_id: String,
    pub section: Handle,
    pub previous: SectionHash,
    pub current: SectionHash,
}

/// 已记录的区块：哈希与对应节点
///
/// 无 id 的区块以 class 为标识，切换 class 后标识会变，按节点找回上次的哈希。
struct TrackedSection {
    hash: SectionHash,
    node: Weak<Node>,
}

impl TrackedSection {
    fn new(hash: SectionHash, node: &Handle) -> Self {
        Self {
            hash,
            node: Rc::downgrade(node),
        }
    }

    fn is_node(&self, node: &Handle) -> bool {
        self.node
            .upgrade()
            .is_some_and(|tracked| Rc::ptr_eq(&tracked, node))
    }
}

/// 变化检测器
pub struct ChangeDetector {
    config: ChangeConfig,
    clock: Arc<dyn Clock>,
    hashes: HashMap<String, TrackedSection>,
    last_invalidation: Option<DateTime<Utc>>,
    navigation_started: Option<DateTime<Utc>>,
}

impl ChangeDetector {
    pub fn new(config: ChangeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            hashes: HashMap::new(),
            last_invalidation: None,
            navigation_started: None,
        }
    }

    pub fn tracked_sections(&self) -> usize {
        self.hashes.len()
    }

    pub fn section_hash(&self, section_id: &str) -> Option<&SectionHash> {
        self.hashes.get(section_id).map(|tracked| &tracked.hash)
    }

    /// 上次记录的哈希：先按节点，节点已不在时按标识
    fn previous_hash(&self, section_id: &str, section: &Handle) -> Option<&SectionHash> {
        self.hashes
            .values()
            .find(|tracked| tracked.is_node(section))
            .or_else(|| self.hashes.get(section_id))
            .map(|tracked| &tracked.hash)
    }

    /// 记录基线，不报告任何变化
    pub fn initialize(&mut self, root: &Handle) {
        self.hashes.clear();
        for (section_id, section) in sections(root) {
            let hash = SectionHash::compute(section_id.clone(), &section);
            self.hashes
                .insert(section_id, TrackedSection::new(hash, &section));
        }
        debug!("已初始化 {} 个区块哈希", self.hashes.len());
    }

    /// 页面内部区块切换，导航窗口内不做失效
    pub fn mark_navigation(&mut self) {
        self.navigation_started = Some(self.clock.now());
    }

    pub fn is_navigating(&self) -> bool {
        let window = Duration::from_millis(self.config.navigation_window_ms);
        self.navigation_started
            .is_some_and(|started| elapsed_between(started, self.clock.now()) < window)
    }

    fn is_throttled(&self, now: DateTime<Utc>) -> bool {
        let interval = Duration::from_millis(self.config.invalidation_interval_ms);
        self.last_invalidation
            .is_some_and(|last| elapsed_between(last, now) < interval)
    }

    /// 检测真实内容变化
    ///
    /// 导航窗口内或距上次失效不足节流间隔时直接返回空。首次出现的区块只记录，不报告；
    /// 本次未出现的区块不再保留。
    pub fn detect_changes(&mut self, root: &Handle) -> Vec<SectionChange> {
        let now = self.clock.now();

        if self.is_navigating() {
            debug!("导航进行中，跳过变化检测");
            return Vec::new();
        }

        if self.is_throttled(now) {
            return Vec::new();
        }

        let mut changes = Vec::new();
        let mut tracked = HashMap::new();
        for (section_id, section) in sections(root) {
            let current = SectionHash::compute(section_id.clone(), &section);

            if let Some(previous) = self.previous_hash(&section_id, &section) {
                if previous.content_hash != current.content_hash {
                    debug!("区块内容变化: {}", section_id);
                    changes.push(SectionChange {
                        section_id: section_id.clone(),
                        section: section.clone(),
                        previous: previous.clone(),
                        current: current.clone(),
                    });
                } else if previous.full_hash != current.full_hash {
                    debug!("区块仅显示状态变化，忽略: {}", section_id);
                }
            }

            tracked.insert(section_id, TrackedSection::new(current, &section));
        }
        self.hashes = tracked;

        if !changes.is_empty() {
            self.last_invalidation = Some(now);
            info!("检测到 {} 个区块内容变化", changes.len());
        }
        changes
    }

    /// 失效变化区块子树内的缓存条目
    pub async fn invalidate_for_changes(
        &self,
        changes: &[SectionChange],
        cache: &mut ResultCache,
    ) -> usize {
        let mut ids = Vec::new();
        for change in innermost(changes) {
            let within = cache.entries_within(&change.section);
            debug!("区块 {} 内失效 {} 个缓存条目", change.section_id, within.len());
            ids.extend(within);
        }
        ids.sort();
        ids.dedup();

        if ids.is_empty() {
            return 0;
        }
        cache.invalidate(&ids).await
    }
}

/// 去掉包含其他变化区块的外层区块
fn innermost(changes: &[SectionChange]) -> Vec<&SectionChange> {
    changes
        .iter()
        .filter(|change| {
            let encloses_other = changes.iter().any(|other| {
                !Rc::ptr_eq(&other.section, &change.section)
                    && contains(&change.section, &other.section)
            });
            if encloses_other {
                debug!("区块 {} 含有更内层的变化区块，不整体失效", change.section_id);
            }
            !encloses_other
        })
        .collect()
}

/// 区块标识：id，否则 class，否则标签名
pub fn section_id(section: &Handle) -> String {
    if let Some(id) = get_node_attr(section, "id").filter(|id| !id.is_empty()) {
        return id;
    }
    let class = class_name(section);
    if !class.trim().is_empty() {
        return class;
    }
    get_node_name(section).unwrap_or_default().to_uppercase()
}

/// 按文档顺序列出全部区块，重复的标识追加序号
pub fn sections(root: &Handle) -> Vec<(String, Handle)> {
    let mut seen: HashMap<String, usize> = HashMap::new();

    descendant_elements(root)
        .into_iter()
        .filter(|node| {
            has_class(node, SECTION_CLASS)
                || get_node_name(node).is_some_and(|tag| SECTION_TAGS.contains(&tag))
        })
        .map(|node| {
            let base = section_id(&node);
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            let id = if *count == 1 {
                base
            } else {
                format!("{}#{}", base, count)
            };
            (id, node)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::PageDocument;
    use crate::scanner::clock::ManualClock;

    const PAGE: &str = "<body>\
        <section id='home' class='content-section active'><p>Accueil</p></section>\
        <section id='about' class='content-section'><p>Nous</p></section>\
        <section><p>Eins</p></section><section><p>Zwei</p></section>\
        </body>";

    fn detector() -> (ChangeDetector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (ChangeDetector::new(ChangeConfig::default(), clock.clone()), clock)
    }

    #[test]
    fn test_duplicate_section_ids_are_disambiguated() {
        let page = PageDocument::parse(PAGE, "https://example.com/").unwrap();
        let ids: Vec<String> = sections(&page.document()).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["home", "about", "SECTION", "SECTION#2"]);
    }

    #[test]
    fn test_class_toggle_is_cosmetic() {
        let page = PageDocument::parse(PAGE, "https://example.com/").unwrap();
        let (mut detector, _) = detector();
        detector.initialize(&page.document());

        let before = detector.section_hash("about").unwrap().clone();
        let home = page.element_by_id("home").unwrap();
        let about = page.element_by_id("about").unwrap();
        page.set_attribute(&home, "class", Some("content-section"));
        page.set_attribute(&about, "class", Some("content-section active"));
        page.set_attribute(&about, "style", Some("display:block"));

        assert!(detector.detect_changes(&page.document()).is_empty());
        let after = detector.section_hash("about").unwrap();
        assert_eq!(before.content_hash, after.content_hash);
        assert_ne!(before.full_hash, after.full_hash);
    }

    #[test]
    fn test_text_change_is_reported_once_and_throttled() {
        let page = PageDocument::parse(PAGE, "https://example.com/").unwrap();
        let (mut detector, clock) = detector();
        detector.initialize(&page.document());

        let about = page.element_by_id("about").unwrap();
        let p = crate::dom::elements_by_tag(&about, "p").remove(0);
        page.set_text(&p, "Über uns");

        let changes = detector.detect_changes(&page.document());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].section_id, "about");

        page.set_text(&p, "Wir");
        clock.advance(Duration::from_millis(500));
        assert!(detector.detect_changes(&page.document()).is_empty());

        clock.advance(Duration::from_millis(600));
        assert_eq!(detector.detect_changes(&page.document()).len(), 1);
    }

    #[test]
    fn test_navigation_window_suppresses_detection() {
        let page = PageDocument::parse(PAGE, "https://example.com/").unwrap();
        let (mut detector, clock) = detector();
        detector.initialize(&page.document());
        detector.mark_navigation();

        let home = page.element_by_id("home").unwrap();
        page.set_text(&crate::dom::elements_by_tag(&home, "p")[0], "Changed");
        assert!(detector.is_navigating());
        assert!(detector.detect_changes(&page.document()).is_empty());

        clock.advance(Duration::from_millis(2100));
        assert!(!detector.is_navigating());
        assert_eq!(detector.detect_changes(&page.document()).len(), 1);
    }

    #[test]
    fn test_class_toggle_with_text_change_on_unnamed_section() {
        let page = PageDocument::parse(
            "<body><div class='content-section active'><p>Eins</p></div></body>",
            "https://example.com/",
        )
        .unwrap();
        let (mut detector, _) = detector();
        detector.initialize(&page.document());

        let (_, section) = sections(&page.document()).remove(0);
        page.set_attribute(&section, "class", Some("content-section"));
        page.set_text(&crate::dom::elements_by_tag(&section, "p")[0], "Zwei");

        let changes = detector.detect_changes(&page.document());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].section_id, "content-section");
        assert_eq!(detector.tracked_sections(), 1);
    }

    #[test]
    fn test_class_toggles_do_not_accumulate_sections() {
        let page = PageDocument::parse(
            "<body><div class='content-section'><p>Eins</p></div></body>",
            "https://example.com/",
        )
        .unwrap();
        let (mut detector, _) = detector();
        detector.initialize(&page.document());

        let (_, section) = sections(&page.document()).remove(0);
        for class in ["content-section active", "content-section", "content-section shown"] {
            page.set_attribute(&section, "class", Some(class));
            assert!(detector.detect_changes(&page.document()).is_empty());
        }
        assert_eq!(detector.tracked_sections(), 1);
        assert!(detector.section_hash("content-section shown").is_some());
    }

    #[test]
    fn test_enclosing_section_is_not_invalidated_wholesale() {
        let page = PageDocument::parse(
            "<body><main><section id='a'><p>Alpha</p></section><section id='b'><p>Beta</p></section></main></body>",
            "https://example.com/",
        )
        .unwrap();
        let (mut detector, _) = detector();
        detector.initialize(&page.document());

        let a = page.element_by_id("a").unwrap();
        page.set_text(&crate::dom::elements_by_tag(&a, "p")[0], "Gamma");

        let changes = detector.detect_changes(&page.document());
        let mut ids: Vec<&str> = changes.iter().map(|c| c.section_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["MAIN", "a"]);

        let kept: Vec<&str> = innermost(&changes).iter().map(|c| c.section_id.as_str()).collect();
        assert_eq!(kept, vec!["a"]);
    }

    #[test]
    fn test_new_sections_are_recorded_not_reported() {
        let page = PageDocument::parse("<body><main><p>x</p></main></body>", "https://example.com/").unwrap();
        let (mut detector, _) = detector();
        detector.initialize(&page.document());

        let body = page.body();
        page.append_html(&body, "<article><p>Neu</p></article>").unwrap();
        assert!(detector.detect_changes(&page.document()).is_empty());
        assert_eq!(detector.tracked_sections(), 2);
    }
}
