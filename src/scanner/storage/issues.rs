//! 会话问题列表

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::store::{remove_quietly, write_quietly, KeyValueStore};
use crate::scanner::classify::DataType;
use crate::scanner::detector::Detection;

const ISSUE_ID_PREFIX: &str = "issue_";

/// 问题来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSource {
    ManualScan,
    ManualScanCached,
    AutoScan,
    AutoScanCached,
}

impl IssueSource {
    pub fn new(auto: bool, cached: bool) -> Self {
        match (auto, cached) {
            (false, false) => IssueSource::ManualScan,
            (false, true) => IssueSource::ManualScanCached,
            (true, false) => IssueSource::AutoScan,
            (true, true) => IssueSource::AutoScanCached,
        }
    }

    pub fn is_cached(self) -> bool {
        matches!(self, IssueSource::ManualScanCached | IssueSource::AutoScanCached)
    }
}

/// 翻译问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    pub text: String,
    pub selector: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub data_type: DataType,
    pub html_tag: String,
    pub class_name: String,
    pub source: IssueSource,
    #[serde(default)]
    pub language: Option<Detection>,
}

/// 会话内的问题表，按发现顺序保存
pub struct IssueRegistry {
    issues: HashMap<String, Issue>,
    order: Vec<String>,
    counter: u64,
    store: Arc<dyn KeyValueStore>,
    storage_key: String,
}

impl IssueRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, storage_key: impl Into<String>) -> Self {
        Self {
            issues: HashMap::new(),
            order: Vec::new(),
            counter: 0,
            store,
            storage_key: storage_key.into(),
        }
    }

    /// 分配下一个问题编号
    pub fn next_id(&mut self) -> String {
        let id = format!("{}{}", ISSUE_ID_PREFIX, self.counter);
        self.counter += 1;
        id
    }

    /// 插入或替换问题，返回是否为新问题
    pub fn insert(&mut self, issue: Issue) -> bool {
        self.advance_counter(&issue.id);
        let is_new = !self.issues.contains_key(&issue.id);
        if is_new {
            self.order.push(issue.id.clone());
        }
        self.issues.insert(issue.id.clone(), issue);
        is_new
    }

    fn advance_counter(&mut self, id: &str) {
        if let Some(n) = id
            .strip_prefix(ISSUE_ID_PREFIX)
            .and_then(|n| n.parse::<u64>().ok())
        {
            self.counter = self.counter.max(n + 1);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Issue> {
        self.issues.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.issues.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Issue> {
        let removed = self.issues.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// 同一页面上文本和选择器都相同的已有问题
    pub fn find_matching(&self, url: &str, selector: &str, text: &str) -> Option<&Issue> {
        self.order
            .iter()
            .filter_map(|id| self.issues.get(id))
            .find(|issue| issue.url == url && issue.selector == selector && issue.text == text)
    }

    /// 按发现顺序返回全部问题
    pub fn issues(&self) -> Vec<Issue> {
        self.order
            .iter()
            .filter_map(|id| self.issues.get(id).cloned())
            .collect()
    }

    /// 恢复上次持久化的问题列表
    pub async fn restore(&mut self) -> usize {
        let value = match self.store.get(&self.storage_key).await {
            Ok(Some(value)) => value,
            Ok(None) => return 0,
            Err(e) => {
                debug!("读取会话问题失败: {}", e);
                return 0;
            }
        };

        match serde_json::from_value::<Vec<Issue>>(value) {
            Ok(issues) => issues
                .into_iter()
                .map(|issue| self.insert(issue))
                .filter(|is_new| *is_new)
                .count(),
            Err(e) => {
                debug!("会话问题格式无效，已忽略: {}", e);
                0
            }
        }
    }

    pub async fn persist(&self) {
        match serde_json::to_value(self.issues()) {
            Ok(value) => write_quietly(self.store.as_ref(), &self.storage_key, value).await,
            Err(e) => debug!("序列化会话问题失败: {}", e),
        }
    }

    /// 清空问题表和持久化数据，编号不回退
    pub async fn clear(&mut self) {
        self.issues.clear();
        self.order.clear();
        remove_quietly(self.store.as_ref(), &self.storage_key).await;
    }
}
