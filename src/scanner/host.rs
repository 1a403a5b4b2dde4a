//! 宿主消息
//!
//! 编排器通过单向消息通知宿主界面。界面可能不存在，所有发送都是尽力而为，失败被忽略。

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::scanner::storage::issues::Issue;

/// 一次扫描的摘要
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub candidates: usize,
    pub cache_hits: usize,
    pub classified: usize,
    pub batches: usize,
    pub new_issues: usize,
    /// 从缓存恢复的问题
    pub restored_issues: usize,
    pub total_issues: usize,
    pub invalidated: usize,
    pub fallback_batches: usize,
    pub duration_ms: u64,
}

/// 发往宿主的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum HostMessage {
    ProgressUpdate { processed: usize, total: usize },
    StreamingIssue { issue: Issue },
    IssuesUpdate { issues: Vec<Issue>, count: usize },
    ScanCompleted { summary: ScanSummary },
    CacheCleared,
    ScanBlocked { reason: String },
}

/// 宿主通道
pub trait HostChannel {
    /// 尽力发送，返回是否送达
    fn post(&self, message: HostMessage) -> bool;
}

impl HostChannel for UnboundedSender<HostMessage> {
    fn post(&self, message: HostMessage) -> bool {
        match self.send(message) {
            Ok(()) => true,
            Err(_) => {
                debug!("宿主界面不可用，消息已丢弃");
                false
            }
        }
    }
}

/// 没有宿主界面
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl HostChannel for NullHost {
    fn post(&self, _message: HostMessage) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_messages_are_tagged_by_action() {
        let json = serde_json::to_value(HostMessage::ProgressUpdate {
            processed: 3,
            total: 10,
        })
        .unwrap();
        assert_eq!(json["action"], "progressUpdate");
        assert_eq!(json["processed"], 3);

        let json = serde_json::to_value(HostMessage::CacheCleared).unwrap();
        assert_eq!(json, serde_json::json!({"action": "cacheCleared"}));
    }

    #[test]
    fn test_closed_channel_is_swallowed() {
        let (tx, rx) = unbounded_channel();
        drop(rx);
        assert!(!tx.post(HostMessage::CacheCleared));
        assert!(!NullHost.post(HostMessage::CacheCleared));
    }
}
