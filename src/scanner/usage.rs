//! 扫描配额
//!
//! 计费与配额属于外部协作方。扫描前询问 [`UsageGate`]，配额耗尽时停止扫描，
//! 不影响缓存和编排器状态。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scanner::error::{ScanError, ScanResult};

/// 扫描类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Manual,
    Auto,
}

/// 配额门
#[async_trait]
pub trait UsageGate: Send + Sync {
    /// 配额耗尽时返回 `QuotaExceeded`
    async fn check(&self) -> ScanResult<()>;

    /// 记录一次完成的扫描
    async fn record_scan(&self, kind: ScanKind, url: &str, elements_scanned: usize);
}

/// 不限量
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedUsage;

#[async_trait]
impl UsageGate for UnlimitedUsage {
    async fn check(&self) -> ScanResult<()> {
        Ok(())
    }

    async fn record_scan(&self, _kind: ScanKind, _url: &str, _elements_scanned: usize) {}
}

/// 固定次数的本地配额
#[derive(Debug)]
pub struct ScanQuota {
    limit: usize,
    manual: AtomicUsize,
    auto: AtomicUsize,
}

impl ScanQuota {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            manual: AtomicUsize::new(0),
            auto: AtomicUsize::new(0),
        }
    }

    pub fn used(&self) -> usize {
        self.manual.load(Ordering::SeqCst) + self.auto.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }
}

#[async_trait]
impl UsageGate for ScanQuota {
    async fn check(&self) -> ScanResult<()> {
        if self.remaining() == 0 {
            return Err(ScanError::QuotaExceeded(format!(
                "已使用 {}/{} 次扫描",
                self.used(),
                self.limit
            )));
        }
        Ok(())
    }

    async fn record_scan(&self, kind: ScanKind, url: &str, elements_scanned: usize) {
        let counter = match kind {
            ScanKind::Manual => &self.manual,
            ScanKind::Auto => &self.auto,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        debug!(
            "记录扫描: {:?} {} ({} 个元素)，剩余 {}",
            kind,
            url,
            elements_scanned,
            self.remaining()
        );
    }
}
