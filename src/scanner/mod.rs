//! 增量扫描引擎
//!
//! 找出页面中不是目标语言的文本，标记为翻译问题：
//! - **pipeline**: 文本提取、稳定标识、令牌估算与自适应分批
//! - **classify**: 分类服务客户端与回复解析
//! - **storage**: 结果缓存、问题表与持久化存储
//! - **change**: 区块变化检测与局部失效
//! - **core**: 扫描状态机、会话事件循环与防抖
//!
//! # 基本用法
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use translateme::dom::PageDocument;
//! use translateme::scanner::{ScanOrchestrator, ScanTrigger, ScannerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let page = Rc::new(PageDocument::parse("<p>Bonjour</p>", "https://example.com/")?);
//! let mut orchestrator = ScanOrchestrator::builder(page, ScannerConfig::default()).build()?;
//! let outcome = orchestrator.scan(ScanTrigger::Manual).await;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// 子模块声明
// ============================================================================

/// 配置管理
pub mod config;

/// 统一错误类型
pub mod error;

/// 提取、标识与分批
pub mod pipeline;

/// 分类服务
pub mod classify;

/// 缓存与持久化
pub mod storage;

pub mod change;

/// 扫描调度
pub mod core;

pub mod clock;
pub mod detector;
pub mod host;
pub mod usage;

// ============================================================================
// 核心API导出
// ============================================================================

pub use self::core::{
    ScanCommand, ScanOrchestrator, ScanOrchestratorBuilder, ScanOutcome, ScanSession, ScanState,
    ScanTrigger, SessionHandle,
};

pub use change::{ChangeDetector, SectionChange, SectionHash};
pub use classify::{ClassificationClient, ClassificationOracle, HttpOracle, Verdict};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{constants, ConfigManager, ScannerConfig};
pub use detector::{Detection, LanguageDetector, ScriptDetector};
pub use error::{ErrorCategory, ErrorSeverity, ScanError, ScanResult};
pub use host::{HostChannel, HostMessage, NullHost, ScanSummary};
pub use pipeline::{IdentityAssigner, ScannableElement, StableId, TextExtractor};
pub use storage::{Issue, IssueSource, KeyValueStore, MemoryStore, RedbStore, ResultCache};
pub use usage::{ScanKind, ScanQuota, UnlimitedUsage, UsageGate};
