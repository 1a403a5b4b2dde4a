//! # TranslateMe Library
//!
//! 网页翻译问题扫描引擎：找出与目标语言不一致的文本，增量缓存分类结果，
//! 并在页面变化时只重新处理受影响的部分。
//!
//! ## 模块组织
//!
//! - `dom` - 页面文档与 DOM 辅助函数
//! - `scanner` - 增量扫描引擎
//! - `env` - 环境变量
//! - `logging` - 日志初始化

pub mod dom;
pub mod env;
pub mod logging;
pub mod scanner;

// Re-export commonly used items for convenience
pub use dom::{PageDocument, PageEvent};
pub use scanner::{
    ConfigManager, ScanError, ScanOrchestrator, ScanOutcome, ScanResult, ScanSession,
    ScanTrigger, ScannerConfig,
};
