//! 扫描调度
//!
//! - `orchestrator`: 单次扫描的状态机
//! - `session`: 事件循环、自动模式与命令处理
//! - `debounce`: 可取消重排的定时器

pub mod debounce;
pub mod orchestrator;
pub mod session;

pub use debounce::Debouncer;
pub use orchestrator::{
    ScanOrchestrator, ScanOrchestratorBuilder, ScanOutcome, ScanState, ScanStateHandle,
    ScanTrigger,
};
pub use session::{ScanCommand, ScanSession, SessionHandle};
