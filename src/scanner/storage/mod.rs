//! 存储模块
//!
//! - `store`: 异步键值存储（内存 / redb）
//! - `cache`: 以稳定标识为键的结果缓存
//! - `issues`: 会话问题列表

pub mod cache;
pub mod issues;
pub mod store;

pub use cache::{CacheEntry, CacheLookup, CacheStats, MissReason, ResultCache};
pub use issues::{Issue, IssueRegistry, IssueSource};
pub use store::{remove_quietly, write_quietly, KeyValueStore, MemoryStore, RedbStore};
