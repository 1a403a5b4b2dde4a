//! 扫描流水线
//!
//! 提取 → 标识 → 估算与分批

pub mod batch;
pub mod extractor;
pub mod identity;

pub use batch::{
    estimate_tokens, AdaptiveBatchSettings, AdaptiveBatchTuner, Batch, BatchItem, BatchPlanner,
    BatchStats,
};
pub use extractor::{is_hidden, ScannableElement, TextExtractor};
pub use identity::{dom_path, element_selector, hash_string, IdentityAssigner, StableId};
