//! 分类模块
//!
//! - `verdict`: 结论标签
//! - `parser`: 自由文本回复解析
//! - `client`: 分类服务接口、提示词与带兜底的分类客户端
//! - `inflight`: 相同请求合并

pub mod client;
pub mod inflight;
pub mod parser;
pub mod verdict;

pub use client::{
    build_prompt, Classification, ClassificationClient, ClassificationOracle, ClassifyItem,
    ClientStats, HttpOracle,
};
pub use inflight::{coalesce_key, InflightRequests};
pub use parser::{parse_line, parse_response};
pub use verdict::{DataType, Verdict};
