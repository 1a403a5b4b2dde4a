//! 扫描模块统一错误处理
//!
//! 提供结构化错误类型和错误处理机制

use std::fmt;

use thiserror::Error;

/// 扫描错误类型
#[derive(Error, Debug, Clone)]
pub enum ScanError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    NetworkError(String),

    /// 认证失败（401）
    #[error("认证失败: {0}")]
    Unauthorized(String),

    /// 速率限制错误（429）
    #[error("请求速率过快，已达到限制")]
    RateLimitExceeded,

    /// 服务暂时不可用（5xx）
    #[error("服务暂时不可用 ({status}): {message}")]
    ServiceUnavailable { status: u16, message: String },

    /// 其他非成功响应
    #[error("分类服务错误 ({status}): {message}")]
    OracleError { status: u16, message: String },

    /// 解析错误
    #[error("解析错误: {0}")]
    ParseError(String),

    /// 文本提取错误
    #[error("文本提取错误: {0}")]
    ExtractionError(String),

    /// 持久化存储错误
    #[error("存储错误: {0}")]
    StorageError(String),

    /// 宿主上下文已失效
    #[error("宿主上下文已失效")]
    ContextInvalidated,

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(String),

    /// 配额耗尽
    #[error("扫描配额已用尽: {0}")]
    QuotaExceeded(String),

    /// 超时错误
    #[error("操作超时: {0}")]
    TimeoutError(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    InternalError(String),
}

impl ScanError {
    /// 检查错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ScanError::NetworkError(_) => true,
            ScanError::TimeoutError(_) => true,
            ScanError::ServiceUnavailable { .. } => true,
            ScanError::StorageError(_) => true,
            ScanError::RateLimitExceeded => false, // 需要等待
            ScanError::Unauthorized(_) => false,
            ScanError::OracleError { .. } => false,
            ScanError::ConfigError(_) => false,
            ScanError::ParseError(_) => false,
            ScanError::ExtractionError(_) => false,
            ScanError::ContextInvalidated => false,
            ScanError::SerializationError(_) => false,
            ScanError::QuotaExceeded(_) => false,
            ScanError::InternalError(_) => false,
        }
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ScanError::ConfigError(_) => ErrorSeverity::Critical,
            ScanError::NetworkError(_) => ErrorSeverity::Warning,
            ScanError::Unauthorized(_) => ErrorSeverity::Error,
            ScanError::RateLimitExceeded => ErrorSeverity::Warning,
            ScanError::ServiceUnavailable { .. } => ErrorSeverity::Warning,
            ScanError::OracleError { .. } => ErrorSeverity::Error,
            ScanError::ParseError(_) => ErrorSeverity::Error,
            ScanError::ExtractionError(_) => ErrorSeverity::Info,
            ScanError::StorageError(_) => ErrorSeverity::Warning,
            ScanError::ContextInvalidated => ErrorSeverity::Info,
            ScanError::SerializationError(_) => ErrorSeverity::Error,
            ScanError::QuotaExceeded(_) => ErrorSeverity::Warning,
            ScanError::TimeoutError(_) => ErrorSeverity::Warning,
            ScanError::InternalError(_) => ErrorSeverity::Critical,
        }
    }

    /// 获取错误类别
    pub fn category(&self) -> ErrorCategory {
        match self {
            ScanError::ConfigError(_) => ErrorCategory::Configuration,
            ScanError::NetworkError(_) => ErrorCategory::Network,
            ScanError::Unauthorized(_) => ErrorCategory::Auth,
            ScanError::RateLimitExceeded => ErrorCategory::RateLimit,
            ScanError::ServiceUnavailable { .. } => ErrorCategory::Service,
            ScanError::OracleError { .. } => ErrorCategory::Service,
            ScanError::ParseError(_) => ErrorCategory::Parsing,
            ScanError::ExtractionError(_) => ErrorCategory::Extraction,
            ScanError::StorageError(_) => ErrorCategory::Storage,
            ScanError::ContextInvalidated => ErrorCategory::Storage,
            ScanError::SerializationError(_) => ErrorCategory::Serialization,
            ScanError::QuotaExceeded(_) => ErrorCategory::Quota,
            ScanError::TimeoutError(_) => ErrorCategory::Timeout,
            ScanError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// 创建带上下文的错误
    pub fn with_context<T: fmt::Display>(mut self, context: T) -> Self {
        let new_msg = format!("{} (上下文: {})", self, context);

        match &mut self {
            ScanError::ConfigError(msg)
            | ScanError::NetworkError(msg)
            | ScanError::Unauthorized(msg)
            | ScanError::ParseError(msg)
            | ScanError::ExtractionError(msg)
            | ScanError::StorageError(msg)
            | ScanError::SerializationError(msg)
            | ScanError::QuotaExceeded(msg)
            | ScanError::TimeoutError(msg)
            | ScanError::InternalError(msg) => *msg = new_msg,
            ScanError::ServiceUnavailable { message, .. }
            | ScanError::OracleError { message, .. } => *message = new_msg,
            ScanError::RateLimitExceeded | ScanError::ContextInvalidated => {}
        }

        self
    }
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Auth,
    RateLimit,
    Service,
    Parsing,
    Extraction,
    Storage,
    Serialization,
    Quota,
    Timeout,
    Internal,
}

/// 标准错误转换
impl From<std::io::Error> for ScanError {
    fn from(error: std::io::Error) -> Self {
        ScanError::StorageError(format!("IO错误: {}", error))
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(error: serde_json::Error) -> Self {
        ScanError::SerializationError(format!("JSON序列化错误: {}", error))
    }
}

impl From<toml::de::Error> for ScanError {
    fn from(error: toml::de::Error) -> Self {
        ScanError::ParseError(format!("TOML解析错误: {}", error))
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ScanError::TimeoutError(format!("请求超时: {}", error))
        } else {
            ScanError::NetworkError(error.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for ScanError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        ScanError::TimeoutError(format!("异步操作超时: {}", error))
    }
}

/// 错误结果类型别名
pub type ScanResult<T> = Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_failures_are_distinct() {
        let auth = ScanError::Unauthorized("bad key".into());
        let limited = ScanError::RateLimitExceeded;
        let transient = ScanError::ServiceUnavailable {
            status: 503,
            message: "down".into(),
        };

        assert_eq!(auth.category(), ErrorCategory::Auth);
        assert_eq!(limited.category(), ErrorCategory::RateLimit);
        assert_eq!(transient.category(), ErrorCategory::Service);
        assert!(!auth.is_retryable());
        assert!(!limited.is_retryable());
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_with_context() {
        let err = ScanError::StorageError("写入失败".into()).with_context("autoScanCache");
        assert!(err.to_string().contains("autoScanCache"));

        let err = ScanError::ContextInvalidated.with_context("ignored");
        assert!(matches!(err, ScanError::ContextInvalidated));
    }

    #[test]
    fn test_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ScanError = json_err.into();
        assert_eq!(err.category(), ErrorCategory::Serialization);

        let toml_err = toml::from_str::<toml::Value>("a = ").unwrap_err();
        let err: ScanError = toml_err.into();
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }
}
