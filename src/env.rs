//! 统一的环境变量管理系统
//!
//! 提供类型安全、可验证的环境变量访问，用于覆盖配置文件中的设置

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// 环境变量解析错误
#[derive(Debug, Clone)]
pub struct EnvError {
    pub variable: String,
    pub message: String,
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Environment variable '{}': {}", self.variable, self.message)
    }
}

impl std::error::Error for EnvError {}

pub type EnvResult<T> = Result<T, EnvError>;

/// 环境变量访问器特性
pub trait EnvVar<T> {
    const NAME: &'static str;
    const DEFAULT: Option<T>;
    const DESCRIPTION: &'static str;

    fn parse(value: &str) -> EnvResult<T>;

    fn get() -> EnvResult<T> {
        match env::var(Self::NAME) {
            Ok(value) => Self::parse(&value),
            Err(_) => Self::DEFAULT.ok_or_else(|| EnvError {
                variable: Self::NAME.to_string(),
                message: "Required environment variable not set".to_string(),
            }),
        }
    }

    /// 仅当变量被显式设置时返回值
    fn get_set() -> Option<EnvResult<T>> {
        env::var(Self::NAME).ok().map(|value| Self::parse(&value))
    }

    fn get_or_default(default: T) -> T {
        Self::get().unwrap_or(default)
    }
}

/// 核心环境变量定义
pub mod core {
    use super::*;

    /// 日志级别
    pub struct LogLevel;
    impl EnvVar<String> for LogLevel {
        const NAME: &'static str = "TRANSLATEME_LOG_LEVEL";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Log level: trace, debug, info, warn, error";

        fn parse(value: &str) -> EnvResult<String> {
            match value.to_lowercase().as_str() {
                "trace" | "debug" | "info" | "warn" | "error" => Ok(value.to_lowercase()),
                _ => Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: format!(
                        "Invalid log level '{}'. Use: trace, debug, info, warn, error",
                        value
                    ),
                }),
            }
        }
    }

    /// 开发模式（关闭时日志默认只输出警告）
    pub struct DevMode;
    impl EnvVar<bool> for DevMode {
        const NAME: &'static str = "TRANSLATEME_DEV_MODE";
        const DEFAULT: Option<bool> = Some(false);
        const DESCRIPTION: &'static str = "Enable verbose development logging";

        fn parse(value: &str) -> EnvResult<bool> {
            parse_bool(value, Self::NAME)
        }
    }
}

/// 分类服务相关环境变量
pub mod oracle {
    use super::*;

    /// API 地址
    pub struct ApiUrl;
    impl EnvVar<String> for ApiUrl {
        const NAME: &'static str = "TRANSLATEME_API_URL";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Classification endpoint (chat completions URL)";

        fn parse(value: &str) -> EnvResult<String> {
            let url = value.trim();
            if url.starts_with("http://") || url.starts_with("https://") {
                Ok(url.to_string())
            } else {
                Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "API URL must start with http:// or https://".to_string(),
                })
            }
        }
    }

    /// API 密钥
    pub struct ApiKey;
    impl EnvVar<String> for ApiKey {
        const NAME: &'static str = "TRANSLATEME_API_KEY";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Bearer token for the classification endpoint";

        fn parse(value: &str) -> EnvResult<String> {
            let key = value.trim();
            if key.is_empty() {
                return Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "API key cannot be empty".to_string(),
                });
            }
            Ok(key.to_string())
        }
    }

    /// 模型标识
    pub struct Model;
    impl EnvVar<String> for Model {
        const NAME: &'static str = "TRANSLATEME_MODEL";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Model identifier sent with every request";

        fn parse(value: &str) -> EnvResult<String> {
            Ok(value.trim().to_string())
        }
    }

    /// 目标语言
    pub struct TargetLang;
    impl EnvVar<String> for TargetLang {
        const NAME: &'static str = "TRANSLATEME_TARGET_LANG";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Target language (ISO 639-1 code)";

        fn parse(value: &str) -> EnvResult<String> {
            let lang = value.trim().to_lowercase();
            if lang.len() != 2 {
                return Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "Language code must be 2 characters (ISO 639-1)".to_string(),
                });
            }
            Ok(lang)
        }
    }

    /// 请求超时
    pub struct RequestTimeout;
    impl EnvVar<Duration> for RequestTimeout {
        const NAME: &'static str = "TRANSLATEME_REQUEST_TIMEOUT";
        const DEFAULT: Option<Duration> = Some(Duration::from_secs(30));
        const DESCRIPTION: &'static str = "Classification request timeout in seconds";

        fn parse(value: &str) -> EnvResult<Duration> {
            let seconds = parse_positive_u64(value, Self::NAME, 1, 300)?;
            Ok(Duration::from_secs(seconds))
        }
    }
}

/// 缓存相关环境变量
pub mod cache {
    use super::*;

    /// 缓存TTL
    pub struct Ttl;
    impl EnvVar<Duration> for Ttl {
        const NAME: &'static str = "TRANSLATEME_CACHE_TTL";
        const DEFAULT: Option<Duration> = Some(Duration::from_secs(86400));
        const DESCRIPTION: &'static str = "Result cache TTL in seconds";

        fn parse(value: &str) -> EnvResult<Duration> {
            let seconds = parse_positive_u64(value, Self::NAME, 60, 86400 * 7)?;
            Ok(Duration::from_secs(seconds))
        }
    }

    /// 缓存容量
    pub struct MaxEntries;
    impl EnvVar<usize> for MaxEntries {
        const NAME: &'static str = "TRANSLATEME_CACHE_MAX_ENTRIES";
        const DEFAULT: Option<usize> = Some(1000);
        const DESCRIPTION: &'static str = "Maximum number of cached scan results";

        fn parse(value: &str) -> EnvResult<usize> {
            let entries = parse_positive_u64(value, Self::NAME, 10, 100_000)?;
            Ok(entries as usize)
        }
    }

    /// 数据库路径
    pub struct DbPath;
    impl EnvVar<PathBuf> for DbPath {
        const NAME: &'static str = "TRANSLATEME_CACHE_DB";
        const DEFAULT: Option<PathBuf> = None;
        const DESCRIPTION: &'static str = "Path of the on-disk result database";

        fn parse(value: &str) -> EnvResult<PathBuf> {
            let expanded = shellexpand::tilde(value.trim());
            if expanded.is_empty() {
                return Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "Path cannot be empty".to_string(),
                });
            }
            Ok(PathBuf::from(expanded.as_ref()))
        }
    }
}

/// 扫描相关环境变量
pub mod scan {
    use super::*;

    /// 逐条推送问题的间隔
    pub struct StreamingDelay;
    impl EnvVar<Duration> for StreamingDelay {
        const NAME: &'static str = "TRANSLATEME_STREAMING_DELAY_MS";
        const DEFAULT: Option<Duration> = Some(Duration::from_millis(300));
        const DESCRIPTION: &'static str = "Pause between streamed issues in milliseconds";

        fn parse(value: &str) -> EnvResult<Duration> {
            let millis = parse_positive_u64(value, Self::NAME, 0, 10_000)?;
            Ok(Duration::from_millis(millis))
        }
    }
}

/// 辅助函数
fn parse_bool(value: &str, var_name: &str) -> EnvResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "enabled" => Ok(true),
        "false" | "0" | "no" | "off" | "disabled" => Ok(false),
        _ => Err(EnvError {
            variable: var_name.to_string(),
            message: format!(
                "Invalid boolean value '{}'. Use: true/false, 1/0, yes/no, on/off, enabled/disabled",
                value
            ),
        }),
    }
}

fn parse_positive_u64(value: &str, var_name: &str, min: u64, max: u64) -> EnvResult<u64> {
    let num: u64 = value.trim().parse().map_err(|_| EnvError {
        variable: var_name.to_string(),
        message: "Must be a valid positive number".to_string(),
    })?;

    if num < min {
        return Err(EnvError {
            variable: var_name.to_string(),
            message: format!("Value {} is below minimum {}", num, min),
        });
    }

    if num > max {
        return Err(EnvError {
            variable: var_name.to_string(),
            message: format!("Value {} exceeds maximum {}", num, max),
        });
    }

    Ok(num)
}

/// 环境变量文档生成器
pub fn generate_env_docs() -> String {
    fn line<T: fmt::Debug, V: EnvVar<T>>(docs: &mut String) {
        docs.push_str(&format!(
            "- `{}`: {} (default: {:?})\n",
            V::NAME,
            V::DESCRIPTION,
            V::DEFAULT
        ));
    }

    let mut docs = String::new();
    docs.push_str("# Environment Variables\n\n");

    docs.push_str("## Core\n\n");
    line::<String, core::LogLevel>(&mut docs);
    line::<bool, core::DevMode>(&mut docs);

    docs.push_str("\n## Classification\n\n");
    line::<String, oracle::ApiUrl>(&mut docs);
    line::<String, oracle::ApiKey>(&mut docs);
    line::<String, oracle::Model>(&mut docs);
    line::<String, oracle::TargetLang>(&mut docs);
    line::<Duration, oracle::RequestTimeout>(&mut docs);

    docs.push_str("\n## Cache\n\n");
    line::<Duration, cache::Ttl>(&mut docs);
    line::<usize, cache::MaxEntries>(&mut docs);
    line::<PathBuf, cache::DbPath>(&mut docs);

    docs.push_str("\n## Scanning\n\n");
    line::<Duration, scan::StreamingDelay>(&mut docs);

    docs
}
