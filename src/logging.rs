//! 日志初始化
//!
//! 设置了 `RUST_LOG` 时以它为准；否则开发模式使用配置的级别，
//! 非开发模式只输出警告及以上。

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::scanner::config::LoggingConfig;

/// 计算默认过滤规则
pub fn default_directive(config: &LoggingConfig) -> String {
    if config.dev_mode {
        format!("translateme={}", config.level)
    } else {
        "warn".to_string()
    }
}

/// 初始化全局日志订阅者，重复调用时忽略
pub fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config)));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init();
}
