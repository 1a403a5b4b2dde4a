//! 扫描配置管理模块
//!
//! 提供配置管理，支持 .env、配置文件、环境变量和默认值

pub mod manager;

pub use manager::{
    AdaptiveConfig, BatchConfig, CacheConfig, ChangeConfig, ConfigManager, ExtractorConfig,
    LoggingConfig, OracleConfig, ScanConfig, ScannerConfig,
};

/// 配置常量
pub mod constants {
    // 文本提取
    pub const TEXT_TAGS: &[&str] = &[
        "h1", "h2", "h3", "h4", "h5", "h6", "p", "span", "a", "button", "input", "textarea",
        "label", "li", "td", "th",
    ];
    /// 只有带 placeholder 时才扫描的表单元素
    pub const PLACEHOLDER_TAGS: &[&str] = &["input", "textarea"];
    pub const HIDDEN_ANCESTOR_TAGS: &[&str] = &["head", "script", "style", "template", "noscript"];
    pub const CONTAINER_KEYWORDS: &[&str] = &[
        "container", "section", "content", "main", "wrapper", "box", "card", "panel",
    ];
    pub const MAX_CONTAINER_CHILDREN: usize = 5;
    pub const MAX_CONTAINER_TEXT_CHARS: usize = 1000;
    pub const MAX_TEXT_CHARS: usize = 500;
    pub const MIN_SCAN_TEXT_CHARS: usize = 3;

    // 令牌估算与批次
    pub const MAX_TOKENS_PER_REQUEST: usize = 80_000;
    pub const MAX_TEXTS_PER_BATCH: usize = 25;
    pub const PROMPT_OVERHEAD_TOKENS: usize = 500;
    pub const MAX_ESTIMATED_RESPONSE_MS: u64 = 15_000;
    pub const TOKENS_PER_SECOND: f64 = 5_000.0;
    pub const ASCII_RATIO_THRESHOLD: f64 = 0.8;
    pub const ASCII_CHARS_PER_TOKEN: f64 = 4.0;
    pub const OTHER_CHARS_PER_TOKEN: f64 = 2.5;
    pub const COMPLEXITY_FACTOR: f64 = 1.1;

    // 自适应批次
    pub const ADAPTIVE_MAX_TOKENS_CEILING: f64 = 100_000.0;
    pub const ADAPTIVE_MAX_TOKENS_FLOOR: f64 = 40_000.0;
    pub const ADAPTIVE_MAX_TEXTS_CEILING: f64 = 35.0;
    pub const ADAPTIVE_MAX_TEXTS_FLOOR: f64 = 15.0;
    pub const ADAPTIVE_FAST_MS: u64 = 10_000;
    pub const ADAPTIVE_SLOW_MS: u64 = 20_000;
    pub const ADAPTIVE_WINDOW_SECS: u64 = 60;
    pub const ADAPTIVE_GROWTH: f64 = 1.1;
    pub const ADAPTIVE_SHRINK: f64 = 0.8;
    pub const FAILED_BATCH_MS: u64 = 30_000;

    // 分类服务
    pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
    pub const DEFAULT_MODEL: &str = "deepseek/deepseek-chat";
    pub const DEFAULT_MAX_TOKENS: u32 = 200;
    pub const DEFAULT_TEMPERATURE: f32 = 0.3;
    pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_APP_TITLE: &str = "TranslateMe";
    pub const DEFAULT_TARGET_LANGUAGE: &str = "en";
    pub const MAX_RESPONSE_LINE_CHARS: usize = 100;
    pub const SHORT_LINE_CHARS: usize = 20;

    // 缓存
    pub const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
    pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;
    pub const REFRESH_WINDOW_SECS: u64 = 5;
    pub const CACHE_STORAGE_KEY: &str = "autoScanCache";
    pub const ADAPTIVE_STORAGE_KEY: &str = "translateMe_adaptiveSettings";
    pub const ISSUES_STORAGE_KEY: &str = "sessionIssues";
    pub const CACHE_FORMAT_VERSION: &str = "1.0";

    // 变化检测
    pub const SECTION_CLASS: &str = "content-section";
    pub const SECTION_TAGS: &[&str] = &["main", "article", "section"];
    pub const INVALIDATION_INTERVAL_MS: u64 = 1000;
    pub const NAVIGATION_WINDOW_MS: u64 = 2000;

    // 扫描调度
    pub const TRACKING_DEBOUNCE_MS: u64 = 1000;
    pub const AUTO_SCAN_SPACING_MS: u64 = 3000;
    pub const STREAMING_DELAY_MS: u64 = 300;
    pub const COALESCE_TIMEOUT_MS: u64 = 5000;

    // 配置文件搜索路径
    pub const CONFIG_PATHS: &[&str] = &[
        "translateme.toml",
        ".translateme.toml",
        "translateme.json",
        "~/.config/translateme/config.toml",
        "/etc/translateme/config.toml",
    ];
}
