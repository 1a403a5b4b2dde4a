//! 配置管理器
//!
//! 提供统一的配置接口，支持文件配置、环境变量和默认值

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants;
use crate::scanner::error::{ScanError, ScanResult};

/// 扫描引擎配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub target_language: TargetLanguage,
    pub oracle: OracleConfig,
    pub batch: BatchConfig,
    pub adaptive: AdaptiveConfig,
    pub extractor: ExtractorConfig,
    pub cache: CacheConfig,
    pub change: ChangeConfig,
    pub scan: ScanConfig,
    pub logging: LoggingConfig,
}

/// 目标语言代码
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TargetLanguage(pub String);

impl Default for TargetLanguage {
    fn default() -> Self {
        Self(constants::DEFAULT_TARGET_LANGUAGE.to_string())
    }
}

impl TargetLanguage {
    pub fn code(&self) -> &str {
        &self.0
    }
}

/// 分类服务配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OracleConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
    pub app_title: String,
    pub referer: Option<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_url: constants::DEFAULT_API_URL.to_string(),
            api_key: None,
            model: constants::DEFAULT_MODEL.to_string(),
            max_tokens: constants::DEFAULT_MAX_TOKENS,
            temperature: constants::DEFAULT_TEMPERATURE,
            request_timeout_secs: constants::DEFAULT_REQUEST_TIMEOUT_SECS,
            app_title: constants::DEFAULT_APP_TITLE.to_string(),
            referer: None,
        }
    }
}

impl OracleConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 批次硬上限
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_tokens_per_request: usize,
    pub max_texts_per_batch: usize,
    pub prompt_overhead_tokens: usize,
    pub max_estimated_response_ms: u64,
    pub tokens_per_second: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_request: constants::MAX_TOKENS_PER_REQUEST,
            max_texts_per_batch: constants::MAX_TEXTS_PER_BATCH,
            prompt_overhead_tokens: constants::PROMPT_OVERHEAD_TOKENS,
            max_estimated_response_ms: constants::MAX_ESTIMATED_RESPONSE_MS,
            tokens_per_second: constants::TOKENS_PER_SECOND,
        }
    }
}

/// 自适应批次参数
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub max_tokens_ceiling: f64,
    pub max_tokens_floor: f64,
    pub max_texts_ceiling: f64,
    pub max_texts_floor: f64,
    pub fast_ms: u64,
    pub slow_ms: u64,
    pub window_secs: u64,
    pub growth: f64,
    pub shrink: f64,
    pub failed_batch_ms: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_tokens_ceiling: constants::ADAPTIVE_MAX_TOKENS_CEILING,
            max_tokens_floor: constants::ADAPTIVE_MAX_TOKENS_FLOOR,
            max_texts_ceiling: constants::ADAPTIVE_MAX_TEXTS_CEILING,
            max_texts_floor: constants::ADAPTIVE_MAX_TEXTS_FLOOR,
            fast_ms: constants::ADAPTIVE_FAST_MS,
            slow_ms: constants::ADAPTIVE_SLOW_MS,
            window_secs: constants::ADAPTIVE_WINDOW_SECS,
            growth: constants::ADAPTIVE_GROWTH,
            shrink: constants::ADAPTIVE_SHRINK,
            failed_batch_ms: constants::FAILED_BATCH_MS,
        }
    }
}

/// 文本提取阈值
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub max_children: usize,
    pub max_container_text_chars: usize,
    pub max_text_chars: usize,
    pub min_scan_text_chars: usize,
    pub container_keywords: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_children: constants::MAX_CONTAINER_CHILDREN,
            max_container_text_chars: constants::MAX_CONTAINER_TEXT_CHARS,
            max_text_chars: constants::MAX_TEXT_CHARS,
            min_scan_text_chars: constants::MIN_SCAN_TEXT_CHARS,
            container_keywords: constants::CONTAINER_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// 结果缓存配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
    pub refresh_window_secs: u64,
    pub storage_key: String,
    pub adaptive_storage_key: String,
    pub issues_storage_key: String,
    pub db_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: constants::DEFAULT_CACHE_TTL_SECS,
            max_entries: constants::DEFAULT_CACHE_MAX_ENTRIES,
            refresh_window_secs: constants::REFRESH_WINDOW_SECS,
            storage_key: constants::CACHE_STORAGE_KEY.to_string(),
            adaptive_storage_key: constants::ADAPTIVE_STORAGE_KEY.to_string(),
            issues_storage_key: constants::ISSUES_STORAGE_KEY.to_string(),
            db_path: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_window(&self) -> Duration {
        Duration::from_secs(self.refresh_window_secs)
    }
}

/// 变化检测配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChangeConfig {
    pub invalidation_interval_ms: u64,
    pub navigation_window_ms: u64,
}

impl Default for ChangeConfig {
    fn default() -> Self {
        Self {
            invalidation_interval_ms: constants::INVALIDATION_INTERVAL_MS,
            navigation_window_ms: constants::NAVIGATION_WINDOW_MS,
        }
    }
}

/// 扫描调度配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    pub tracking_debounce_ms: u64,
    pub auto_scan_spacing_ms: u64,
    pub streaming_delay_ms: u64,
    pub coalesce_timeout_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            tracking_debounce_ms: constants::TRACKING_DEBOUNCE_MS,
            auto_scan_spacing_ms: constants::AUTO_SCAN_SPACING_MS,
            streaming_delay_ms: constants::STREAMING_DELAY_MS,
            coalesce_timeout_ms: constants::COALESCE_TIMEOUT_MS,
        }
    }
}

impl ScanConfig {
    pub fn tracking_debounce(&self) -> Duration {
        Duration::from_millis(self.tracking_debounce_ms)
    }

    pub fn auto_scan_spacing(&self) -> Duration {
        Duration::from_millis(self.auto_scan_spacing_ms)
    }

    pub fn streaming_delay(&self) -> Duration {
        Duration::from_millis(self.streaming_delay_ms)
    }

    pub fn coalesce_timeout(&self) -> Duration {
        Duration::from_millis(self.coalesce_timeout_ms)
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dev_mode: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dev_mode: false,
        }
    }
}

impl ScannerConfig {
    /// 验证配置
    pub fn validate(&self) -> ScanResult<()> {
        if self.target_language.code().is_empty() {
            return Err(ScanError::ConfigError("目标语言不能为空".to_string()));
        }

        if !self.oracle.api_url.starts_with("http://") && !self.oracle.api_url.starts_with("https://") {
            return Err(ScanError::ConfigError(format!(
                "API地址无效: {}",
                self.oracle.api_url
            )));
        }

        if self.batch.max_tokens_per_request <= self.batch.prompt_overhead_tokens {
            return Err(ScanError::ConfigError(
                "单次请求令牌上限必须大于提示词开销".to_string(),
            ));
        }

        if self.batch.max_texts_per_batch == 0 {
            return Err(ScanError::ConfigError("批次文本数不能为0".to_string()));
        }

        if self.batch.tokens_per_second <= 0.0 {
            return Err(ScanError::ConfigError("吞吐量必须大于0".to_string()));
        }

        if self.adaptive.max_tokens_floor > self.adaptive.max_tokens_ceiling
            || self.adaptive.max_texts_floor > self.adaptive.max_texts_ceiling
        {
            return Err(ScanError::ConfigError(
                "自适应下限不能高于上限".to_string(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(ScanError::ConfigError("缓存容量不能为0".to_string()));
        }

        Ok(())
    }

    /// 应用环境变量覆盖
    pub fn apply_env_overrides(&mut self) {
        use crate::env::{cache, core, oracle, scan, EnvVar};

        if let Some(Ok(level)) = core::LogLevel::get_set() {
            self.logging.level = level;
        }

        if let Some(Ok(dev_mode)) = core::DevMode::get_set() {
            self.logging.dev_mode = dev_mode;
        }

        if let Some(Ok(api_url)) = oracle::ApiUrl::get_set() {
            tracing::info!("环境变量覆盖 API URL: {}", api_url);
            self.oracle.api_url = api_url;
        }

        if let Some(Ok(api_key)) = oracle::ApiKey::get_set() {
            self.oracle.api_key = Some(api_key);
        }

        if let Some(Ok(model)) = oracle::Model::get_set() {
            self.oracle.model = model;
        }

        if let Some(Ok(lang)) = oracle::TargetLang::get_set() {
            self.target_language = TargetLanguage(lang);
        }

        if let Some(Ok(timeout)) = oracle::RequestTimeout::get_set() {
            self.oracle.request_timeout_secs = timeout.as_secs();
        }

        if let Some(Ok(ttl)) = cache::Ttl::get_set() {
            self.cache.ttl_secs = ttl.as_secs();
        }

        if let Some(Ok(max_entries)) = cache::MaxEntries::get_set() {
            self.cache.max_entries = max_entries;
        }

        if let Some(Ok(path)) = cache::DbPath::get_set() {
            self.cache.db_path = Some(path);
        }

        if let Some(Ok(delay)) = scan::StreamingDelay::get_set() {
            self.scan.streaming_delay_ms = delay.as_millis() as u64;
        }
    }
}

/// 配置管理器
pub struct ConfigManager {
    config: ScannerConfig,
}

impl ConfigManager {
    /// 按搜索路径加载配置
    pub fn new() -> ScanResult<Self> {
        Self::load_dotenv();
        let config = Self::load_config()?;
        Self::finish(config)
    }

    /// 从指定文件加载配置
    pub fn from_path(path: &Path) -> ScanResult<Self> {
        Self::load_dotenv();
        let config = Self::load_from_file(path)?;
        Self::finish(config)
    }

    fn finish(mut config: ScannerConfig) -> ScanResult<Self> {
        config.apply_env_overrides();
        config.validate()?;
        Ok(Self { config })
    }

    pub fn into_config(self) -> ScannerConfig {
        self.config
    }

    fn load_config() -> ScanResult<ScannerConfig> {
        for path in constants::CONFIG_PATHS {
            let expanded_path = shellexpand::tilde(path);
            let candidate = Path::new(expanded_path.as_ref());
            if candidate.exists() {
                tracing::info!("加载配置文件: {}", expanded_path);
                return Self::load_from_file(candidate);
            }
        }

        tracing::info!("未找到配置文件，使用默认配置");
        Ok(ScannerConfig::default())
    }

    fn load_from_file(path: &Path) -> ScanResult<ScannerConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScanError::ConfigError(format!("读取配置文件失败: {}", e)))?;

        if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .map_err(|e| ScanError::ConfigError(format!("解析JSON配置失败: {}", e)))
        } else {
            toml::from_str(&content)
                .map_err(|e| ScanError::ConfigError(format!("解析TOML配置失败: {}", e)))
        }
    }

    /// 加载 .env 文件
    fn load_dotenv() {
        let env_files = [".env.local", ".env.development", ".env.production", ".env"];

        for env_file in &env_files {
            if Path::new(env_file).exists() && dotenv::from_filename(env_file).is_ok() {
                tracing::info!("已加载环境变量文件: {}", env_file);
                break;
            }
        }
    }

    /// 生成示例配置文件
    pub fn generate_example_config(path: &Path) -> ScanResult<()> {
        let config = ScannerConfig::default();
        let body = toml::to_string_pretty(&config)
            .map_err(|e| ScanError::ConfigError(format!("序列化配置失败: {}", e)))?;
        let content = format!(
            "# TranslateMe 扫描引擎配置\n# API 密钥建议通过 TRANSLATEME_API_KEY 设置\n\n{}",
            body
        );

        std::fs::write(path, content)
            .map_err(|e| ScanError::ConfigError(format!("写入配置文件失败: {}", e)))?;

        Ok(())
    }
}
