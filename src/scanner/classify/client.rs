//! 分类客户端
//!
//! 把一个批次的文本发送给外部分类服务，并把自由文本回复解析为固定的结论集合。
//! 对调用方来说分类永远不会失败：传输或解析错误都会退化为全部 `Static/Issue`，
//! 回复条数不足时用同样的默认值补齐。

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::inflight::{coalesce_key, InflightRequests};
use super::parser::{normalize, parse_response};
use super::verdict::Verdict;
use crate::scanner::config::OracleConfig;
use crate::scanner::detector::language_name;
use crate::scanner::error::{ScanError, ScanResult};
use crate::scanner::pipeline::extractor::ScannableElement;

// ============================================================================
// 分类服务接口
// ============================================================================

/// 外部文本分类服务
#[async_trait]
pub trait ClassificationOracle: Send + Sync {
    /// 发送提示词，返回模型的原始文本回复
    async fn complete(&self, prompt: &str) -> ScanResult<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// 兼容 OpenAI 聊天补全接口的 HTTP 分类服务
pub struct HttpOracle {
    client: reqwest::Client,
    config: OracleConfig,
}

impl HttpOracle {
    pub fn new(config: OracleConfig) -> ScanResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    fn status_error(status: u16, body: String) -> ScanError {
        match status {
            401 => ScanError::Unauthorized(format!("API密钥无效: {}", body)),
            429 => ScanError::RateLimitExceeded,
            500..=599 => ScanError::ServiceUnavailable {
                status,
                message: body,
            },
            _ => ScanError::OracleError {
                status,
                message: body,
            },
        }
    }
}

#[async_trait]
impl ClassificationOracle for HttpOracle {
    async fn complete(&self, prompt: &str) -> ScanResult<String> {
        let api_key = match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => return Err(ScanError::ConfigError("未配置分类服务API密钥".to_string())),
        };

        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let mut request = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", &self.config.app_title);
        if let Some(referer) = &self.config.referer {
            request = request.header("HTTP-Referer", referer);
        }

        let response = request.json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::status_error(status.as_u16(), text));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or_else(|| ScanError::ParseError("分类服务响应缺少 choices[0].message.content".to_string()))
    }
}

// ============================================================================
// 提示词
// ============================================================================

/// 发送给分类服务的单个条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyItem {
    pub text: String,
    pub tag_name: String,
    pub class_name: String,
}

impl From<&ScannableElement> for ClassifyItem {
    fn from(element: &ScannableElement) -> Self {
        Self {
            text: element.text.clone(),
            tag_name: element.tag_name.clone(),
            class_name: element.class_name.clone(),
        }
    }
}

/// 构建分类提示词
pub fn build_prompt(items: &[ClassifyItem], target_language: &str) -> String {
    let language = language_name(target_language).unwrap_or(target_language);

    let mut prompt = format!(
        "You are a translation QA expert. Analyze each text and classify as:\n\
         - Static/Issue (UI element not in {language})\n\
         - Static/No_Issue (UI element correctly in {language})\n\
         - Dynamic/Issue (user content not in {language})\n\
         - Dynamic/No_Issue (user content correctly in {language})\n\n\
         Texts to analyze:\n"
    );

    for (index, item) in items.iter().enumerate() {
        let tag = if item.tag_name.is_empty() {
            "unknown".to_string()
        } else {
            item.tag_name.to_lowercase()
        };
        let class_info = if item.class_name.is_empty() {
            String::new()
        } else {
            format!(" class=\"{}\"", item.class_name)
        };
        let _ = writeln!(prompt, "{}. \"{}\" | <{}{}>", index + 1, item.text, tag, class_info);
    }

    let _ = write!(
        prompt,
        "\nIMPORTANT: You must provide exactly {} results, one for each text above.\n\
         Format: One result per line, using only these exact values:\n\
         - Static/Issue\n\
         - Static/No_Issue\n\
         - Dynamic/Issue\n\
         - Dynamic/No_Issue\n\n\
         Results:\n",
        items.len()
    );

    prompt
}

// ============================================================================
// 分类客户端
// ============================================================================

/// 一个批次的分类结果
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// 与输入一一对应的结论
    pub verdicts: Vec<Verdict>,
    /// 请求失败，结论全部为默认值
    pub fallback: bool,
    /// 因回复条数不足而补齐的数量
    pub padded: usize,
}

impl Classification {
    pub fn fallback(count: usize) -> Self {
        Self {
            verdicts: vec![Verdict::FALLBACK; count],
            fallback: true,
            padded: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.fallback
    }
}

/// 客户端统计
#[derive(Debug, Default)]
pub struct ClientStats {
    requests: AtomicUsize,
    failures: AtomicUsize,
    coalesced: AtomicUsize,
}

impl ClientStats {
    pub fn get_requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn get_coalesced(&self) -> usize {
        self.coalesced.load(Ordering::Relaxed)
    }
}

/// 分类客户端
pub struct ClassificationClient {
    oracle: Arc<dyn ClassificationOracle>,
    inflight: InflightRequests,
    stats: Arc<ClientStats>,
}

impl ClassificationClient {
    pub fn new(oracle: Arc<dyn ClassificationOracle>, coalesce_timeout: Duration) -> Self {
        Self {
            oracle,
            inflight: InflightRequests::new(coalesce_timeout),
            stats: Arc::new(ClientStats::default()),
        }
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// 分类一个批次
    ///
    /// 文本完全相同的并发请求只发送一次，后到的调用方等待同一个结果。
    pub async fn classify(&self, items: &[ClassifyItem], target_language: &str) -> Classification {
        if items.is_empty() {
            return Classification {
                verdicts: Vec::new(),
                fallback: false,
                padded: 0,
            };
        }

        let key = coalesce_key(target_language, items.iter().map(|item| item.text.as_str()));
        let oracle = Arc::clone(&self.oracle);
        let stats = Arc::clone(&self.stats);
        let owned = items.to_vec();
        let target = target_language.to_string();

        let (classification, joined) = self
            .inflight
            .run(key, move || {
                async move { request_verdicts(oracle.as_ref(), &stats, &owned, &target).await }.boxed()
            })
            .await;

        if joined {
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        classification
    }
}

async fn request_verdicts(
    oracle: &dyn ClassificationOracle,
    stats: &ClientStats,
    items: &[ClassifyItem],
    target_language: &str,
) -> Classification {
    let expected = items.len();
    let prompt = build_prompt(items, target_language);
    stats.requests.fetch_add(1, Ordering::Relaxed);
    debug!("发送分类请求: {} 个文本", expected);

    match oracle.complete(&prompt).await {
        Ok(content) => {
            let parsed = parse_response(&content);
            let padded = expected.saturating_sub(parsed.len());
            if padded > 0 {
                warn!("分类结果不足: 期望 {}，得到 {}，以默认值补齐", expected, parsed.len());
            } else if parsed.len() > expected {
                debug!("分类结果多于输入: {} > {}，已截断", parsed.len(), expected);
            }
            Classification {
                verdicts: normalize(parsed, expected),
                fallback: false,
                padded,
            }
        }
        Err(e) => {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            match &e {
                ScanError::Unauthorized(_) => error!("分类服务认证失败，使用默认结论"),
                ScanError::RateLimitExceeded => error!("分类服务限流，使用默认结论"),
                ScanError::ServiceUnavailable { status, .. } => {
                    error!("分类服务暂时不可用 ({})，使用默认结论", status)
                }
                other => error!("分类请求失败，使用默认结论: {}", other),
            }
            Classification::fallback(expected)
        }
    }
}
