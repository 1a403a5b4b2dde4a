// 集成测试公共模块
//
// 提供可编程的分类服务、页面夹具和编排器构建辅助

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use translateme::dom::PageDocument;
use translateme::scanner::{
    ClassificationOracle, Clock, HostMessage, KeyValueStore, ManualClock, MemoryStore,
    ScanOrchestrator, ScanResult, ScannerConfig, UsageGate,
};

pub const PAGE_URL: &str = "https://shop.example.com/products";

/// 三个区块，每个区块一个段落
pub const SECTIONED_PAGE: &str = "<html><body>\
    <section id='intro' class='content-section active'><p>Bienvenue chez nous</p></section>\
    <section id='offers' class='content-section'><p>Angebote der Woche</p></section>\
    <section id='contact' class='content-section'><p>Contact us today</p></section>\
    </body></html>";

/// 分类服务的回复方式
#[derive(Debug, Clone)]
pub enum Reply {
    /// 按文本查表，默认 Static/Issue
    Labels,
    /// 无法解析的回复
    Malformed(String),
}

/// 可编程的分类服务，记录每次请求中的文本
pub struct MockOracle {
    labels: Mutex<HashMap<String, String>>,
    reply: Mutex<Reply>,
    latency: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<String>>>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            labels: Mutex::new(HashMap::new()),
            reply: Mutex::new(Reply::Labels),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn label(self, text: &str, label: &str) -> Self {
        self.labels
            .lock()
            .unwrap()
            .insert(text.to_string(), label.to_string());
        self
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次请求里的文本
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().unwrap().clone()
    }
}

/// 从提示词中取出 `N. "text" | <tag>` 行里的文本
pub fn prompt_texts(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|line| {
            let (_, rest) = line.split_once(". \"")?;
            let (text, _) = rest.rsplit_once("\" | <")?;
            Some(text.to_string())
        })
        .collect()
}

#[async_trait]
impl ClassificationOracle for MockOracle {
    async fn complete(&self, prompt: &str) -> ScanResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let texts = prompt_texts(prompt);
        self.requests.lock().unwrap().push(texts.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let reply = self.reply.lock().unwrap().clone();
        match reply {
            Reply::Malformed(content) => Ok(content),
            Reply::Labels => {
                let labels = self.labels.lock().unwrap();
                Ok(texts
                    .iter()
                    .map(|text| labels.get(text).cloned().unwrap_or_else(|| "Static/Issue".to_string()))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
        }
    }
}

/// 测试配置：不做流式停顿
pub fn test_config() -> ScannerConfig {
    let mut config = ScannerConfig::default();
    config.scan.streaming_delay_ms = 0;
    config
}

pub fn page(html: &str) -> Rc<PageDocument> {
    Rc::new(PageDocument::parse(html, PAGE_URL).expect("fixture page should parse"))
}

/// 测试环境
pub struct TestEnvironment {
    pub page: Rc<PageDocument>,
    pub oracle: Arc<MockOracle>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn KeyValueStore>,
    pub config: ScannerConfig,
    pub usage: Option<Arc<dyn UsageGate>>,
}

impl TestEnvironment {
    pub fn new(html: &str) -> Self {
        Self::with_oracle(html, MockOracle::new())
    }

    pub fn with_oracle(html: &str, oracle: MockOracle) -> Self {
        Self {
            page: page(html),
            oracle: Arc::new(oracle),
            clock: Arc::new(ManualClock::default()),
            store: Arc::new(MemoryStore::new()),
            config: test_config(),
            usage: None,
        }
    }

    /// 构建编排器，返回宿主消息接收端
    pub fn orchestrator(&self) -> (ScanOrchestrator, UnboundedReceiver<HostMessage>) {
        let (tx, rx) = unbounded_channel();
        let clock: Arc<dyn Clock> = self.clock.clone();
        let mut builder = ScanOrchestrator::builder(Rc::clone(&self.page), self.config.clone())
            .oracle(self.oracle.clone())
            .store(Arc::clone(&self.store))
            .clock(clock)
            .host(tx);
        if let Some(usage) = &self.usage {
            builder = builder.usage(Arc::clone(usage));
        }
        let orchestrator = builder.build().expect("orchestrator should build");
        (orchestrator, rx)
    }
}

/// 取出当前已到达的全部宿主消息
pub fn drain(rx: &mut UnboundedReceiver<HostMessage>) -> Vec<HostMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

pub fn count_completed(messages: &[HostMessage]) -> usize {
    messages
        .iter()
        .filter(|message| matches!(message, HostMessage::ScanCompleted { .. }))
        .count()
}
