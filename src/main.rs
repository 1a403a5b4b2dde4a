//! 命令行入口

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use encoding_rs::Encoding;
use tracing::info;

use translateme::dom::PageDocument;
use translateme::logging::init_logging;
use translateme::scanner::config::manager::TargetLanguage;
use translateme::scanner::pipeline::AdaptiveBatchTuner;
use translateme::scanner::storage::IssueRegistry;
use translateme::scanner::{
    ConfigManager, Issue, KeyValueStore, RedbStore, ResultCache, ScanError, ScanOrchestrator,
    ScanOutcome, ScanResult, ScanTrigger, ScannerConfig, SystemClock,
};

const DEFAULT_DB_FILE: &str = "scan-cache.redb";
const TEXT_PREVIEW_CHARS: usize = 48;

#[derive(Parser)]
#[command(
    name = "translateme",
    version,
    about = "Flags page text that is not written in the target language"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a saved HTML page once
    Scan(ScanArgs),
    /// Inspect or clear the persisted result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// HTML file to scan
    file: PathBuf,
    /// URL the page was loaded from
    #[arg(long)]
    url: String,
    /// Target language code (e.g. en, fr)
    #[arg(long)]
    target: Option<String>,
    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Result database
    #[arg(long)]
    db: Option<PathBuf>,
    /// Document charset when the file has no BOM
    #[arg(long, default_value = "utf-8")]
    encoding: String,
    /// Print issues as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct StoreArgs {
    /// Result database
    #[arg(long)]
    db: Option<PathBuf>,
    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show what the result database holds
    Stats(StoreArgs),
    /// Remove cached results, session issues and batch settings
    Clear(StoreArgs),
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write an example configuration file
    Init { path: PathBuf },
    /// List the environment variables that override the configuration
    Env,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Scan(args) => run_scan(args),
        Command::Cache { action } => run_cache(action),
        Command::Config {
            action: ConfigAction::Init { path },
        } => init_config(&path),
        Command::Config {
            action: ConfigAction::Env,
        } => {
            print!("{}", translateme::env::generate_env_docs());
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("错误: {}", e);
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// 公共辅助
// ============================================================================

fn load_config(path: Option<&Path>) -> ScanResult<ScannerConfig> {
    let manager = match path {
        Some(path) => ConfigManager::from_path(path)?,
        None => ConfigManager::new()?,
    };
    let config = manager.into_config();
    init_logging(&config.logging);
    Ok(config)
}

fn default_db_path() -> ScanResult<PathBuf> {
    directories::ProjectDirs::from("", "", "translateme")
        .map(|dirs| dirs.cache_dir().join(DEFAULT_DB_FILE))
        .ok_or_else(|| ScanError::ConfigError("无法确定缓存目录".to_string()))
}

fn resolve_db_path(arg: Option<PathBuf>, config: &ScannerConfig) -> ScanResult<PathBuf> {
    match arg.or_else(|| config.cache.db_path.clone()) {
        Some(path) => Ok(path),
        None => default_db_path(),
    }
}

fn runtime() -> ScanResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ScanError::InternalError(format!("创建运行时失败: {}", e)))
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(TEXT_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

// ============================================================================
// scan
// ============================================================================

fn run_scan(args: ScanArgs) -> ScanResult<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(target) = &args.target {
        config.target_language = TargetLanguage(target.to_lowercase());
    }
    if !config.oracle.is_configured() {
        return Err(ScanError::ConfigError(
            "未设置 API 密钥，请通过 TRANSLATEME_API_KEY 或配置文件提供".to_string(),
        ));
    }
    config.cache.db_path = Some(resolve_db_path(args.db.clone(), &config)?);
    config.scan.streaming_delay_ms = 0;

    let data = std::fs::read(&args.file)?;
    let encoding = Encoding::for_bom(&data)
        .map(|(encoding, _)| encoding.name().to_string())
        .unwrap_or_else(|| args.encoding.clone());
    info!("读取页面: {} ({})", args.file.display(), encoding);

    runtime()?.block_on(async move {
        let page = Rc::new(PageDocument::from_bytes(&data, &encoding, &args.url)?);
        let mut orchestrator = ScanOrchestrator::builder(page, config).build()?;

        let summary = match orchestrator.scan(ScanTrigger::Manual).await {
            ScanOutcome::Completed(summary) => summary,
            ScanOutcome::Blocked(reason) => return Err(ScanError::QuotaExceeded(reason)),
        };
        let issues = orchestrator.issues().issues();

        if args.json {
            let report = serde_json::json!({
                "url": args.url,
                "summary": summary,
                "issues": issues,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_issue_table(&issues);
            println!(
                "\n候选 {} 个，缓存命中 {} 个，分类 {} 个（{} 批），问题 {} 个，耗时 {}ms",
                summary.candidates,
                summary.cache_hits,
                summary.classified,
                summary.batches,
                summary.total_issues,
                summary.duration_ms
            );
        }
        Ok(())
    })
}

fn print_issue_table(issues: &[Issue]) {
    if issues.is_empty() {
        println!("未发现翻译问题");
        return;
    }

    println!(
        "{:<10} {:<8} {:<8} {:<24} {:<6} TEXT",
        "ID", "TYPE", "TAG", "SELECTOR", "LANG"
    );
    for issue in issues {
        let language = issue
            .language
            .as_ref()
            .map(|detection| detection.language.as_str())
            .unwrap_or("-");
        println!(
            "{:<10} {:<8} {:<8} {:<24} {:<6} {}",
            issue.id,
            issue.data_type.to_string(),
            issue.html_tag,
            issue.selector,
            language,
            preview(&issue.text)
        );
    }
}

// ============================================================================
// cache
// ============================================================================

fn run_cache(action: CacheAction) -> ScanResult<()> {
    let (args, clear) = match action {
        CacheAction::Stats(args) => (args, false),
        CacheAction::Clear(args) => (args, true),
    };
    let config = load_config(args.config.as_deref())?;
    let path = resolve_db_path(args.db, &config)?;
    let store: Arc<dyn KeyValueStore> = Arc::new(RedbStore::open(&path)?);

    runtime()?.block_on(async move {
        let clock = Arc::new(SystemClock);
        let mut cache = ResultCache::new(config.cache.clone(), Arc::clone(&store), clock.clone());
        let mut issues = IssueRegistry::new(Arc::clone(&store), config.cache.issues_storage_key.clone());

        if clear {
            cache.clear().await;
            issues.clear().await;
            store.remove(&config.cache.adaptive_storage_key).await?;
            println!("✅ 已清空结果缓存: {}", path.display());
            return Ok(());
        }

        cache.load().await;
        issues.restore().await;
        let mut tuner = AdaptiveBatchTuner::new(
            config.adaptive.clone(),
            Arc::clone(&store),
            config.cache.adaptive_storage_key.clone(),
            clock,
        );
        tuner.load().await;

        let issue_entries = cache.entries().filter(|entry| entry.verdict.is_issue()).count();
        let oldest = cache.entries().map(|entry| entry.timestamp).min();
        let newest = cache.entries().map(|entry| entry.timestamp).max();
        let settings = tuner.settings();

        println!("数据库: {}", path.display());
        println!("缓存条目: {}", cache.len());
        println!("问题条目: {}", issue_entries);
        if let (Some(oldest), Some(newest)) = (oldest, newest) {
            println!("时间范围: {} ~ {}", oldest.to_rfc3339(), newest.to_rfc3339());
        }
        println!("会话问题: {}", issues.len());
        println!(
            "批次设置: {:.0} tokens / {:.1} 条",
            settings.max_tokens, settings.max_texts
        );
        Ok(())
    })
}

// ============================================================================
// config
// ============================================================================

fn init_config(path: &Path) -> ScanResult<()> {
    ConfigManager::generate_example_config(path)?;
    println!("✅ 已生成示例配置: {}", path.display());
    Ok(())
}
