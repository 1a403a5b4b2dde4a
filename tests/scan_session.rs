//! 扫描会话：自动模式防抖、扫描间隔、并发请求与停止条件
//!
//! 全部在暂停的时钟下运行，时间由 tokio 自动推进。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use translateme::scanner::{HostMessage, ScanQuota, ScanSession, UsageGate};

#[allow(dead_code)]
mod common {
    include!("common/mod.rs");
}

use common::{count_completed, drain, MockOracle, TestEnvironment};

const PAGE: &str = "<html><body><p id='headline'>Willkommen zurück</p></body></html>";

/// 自动模式下连续修改只触发一次扫描，且两次自动扫描之间至少间隔 3 秒
#[tokio::test(start_paused = true)]
async fn test_auto_mode_coalesces_mutations_and_keeps_spacing() {
    let env = TestEnvironment::new(PAGE);
    let (orchestrator, mut rx) = env.orchestrator();
    let (session, handle) = ScanSession::new(orchestrator);

    let driver = async {
        handle.start_auto();

        // 第一次自动扫描在 1 秒时
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(count_completed(&drain(&mut rx)), 1);

        let headline = env.page.element_by_id("headline").unwrap();
        env.page.set_text(&headline, "Willkommen");
        sleep(Duration::from_millis(100)).await;
        env.page.set_text(&headline, "Willkommen bei uns");
        sleep(Duration::from_millis(100)).await;
        env.page.set_text(&headline, "Willkommen bei uns zu Hause");

        // 防抖在 2.7 秒到期，但距上次完成不足 3 秒，推迟到 4 秒
        sleep(Duration::from_millis(2100)).await;
        assert_eq!(count_completed(&drain(&mut rx)), 0);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(count_completed(&drain(&mut rx)), 1);

        handle.shutdown();
    };

    let (orchestrator, ()) = tokio::join!(session.run(), driver);
    assert_eq!(orchestrator.passes(), 2);
    assert_eq!(env.oracle.calls(), 2);
    assert_eq!(
        env.oracle.requests()[1],
        vec!["Willkommen bei uns zu Hause".to_string()]
    );

    println!("✅ 自动模式防抖与扫描间隔");
}

/// 扫描进行中收到的扫描请求被忽略
#[tokio::test(start_paused = true)]
async fn test_scan_request_during_pass_is_dropped() {
    let env = TestEnvironment::with_oracle(
        PAGE,
        MockOracle::new().with_latency(Duration::from_secs(2)),
    );
    let (orchestrator, mut rx) = env.orchestrator();
    let state = orchestrator.state_handle();
    let (session, handle) = ScanSession::new(orchestrator);

    let driver = async {
        handle.scan();
        sleep(Duration::from_millis(500)).await;
        assert!(!state.is_idle());
        assert!(handle.scan());

        sleep(Duration::from_secs(3)).await;
        assert!(state.is_idle());
        assert_eq!(count_completed(&drain(&mut rx)), 1);

        handle.shutdown();
    };

    let (orchestrator, ()) = tokio::join!(session.run(), driver);
    assert_eq!(orchestrator.passes(), 1);
    assert_eq!(env.oracle.calls(), 1);

    println!("✅ 扫描期间的重复请求被忽略");
}

/// 扫描期间停止自动模式：当前扫描完成，之后不再自动触发
#[tokio::test(start_paused = true)]
async fn test_stop_auto_during_pass() {
    let env = TestEnvironment::with_oracle(
        PAGE,
        MockOracle::new().with_latency(Duration::from_secs(2)),
    );
    let (orchestrator, mut rx) = env.orchestrator();
    let (session, handle) = ScanSession::new(orchestrator);

    let driver = async {
        handle.start_auto();
        let headline = env.page.element_by_id("headline").unwrap();

        // 第一次扫描 1 秒开始，3 秒结束
        sleep(Duration::from_millis(1500)).await;
        env.page.set_text(&headline, "Guten Morgen");
        sleep(Duration::from_millis(500)).await;
        handle.stop_auto();

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(count_completed(&drain(&mut rx)), 1);

        env.page.set_text(&headline, "Guten Abend");
        sleep(Duration::from_secs(10)).await;
        assert_eq!(count_completed(&drain(&mut rx)), 0);

        handle.shutdown();
    };

    let (orchestrator, ()) = tokio::join!(session.run(), driver);
    assert_eq!(orchestrator.passes(), 1);
    assert_eq!(env.oracle.calls(), 1);

    println!("✅ 扫描期间停止自动模式");
}

/// 配额耗尽时扫描被阻止，自动模式随之停止
#[tokio::test(start_paused = true)]
async fn test_quota_exhaustion_stops_auto_mode() {
    let quota = Arc::new(ScanQuota::new(1));
    let mut env = TestEnvironment::new(PAGE);
    env.usage = Some(quota.clone() as Arc<dyn UsageGate>);
    let (orchestrator, mut rx) = env.orchestrator();
    let (session, handle) = ScanSession::new(orchestrator);

    let driver = async {
        handle.start_auto();
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(count_completed(&drain(&mut rx)), 1);
        assert_eq!(quota.remaining(), 0);

        let headline = env.page.element_by_id("headline").unwrap();
        env.page.set_text(&headline, "Schönen Tag noch");

        // 4 秒时的自动扫描被配额阻止
        sleep(Duration::from_secs(3)).await;
        let messages = drain(&mut rx);
        assert_eq!(count_completed(&messages), 0);
        assert!(messages
            .iter()
            .any(|message| matches!(message, HostMessage::ScanBlocked { .. })));

        env.page.set_text(&headline, "Bis bald");
        sleep(Duration::from_secs(10)).await;
        assert!(drain(&mut rx).is_empty());

        handle.shutdown();
    };

    let (orchestrator, ()) = tokio::join!(session.run(), driver);
    assert_eq!(orchestrator.passes(), 1);
    assert_eq!(env.oracle.calls(), 1);

    println!("✅ 配额耗尽停止自动模式");
}

/// 跳转到其他站点后自动模式停止，手动扫描不受影响
#[tokio::test(start_paused = true)]
async fn test_hostname_change_stops_auto_mode() {
    let env = TestEnvironment::new(PAGE);
    let (orchestrator, mut rx) = env.orchestrator();
    let (session, handle) = ScanSession::new(orchestrator);

    let driver = async {
        handle.start_auto();
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(count_completed(&drain(&mut rx)), 1);

        sleep(Duration::from_secs(4)).await;
        env.page.navigate("https://other.example.org/start");
        sleep(Duration::from_secs(5)).await;
        assert_eq!(count_completed(&drain(&mut rx)), 0);

        handle.scan();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(count_completed(&drain(&mut rx)), 1);

        handle.shutdown();
    };

    let (orchestrator, ()) = tokio::join!(session.run(), driver);
    assert_eq!(orchestrator.passes(), 2);

    println!("✅ 站点变化停止自动模式");
}

/// 清空缓存的命令在扫描结束后执行
#[tokio::test(start_paused = true)]
async fn test_clear_cache_command() {
    let env = TestEnvironment::with_oracle(
        PAGE,
        MockOracle::new().with_latency(Duration::from_secs(1)),
    );
    let (orchestrator, mut rx) = env.orchestrator();
    let (session, handle) = ScanSession::new(orchestrator);

    let driver = async {
        handle.scan();
        sleep(Duration::from_millis(200)).await;
        handle.clear_cache();
        sleep(Duration::from_secs(2)).await;

        let messages = drain(&mut rx);
        let completed_at = messages
            .iter()
            .position(|message| matches!(message, HostMessage::ScanCompleted { .. }));
        let cleared_at = messages
            .iter()
            .position(|message| matches!(message, HostMessage::CacheCleared));
        assert!(completed_at.is_some());
        assert!(cleared_at > completed_at);

        handle.shutdown();
    };

    let (orchestrator, ()) = tokio::join!(session.run(), driver);
    assert!(orchestrator.cache().is_empty());
}

/// 区块切换事件开启导航窗口，窗口内的内容变化不触发区块失效
#[tokio::test(start_paused = true)]
async fn test_section_change_event_opens_navigation_window() {
    let env = TestEnvironment::new(common::SECTIONED_PAGE);
    let (orchestrator, mut rx) = env.orchestrator();
    let (session, handle) = ScanSession::new(orchestrator);

    let driver = async {
        handle.scan();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(count_completed(&drain(&mut rx)), 1);

        env.page.announce_section_change("offers");
        sleep(Duration::from_millis(10)).await;
        let intro = env.page.element_by_id("intro").unwrap();
        let paragraph = translateme::dom::elements_by_tag(&intro, "p").remove(0);
        env.page.set_text(&paragraph, "Bienvenue à tous");

        handle.scan();
        sleep(Duration::from_millis(100)).await;
        let summaries: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|message| match message {
                HostMessage::ScanCompleted { summary } => Some(summary),
                _ => None,
            })
            .collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].invalidated, 0);
        assert_eq!(summaries[0].classified, 1);

        handle.shutdown();
    };

    let (orchestrator, ()) = tokio::join!(session.run(), driver);
    assert!(orchestrator.change_detector().is_navigating());
}
