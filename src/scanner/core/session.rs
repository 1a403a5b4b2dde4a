//! 扫描会话
//!
//! 会话拥有编排器，并在一个事件循环里处理三类输入：宿主命令、页面变更和防抖定时器。
//! 自动模式下，相关的页面变更只会重置定时器，定时器触发才会开始扫描。
//! 扫描进行中循环仍在运行：新的扫描请求被丢弃，变更继续重置定时器，
//! 所以一串变更只会带来一次后续扫描。

use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::debounce::Debouncer;
use super::orchestrator::{ScanOrchestrator, ScanOutcome, ScanTrigger};
use crate::dom::{has_class, PageEvent};
use crate::scanner::config::constants::SECTION_CLASS;

/// 宿主发往会话的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCommand {
    /// 立即手动扫描
    Scan,
    StartAuto,
    StopAuto,
    ClearCache,
    Shutdown,
}

/// 会话命令句柄
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: UnboundedSender<ScanCommand>,
}

impl SessionHandle {
    /// 会话已结束时返回 `false`
    pub fn send(&self, command: ScanCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn scan(&self) -> bool {
        self.send(ScanCommand::Scan)
    }

    pub fn start_auto(&self) -> bool {
        self.send(ScanCommand::StartAuto)
    }

    pub fn stop_auto(&self) -> bool {
        self.send(ScanCommand::StopAuto)
    }

    pub fn clear_cache(&self) -> bool {
        self.send(ScanCommand::ClearCache)
    }

    pub fn shutdown(&self) -> bool {
        self.send(ScanCommand::Shutdown)
    }
}

/// 页面事件对会话的意义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventAction {
    /// 自动模式下重置定时器
    Rescan,
    /// 开始导航窗口
    Navigation,
    Ignore,
}

fn event_action(event: &PageEvent) -> EventAction {
    match event {
        PageEvent::CharacterData { .. } => EventAction::Rescan,
        PageEvent::ChildList { .. } if event.adds_text() => EventAction::Rescan,
        PageEvent::Attribute { target, name }
            if name == "class" && has_class(target, SECTION_CLASS) && has_class(target, "active") =>
        {
            EventAction::Rescan
        }
        PageEvent::UrlChanged { .. } => EventAction::Rescan,
        PageEvent::VisibilityChanged { visible: true } => EventAction::Rescan,
        PageEvent::SectionChanged { .. } => EventAction::Navigation,
        _ => EventAction::Ignore,
    }
}

/// 自动模式
#[derive(Debug, Clone)]
struct AutoMode {
    /// 开启时的站点
    hostname: Option<String>,
}

/// 扫描会话
pub struct ScanSession {
    orchestrator: ScanOrchestrator,
    commands: UnboundedReceiver<ScanCommand>,
    events: UnboundedReceiver<PageEvent>,
    debouncer: Debouncer,
    auto: Option<AutoMode>,
    last_auto_completed: Option<Instant>,
    pending_navigation: bool,
}

impl ScanSession {
    pub fn new(orchestrator: ScanOrchestrator) -> (Self, SessionHandle) {
        let (tx, commands) = unbounded_channel();
        let events = orchestrator.page().subscribe();
        let debouncer = Debouncer::new(orchestrator.config().scan.tracking_debounce());

        let session = Self {
            orchestrator,
            commands,
            events,
            debouncer,
            auto: None,
            last_auto_completed: None,
            pending_navigation: false,
        };
        (session, SessionHandle { tx })
    }

    pub fn orchestrator(&self) -> &ScanOrchestrator {
        &self.orchestrator
    }

    pub fn is_auto(&self) -> bool {
        self.auto.is_some()
    }

    /// 运行事件循环，收到 `Shutdown` 或所有句柄都被丢弃后返回编排器
    pub async fn run(mut self) -> ScanOrchestrator {
        self.orchestrator.initialize().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("命令通道已关闭，结束扫描会话");
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = self.events.recv() => self.handle_event(&event),
                _ = self.debouncer.fired() => {
                    if !self.on_timer().await {
                        break;
                    }
                }
            }
        }

        info!("扫描会话结束，共完成 {} 次扫描", self.orchestrator.passes());
        self.orchestrator
    }

    /// 返回 `false` 表示会话应当结束
    async fn handle_command(&mut self, command: ScanCommand) -> bool {
        match command {
            ScanCommand::Scan => self.run_pass(ScanTrigger::Manual).await,
            ScanCommand::StartAuto => {
                self.start_auto();
                true
            }
            ScanCommand::StopAuto => {
                self.stop_auto();
                true
            }
            ScanCommand::ClearCache => {
                self.orchestrator.clear_cache().await;
                true
            }
            ScanCommand::Shutdown => false,
        }
    }

    fn handle_event(&mut self, event: &PageEvent) {
        match event_action(event) {
            EventAction::Rescan if self.auto.is_some() => {
                debug!("页面变化，重新计时");
                self.debouncer.schedule();
            }
            EventAction::Navigation => self.orchestrator.mark_navigation(),
            _ => {}
        }
    }

    fn start_auto(&mut self) {
        let hostname = self.orchestrator.page().hostname();
        info!("开启自动扫描: {}", hostname.as_deref().unwrap_or("-"));
        self.auto = Some(AutoMode { hostname });
        self.debouncer.schedule();
    }

    fn stop_auto(&mut self) {
        if self.auto.take().is_some() {
            info!("已停止自动扫描");
        }
        self.debouncer.cancel();
    }

    /// 定时器触发
    async fn on_timer(&mut self) -> bool {
        let Some(mode) = &self.auto else {
            return true;
        };

        if self.orchestrator.page().hostname() != mode.hostname {
            info!("站点已变化，停止自动扫描");
            self.stop_auto();
            return true;
        }

        let spacing = self.orchestrator.config().scan.auto_scan_spacing();
        if let Some(last) = self.last_auto_completed {
            let since = last.elapsed();
            if since < spacing {
                let remaining = spacing - since;
                debug!("距上次自动扫描不足 {:?}，{:?} 后重试", spacing, remaining);
                self.debouncer.schedule_in(remaining);
                return true;
            }
        }

        self.run_pass(ScanTrigger::AutoTick).await
    }

    /// 执行一次扫描，期间继续处理命令和页面事件
    ///
    /// 返回 `false` 表示扫描期间收到了 `Shutdown`。
    async fn run_pass(&mut self, trigger: ScanTrigger) -> bool {
        let mut deferred = Vec::new();

        let outcome = {
            let Self {
                orchestrator,
                commands,
                events,
                debouncer,
                auto,
                pending_navigation,
                ..
            } = self;
            let state = orchestrator.state_handle();
            let pass = orchestrator.scan(trigger);
            tokio::pin!(pass);

            loop {
                tokio::select! {
                    outcome = &mut pass => break outcome,
                    Some(command) = commands.recv() => match command {
                        ScanCommand::Scan => {
                            debug!("扫描进行中 ({:?})，忽略扫描请求", state.get());
                        }
                        ScanCommand::StopAuto => {
                            if auto.take().is_some() {
                                info!("已停止自动扫描，当前扫描继续完成");
                            }
                            debouncer.cancel();
                        }
                        other => deferred.push(other),
                    },
                    Some(event) = events.recv() => match event_action(&event) {
                        EventAction::Rescan if auto.is_some() => debouncer.schedule(),
                        EventAction::Navigation => *pending_navigation = true,
                        _ => {}
                    },
                }
            }
        };

        if std::mem::take(&mut self.pending_navigation) {
            self.orchestrator.mark_navigation();
        }

        match outcome {
            ScanOutcome::Completed(_) if trigger.is_auto() => {
                self.last_auto_completed = Some(Instant::now());
            }
            ScanOutcome::Completed(_) => {}
            ScanOutcome::Blocked(reason) => {
                warn!("扫描受限，停止自动扫描: {}", reason);
                self.stop_auto();
            }
        }

        for command in deferred {
            match command {
                ScanCommand::StartAuto => self.start_auto(),
                ScanCommand::ClearCache => self.orchestrator.clear_cache().await,
                ScanCommand::Shutdown => return false,
                ScanCommand::Scan | ScanCommand::StopAuto => {}
            }
        }
        true
    }

    /// 距离下一次定时触发的时间
    pub fn pending_delay(&self) -> Option<Duration> {
        self.debouncer
            .deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}
