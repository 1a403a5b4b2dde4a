//! 防抖定时器
//!
//! 只有一个待触发的截止时间，每次 [`Debouncer::schedule`] 都会取消并重新安排。
//! 定时器触发是发起扫描的唯一途径。

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// 从现在起重新计时
    pub fn schedule(&mut self) {
        self.schedule_in(self.delay);
    }

    pub fn schedule_in(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    pub fn schedule_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 等待截止时间到达；没有待触发的定时器时永不完成
    ///
    /// 可在 `select!` 中安全取消：只有真正触发后才清除截止时间。
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}
