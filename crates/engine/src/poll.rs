//! 引擎轮询循环
//!
//! 固定间隔 tick，每个 tick 最多派发 batch 条任务以摊薄派发延迟；
//! 队列扫空或派发出错即结束本 tick。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::engine::TaskEngine;

pub struct PollScheduler {
    engine: TaskEngine,
    delay_ms: u64,
    batch: usize,
}

impl PollScheduler {
    pub fn new(engine: TaskEngine, delay_ms: u64, batch: usize) -> Self {
        Self {
            engine,
            delay_ms,
            batch,
        }
    }

    /// 单个 tick：最多派发 batch 条，就绪队列扫空提前返回
    pub async fn tick(&self) {
        for _ in 0..self.batch {
            match self.engine.poll_and_run_once().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!("任务派发失败: {e}");
                    break;
                }
            }
        }
    }

    pub async fn run_loop(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.delay_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("轮询循环停止");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }
}
