//! 退出信号 (Shutdown signal)
//!
//! 同一个信号同时服务两类消费者:
//! - 后台线程: `sleep()` 可被打断的休眠 (crossbeam 通道断开即唤醒)
//! - 异步任务: `cancelled().await`

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            token: CancellationToken::new(),
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    /// 触发退出; 重复调用无副作用
    pub fn trigger(&self) {
        self.token.cancel();
        // 丢弃唯一的 Sender, 所有 recv_timeout 立即返回 Disconnected
        self.tx.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 休眠 `duration`; 返回 true 表示休眠被退出信号打断
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        match self.rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => false,
            _ => true,
        }
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
