//! 摄像头句柄 - 打开/重试/读帧/释放
//!
//! 句柄只有一个所有者; 并发访问由 `ActiveCamera` 的互斥锁串行化

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::CameraDescriptor;
use crate::detection::Frame;
use crate::error::{CameraError, CameraResult};
use crate::shutdown::Shutdown;

/// 底层视频源 (本地 / 网络)
pub trait FrameSource: Send {
    /// 建立连接; 返回 Ok 表示已经可以读帧
    fn connect(&mut self) -> CameraResult<()>;

    /// 读取下一帧
    fn read(&mut self) -> CameraResult<Frame>;

    /// 释放底层资源; 必须可重复调用
    fn release(&mut self);
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Opening => "opening",
            ConnectionState::Open => "open",
            ConnectionState::Failed => "failed",
        }
    }
}

/// 打开重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

/// 重试休眠中检查中止标志的间隔
const ABORT_POLL: Duration = Duration::from_millis(20);

pub struct CameraHandle {
    descriptor: CameraDescriptor,
    state: ConnectionState,
    retry_count: u32,
    policy: RetryPolicy,
    source: Box<dyn FrameSource>,
    shutdown: Shutdown,
    aborted: Arc<AtomicBool>,
}

impl CameraHandle {
    pub fn new(descriptor: CameraDescriptor, source: Box<dyn FrameSource>, policy: RetryPolicy, shutdown: Shutdown) -> Self {
        Self {
            descriptor,
            state: ConnectionState::Closed,
            retry_count: 0,
            policy,
            source,
            shutdown,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 中止标志: 置位后打开流程在下一次尝试或休眠时放弃
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.aborted.clone()
    }

    pub fn descriptor(&self) -> &CameraDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// 最近一次打开过程中失败的次数
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// 打开视频源, 最多尝试 `policy.attempts` 次, 两次尝试之间休眠 `policy.interval`
    ///
    /// 重试耗尽后进入 `Failed`, 之后的 `next_frame` 会再次触发打开
    pub fn open(&mut self) -> CameraResult<()> {
        if self.state == ConnectionState::Open {
            return Ok(());
        }

        self.state = ConnectionState::Opening;
        self.retry_count = 0;
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(stop) = self.interrupted() {
                self.state = ConnectionState::Closed;
                return Err(stop);
            }

            match self.source.connect() {
                Ok(()) => {
                    self.state = ConnectionState::Open;
                    tracing::info!(camera = %self.descriptor, attempt, "✅ 摄像头已连接");
                    return Ok(());
                }
                Err(e) => {
                    self.source.release();
                    self.retry_count = attempt;
                    tracing::warn!(
                        camera = %self.descriptor,
                        error = %e,
                        "⚠️ 摄像头连接失败 ({}/{})",
                        attempt,
                        attempts
                    );
                }
            }

            if attempt < attempts {
                if let Some(stop) = self.pause(self.policy.interval) {
                    self.state = ConnectionState::Closed;
                    return Err(stop);
                }
            }
        }

        self.state = ConnectionState::Failed;
        tracing::error!(camera = %self.descriptor, attempts, "❌ 摄像头重试次数耗尽");
        Err(CameraError::Unavailable {
            descriptor: self.descriptor.clone(),
            attempts,
        })
    }

    fn interrupted(&self) -> Option<CameraError> {
        if self.shutdown.is_triggered() {
            Some(CameraError::Shutdown)
        } else if self.aborted.load(Ordering::SeqCst) {
            Some(CameraError::NotOpen)
        } else {
            None
        }
    }

    /// 重试间隔休眠, 退出信号或中止标志会提前结束
    fn pause(&self, interval: Duration) -> Option<CameraError> {
        let deadline = Instant::now() + interval;
        loop {
            if let Some(stop) = self.interrupted() {
                return Some(stop);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            self.shutdown.sleep(left.min(ABORT_POLL));
        }
    }

    /// 读取下一帧
    ///
    /// - 未打开: 触发重新打开, 本次返回错误
    /// - 读取失败: 释放并重新打开, 返回读取错误
    pub fn next_frame(&mut self) -> CameraResult<Frame> {
        if self.state != ConnectionState::Open {
            return Err(match self.open() {
                Ok(()) => CameraError::NotOpen,
                Err(e) => e,
            });
        }

        match self.source.read() {
            Ok(frame) => Ok(frame),
            Err(e) => {
                tracing::warn!(camera = %self.descriptor, error = %e, "⚠️ 读帧失败, 重新连接");
                self.source.release();
                self.state = ConnectionState::Closed;
                if let Err(reopen) = self.open() {
                    tracing::debug!(camera = %self.descriptor, error = %reopen, "重新连接未成功");
                }
                Err(e)
            }
        }
    }

    /// 释放视频源; 重复调用无副作用
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.source.release();
        self.state = ConnectionState::Closed;
        tracing::info!(camera = %self.descriptor, "📴 摄像头已释放");
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.close();
    }
}
