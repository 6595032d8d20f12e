//! 活动摄像头管理
//!
//! 切换流程: 构造 → 打开(含重试) → 原子替换 → 记录耗时 → 关闭旧句柄
//! 读帧方通过 `active()` 拿到当前句柄, 替换不会阻塞读帧

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::handle::{CameraHandle, ConnectionState, FrameSource, RetryPolicy};
use super::{camera::LocalCamera, network, network::NetworkCamera, CameraDescriptor, CameraKind};
use crate::config::CameraConfig;
use crate::detection::Frame;
use crate::error::{CameraError, CameraResult};
use crate::monitoring::PerformanceMonitor;
use crate::shutdown::Shutdown;

/// 视频源工厂: 按描述构造视频源, 并负责可达性探测
pub trait SourceFactory: Send + Sync {
    fn create(&self, descriptor: &CameraDescriptor) -> Box<dyn FrameSource>;

    fn probe(&self, descriptor: &CameraDescriptor) -> bool;
}

/// 真实设备: FFmpeg 本地采集 + FFmpeg 网络拉流
pub struct SystemSources {
    config: CameraConfig,
}

impl SystemSources {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

impl SourceFactory for SystemSources {
    fn create(&self, descriptor: &CameraDescriptor) -> Box<dyn FrameSource> {
        match descriptor {
            CameraDescriptor::Local { index } => Box::new(LocalCamera::new(*index, self.config.clone())),
            CameraDescriptor::Network { url } => Box::new(NetworkCamera::new(url.clone(), &self.config)),
        }
    }

    fn probe(&self, descriptor: &CameraDescriptor) -> bool {
        match descriptor {
            // 本地摄像头是兜底选项, 不做探测
            CameraDescriptor::Local { .. } => true,
            CameraDescriptor::Network { url } => {
                network::probe(url, Duration::from_millis(self.config.probe_timeout_ms))
            }
        }
    }
}

/// 当前活动摄像头
pub struct ActiveCamera {
    descriptor: CameraDescriptor,
    handle: Mutex<CameraHandle>,
    // 与句柄共享: 置位后进行中的重试立即放弃
    retired: Arc<AtomicBool>,
}

impl ActiveCamera {
    fn new(handle: CameraHandle) -> Self {
        Self {
            descriptor: handle.descriptor().clone(),
            retired: handle.abort_flag(),
            handle: Mutex::new(handle),
        }
    }

    pub fn descriptor(&self) -> &CameraDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> CameraKind {
        self.descriptor.kind()
    }

    /// 读取下一帧; 已被替换的句柄不再重新打开
    pub fn next_frame(&self) -> CameraResult<Frame> {
        let mut handle = self.handle.lock();
        if self.retired.load(Ordering::SeqCst) {
            return Err(CameraError::NotOpen);
        }
        handle.next_frame()
    }

    /// 连接状态; 句柄正忙 (读帧/重连中) 时返回 None
    pub fn state(&self) -> Option<ConnectionState> {
        self.handle
            .try_lock_for(Duration::from_millis(50))
            .map(|handle| handle.state())
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// 标记为已替换并释放
    ///
    /// 进行中的重试在下一次尝试或休眠时放弃, 这里最多等待一次连接尝试
    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.handle.lock().close();
    }
}

pub struct CameraManager {
    active: ArcSwap<ActiveCamera>,
    local: CameraDescriptor,
    network: CameraDescriptor,
    factory: Arc<dyn SourceFactory>,
    policy: RetryPolicy,
    monitor: Arc<PerformanceMonitor>,
    shutdown: Shutdown,
    switch_lock: Mutex<()>,
}

impl CameraManager {
    /// 初始活动摄像头: 网络摄像头可达时选网络, 否则本地 (未打开, 首次读帧时打开)
    pub fn new(
        local: CameraDescriptor,
        network: CameraDescriptor,
        factory: Arc<dyn SourceFactory>,
        policy: RetryPolicy,
        monitor: Arc<PerformanceMonitor>,
        shutdown: Shutdown,
    ) -> Self {
        let initial = if factory.probe(&network) {
            tracing::info!(camera = %network, "📱 网络摄像头可达, 作为初始视频源");
            &network
        } else {
            tracing::info!(camera = %local, "📹 网络摄像头不可达, 使用本地摄像头");
            &local
        };
        let handle = CameraHandle::new(initial.clone(), factory.create(initial), policy, shutdown.clone());
        Self {
            active: ArcSwap::from_pointee(ActiveCamera::new(handle)),
            local,
            network,
            factory,
            policy,
            monitor,
            shutdown,
            switch_lock: Mutex::new(()),
        }
    }

    pub fn active(&self) -> Arc<ActiveCamera> {
        self.active.load_full()
    }

    pub fn descriptor(&self, kind: CameraKind) -> &CameraDescriptor {
        match kind {
            CameraKind::Local => &self.local,
            CameraKind::Network => &self.network,
        }
    }

    /// 探测某类视频源是否可达
    pub fn probe(&self, kind: CameraKind) -> bool {
        self.factory.probe(self.descriptor(kind))
    }

    /// 切换到 `kind` 类视频源 (同类也会重建句柄)
    ///
    /// 打开失败时仍然替换, 新句柄处于 `Failed`, 由后续读帧继续重试;
    /// 返回值为新句柄的打开结果
    pub fn switch_to(&self, kind: CameraKind) -> CameraResult<()> {
        let _switching = self.switch_lock.lock();
        let start = Instant::now();
        let descriptor = self.descriptor(kind).clone();
        tracing::info!(camera = %descriptor, "🔄 切换摄像头");

        let mut handle = CameraHandle::new(
            descriptor.clone(),
            self.factory.create(&descriptor),
            self.policy,
            self.shutdown.clone(),
        );
        let opened = handle.open();
        if let Err(CameraError::Shutdown) = opened {
            return opened;
        }

        let previous = self.active.swap(Arc::new(ActiveCamera::new(handle)));
        let elapsed = start.elapsed();
        self.monitor.record_camera_switch(elapsed);
        previous.retire();

        tracing::info!(
            from = %previous.descriptor(),
            to = %descriptor,
            elapsed_ms = elapsed.as_millis() as u64,
            "✅ 摄像头切换完成"
        );
        opened
    }

    /// 释放当前摄像头 (退出时调用)
    pub fn close(&self) {
        let _switching = self.switch_lock.lock();
        self.active.load().retire();
    }
}
