//! 摄像头自动选择
//!
//! 网络摄像头可达时优先使用, 否则回退到本地摄像头

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{CameraDescriptor, CameraKind, CameraManager};
use crate::error::CameraResult;
use crate::shutdown::Shutdown;

pub struct CameraSelector {
    manager: Arc<CameraManager>,
    interval: Duration,
    shutdown: Shutdown,
}

impl CameraSelector {
    pub fn new(manager: Arc<CameraManager>, interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            manager,
            interval,
            shutdown,
        }
    }

    /// 当前首选视频源
    pub fn probe(&self) -> CameraDescriptor {
        let kind = if self.manager.probe(CameraKind::Network) {
            CameraKind::Network
        } else {
            CameraKind::Local
        };
        self.manager.descriptor(kind).clone()
    }

    /// 探测一次; 首选类型与当前不同时切换. 返回是否发生切换
    pub fn tick(&self) -> bool {
        let preferred = self.probe();
        let current = self.manager.active().kind();
        if preferred.kind() == current {
            return false;
        }
        tracing::info!(from = current.as_str(), to = preferred.kind().as_str(), "📡 视频源可用性变化");
        if let Err(e) = self.manager.switch_to(preferred.kind()) {
            tracing::warn!(camera = %preferred, error = %e, "⚠️ 新摄像头未能打开, 等待下次重试");
        }
        true
    }

    /// 显式切换 (不经过定时器, 总是重建句柄)
    pub fn switch(&self, kind: CameraKind) -> CameraResult<()> {
        self.manager.switch_to(kind)
    }

    /// 后台线程: 立即探测一次, 之后每 `interval` 探测一次
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let selector = self.clone();
        std::thread::Builder::new()
            .name("camera-selector".into())
            .spawn(move || {
                tracing::info!(interval_ms = selector.interval.as_millis() as u64, "🎥 摄像头选择线程启动");
                loop {
                    if selector.shutdown.is_triggered() {
                        break;
                    }
                    selector.tick();
                    if selector.shutdown.sleep(selector.interval) {
                        break;
                    }
                }
                tracing::info!("🎥 摄像头选择线程退出");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::input::testing::ScriptedFactory;
    use crate::input::RetryPolicy;
    use crate::monitoring::PerformanceMonitor;

    fn selector(factory: Arc<ScriptedFactory>) -> (CameraSelector, Arc<CameraManager>, Arc<PerformanceMonitor>) {
        let monitor = Arc::new(PerformanceMonitor::new(&MonitorConfig::default()));
        let shutdown = Shutdown::new();
        let manager = Arc::new(CameraManager::new(
            CameraDescriptor::Local { index: 0 },
            CameraDescriptor::Network {
                url: "http://phone/video".into(),
            },
            factory,
            RetryPolicy {
                attempts: 1,
                interval: Duration::from_millis(1),
            },
            monitor.clone(),
            shutdown.clone(),
        ));
        let selector = CameraSelector::new(manager.clone(), Duration::from_millis(10), shutdown);
        (selector, manager, monitor)
    }

    #[test]
    fn test_no_swap_when_kind_unchanged() {
        let factory = Arc::new(ScriptedFactory::default());
        let (selector, manager, monitor) = selector(factory.clone());
        let before = manager.active();

        for _ in 0..3 {
            assert!(!selector.tick());
        }
        assert!(Arc::ptr_eq(&before, &manager.active()));
        assert_eq!(factory.created().len(), 1);
        assert_eq!(monitor.snapshot().camera_switches, 0);
    }

    #[test]
    fn test_failover_follows_reachability() {
        let factory = Arc::new(ScriptedFactory::default());
        let (selector, manager, _) = selector(factory.clone());

        factory.set_reachable(true);
        assert_eq!(selector.probe().kind(), CameraKind::Network);
        assert!(selector.tick());
        assert_eq!(manager.active().kind(), CameraKind::Network);
        assert!(!selector.tick());

        factory.set_reachable(false);
        assert!(selector.tick());
        assert_eq!(manager.active().kind(), CameraKind::Local);
    }

    #[test]
    fn test_explicit_switch_records_one_sample() {
        let factory = Arc::new(ScriptedFactory::default());
        let (selector, manager, monitor) = selector(factory);

        selector.switch(CameraKind::Local).unwrap();
        assert_eq!(monitor.snapshot().camera_switches, 1);
        selector.switch(CameraKind::Network).unwrap();
        assert_eq!(monitor.snapshot().camera_switches, 2);
        assert_eq!(manager.active().kind(), CameraKind::Network);
    }

    #[test]
    fn test_background_thread_switches_and_stops() {
        let factory = Arc::new(ScriptedFactory::default());
        let shutdown = Shutdown::new();
        let monitor = Arc::new(PerformanceMonitor::new(&MonitorConfig::default()));
        let manager = Arc::new(CameraManager::new(
            CameraDescriptor::Local { index: 0 },
            CameraDescriptor::Network {
                url: "http://phone/video".into(),
            },
            factory.clone(),
            RetryPolicy::default(),
            monitor,
            shutdown.clone(),
        ));
        assert_eq!(manager.active().kind(), CameraKind::Local);
        factory.set_reachable(true);
        let handle = Arc::new(CameraSelector::new(manager.clone(), Duration::from_millis(5), shutdown.clone()))
            .spawn()
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.active().kind() != CameraKind::Network && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(manager.active().kind(), CameraKind::Network);
        shutdown.trigger();
        handle.join().unwrap();
    }
}
