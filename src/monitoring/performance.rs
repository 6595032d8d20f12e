//! 性能统计 (Performance Monitor)
//!
//! 所有状态在一把锁内; 锁内只做计数与窗口更新, 不做 IO

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::MetricWindow;
use crate::config::MonitorConfig;
use crate::detection::{Detection, StageKind};
use crate::shutdown::Shutdown;

/// 合成真值: 置信度高于此值的检测视为真值
const SYNTHETIC_TRUTH_CONFIDENCE: f32 = 0.7;
/// 与真值 IoU 高于此值视为正确
const MATCH_IOU: f32 = 0.5;
/// 没有合成真值时的基线精度
const BASELINE_PRECISION: f64 = 0.5;

/// 单帧检测结果样本
#[derive(Debug, Clone)]
pub enum DetectionSample {
    Motion { detected: bool, mask_energy: u64 },
    Objects(Vec<Detection>),
}

/// 对外指标 (`/get_metrics`)
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsReport {
    pub fps: f64,
    pub motion_latency: f64, // ms
    pub object_latency: f64, // ms
    pub switch_time: f64,    // ms
    pub motion_accuracy: f64,
    pub object_map: f64,
    pub false_positive_reduction: f64,
    pub uptime: f64,
    pub recovery_rate: f64,
    pub connection_failures: u64,
    pub connection_recoveries: u64,
    pub camera_switches: u64,
    pub frames: u64,
}

#[derive(Debug)]
struct MonitorState {
    last_tick: Option<Instant>,
    frame_intervals: MetricWindow, // 秒
    motion_latency: MetricWindow,  // ms
    object_latency: MetricWindow,  // ms
    switch_time: MetricWindow,     // ms
    motion_accuracy: MetricWindow, // 0/1
    object_precision: MetricWindow,

    // 累计计数, 不受窗口影响
    frames: u64,
    total_detections: u64,
    total_false_positives: u64,
    connection_failures: u64,
    connection_recoveries: u64,
    camera_switches: u64,
    downtime: Duration,
    outage_since: Option<Instant>,
}

impl MonitorState {
    fn new(window: usize) -> Self {
        Self {
            last_tick: None,
            frame_intervals: MetricWindow::new(window),
            motion_latency: MetricWindow::new(window),
            object_latency: MetricWindow::new(window),
            switch_time: MetricWindow::new(window),
            motion_accuracy: MetricWindow::new(window),
            object_precision: MetricWindow::new(window),
            frames: 0,
            total_detections: 0,
            total_false_positives: 0,
            connection_failures: 0,
            connection_recoveries: 0,
            camera_switches: 0,
            downtime: Duration::ZERO,
            outage_since: None,
        }
    }
}

pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
    started: Instant,
    motion_energy_threshold: u64,
}

impl PerformanceMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self::started_at(config, Instant::now())
    }

    pub fn started_at(config: &MonitorConfig, started: Instant) -> Self {
        Self {
            state: Mutex::new(MonitorState::new(config.window_size)),
            started,
            motion_energy_threshold: config.motion_energy_threshold,
        }
    }

    pub fn record_frame_tick(&self) {
        self.record_frame_tick_at(Instant::now());
    }

    pub fn record_frame_tick_at(&self, now: Instant) {
        let mut state = self.state.lock();
        if let Some(last) = state.last_tick {
            let interval = now.saturating_duration_since(last).as_secs_f64();
            state.frame_intervals.push(interval);
        }
        state.last_tick = Some(now);
        state.frames += 1;
    }

    pub fn record_stage_latency(&self, stage: StageKind, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        let mut state = self.state.lock();
        match stage {
            StageKind::Motion => state.motion_latency.push(ms),
            StageKind::Object => state.object_latency.push(ms),
        }
    }

    pub fn record_camera_switch(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.switch_time.push(duration.as_secs_f64() * 1000.0);
        state.camera_switches += 1;
    }

    pub fn record_detection(&self, sample: DetectionSample) {
        match sample {
            DetectionSample::Motion { detected, mask_energy } => {
                let true_positive = detected && mask_energy > self.motion_energy_threshold;
                let mut state = self.state.lock();
                state.motion_accuracy.push(if true_positive { 1.0 } else { 0.0 });
                if detected {
                    state.total_detections += 1;
                    if !true_positive {
                        state.total_false_positives += 1;
                    }
                }
            }
            DetectionSample::Objects(detections) => {
                if detections.is_empty() {
                    return;
                }
                // 计算在锁外完成
                let (precision, false_positives) = object_precision(&detections);
                let mut state = self.state.lock();
                state.object_precision.push(precision);
                state.total_detections += detections.len() as u64;
                state.total_false_positives += false_positives;
            }
        }
    }

    pub fn record_connection_failure(&self) {
        self.record_connection_failure_at(Instant::now());
    }

    /// 一次中断内的后续失败不会重置停机起点
    pub fn record_connection_failure_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.connection_failures += 1;
        if state.outage_since.is_none() {
            state.outage_since = Some(now);
        }
    }

    pub fn record_connection_recovery(&self) {
        self.record_connection_recovery_at(Instant::now());
    }

    pub fn record_connection_recovery_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.connection_recoveries += 1;
        if let Some(since) = state.outage_since.take() {
            state.downtime += now.saturating_duration_since(since);
        }
    }

    pub fn snapshot(&self) -> MetricsReport {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> MetricsReport {
        let state = self.state.lock();

        let fps = match state.frame_intervals.mean() {
            Some(mean) if mean > 0.0 => 1.0 / mean,
            _ => 0.0,
        };

        let false_positive_reduction = if state.total_detections > 0 {
            let rate = state.total_false_positives as f64 / state.total_detections as f64 * 100.0;
            (100.0 - rate).max(0.0)
        } else {
            100.0
        };

        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let mut downtime = state.downtime;
        if let Some(since) = state.outage_since {
            downtime += now.saturating_duration_since(since);
        }
        let uptime = if elapsed > 0.0 {
            ((elapsed - downtime.as_secs_f64()) / elapsed * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };

        let recovery_rate = if state.connection_failures > 0 {
            state.connection_recoveries as f64 / state.connection_failures as f64 * 100.0
        } else {
            0.0
        };

        MetricsReport {
            fps,
            motion_latency: state.motion_latency.mean().unwrap_or(0.0),
            object_latency: state.object_latency.mean().unwrap_or(0.0),
            switch_time: state.switch_time.mean().unwrap_or(0.0),
            motion_accuracy: state.motion_accuracy.mean().unwrap_or(0.0) * 100.0,
            object_map: state.object_precision.mean().unwrap_or(0.0) * 100.0,
            false_positive_reduction,
            uptime,
            recovery_rate,
            connection_failures: state.connection_failures,
            connection_recoveries: state.connection_recoveries,
            camera_switches: state.camera_switches,
            frames: state.frames,
        }
    }

    /// 每 `interval` 输出一次指标日志, 直到退出信号
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration, shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
        let monitor = self.clone();
        std::thread::Builder::new()
            .name("metrics-reporter".into())
            .spawn(move || {
                while !shutdown.sleep(interval) {
                    let r = monitor.snapshot();
                    tracing::info!(
                        fps = %format!("{:.1}", r.fps),
                        motion_ms = %format!("{:.1}", r.motion_latency),
                        object_ms = %format!("{:.1}", r.object_latency),
                        switch_ms = %format!("{:.1}", r.switch_time),
                        motion_accuracy = %format!("{:.1}%", r.motion_accuracy),
                        object_map = %format!("{:.1}%", r.object_map),
                        fp_reduction = %format!("{:.1}%", r.false_positive_reduction),
                        uptime = %format!("{:.1}%", r.uptime),
                        recovery_rate = %format!("{:.1}%", r.recovery_rate),
                        "📊 性能指标"
                    );
                }
                tracing::debug!("📊 指标输出线程退出");
            })
    }
}

/// 合成真值精度: (精度样本, 误报数)
///
/// 真值取自同一帧的高置信度检测, 结果偏乐观, 只作趋势参考
fn object_precision(detections: &[Detection]) -> (f64, u64) {
    let truth: Vec<&Detection> = detections
        .iter()
        .filter(|d| d.confidence > SYNTHETIC_TRUTH_CONFIDENCE)
        .collect();
    let total = detections.len() as u64;

    if truth.is_empty() {
        return (BASELINE_PRECISION, total);
    }

    let correct = detections
        .iter()
        .filter(|d| {
            let best = truth
                .iter()
                .map(|t| d.bbox.iou(&t.bbox))
                .fold(0.0f32, f32::max);
            best > MATCH_IOU
        })
        .count() as u64;

    (correct as f64 / total as f64, total - correct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;

    fn monitor(window: usize) -> (PerformanceMonitor, Instant) {
        let start = Instant::now();
        let config = MonitorConfig {
            window_size: window,
            ..Default::default()
        };
        (PerformanceMonitor::started_at(&config, start), start)
    }

    fn det(conf: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new("person", conf, BBox::new(x1, y1, x2, y2).unwrap())
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_fps_from_mean_interval() {
        let (m, start) = monitor(100);
        for i in 0..=10 {
            m.record_frame_tick_at(start + secs(i as f64 * 0.1));
        }
        let r = m.snapshot_at(start + secs(1.0));
        assert!((r.fps - 10.0).abs() < 1e-3);
        assert_eq!(r.frames, 11);
    }

    #[test]
    fn test_latency_window_keeps_last_samples() {
        let (m, _) = monitor(2);
        m.record_stage_latency(StageKind::Motion, Duration::from_millis(100));
        m.record_stage_latency(StageKind::Motion, Duration::from_millis(10));
        m.record_stage_latency(StageKind::Motion, Duration::from_millis(20));
        m.record_stage_latency(StageKind::Object, Duration::from_millis(40));
        let r = m.snapshot();
        assert!(close(r.motion_latency, 15.0));
        assert!(close(r.object_latency, 40.0));
    }

    #[test]
    fn test_recovery_rate() {
        let (m, start) = monitor(100);
        assert_eq!(m.snapshot().recovery_rate, 0.0);
        for i in 0..3 {
            m.record_connection_failure_at(start + secs(i as f64));
        }
        m.record_connection_recovery_at(start + secs(4.0));
        let r = m.snapshot_at(start + secs(10.0));
        assert!((r.recovery_rate - 33.333).abs() < 0.01);
        assert_eq!(r.connection_failures, 3);
        assert_eq!(r.connection_recoveries, 1);
    }

    #[test]
    fn test_uptime_counts_closed_and_open_outages() {
        let (m, start) = monitor(100);
        assert!(close(m.snapshot_at(start + secs(10.0)).uptime, 100.0));

        // 2s..4s 停机, 后续失败不重置起点
        m.record_connection_failure_at(start + secs(2.0));
        m.record_connection_failure_at(start + secs(3.0));
        m.record_connection_recovery_at(start + secs(4.0));
        assert!(close(m.snapshot_at(start + secs(10.0)).uptime, 80.0));

        // 进行中的停机实时计入
        m.record_connection_failure_at(start + secs(10.0));
        assert!(close(m.snapshot_at(start + secs(20.0)).uptime, 60.0));
    }

    #[test]
    fn test_motion_accuracy_and_false_positives() {
        let (m, _) = monitor(100);
        m.record_detection(DetectionSample::Motion { detected: true, mask_energy: 2_000_000 });
        m.record_detection(DetectionSample::Motion { detected: true, mask_energy: 10 });
        m.record_detection(DetectionSample::Motion { detected: false, mask_energy: 0 });
        m.record_detection(DetectionSample::Motion { detected: false, mask_energy: 0 });
        let r = m.snapshot();
        assert!(close(r.motion_accuracy, 25.0));
        // 2 次检测, 1 次误报
        assert!(close(r.false_positive_reduction, 50.0));
    }

    #[test]
    fn test_object_precision_with_synthetic_truth() {
        let (m, _) = monitor(100);
        m.record_detection(DetectionSample::Objects(vec![
            det(0.9, 0., 0., 10., 10.),
            det(0.6, 1., 1., 10., 10.),
            det(0.6, 50., 50., 60., 60.),
            det(0.6, 80., 80., 90., 90.),
        ]));
        let r = m.snapshot();
        assert!(close(r.object_map, 50.0));
        assert!(close(r.false_positive_reduction, 50.0));
    }

    #[test]
    fn test_object_without_truth_uses_baseline() {
        let (m, _) = monitor(100);
        m.record_detection(DetectionSample::Objects(vec![det(0.55, 0., 0., 5., 5.)]));
        m.record_detection(DetectionSample::Objects(Vec::new()));
        let r = m.snapshot();
        assert!(close(r.object_map, 50.0));
        assert!(close(r.false_positive_reduction, 0.0));
    }

    #[test]
    fn test_false_positive_reduction_without_detections() {
        let (m, _) = monitor(100);
        assert!(close(m.snapshot().false_positive_reduction, 100.0));
    }

    #[test]
    fn test_switch_samples() {
        let (m, _) = monitor(100);
        m.record_camera_switch(Duration::from_millis(300));
        m.record_camera_switch(Duration::from_millis(100));
        let r = m.snapshot();
        assert!(close(r.switch_time, 200.0));
        assert_eq!(r.camera_switches, 2);
    }

    #[test]
    fn test_reporter_stops_on_shutdown() {
        let (m, _) = monitor(10);
        let shutdown = Shutdown::new();
        let handle = Arc::new(m)
            .spawn_reporter(Duration::from_millis(10), shutdown.clone())
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        shutdown.trigger();
        handle.join().unwrap();
    }
}
