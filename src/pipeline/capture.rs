/// 采集线程 (Capture Loop)
/// 职责: 读帧 → 各分析阶段 → 写入 FrameStore → 记录性能指标
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{FrameStore, FrameUpdate};
use crate::detection::motion::mask_to_rgb;
use crate::detection::{AnalysisStage, Frame, StageOutput, StageResult};
use crate::error::CameraError;
use crate::input::CameraManager;
use crate::monitoring::{DetectionSample, PerformanceMonitor};
use crate::shutdown::Shutdown;

/// 读帧失败后的等待
const ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// 本地摄像头尚无新帧时的等待
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// 单步结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// 处理了一帧新画面
    Processed,
    /// 与上一帧相同, 未处理
    Duplicate,
    /// 读帧失败
    Failed,
    /// 收到退出信号
    Stopped,
}

pub struct CaptureLoop {
    manager: Arc<CameraManager>,
    stages: Vec<Box<dyn AnalysisStage>>,
    store: Arc<FrameStore>,
    monitor: Arc<PerformanceMonitor>,
    shutdown: Shutdown,

    healthy: bool,
    last: Option<Frame>,
    // 统计
    count: u64,
}

impl CaptureLoop {
    pub fn new(
        manager: Arc<CameraManager>,
        stages: Vec<Box<dyn AnalysisStage>>,
        store: Arc<FrameStore>,
        monitor: Arc<PerformanceMonitor>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            manager,
            stages,
            store,
            monitor,
            shutdown,
            healthy: true,
            last: None,
            count: 0,
        }
    }

    /// 读取并处理一帧
    pub fn step(&mut self) -> StepOutcome {
        let camera = self.manager.active();
        let frame = match camera.next_frame() {
            Ok(frame) => frame,
            Err(CameraError::Shutdown) => return StepOutcome::Stopped,
            // 刚完成 (重新) 打开, 或句柄已被替换
            Err(CameraError::NotOpen) => return StepOutcome::Failed,
            Err(e) => {
                if self.healthy {
                    self.healthy = false;
                    self.monitor.record_connection_failure();
                    tracing::warn!(camera = %camera.descriptor(), error = %e, "❌ 无法读取画面");
                } else {
                    tracing::debug!(camera = %camera.descriptor(), error = %e, "画面仍不可用");
                }
                return StepOutcome::Failed;
            }
        };

        if let Some(last) = &self.last {
            if last.same_capture(&frame) {
                return StepOutcome::Duplicate;
            }
        }

        if !self.healthy {
            self.healthy = true;
            self.monitor.record_connection_recovery();
            tracing::info!(camera = %camera.descriptor(), "✅ 画面恢复");
        }

        self.process(&frame);
        self.last = Some(frame);
        self.count += 1;
        StepOutcome::Processed
    }

    fn process(&mut self, frame: &Frame) {
        self.monitor.record_frame_tick();

        let mut update = FrameUpdate {
            raw: Some(frame.clone().into()),
            ..Default::default()
        };

        for stage in self.stages.iter_mut() {
            let kind = stage.kind();
            let start = Instant::now();
            let output = match catch_unwind(AssertUnwindSafe(|| stage.analyze(frame))) {
                Ok(output) => output,
                Err(_) => {
                    tracing::error!(stage = kind.as_str(), "❌ 分析阶段异常, 输出原始画面");
                    StageOutput::degraded(kind, frame)
                }
            };
            self.monitor.record_stage_latency(kind, start.elapsed());

            let mask_energy = output.result.mask_energy();
            match output.result {
                StageResult::Motion { detected, mask } => {
                    self.monitor.record_detection(DetectionSample::Motion { detected, mask_energy });
                    update.diff = Some(frame.derive(mask_to_rgb(&mask)).into());
                    update.motion = Some(output.annotated.into());
                }
                StageResult::Objects(detections) => {
                    self.monitor.record_detection(DetectionSample::Objects(detections.clone()));
                    update.object = Some(output.annotated.into());
                    update.detections = Some(detections);
                }
            }
        }

        self.store.publish(update);
    }

    pub fn run(mut self) {
        tracing::info!(stages = self.stages.len(), "📹 采集线程启动");
        while !self.shutdown.is_triggered() {
            let wait = match self.step() {
                StepOutcome::Processed => continue,
                StepOutcome::Duplicate => IDLE_WAIT,
                StepOutcome::Failed => ERROR_BACKOFF,
                StepOutcome::Stopped => break,
            };
            if self.shutdown.sleep(wait) {
                break;
            }
        }
        tracing::info!(frames = self.count, "📹 采集线程退出");
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || self.run())
    }
}
