/// 分析系统 (Analysis System)
///
/// 每个分析阶段: Frame → (标注帧, 结构化结果)
/// - MotionStage:   背景建模运动检测 (motion + diff 两路输出)
/// - ObjectStage:   目标检测 (object 输出 + 检测列表)
///   - YoloDetector: 本地 YOLOv8 ONNX 推理
///   - HttpDetector: 远程检测服务
///
/// 阶段只在采集线程内被调用, 同一实例不会被并发调用
pub mod detector;
pub mod motion;
pub mod overlay;
pub mod types;
pub mod yolo;

use image::GrayImage;
use std::sync::Arc;

pub use detector::{DetectorConfig, ObjectStage};
pub use motion::{MotionConfig, MotionStage};
pub use overlay::Overlay;
pub use types::{AnnotatedFrame, BBox, Detection, Frame};
pub use yolo::YoloDetector;

/// 阶段类型 (用于延迟统计)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Motion,
    Object,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Motion => "motion",
            StageKind::Object => "object",
        }
    }
}

/// 阶段结果
#[derive(Debug, Clone)]
pub enum StageResult {
    /// 运动检测: 是否检测到运动 + 前景掩码
    Motion { detected: bool, mask: Arc<GrayImage> },
    /// 目标检测列表
    Objects(Vec<Detection>),
}

impl StageResult {
    /// 前景图像素和, 按三通道 diff 画面计算 (单通道掩码和 × 3); 非运动结果为 0
    pub fn mask_energy(&self) -> u64 {
        match self {
            StageResult::Motion { mask, .. } => mask.as_raw().iter().map(|&p| p as u64).sum::<u64>() * 3,
            StageResult::Objects(_) => 0,
        }
    }
}

/// 单次分析输出
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub annotated: Frame,
    pub result: StageResult,
}

impl StageOutput {
    /// 降级输出: 原始帧 + 空/否定结果
    pub fn degraded(kind: StageKind, frame: &Frame) -> Self {
        let result = match kind {
            StageKind::Motion => StageResult::Motion {
                detected: false,
                mask: Arc::new(GrayImage::new(frame.width(), frame.height())),
            },
            StageKind::Object => StageResult::Objects(Vec::new()),
        };
        Self {
            annotated: frame.clone(),
            result,
        }
    }
}

/// 分析阶段接口
///
/// 实现不得返回错误或 panic: 内部故障时返回 `StageOutput::degraded`
pub trait AnalysisStage: Send {
    fn kind(&self) -> StageKind;

    fn analyze(&mut self, frame: &Frame) -> StageOutput;
}
