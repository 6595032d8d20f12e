// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 命令行参数与运行参数
pub mod detection; // 分析阶段 (运动检测 / 目标检测)
pub mod error; // 错误类型
pub mod input; // 视频输入系统
pub mod monitoring; // 运行指标
pub mod pipeline; // 采集线程与结果缓存
pub mod server; // HTTP 服务
pub mod shutdown; // 退出信号

pub use crate::config::{Args, PipelineConfig};
pub use crate::detection::{AnalysisStage, AnnotatedFrame, Detection, Frame, MotionStage, ObjectStage};
pub use crate::error::{AppError, CameraError, CameraResult};
pub use crate::input::{CameraDescriptor, CameraKind, CameraManager, CameraSelector};
pub use crate::monitoring::{MetricsReport, PerformanceMonitor};
pub use crate::pipeline::{CaptureLoop, FrameStore, Slot};
pub use crate::server::{AppState, StreamMultiplexer};
pub use crate::shutdown::Shutdown;
