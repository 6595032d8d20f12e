/// 运行指标 (Monitoring)
///
/// - MetricWindow:       固定容量滑动窗口
/// - PerformanceMonitor: 帧率/延迟/检测质量/可用性统计, 定时输出日志
pub mod performance;
pub mod window;

pub use performance::{DetectionSample, MetricsReport, PerformanceMonitor};
pub use window::MetricWindow;
