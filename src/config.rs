//! 运行配置 - 命令行参数 + JSON 参数文件

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::detection::{DetectorConfig, MotionConfig};
use crate::input::RetryPolicy;

pub const DEFAULT_PHONECAM_URL: &str = "http://10.45.4.132:4747/video";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "自适应摄像头采集/分析/推流服务", long_about = None)]
pub struct Args {
    /// HTTP 监听地址
    #[arg(short, long, default_value = "0.0.0.0:5000")]
    pub bind: SocketAddr,

    /// 本地摄像头索引
    #[arg(short, long, default_value_t = 0)]
    pub webcam: u32,

    /// 网络摄像头 MJPEG 地址
    #[arg(long, env = "PHONECAM_URL", default_value = DEFAULT_PHONECAM_URL)]
    pub phonecam_url: String,

    /// YOLOv8 ONNX 模型 (优先于检测服务)
    #[arg(short, long, env = "DETECTOR_MODEL")]
    pub model: Option<PathBuf>,

    /// 目标检测服务地址 (模型与服务都未设置时目标检测输出原始画面)
    #[arg(long, env = "DETECTOR_URL")]
    pub detector_url: Option<String>,

    /// 标注字体文件 (TTF/OTF)
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// 参数配置文件 (JSON), 默认位于用户配置目录
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl Args {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }
}

/// 默认配置文件位置: <config_dir>/sentinel-cam/pipeline.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("sentinel-cam"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pipeline.json")
}

/// 摄像头参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    // === 重试 ===
    pub retry_attempts: u32,    // 打开重试次数
    pub retry_interval_ms: u64, // 重试间隔

    // === 探测 ===
    pub probe_interval_ms: u64, // 网络摄像头探测周期
    pub probe_timeout_ms: u64,  // 单次探测超时

    // === 读帧 ===
    pub connect_timeout_ms: u64, // 网络连接超时
    pub read_timeout_ms: u64,    // 网络读帧超时
    pub open_timeout_ms: u64,    // 本地摄像头等待首帧超时
    pub stale_limit_ms: u64,     // 本地画面停滞判定

    // === 本地采集 (FFmpeg) ===
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,
    pub local_input: Option<String>, // 覆盖默认设备输入, 如 video=<设备名>
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_interval_ms: 2000,

            probe_interval_ms: 10_000,
            probe_timeout_ms: 1500,

            connect_timeout_ms: 3000,
            read_timeout_ms: 5000,
            open_timeout_ms: 5000,
            stale_limit_ms: 2000,

            capture_width: 1280,
            capture_height: 720,
            capture_fps: 30,
            local_input: None,
        }
    }
}

impl CameraConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            interval: Duration::from_millis(self.retry_interval_ms),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// 性能统计参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub window_size: usize,           // 滑动窗口容量
    pub report_interval_ms: u64,      // 日志输出周期
    pub motion_energy_threshold: u64, // 运动"真阳性"掩码像素和阈值
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            report_interval_ms: 1000,
            motion_energy_threshold: 1_000_000,
        }
    }
}

/// 推流参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub jpeg_quality: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { jpeg_quality: 80 }
    }
}

/// 全部可调参数
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub camera: CameraConfig,
    pub motion: MotionConfig,
    pub detector: DetectorConfig,
    pub monitor: MonitorConfig,
    pub stream: StreamConfig,
}

impl PipelineConfig {
    /// 从JSON文件加载配置; 文件不存在时写入默认配置, 解析失败时使用默认值
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "✅ 配置已加载");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "⚠️ 配置文件解析失败, 使用默认值");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "📝 配置文件不存在, 创建默认配置");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    tracing::warn!(error = %e, "❌ 保存默认配置失败");
                }
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("创建目录 {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("写入 {}", path.display()))?;
        tracing::info!(path = %path.display(), "💾 配置已保存");
        Ok(())
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        tracing::info!(
            retry_attempts = self.camera.retry_attempts,
            retry_interval_ms = self.camera.retry_interval_ms,
            probe_interval_ms = self.camera.probe_interval_ms,
            window_size = self.monitor.window_size,
            conf_threshold = self.detector.conf_threshold,
            "🎛️ 当前运行参数"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("sentinel-cam-test-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn test_missing_file_writes_defaults() {
        let path = temp_path("missing/pipeline.json");
        let _ = fs::remove_file(&path);
        let config = PipelineConfig::load(&path);
        assert_eq!(config.camera.retry_attempts, 5);
        assert!(path.exists());
        let reloaded = PipelineConfig::load(&path);
        assert_eq!(reloaded.monitor.window_size, 100);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_path("partial.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"camera":{"retry_attempts":2},"stream":{"jpeg_quality":60}}"#).unwrap();
        let config = PipelineConfig::load(&path);
        assert_eq!(config.camera.retry_attempts, 2);
        assert_eq!(config.camera.retry_interval_ms, 2000);
        assert_eq!(config.stream.jpeg_quality, 60);
        assert_eq!(config.motion.noise_area, 1100.0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let path = temp_path("broken.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        let config = PipelineConfig::load(&path);
        assert_eq!(config.camera.probe_interval(), Duration::from_secs(10));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["sentinel", "--phonecam-url", "http://phone:4747/video"]);
        assert_eq!(args.webcam, 0);
        assert_eq!(args.phonecam_url, "http://phone:4747/video");
        assert_eq!(args.bind.port(), 5000);
        assert_eq!(args.config_path(), default_config_path());
    }
}
