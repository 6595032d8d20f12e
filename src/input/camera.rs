//! 本地摄像头 - FFmpeg 采集
//!
//! 支持 DirectShow(Windows) / AVFoundation(macOS) / V4L2(Linux)
//! 解码线程持续刷新最新帧, `read()` 只取最新帧, 从不阻塞

use std::time::Duration;

use super::ffmpeg::{FfmpegCapture, InputSpec};
use super::FrameSource;
use crate::config::CameraConfig;
use crate::detection::Frame;
use crate::error::{CameraError, CameraResult};

pub struct LocalCamera {
    index: u32,
    config: CameraConfig,
    capture: Option<FfmpegCapture>,
}

impl LocalCamera {
    pub fn new(index: u32, config: CameraConfig) -> Self {
        Self {
            index,
            config,
            capture: None,
        }
    }

    /// 输入格式 - 根据平台选择
    fn input_format() -> &'static str {
        #[cfg(target_os = "windows")]
        {
            "dshow" // DirectShow
        }
        #[cfg(target_os = "macos")]
        {
            "avfoundation" // AVFoundation
        }
        #[cfg(target_os = "linux")]
        {
            "v4l2" // Video4Linux2
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            "video4linux2"
        }
    }

    /// 摄像头URL - 根据平台选择
    fn camera_url(&self) -> CameraResult<String> {
        if let Some(input) = &self.config.local_input {
            return Ok(input.clone());
        }

        #[cfg(target_os = "windows")]
        {
            // dshow 只能按设备名打开, 按索引取枚举结果
            let devices = ez_ffmpeg::device::get_input_video_devices()
                .map_err(|e| CameraError::Connect(format!("获取摄像头列表失败: {e}")))?;
            dshow_input(self.index, &devices)
        }
        #[cfg(target_os = "macos")]
        {
            Ok(format!("{}", self.index))
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            Ok(format!("/dev/video{}", self.index))
        }
    }

    fn input_spec(&self) -> CameraResult<InputSpec> {
        Ok(InputSpec::new(self.camera_url()?)
            .format(Self::input_format())
            .opt("framerate", self.config.capture_fps)
            .opt(
                "video_size",
                format!("{}x{}", self.config.capture_width, self.config.capture_height),
            ))
    }
}

/// DirectShow 输入: 按索引选择设备名
pub fn dshow_input(index: u32, devices: &[String]) -> CameraResult<String> {
    devices
        .get(index as usize)
        .map(|name| format!("video={name}"))
        .ok_or_else(|| CameraError::Connect(format!("no video device #{index} ({} found)", devices.len())))
}

/// 获取可用的摄像头设备列表
pub fn list_devices() -> Vec<(usize, String)> {
    match ez_ffmpeg::device::get_input_video_devices() {
        Ok(devices) => devices.into_iter().enumerate().collect(),
        Err(e) => {
            tracing::warn!(error = %e, "⚠️ 获取摄像头列表失败");
            vec![]
        }
    }
}

impl FrameSource for LocalCamera {
    fn connect(&mut self) -> CameraResult<()> {
        self.release();

        let spec = self.input_spec()?;
        tracing::debug!(format = Self::input_format(), input = %spec.url, "🔍 启动摄像头解码");
        let capture = FfmpegCapture::start(format!("local-camera-{}", self.index), spec)?;

        // 等待首帧
        let timeout = Duration::from_millis(self.config.open_timeout_ms);
        match capture.slot().wait_newer(0, timeout) {
            Ok(_) => {
                self.capture = Some(capture);
                Ok(())
            }
            Err(e) => Err(CameraError::Connect(format!("camera #{}: {e}", self.index))),
        }
    }

    fn read(&mut self) -> CameraResult<Frame> {
        let capture = self.capture.as_ref().ok_or(CameraError::NotOpen)?;
        let frame = capture.slot().latest()?;
        let age = frame.captured_at().elapsed();
        if age > Duration::from_millis(self.config.stale_limit_ms) {
            return Err(CameraError::Stale(age.as_millis()));
        }
        Ok(frame)
    }

    fn release(&mut self) {
        // FfmpegCapture 在 drop 时停止解码线程
        if self.capture.take().is_some() {
            tracing::debug!(index = self.index, "📴 摄像头解码已停止");
        }
    }
}

impl Drop for LocalCamera {
    fn drop(&mut self) {
        self.release();
    }
}
