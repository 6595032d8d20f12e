/// 视频输入系统 (Video Input System)
///
/// - CameraHandle:   单个视频源的打开/重试/读帧/释放
/// - LocalCamera:    本地摄像头 (FFmpeg 采集, 解码线程持续刷新最新帧)
/// - NetworkCamera:  网络摄像头 (FFmpeg 主动拉流, 每次读帧阻塞)
/// - CameraManager:  当前活动句柄 (原子替换) 与切换流程
/// - CameraSelector: 定时探测网络摄像头可用性并热切换
pub mod camera;
pub mod ffmpeg;
pub mod handle;
pub mod manager;
pub mod network;
pub mod selector;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use serde::Serialize;

pub use camera::{list_devices, LocalCamera};
pub use ffmpeg::{FfmpegCapture, FrameSlot};
pub use handle::{CameraHandle, ConnectionState, FrameSource, RetryPolicy};
pub use manager::{ActiveCamera, CameraManager, SourceFactory, SystemSources};
pub use network::NetworkCamera;
pub use selector::CameraSelector;

/// 视频源描述 (构造后不可变)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CameraDescriptor {
    /// 本地设备索引
    Local { index: u32 },
    /// 网络流地址
    Network { url: String },
}

impl CameraDescriptor {
    pub fn kind(&self) -> CameraKind {
        match self {
            CameraDescriptor::Local { .. } => CameraKind::Local,
            CameraDescriptor::Network { .. } => CameraKind::Network,
        }
    }
}

impl fmt::Display for CameraDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraDescriptor::Local { index } => write!(f, "local camera #{index}"),
            CameraDescriptor::Network { url } => write!(f, "network camera {url}"),
        }
    }
}

/// 视频源类型 (选择器按类型分派)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CameraKind {
    #[serde(rename = "webcam")]
    Local,
    #[serde(rename = "phonecam")]
    Network,
}

impl CameraKind {
    /// 对外名称 (HTTP 接口使用)
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraKind::Local => "webcam",
            CameraKind::Network => "phonecam",
        }
    }
}

impl std::str::FromStr for CameraKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webcam" => Ok(CameraKind::Local),
            "phonecam" => Ok(CameraKind::Network),
            other => Err(format!("unknown camera source '{other}', expected webcam or phonecam")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [CameraKind::Local, CameraKind::Network] {
            assert_eq!(kind.as_str().parse::<CameraKind>().unwrap(), kind);
        }
        assert!("usb".parse::<CameraKind>().is_err());
    }

    #[test]
    fn test_descriptor_kind() {
        assert_eq!(CameraDescriptor::Local { index: 0 }.kind(), CameraKind::Local);
        let net = CameraDescriptor::Network {
            url: "http://cam/video".into(),
        };
        assert_eq!(net.kind(), CameraKind::Network);
        assert_eq!(net.to_string(), "network camera http://cam/video");
    }
}
