//! 网络摄像头 - FFmpeg 主动拉流
//!
//! 每次 `read()` 阻塞到下一帧到达 (或读超时); 可用性探测走 HTTP 短连接

use std::time::Duration;

use super::ffmpeg::{FfmpegCapture, InputSpec};
use super::FrameSource;
use crate::config::CameraConfig;
use crate::detection::Frame;
use crate::error::{CameraError, CameraResult};

pub struct NetworkCamera {
    url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    capture: Option<FfmpegCapture>,
    last_seq: u64,
}

impl NetworkCamera {
    pub fn new(url: impl Into<String>, config: &CameraConfig) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            capture: None,
            last_seq: 0,
        }
    }

    fn input_spec(&self) -> InputSpec {
        // 单位: 微秒; 网络读阻塞超过读超时即结束解码
        InputSpec::new(self.url.as_str()).opt("rw_timeout", self.read_timeout.as_micros())
    }
}

impl FrameSource for NetworkCamera {
    fn connect(&mut self) -> CameraResult<()> {
        self.release();
        let capture = FfmpegCapture::start("network-camera", self.input_spec())?;

        // 收到首帧才算连接成功; 首帧留给下一次 read
        match capture.slot().wait_newer(0, self.connect_timeout + self.read_timeout) {
            Ok(_) => {
                tracing::debug!(url = %self.url, "🔗 网络摄像头已响应");
                self.capture = Some(capture);
                self.last_seq = 0;
                Ok(())
            }
            Err(e) => Err(CameraError::Connect(format!("{}: {e}", self.url))),
        }
    }

    fn read(&mut self) -> CameraResult<Frame> {
        let capture = self.capture.as_ref().ok_or(CameraError::NotOpen)?;
        let (frame, seq) = capture.slot().wait_newer(self.last_seq, self.read_timeout)?;
        self.last_seq = seq;
        Ok(frame)
    }

    fn release(&mut self) {
        self.capture = None;
    }
}

/// 探测: 短连接请求网络流, 收到响应头即视为可用, 随后立即断开
pub fn probe(url: &str, timeout: Duration) -> bool {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .build();
    match agent.get(url).call() {
        Ok(_response) => true,
        Err(e) => {
            tracing::debug!(%url, error = %e, "网络摄像头不可达");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::encode_jpeg;
    use image::{Rgb, RgbImage};
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};

    fn read_request(stream: &TcpStream) {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        while reader.read_line(&mut line).map(|n| n > 0).unwrap_or(false) {
            if line == "\r\n" {
                break;
            }
            line.clear();
        }
    }

    /// 单连接 MJPEG 服务, 发送 `frames` 帧后关闭
    fn serve_mjpeg(frames: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&stream);
            let mut body = Vec::new();
            body.extend_from_slice(
                b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n",
            );
            for i in 0..frames {
                let jpeg = encode_jpeg(&RgbImage::from_pixel(64, 48, Rgb([(i * 10) as u8, 0, 0])), 90).unwrap();
                body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
                body.extend_from_slice(&jpeg);
                body.extend_from_slice(b"\r\n");
            }
            let _ = stream.write_all(&body);
        });
        format!("http://{addr}/video")
    }

    #[test]
    #[ignore = "需要 FFmpeg 运行时解码 MJPEG"]
    fn test_pulls_frames_until_stream_ends() {
        let url = serve_mjpeg(20);
        let mut cam = NetworkCamera::new(url, &CameraConfig::default());
        cam.connect().unwrap();

        let frame = cam.read().unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));
        // 流结束后读帧失败
        let mut ended = false;
        for _ in 0..20 {
            if matches!(cam.read(), Err(CameraError::Read(_))) {
                ended = true;
                break;
            }
        }
        assert!(ended);

        cam.release();
        assert!(matches!(cam.read(), Err(CameraError::NotOpen)));
    }

    #[test]
    fn test_read_before_connect_fails() {
        let mut cam = NetworkCamera::new("http://127.0.0.1:9/video", &CameraConfig::default());
        assert!(matches!(cam.read(), Err(CameraError::NotOpen)));
    }

    #[test]
    fn test_reachability_check() {
        let url = serve_mjpeg(1);
        assert!(probe(&url, Duration::from_secs(2)));

        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        assert!(!probe(&format!("http://{closed}/video"), Duration::from_millis(500)));
    }

    #[test]
    fn test_connect_refused() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut cam = NetworkCamera::new(format!("http://{closed}/video"), &CameraConfig::default());
        assert!(matches!(cam.connect(), Err(CameraError::Connect(_))));
    }
}
