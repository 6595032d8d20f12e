// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 目标检测阶段 (Object Stage)
/// 职责: Frame → 缩放 → 推理后端 (本地 YOLOv8 / HTTP 检测服务) → 过滤/还原坐标 → 绘制标注
use std::time::Duration;

use fast_image_resize as fr;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::overlay::{Overlay, BLACK, GREEN};
use super::types::encode_jpeg;
use super::{AnalysisStage, BBox, Detection, Frame, StageKind, StageOutput, StageResult};

/// 目标检测参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub conf_threshold: f32, // 置信度阈值
    pub iou_threshold: f32,  // NMS IoU 阈值 (本地模型)
    pub input_size: u32,     // 模型输入边长 (本地模型)
    pub max_side: u32,       // 推理前缩放到的最长边
    pub jpeg_quality: u8,    // 上传质量 (检测服务)
    pub timeout_ms: u64,     // 单次请求超时 (检测服务)
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.5,
            iou_threshold: 0.45,
            input_size: 640,
            max_side: 640,
            jpeg_quality: 80,
            timeout_ms: 2000,
        }
    }
}

/// 推理后端返回的原始检测框 (x1, y1, x2, y2, 输入图像坐标)
#[derive(Clone, Debug, Deserialize)]
pub struct RawDetection {
    #[serde(alias = "label")]
    pub class: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

/// 推理后端
pub trait DetectorBackend: Send {
    fn infer(&mut self, image: &RgbImage) -> anyhow::Result<Vec<RawDetection>>;
}

/// HTTP 检测服务: POST image/jpeg → {"detections": [...]}
pub struct HttpDetector {
    url: String,
    agent: ureq::Agent,
    jpeg_quality: u8,
}

impl HttpDetector {
    pub fn new(url: String, config: &DetectorConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self {
            url,
            agent,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

impl DetectorBackend for HttpDetector {
    fn infer(&mut self, image: &RgbImage) -> anyhow::Result<Vec<RawDetection>> {
        let jpeg = encode_jpeg(image, self.jpeg_quality)?;
        let body = self
            .agent
            .post(&self.url)
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)?
            .into_string()?;
        let response: DetectResponse = serde_json::from_str(&body)?;
        Ok(response.detections)
    }
}

pub struct ObjectStage {
    config: DetectorConfig,
    overlay: Overlay,
    backend: Option<Box<dyn DetectorBackend>>,
    resizer: fr::Resizer,
    // 统计
    failures: u64,
}

impl ObjectStage {
    pub fn new(config: DetectorConfig, overlay: Overlay, backend: Option<Box<dyn DetectorBackend>>) -> Self {
        if backend.is_none() {
            tracing::warn!("⚠️ 未配置检测模型或检测服务, 目标检测输出原始画面");
        }
        Self {
            config,
            overlay,
            backend,
            resizer: fr::Resizer::new(),
            failures: 0,
        }
    }

    /// 按最长边缩放; 返回 (图像, x缩放回原图系数, y缩放回原图系数)
    fn downscale(&mut self, img: &RgbImage) -> anyhow::Result<(Option<RgbImage>, f32, f32)> {
        let (w, h) = img.dimensions();
        let longest = w.max(h);
        if self.config.max_side == 0 || longest <= self.config.max_side {
            return Ok((None, 1.0, 1.0));
        }
        let ratio = self.config.max_side as f32 / longest as f32;
        let dw = ((w as f32 * ratio).round() as u32).max(1);
        let dh = ((h as f32 * ratio).round() as u32).max(1);

        let src_image = fr::images::Image::from_vec_u8(w, h, img.as_raw().clone(), fr::PixelType::U8x3)?;
        let mut dst_image = fr::images::Image::new(dw, dh, fr::PixelType::U8x3);
        self.resizer.resize(
            &src_image,
            &mut dst_image,
            &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Nearest),
        )?;

        let resized = RgbImage::from_raw(dw, dh, dst_image.buffer().to_vec())
            .ok_or_else(|| anyhow::anyhow!("resize buffer size mismatch"))?;
        Ok((Some(resized), w as f32 / dw as f32, h as f32 / dh as f32))
    }

    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        let (resized, sx, sy) = self.downscale(frame.image())?;

        let Some(backend) = self.backend.as_mut() else {
            return Ok(Vec::new());
        };
        let raw = backend.infer(resized.as_ref().unwrap_or(frame.image()))?;

        let detections = raw
            .into_iter()
            .filter(|d| d.confidence >= self.config.conf_threshold)
            .filter_map(|d| {
                let [x1, y1, x2, y2] = d.bbox;
                let bbox = BBox::new(x1, y1, x2, y2)?.scale(sx, sy);
                Some(Detection::new(d.class, d.confidence, bbox))
            })
            .collect();
        Ok(detections)
    }
}

impl AnalysisStage for ObjectStage {
    fn kind(&self) -> StageKind {
        StageKind::Object
    }

    fn analyze(&mut self, frame: &Frame) -> StageOutput {
        if self.backend.is_none() {
            return StageOutput::degraded(StageKind::Object, frame);
        }

        let detections = match self.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                self.failures += 1;
                // 前几次以及之后每 100 次打印一次, 避免日志刷屏
                if self.failures <= 3 || self.failures % 100 == 0 {
                    tracing::warn!(error = %e, failures = self.failures, "❌ 目标检测失败, 输出原始画面");
                }
                return StageOutput::degraded(StageKind::Object, frame);
            }
        };

        let mut annotated = frame.image().clone();
        for det in &detections {
            self.overlay.draw_box(&mut annotated, &det.bbox, GREEN);
            let label = format!("{} {:.2}", det.label, det.confidence);
            self.overlay.draw_label(&mut annotated, &det.bbox, &label, GREEN, BLACK);
        }

        StageOutput {
            annotated: frame.derive(annotated),
            result: StageResult::Objects(detections),
        }
    }
}
