/// 检测系统数据结构定义
/// Data structures shared by capture, analysis and serving
use std::io::Cursor;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::{Deserialize, Serialize};

// ========== 帧 ==========

/// 采集帧: 不可变像素缓冲 + 采集时间
#[derive(Clone, Debug)]
pub struct Frame {
    image: Arc<RgbImage>,
    captured_at: Instant,
    timestamp: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
            captured_at: Instant::now(),
            timestamp: Utc::now(),
        }
    }

    /// 派生帧: 新像素, 沿用原帧的采集时间
    pub fn derive(&self, image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
            captured_at: self.captured_at,
            timestamp: self.timestamp,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// 两个 Frame 是否来自同一次采集 (共享同一像素缓冲)
    pub fn same_capture(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.image, &other.image) || self.captured_at == other.captured_at
    }
}

/// 带标注的帧, 由某个分析阶段产出; JPEG 编码结果按需生成并在所有观看者间共享
#[derive(Debug)]
pub struct AnnotatedFrame {
    frame: Frame,
    jpeg: OnceLock<Bytes>,
}

impl AnnotatedFrame {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            jpeg: OnceLock::new(),
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// JPEG 编码 (首次调用时编码, 之后复用)
    pub fn jpeg(&self, quality: u8) -> Result<Bytes, image::ImageError> {
        if let Some(bytes) = self.jpeg.get() {
            return Ok(bytes.clone());
        }
        let encoded = encode_jpeg(self.frame.image(), quality)?;
        Ok(self.jpeg.get_or_init(|| encoded).clone())
    }
}

impl From<Frame> for AnnotatedFrame {
    fn from(frame: Frame) -> Self {
        Self::new(frame)
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, image::ImageError> {
    let mut buf = Cursor::new(Vec::with_capacity(64 * 1024));
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
        encoder.encode_image(image)?;
    }
    Ok(Bytes::from(buf.into_inner()))
}

// ========== 检测结果 ==========

/// 检测框 (x1,y1) 左上 / (x2,y2) 右下, 保证 x1<x2, y1<y2
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl BBox {
    /// 角点顺序无关; 面积为 0 的框返回 None
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Option<Self> {
        let (x1, x2) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (y1, y2) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        if !(x1 < x2 && y1 < y2) {
            return None;
        }
        Some(Self { x1, y1, x2, y2 })
    }

    pub fn x1(&self) -> f32 {
        self.x1
    }

    pub fn y1(&self) -> f32 {
        self.y1
    }

    pub fn x2(&self) -> f32 {
        self.x2
    }

    pub fn y2(&self) -> f32 {
        self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
        }
    }

    pub fn intersection_area(&self, another: &BBox) -> f32 {
        let l = self.x1.max(another.x1);
        let r = self.x2.min(another.x2);
        let t = self.y1.max(another.y1);
        let b = self.y2.min(another.y2);
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &BBox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    /// Intersection over Union; 不相交为 0
    pub fn iou(&self, another: &BBox) -> f32 {
        let union = self.union(another);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(another) / union
    }
}

impl TryFrom<[f32; 4]> for BBox {
    type Error = String;

    fn try_from([x1, y1, x2, y2]: [f32; 4]) -> Result<Self, Self::Error> {
        BBox::new(x1, y1, x2, y2).ok_or_else(|| format!("degenerate bbox [{x1}, {y1}, {x2}, {y2}]"))
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// 单个目标检测结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class", alias = "label")]
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0., 1.),
            bbox,
        }
    }
}
