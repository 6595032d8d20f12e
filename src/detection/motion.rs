// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 运动检测阶段 (Motion Stage)
///
/// 单高斯逐像素背景模型 + 形态学去噪 + 外轮廓面积过滤
/// 输出: 红框标注帧 (motion) 与前景掩码 (diff)
use std::sync::Arc;

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate_mut, open_mut};
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

use super::overlay::{Overlay, GREEN, RED};
use super::{AnalysisStage, BBox, Frame, StageKind, StageOutput, StageResult};

/// 运动检测参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub var_threshold: f32, // 前景判定阈值 (平方马氏距离)
    pub history: u32,       // 背景学习窗口 (帧)
    pub var_init: f32,      // 初始方差
    pub var_min: f32,
    pub var_max: f32,
    pub open_radius: u8,    // 开运算半径
    pub dilate_radius: u8,  // 膨胀半径
    pub noise_area: f64,    // 轮廓最小面积 (像素)
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            var_threshold: 50.0,
            history: 2000,
            var_init: 15.0 * 15.0,
            var_min: 4.0,
            var_max: 75.0 * 75.0,
            open_radius: 2,
            dilate_radius: 8,
            noise_area: 1100.0,
        }
    }
}

/// 背景模型 (每像素均值 + 方差)
struct Background {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    var: Vec<f32>,
    frames: u32,
}

impl Background {
    fn new(gray: &GrayImage, var_init: f32) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            mean: gray.as_raw().iter().map(|&p| p as f32).collect(),
            var: vec![var_init; gray.as_raw().len()],
            frames: 1,
        }
    }

    /// 更新模型并返回二值前景掩码 (0 / 255)
    fn apply(&mut self, gray: &GrayImage, cfg: &MotionConfig) -> GrayImage {
        self.frames = self.frames.saturating_add(1);
        let alpha = 1.0 / self.frames.min(cfg.history.max(1)) as f32;

        let mut mask = GrayImage::new(self.width, self.height);
        for (i, (&p, out)) in gray.as_raw().iter().zip(mask.iter_mut()).enumerate() {
            let d = p as f32 - self.mean[i];
            let d2 = d * d;
            if d2 > cfg.var_threshold * self.var[i] {
                *out = 255;
            }
            self.mean[i] += alpha * d;
            self.var[i] = (self.var[i] + alpha * (d2 - self.var[i])).clamp(cfg.var_min, cfg.var_max);
        }
        mask
    }
}

pub struct MotionStage {
    config: MotionConfig,
    overlay: Overlay,
    background: Option<Background>,
}

impl MotionStage {
    pub fn new(config: MotionConfig, overlay: Overlay) -> Self {
        Self {
            config,
            overlay,
            background: None,
        }
    }

    fn detect(&mut self, frame: &Frame) -> StageOutput {
        let gray = image::imageops::grayscale(frame.image());

        let background = match self.background.as_mut() {
            // 分辨率变化 (切换摄像头) 时重建背景
            Some(bg) if bg.width == gray.width() && bg.height == gray.height() => bg,
            _ => {
                self.background = Some(Background::new(&gray, self.config.var_init));
                return StageOutput::degraded(StageKind::Motion, frame);
            }
        };

        let mut mask = background.apply(&gray, &self.config);
        if self.config.open_radius > 0 {
            open_mut(&mut mask, Norm::LInf, self.config.open_radius);
        }
        if self.config.dilate_radius > 0 {
            dilate_mut(&mut mask, Norm::LInf, self.config.dilate_radius);
        }

        let mut annotated: RgbImage = frame.image().clone();
        let mut detected = false;
        for contour in find_contours::<i32>(&mask) {
            if contour.border_type != BorderType::Outer || contour.parent.is_some() {
                continue;
            }
            if contour_area(&contour.points) <= self.config.noise_area {
                continue;
            }
            detected = true;
            if let Some(rect) = bounding_box(&contour.points) {
                self.overlay.draw_box(&mut annotated, &rect, RED);
                self.overlay.draw_text(
                    &mut annotated,
                    rect.x1() as i32,
                    rect.y1() as i32 - 10,
                    "Motion Detected",
                    GREEN,
                );
            }
        }

        StageOutput {
            annotated: frame.derive(annotated),
            result: StageResult::Motion {
                detected,
                mask: Arc::new(mask),
            },
        }
    }
}

impl AnalysisStage for MotionStage {
    fn kind(&self) -> StageKind {
        StageKind::Motion
    }

    fn analyze(&mut self, frame: &Frame) -> StageOutput {
        if frame.width() == 0 || frame.height() == 0 {
            return StageOutput::degraded(StageKind::Motion, frame);
        }
        self.detect(frame)
    }
}

/// 掩码 → 三通道灰度图 (diff 画面)
pub fn mask_to_rgb(mask: &GrayImage) -> RgbImage {
    RgbImage::from_fn(mask.width(), mask.height(), |x, y| {
        let Luma([v]) = *mask.get_pixel(x, y);
        image::Rgb([v, v, v])
    })
}

/// 多边形面积 (鞋带公式)
fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0i64;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        twice += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    (twice as f64 / 2.0).abs()
}

fn bounding_box(points: &[Point<i32>]) -> Option<BBox> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    BBox::new(
        min_x as f32,
        min_y as f32,
        (max_x + 1) as f32,
        (max_y + 1) as f32,
    )
}
