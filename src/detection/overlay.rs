//! 标注绘制 (boxes + labels)
//!
//! 字体可选: 未加载字体时只画框, 不画文字

use std::path::Path;
use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use super::BBox;

pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

#[derive(Clone, Default)]
pub struct Overlay {
    font: Option<Arc<FontVec>>,
}

impl Overlay {
    pub fn new(font: Option<FontVec>) -> Self {
        Self {
            font: font.map(Arc::new),
        }
    }

    /// 从字体文件加载; 失败时退化为无文字标注
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        let font = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|data| FontVec::try_from_vec(data).map_err(|e| e.to_string()));
        match font {
            Ok(font) => {
                tracing::info!(path = %path.display(), "✅ 标注字体加载成功");
                Self::new(Some(font))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "⚠️ 标注字体加载失败, 仅绘制边框");
                Self::default()
            }
        }
    }

    /// 2px 边框
    pub fn draw_box(&self, img: &mut RgbImage, bbox: &BBox, color: Rgb<u8>) {
        let Some(rect) = clip_rect(img, bbox) else {
            return;
        };
        draw_hollow_rect_mut(img, rect, color);
        if rect.width() > 2 && rect.height() > 2 {
            let inner = Rect::at(rect.left() + 1, rect.top() + 1)
                .of_size(rect.width() - 2, rect.height() - 2);
            draw_hollow_rect_mut(img, inner, color);
        }
    }

    /// 在 (x, y) 上方写文字
    pub fn draw_text(&self, img: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
        if let Some(font) = &self.font {
            let scale = PxScale::from(16.0);
            draw_text_mut(img, color, x, (y - 18).max(0), scale, font.as_ref(), text);
        }
    }

    /// 实心底色标签 (目标检测样式)
    pub fn draw_label(&self, img: &mut RgbImage, bbox: &BBox, text: &str, bg: Rgb<u8>, fg: Rgb<u8>) {
        let Some(font) = &self.font else {
            return;
        };
        let scale = PxScale::from(14.0);
        let (w, h) = text_size(scale, font.as_ref(), text);
        let x = bbox.x1().max(0.) as i32;
        let y = (bbox.y1() as i32 - h as i32 - 6).max(0);
        if w > 0 && h > 0 {
            draw_filled_rect_mut(img, Rect::at(x, y).of_size(w + 4, h + 6), bg);
        }
        draw_text_mut(img, fg, x + 2, y + 2, scale, font.as_ref(), text);
    }
}

fn clip_rect(img: &RgbImage, bbox: &BBox) -> Option<Rect> {
    let (w, h) = img.dimensions();
    let x1 = bbox.x1().max(0.) as u32;
    let y1 = bbox.y1().max(0.) as u32;
    let x2 = (bbox.x2().max(0.) as u32).min(w);
    let y2 = (bbox.y2().max(0.) as u32).min(h);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Rect::at(x1 as i32, y1 as i32).of_size(x2 - x1, y2 - y1))
}
