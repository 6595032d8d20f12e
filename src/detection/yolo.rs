// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 本地推理后端 (ONNX Runtime)
// 包含: 模型加载、预处理、推理、后处理

use std::path::Path;

use anyhow::Result;
use image::RgbImage;
use ndarray::{s, Array, ArrayView, ArrayViewD, Axis, IxDyn};
use ort::session::Session;
use ort::value::Tensor;

use super::detector::{DetectorBackend, DetectorConfig, RawDetection};
use super::BBox;

const CXYWH_OFFSET: usize = 4;

/// COCO 80 类 (YOLOv8 官方权重)
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

fn ort_err(e: impl std::fmt::Display) -> anyhow::Error {
    anyhow::anyhow!("onnxruntime: {e}")
}

/// YOLOv8 检测模型
pub struct YoloDetector {
    session: Session,
    width: u32,
    height: u32,
    conf: f32,
    iou: f32,
    names: Vec<String>,
}

impl YoloDetector {
    pub fn new(model: &Path, config: &DetectorConfig) -> Result<Self> {
        let session = Session::builder()
            .map_err(ort_err)?
            .commit_from_file(model)
            .map_err(ort_err)?;
        let detector = Self {
            session,
            width: config.input_size,
            height: config.input_size,
            conf: config.conf_threshold,
            iou: config.iou_threshold,
            names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
        };
        tracing::info!(
            model = %model.display(),
            input = %format!("{}x{}", detector.width, detector.height),
            conf = detector.conf,
            iou = detector.iou,
            "📦 YOLOv8 模型已加载"
        );
        Ok(detector)
    }
}

impl DetectorBackend for YoloDetector {
    fn infer(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let (xs, ratio) = letterbox(image, self.width, self.height);
        let input = Tensor::from_array(xs).map_err(ort_err)?;
        let outputs = self.session.run(ort::inputs![input]).map_err(ort_err)?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(ort_err)?;
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        let preds = ArrayView::from_shape(IxDyn(&dims), data)?;
        Ok(decode(
            preds,
            ratio,
            image.dimensions(),
            self.conf,
            self.iou,
            &self.names,
        ))
    }
}

/// 缩放比例与缩放后尺寸 (保持宽高比)
fn scale_wh(w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
    let r = (w1 / w0).min(h1 / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

/// 预处理: 等比缩放贴左上角, 其余填充 144, NCHW 归一化到 0~1
///
/// 返回 (输入张量, 缩放比例)
pub fn letterbox(image: &RgbImage, width: u32, height: u32) -> (Array<f32, IxDyn>, f32) {
    let mut ys = Array::ones((1, 3, height as usize, width as usize)).into_dyn();
    ys.fill(144.0 / 255.0);

    let (w0, h0) = image.dimensions();
    let (ratio, w_new, h_new) = scale_wh(w0 as f32, h0 as f32, width as f32, height as f32);
    let w_new = (w_new as u32).clamp(1, width);
    let h_new = (h_new as u32).clamp(1, height);
    let img = image::imageops::resize(image, w_new, h_new, image::imageops::FilterType::Triangle);

    for (x, y, rgb) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = rgb.0;
        ys[[0, 0, y, x]] = (r as f32) / 255.0;
        ys[[0, 1, y, x]] = (g as f32) / 255.0;
        ys[[0, 2, y, x]] = (b as f32) / 255.0;
    }
    (ys, ratio)
}

/// 后处理: [1, 4 + nc, anchors] → 原图坐标检测框 (置信度过滤 + NMS)
pub fn decode(
    preds: ArrayViewD<f32>,
    ratio: f32,
    (width_original, height_original): (u32, u32),
    conf: f32,
    iou: f32,
    names: &[String],
) -> Vec<RawDetection> {
    if preds.ndim() != 3 || preds.shape()[1] <= CXYWH_OFFSET {
        tracing::warn!(shape = ?preds.shape(), "⚠️ 模型输出形状不符合 YOLOv8 检测头");
        return Vec::new();
    }
    let (w0, h0) = (width_original as f32, height_original as f32);
    let nc = preds.shape()[1] - CXYWH_OFFSET;

    let mut data = Vec::new();
    let anchor = preds.index_axis(Axis(0), 0);
    for pred in anchor.axis_iter(Axis(1)) {
        let bbox = pred.slice(s![0..CXYWH_OFFSET]);
        let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + nc]);

        let Some((id, &confidence)) = clss
            .iter()
            .enumerate()
            .reduce(|max, x| if x.1 > max.1 { x } else { max })
        else {
            continue;
        };
        if confidence < conf {
            continue;
        }

        let cx = bbox[0] / ratio;
        let cy = bbox[1] / ratio;
        let w = bbox[2] / ratio;
        let h = bbox[3] / ratio;
        let x = cx - w / 2.;
        let y = cy - h / 2.;
        let class = names.get(id).cloned().unwrap_or_else(|| format!("class_{id}"));
        data.push(RawDetection {
            class,
            confidence,
            bbox: [x.clamp(0.0, w0), y.clamp(0.0, h0), (x + w).clamp(0.0, w0), (y + h).clamp(0.0, h0)],
        });
    }

    non_max_suppression(&mut data, iou);
    data
}

fn iou_of(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    match (BBox::try_from(*a), BBox::try_from(*b)) {
        (Ok(a), Ok(b)) => a.iou(&b),
        _ => 0.0,
    }
}

/// 按置信度降序保留与已保留框 IoU 不超过阈值的框 (不区分类别)
pub fn non_max_suppression(xs: &mut Vec<RawDetection>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if iou_of(&xs[prev_index].bbox, &xs[index].bbox) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::Array3;

    fn names() -> Vec<String> {
        vec!["person".to_string(), "dog".to_string()]
    }

    /// 按 anchor 填充 [1, 4 + nc, n] 输出
    fn output(anchors: &[[f32; 6]]) -> Array<f32, IxDyn> {
        let mut preds = Array3::<f32>::zeros((1, 6, anchors.len()));
        for (i, a) in anchors.iter().enumerate() {
            for (c, v) in a.iter().enumerate() {
                preds[[0, c, i]] = *v;
            }
        }
        preds.into_dyn()
    }

    #[test]
    fn test_letterbox_pads_and_normalizes() {
        let img = RgbImage::from_pixel(200, 100, Rgb([255, 0, 51]));
        let (xs, ratio) = letterbox(&img, 64, 64);
        assert_eq!(xs.shape(), &[1, 3, 64, 64]);
        assert!((ratio - 0.32).abs() < 1e-6);

        // 缩放后 64x32 贴在左上角
        assert!((xs[[0, 0, 0, 0]] - 1.0).abs() < 0.01);
        assert!((xs[[0, 2, 31, 63]] - 0.2).abs() < 0.01);
        // 下半部分为填充色
        assert!((xs[[0, 1, 40, 10]] - 144.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_rescales_and_filters() {
        let preds = output(&[
            // cx, cy, w, h, person, dog
            [50., 40., 20., 10., 0.9, 0.1],
            [10., 10., 4., 4., 0.2, 0.3],
        ]);
        let dets = decode(preds.view(), 0.5, (400, 300), 0.5, 0.45, &names());
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class, "person");
        assert_eq!(dets[0].bbox, [80., 70., 120., 90.]);
    }

    #[test]
    fn test_decode_clamps_to_image() {
        let preds = output(&[[2., 2., 10., 10., 0.1, 0.8]]);
        let dets = decode(preds.view(), 1.0, (100, 100), 0.5, 0.45, &names());
        assert_eq!(dets[0].class, "dog");
        assert_eq!(dets[0].bbox, [0., 0., 7., 7.]);
    }

    #[test]
    fn test_nms_keeps_highest_of_overlapping() {
        let preds = output(&[
            [50., 50., 20., 20., 0.7, 0.0],
            [51., 51., 20., 20., 0.9, 0.0],
            [150., 150., 20., 20., 0.6, 0.0],
        ]);
        let dets = decode(preds.view(), 1.0, (300, 300), 0.5, 0.45, &names());
        assert_eq!(dets.len(), 2);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
        assert!((dets[1].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_class_id_and_bad_shape() {
        let preds = output(&[[5., 5., 2., 2., 0.0, 0.9]]);
        let dets = decode(preds.view(), 1.0, (10, 10), 0.5, 0.45, &["person".to_string()]);
        assert_eq!(dets[0].class, "class_1");

        let flat = Array::<f32, _>::zeros(IxDyn(&[1, 4]));
        assert!(decode(flat.view(), 1.0, (10, 10), 0.5, 0.45, &names()).is_empty());
    }

    #[test]
    fn test_missing_model_fails() {
        let result = YoloDetector::new(Path::new("/nonexistent/yolov8n.onnx"), &DetectorConfig::default());
        assert!(result.is_err());
    }
}
