use crate::utils::onnx::load_session;
use crate::utils::process_img::image_to_tensor;
use anyhow::{ensure, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const STRIDES: [usize; 3] = [8, 16, 32];
const NUM_ANCHORS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    /// 交并比，范围 0.0（无重叠）到 1.0（完全重叠）
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// 一次检测结果：边界框、置信度和五点关键点（左眼、右眼、鼻尖、左嘴角、右嘴角）
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub score: f32,
    pub landmarks: [[f32; 2]; 5],
}

impl DetectedFace {
    fn rescaled(mut self, factor: f32) -> Self {
        self.bbox = BoundingBox {
            x1: self.bbox.x1 * factor,
            y1: self.bbox.y1 * factor,
            x2: self.bbox.x2 * factor,
            y2: self.bbox.y2 * factor,
        };
        self.landmarks = self.landmarks.map(|[x, y]| [x * factor, y * factor]);
        self
    }

    pub fn eye_distance(&self) -> f32 {
        let [l, r] = [self.landmarks[0], self.landmarks[1]];
        ((r[0] - l[0]).powi(2) + (r[1] - l[1]).powi(2)).sqrt()
    }
}

/// SCRFD 人脸检测器（insightface det_10g）
pub struct FaceDetector {
    model: Session,
    input_name: String,
    output_names: Vec<String>,
    input_size: u32,
    conf_threshold: f32,
    iou_threshold: f32,
}

impl FaceDetector {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_size: u32,
        conf_threshold: f32,
        iou_threshold: f32,
        intra_threads: usize,
    ) -> Result<Self> {
        let (model, input_name, output_names) = load_session(model_path.as_ref(), intra_threads)?;
        ensure!(
            output_names.len() == STRIDES.len() * 3,
            "检测模型需要 9 个输出（含关键点），实际 {}",
            output_names.len()
        );

        Ok(Self {
            model,
            input_name,
            output_names,
            input_size,
            conf_threshold,
            iou_threshold,
        })
    }

    pub fn detect(&mut self, img: &RgbImage) -> Result<Vec<DetectedFace>> {
        let (input_tensor, det_scale) = letterbox(img, self.input_size);
        let outputs = self.inference(&input_tensor)?;

        let mut proposals = Vec::new();
        for (idx, &stride) in STRIDES.iter().enumerate() {
            let feat = self.input_size as usize / stride;
            proposals.extend(decode_stride(
                &outputs[idx],
                &outputs[idx + STRIDES.len()],
                &outputs[idx + STRIDES.len() * 2],
                stride,
                (feat, feat),
                self.conf_threshold,
            )?);
        }

        let faces: Vec<DetectedFace> = nms(proposals, self.iou_threshold)
            .into_iter()
            .map(|face| face.rescaled(1.0 / det_scale))
            .collect();
        log::debug!("检测到 {} 个人脸", faces.len());
        Ok(faces)
    }

    fn inference(&mut self, input_tensor: &Array4<f32>) -> Result<Vec<Vec<f32>>> {
        let input_tensor = TensorRef::from_array_view(input_tensor.view())?;
        let outputs = self
            .model
            .run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        self.output_names
            .iter()
            .map(|name| {
                let tensor = outputs[name.as_str()]
                    .try_extract_array::<f32>()
                    .with_context(|| format!("无法读取检测输出 {}", name))?;
                Ok(tensor.iter().copied().collect())
            })
            .collect()
    }
}

/// 等比缩放后贴到 `size` 方形画布左上角，其余区域补 0，返回张量与缩放系数
fn letterbox(img: &RgbImage, size: u32) -> (Array4<f32>, f32) {
    let (w, h) = img.dimensions();
    let im_ratio = h as f32 / w as f32;
    let (new_w, new_h) = if im_ratio > 1.0 {
        (((size as f32 / im_ratio) as u32).max(1), size)
    } else {
        (size, ((size as f32 * im_ratio) as u32).max(1))
    };
    let det_scale = new_h as f32 / h as f32;

    let resized = imageops::resize(img, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::new(size, size);
    imageops::replace(&mut canvas, &resized, 0, 0);

    (image_to_tensor(&canvas, 127.5, 128.0), det_scale)
}

/// 解码单个 stride 的输出。每个网格点有 NUM_ANCHORS 个锚点，
/// 锚点中心为 `(x * stride, y * stride)`，距离值以 stride 为单位。
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    (feat_h, feat_w): (usize, usize),
    threshold: f32,
) -> Result<Vec<DetectedFace>> {
    let count = feat_h * feat_w * NUM_ANCHORS;
    ensure!(
        scores.len() == count && bboxes.len() == count * 4 && kps.len() == count * 10,
        "stride {} 的输出尺寸不匹配",
        stride
    );

    let s = stride as f32;
    let mut faces = Vec::new();
    for i in 0..count {
        let score = scores[i];
        if score < threshold {
            continue;
        }
        let cell = i / NUM_ANCHORS;
        let cx = (cell % feat_w) as f32 * s;
        let cy = (cell / feat_w) as f32 * s;

        let d = &bboxes[i * 4..i * 4 + 4];
        let k = &kps[i * 10..i * 10 + 10];
        let mut landmarks = [[0.0f32; 2]; 5];
        for (p, point) in landmarks.iter_mut().enumerate() {
            *point = [cx + k[p * 2] * s, cy + k[p * 2 + 1] * s];
        }

        faces.push(DetectedFace {
            bbox: BoundingBox {
                x1: cx - d[0] * s,
                y1: cy - d[1] * s,
                x2: cx + d[2] * s,
                y2: cy + d[3] * s,
            },
            score,
            landmarks,
        });
    }
    Ok(faces)
}

/// 按置信度降序做贪心非极大值抑制，结果保持降序
pub fn nms(mut faces: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<DetectedFace> = Vec::new();
    for face in faces {
        if keep.iter().all(|k| k.bbox.iou(&face.bbox) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}
