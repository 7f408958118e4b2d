use crate::face_processor::face_align::{arcface_template, norm_crop};
use crate::utils::onnx::load_session;
use crate::utils::process_img::{image_to_tensor, l2_normalize};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use ndarray::Array1;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 112;

/// ArcFace 身份特征提取（insightface w600k_r50）
pub struct FaceRecognition {
    model: Session,
    input_name: String,
    output_name: String,
}

impl FaceRecognition {
    pub fn new<P: AsRef<Path>>(model_path: P, intra_threads: usize) -> Result<Self> {
        let (model, input_name, output_names) = load_session(model_path.as_ref(), intra_threads)?;
        let output_name = output_names.into_iter().next().context("识别模型没有输出")?;
        Ok(Self {
            model,
            input_name,
            output_name,
        })
    }

    /// 对齐裁剪后提取特征，返回 L2 归一化的向量
    pub fn recognition(&mut self, img: &RgbImage, landmarks: &[[f32; 2]; 5]) -> Result<Array1<f32>> {
        let template = arcface_template(INPUT_SIZE);
        let (aligned, _) = norm_crop(img, landmarks, &template, INPUT_SIZE, Rgb([0, 0, 0]))?;

        let input = image_to_tensor(&aligned, 127.5, 127.5);
        let input_tensor = TensorRef::from_array_view(input.view())?;
        let outputs = self
            .model
            .run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        let embedding = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .context("无法提取人脸特征")?;
        let embedding: Array1<f32> = embedding.iter().copied().collect();

        Ok(l2_normalize(embedding))
    }
}
