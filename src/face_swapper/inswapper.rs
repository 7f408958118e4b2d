use crate::face_processor::face_align::{
    arcface_template, kernel_sigma, norm_crop, warp_gray, warp_rgb, Affine2,
};
use crate::face_processor::face_detector::DetectedFace;
use crate::utils::onnx::load_session;
use crate::utils::onnx_proto::last_initializer;
use crate::utils::process_img::{
    blend_masked, image_to_tensor, l2_normalize, reinhard_color_transfer, tensor_to_image,
};
use anyhow::{ensure, Context, Result};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::erode;
use ndarray::{Array1, Array2};
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

const INPUT_SIZE: u32 = 128;
const EMBEDDING_DIM: usize = 512;

/// inswapper_128 人脸替换器
pub struct InSwapper {
    model: Session,
    output_name: String,
    emap: Array2<f32>,
    color_transfer: bool,
}

impl InSwapper {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        emap_path: Option<&Path>,
        color_transfer: bool,
        intra_threads: usize,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let (model, _, output_names) = load_session(model_path, intra_threads)?;
        let output_name = output_names.into_iter().next().context("换脸模型没有输出")?;
        let emap = match emap_path {
            Some(path) => load_emap(path)?,
            None => emap_from_model(model_path)?,
        };

        Ok(Self {
            model,
            output_name,
            emap,
            color_transfer,
        })
    }

    /// 把 `source_embedding` 的身份换到 `target_img` 中 `target_face` 所在位置
    pub fn swap_face(
        &mut self,
        target_img: &RgbImage,
        target_face: &DetectedFace,
        source_embedding: &Array1<f32>,
    ) -> Result<RgbImage> {
        let template = arcface_template(INPUT_SIZE);
        let (aligned, m) = norm_crop(
            target_img,
            &target_face.landmarks,
            &template,
            INPUT_SIZE,
            Rgb([0, 0, 0]),
        )?;

        let target_tensor = Tensor::from_array(image_to_tensor(&aligned, 0.0, 255.0))?;
        let source_tensor = Tensor::from_array(build_latent(source_embedding, &self.emap)?)?;

        let inputs = ort::inputs![
            "target" => target_tensor,
            "source" => source_tensor,
        ];
        let outputs = self.model.run(inputs).context("换脸推理失败")?;
        let output = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;

        let mut fake = tensor_to_image(output, |v| v * 255.0)?;
        if self.color_transfer {
            fake = reinhard_color_transfer(&fake, &aligned);
        }

        paste_back(target_img, &fake, &m)
    }
}

/// emap 是模型图的最后一个 initializer
fn emap_from_model(model_path: &Path) -> Result<Array2<f32>> {
    let (dims, values) = last_initializer(model_path)?;
    ensure!(
        dims == [EMBEDDING_DIM, EMBEDDING_DIM],
        "模型内置 emap 形状应为 [{0}, {0}]，实际 {1:?}",
        EMBEDDING_DIM,
        dims
    );
    log::info!("已从 {} 读取 emap", model_path.display());
    Ok(Array2::from_shape_vec((EMBEDDING_DIM, EMBEDDING_DIM), values)?)
}

/// 读取 512x512 小端 f32 的 emap 矩阵
fn load_emap(path: &Path) -> Result<Array2<f32>> {
    let bytes = std::fs::read(path).with_context(|| format!("无法读取 emap {}", path.display()))?;
    ensure!(
        bytes.len() == EMBEDDING_DIM * EMBEDDING_DIM * 4,
        "emap 大小应为 {} 字节，实际 {}",
        EMBEDDING_DIM * EMBEDDING_DIM * 4,
        bytes.len()
    );
    let values = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Array2::from_shape_vec((EMBEDDING_DIM, EMBEDDING_DIM), values)?)
}

/// latent = normed_embedding · emap，再做一次 L2 归一化；形状 [1, 512]
fn build_latent(embedding: &Array1<f32>, emap: &Array2<f32>) -> Result<Array2<f32>> {
    ensure!(
        embedding.len() == EMBEDDING_DIM,
        "身份特征维度应为 {}，实际 {}",
        EMBEDDING_DIM,
        embedding.len()
    );
    Ok(l2_normalize(embedding.dot(emap)).insert_axis(ndarray::Axis(0)))
}

/// 用逆变换把换好的 128x128 人脸贴回原图，边缘经过腐蚀和高斯模糊
fn paste_back(target: &RgbImage, fake: &RgbImage, m: &Affine2) -> Result<RgbImage> {
    let inv = m.invert()?;
    let size = target.dimensions();

    let fake_full = warp_rgb(fake, &inv, size, Rgb([0, 0, 0]))?;
    let Some(mask) = paste_mask(&inv, fake.width(), size)? else {
        return Ok(target.clone());
    };
    blend_masked(target, &fake_full, &mask)
}

/// 大于 20 的像素直接置为 255，其余保持原值
fn harden_mask(mask: &mut GrayImage) {
    for p in mask.pixels_mut().filter(|p| p[0] > 20) {
        p[0] = 255;
    }
}

/// 贴回掩码：白色方块逆变换到原图后把大于 20 的像素置满、按人脸尺寸腐蚀并模糊。
/// 人脸完全落在画面外时返回 None。
fn paste_mask(inv: &Affine2, crop_size: u32, size: (u32, u32)) -> Result<Option<GrayImage>> {
    let white = GrayImage::from_pixel(crop_size, crop_size, Luma([255]));
    let mut mask = warp_gray(&white, inv, size)?;
    harden_mask(&mut mask);

    let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0, 0);
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == 255 {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if min_x == u32::MAX {
        return Ok(None);
    }

    let mask_size = (((max_x - min_x) * (max_y - min_y)) as f32).sqrt() as u32;
    let erode_k = (mask_size / 10).max(10);
    let mask = erode(&mask, Norm::LInf, (erode_k / 2).min(255) as u8);

    let blur_k = (mask_size / 20).max(5);
    let mask = gaussian_blur_f32(&mask, kernel_sigma(2 * blur_k + 1));
    Ok(Some(mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::onnx_proto::{GraphProto, ModelProto, TensorProto};
    use prost::Message;
    use std::io::Write;

    fn write_model(emap_dims: Vec<i64>, emap_values: &[f32]) -> tempfile::NamedTempFile {
        let tensor = |name: &str, dims: Vec<i64>, values: &[f32]| TensorProto {
            dims,
            data_type: 1,
            name: name.to_string(),
            raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>().into(),
            ..Default::default()
        };
        let model = ModelProto {
            graph: Some(GraphProto {
                initializer: vec![
                    tensor("conv.weight", vec![2], &[7.0, 7.0]),
                    tensor("emap", emap_dims, emap_values),
                ],
            }),
        };
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), model.encode_to_vec()).unwrap();
        file
    }

    #[test]
    fn emap_is_read_from_model_graph() {
        let mut values = vec![0.0f32; EMBEDDING_DIM * EMBEDDING_DIM];
        values[1] = 2.5;
        values[EMBEDDING_DIM + 3] = -1.0;
        let file = write_model(vec![EMBEDDING_DIM as i64, EMBEDDING_DIM as i64], &values);

        let emap = emap_from_model(file.path()).unwrap();
        assert_eq!(emap[[0, 1]], 2.5);
        assert_eq!(emap[[1, 3]], -1.0);

        // 身份特征经过 emap 投影后再归一化
        let mut embedding = Array1::zeros(EMBEDDING_DIM);
        embedding[0] = 1.0;
        let latent = build_latent(&embedding, &emap).unwrap();
        assert_eq!(latent.shape(), &[1, EMBEDDING_DIM]);
        assert!((latent[[0, 1]] - 1.0).abs() < 1e-6);
        assert_eq!(latent[[0, 0]], 0.0);
    }

    #[test]
    fn model_emap_shape_is_checked() {
        let file = write_model(vec![2, 2], &[1.0, 0.0, 0.0, 1.0]);
        assert!(emap_from_model(file.path()).is_err());
    }

    #[test]
    fn latent_applies_emap() {
        let mut emap = Array2::zeros((EMBEDDING_DIM, EMBEDDING_DIM));
        emap[[0, 1]] = 3.0;
        let mut embedding = Array1::zeros(EMBEDDING_DIM);
        embedding[0] = 1.0;
        let latent = build_latent(&embedding, &emap).unwrap();
        assert!((latent[[0, 1]] - 1.0).abs() < 1e-6);
        assert_eq!(latent[[0, 0]], 0.0);
    }

    #[test]
    fn latent_rejects_wrong_dimension() {
        assert!(build_latent(&Array1::zeros(128), &Array2::zeros((EMBEDDING_DIM, EMBEDDING_DIM))).is_err());
    }

    #[test]
    fn emap_file_size_is_checked() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 16]).unwrap();
        assert!(load_emap(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut bytes = vec![0u8; EMBEDDING_DIM * EMBEDDING_DIM * 4];
        bytes[4..8].copy_from_slice(&1.5f32.to_le_bytes());
        file.write_all(&bytes).unwrap();
        let emap = load_emap(file.path()).unwrap();
        assert_eq!(emap[[0, 1]], 1.5);
    }

    #[test]
    fn paste_mask_is_solid_inside_and_empty_outside() {
        // 128 的人脸块放大 2 倍贴到 (100, 100)
        let m = Affine2([0.5, 0.0, -50.0, 0.0, 0.5, -50.0]);
        let inv = m.invert().unwrap();
        let mask = paste_mask(&inv, 128, (512, 512)).unwrap().unwrap();
        assert!(mask.get_pixel(228, 228)[0] >= 250);
        assert_eq!(mask.get_pixel(10, 10)[0], 0);
        assert_eq!(mask.get_pixel(500, 500)[0], 0);
        // 边缘经过腐蚀，原边界处已经透明
        assert!(mask.get_pixel(101, 228)[0] < 128);
    }

    #[test]
    fn harden_mask_keeps_faint_edge_values() {
        let mut mask = GrayImage::from_fn(4, 1, |x, _| Luma([[0, 20, 21, 200][x as usize]]));
        harden_mask(&mut mask);
        let values: Vec<u8> = mask.pixels().map(|p| p[0]).collect();
        assert_eq!(values, vec![0, 20, 255, 255]);
    }

    #[test]
    fn paste_mask_outside_frame_is_none() {
        let inv = Affine2([1.0, 0.0, 5000.0, 0.0, 1.0, 5000.0]);
        assert!(paste_mask(&inv, 128, (64, 64)).unwrap().is_none());
    }

    #[test]
    fn paste_back_keeps_background_outside_face() {
        let target = RgbImage::from_pixel(300, 300, Rgb([10, 20, 30]));
        let fake = RgbImage::from_pixel(128, 128, Rgb([250, 250, 250]));
        let m = Affine2([1.0, 0.0, -50.0, 0.0, 1.0, -50.0]);
        let out = paste_back(&target, &fake, &m).unwrap();
        assert_eq!(out.get_pixel(5, 5).0, [10, 20, 30]);
        assert!(out.get_pixel(114, 114).0.iter().all(|&c| c >= 245));
    }
}
