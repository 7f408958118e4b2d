use crate::face_processor::face_align::{
    kernel_sigma, norm_crop, warp_gray, warp_rgb, Affine2, FFHQ_512,
};
use crate::face_processor::face_detector::FaceDetector;
use crate::frame::ProcessFrame;
use crate::utils::onnx::load_session;
use crate::utils::process_img::{blend_masked, image_to_tensor, tensor_to_image};
use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::erode;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const FACE_SIZE: u32 = 512;
const MIN_EYE_DISTANCE: f32 = 5.0;
// 对齐裁剪时画面外区域的填充色（RGB 顺序）
const BORDER_FILL: Rgb<u8> = Rgb([132, 133, 135]);

/// GFPGAN 人脸修复 + 整图放大
pub struct FaceEnhancer {
    gfpgan: Session,
    input_name: String,
    output_name: String,
    face_detector: FaceDetector,
    upscale: u32,
}

impl ProcessFrame for FaceEnhancer {
    fn process_image(&mut self, original_img: &RgbImage) -> Result<RgbImage> {
        let faces = self.face_detector.detect(original_img)?;

        let (w, h) = original_img.dimensions();
        let mut final_img = imageops::resize(
            original_img,
            w * self.upscale,
            h * self.upscale,
            FilterType::Lanczos3,
        );

        let mut restored_count = 0;
        for face in faces.iter().filter(|f| f.eye_distance() >= MIN_EYE_DISTANCE) {
            let (aligned, m) = norm_crop(original_img, &face.landmarks, &FFHQ_512, FACE_SIZE, BORDER_FILL)?;
            let restored = self.enhance_faces(&aligned)?;

            let factor = self.upscale as f32;
            let offset = if self.upscale > 1 { 0.5 * factor } else { 0.0 };
            let inv = m.invert()?.scaled(factor, offset);
            final_img = paste_restored(&final_img, &restored, &inv, self.upscale)?;
            restored_count += 1;
        }

        log::debug!("已修复 {}/{} 个人脸", restored_count, faces.len());
        Ok(final_img)
    }
}

impl FaceEnhancer {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        face_detector: FaceDetector,
        upscale: u32,
        intra_threads: usize,
    ) -> Result<Self> {
        let (gfpgan, input_name, output_names) = load_session(model_path.as_ref(), intra_threads)?;
        let output_name = output_names.into_iter().next().context("GFPGAN 模型没有输出")?;

        Ok(Self {
            gfpgan,
            input_name,
            output_name,
            face_detector,
            upscale: upscale.max(1),
        })
    }

    /// 修复一张已对齐的 512x512 人脸
    pub fn enhance_faces(&mut self, face: &RgbImage) -> Result<RgbImage> {
        let input = image_to_tensor(face, 127.5, 127.5);
        let input_tensor = TensorRef::from_array_view(input.view())?;

        let outputs = self
            .gfpgan
            .run(ort::inputs![self.input_name.as_str() => input_tensor])?;
        let output = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .context("Failed to extract output tensor")?;

        tensor_to_image(output, |v| (v.clamp(-1.0, 1.0) + 1.0) * 0.5 * 255.0)
    }
}

/// 把修复后的人脸按 `inv`（对齐空间 -> 放大后原图）贴回
fn paste_restored(
    background: &RgbImage,
    restored: &RgbImage,
    inv: &Affine2,
    upscale: u32,
) -> Result<RgbImage> {
    let size = background.dimensions();
    let pasted = warp_rgb(restored, inv, size, Rgb([0, 0, 0]))?;
    match soft_mask(inv, restored.width(), size, upscale)? {
        Some(mask) => blend_masked(background, &pasted, &mask),
        None => Ok(background.clone()),
    }
}

/// 柔和边缘掩码：先按放大倍数腐蚀去掉插值毛边，
/// 再按人脸面积收缩 `w_edge` 并模糊 `2 * w_edge + 1`
fn soft_mask(
    inv: &Affine2,
    face_size: u32,
    size: (u32, u32),
    upscale: u32,
) -> Result<Option<GrayImage>> {
    let white = GrayImage::from_pixel(face_size, face_size, Luma([255]));
    let inv_mask = warp_gray(&white, inv, size)?;
    let inv_mask_erosion = erode(&inv_mask, Norm::LInf, upscale.min(255) as u8);

    let total_face_area: f32 = inv_mask_erosion.pixels().map(|p| p[0] as f32 / 255.0).sum();
    if total_face_area < 1.0 {
        return Ok(None);
    }

    let w_edge = (total_face_area.sqrt() as u32) / 20;
    let inv_mask_center = erode(&inv_mask_erosion, Norm::LInf, w_edge.min(255) as u8);
    let mask = gaussian_blur_f32(&inv_mask_center, kernel_sigma(w_edge * 2 + 1));
    Ok(Some(mask))
}
