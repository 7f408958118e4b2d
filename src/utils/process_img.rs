use anyhow::{anyhow, Result};
use image::{GrayImage, Rgb, RgbImage};
use ndarray::{Array1, Array4, ArrayViewD};
use palette::{FromColor, Lab, Srgb};

/// RGB 图像转为 NCHW 张量，逐像素执行 `(v - mean) / std`
pub fn image_to_tensor(img: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = img.dimensions();
    let mut array = Array4::<f32>::zeros((1, 3, h as usize, w as usize));

    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..3 {
            array[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }

    array
}

/// NCHW 张量转回 RGB 图像，`to_pixel` 负责把模型输出映射到 [0, 255]
pub fn tensor_to_image(output: ArrayViewD<f32>, to_pixel: impl Fn(f32) -> f32) -> Result<RgbImage> {
    let (h, w) = match output.shape() {
        &[1, 3, h, w] => (h, w),
        shape => return Err(anyhow!("意外的输出形状: {:?}", shape)),
    };

    let mut img = RgbImage::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let channel = |c: usize| to_pixel(output[[0, c, y, x]]).round().clamp(0.0, 255.0) as u8;
            img.put_pixel(x as u32, y as u32, Rgb([channel(0), channel(1), channel(2)]));
        }
    }

    Ok(img)
}

pub fn l2_normalize(v: Array1<f32>) -> Array1<f32> {
    let norm = v.dot(&v).sqrt();
    if norm > f32::EPSILON {
        v / norm
    } else {
        v
    }
}

/// 按掩码线性混合：`out = face * alpha + background * (1 - alpha)`，三者尺寸需一致
pub fn blend_masked(background: &RgbImage, face: &RgbImage, mask: &GrayImage) -> Result<RgbImage> {
    let dims = background.dimensions();
    if face.dimensions() != dims || mask.dimensions() != dims {
        return Err(anyhow!(
            "混合尺寸不一致: 背景 {:?}, 人脸 {:?}, 掩码 {:?}",
            dims,
            face.dimensions(),
            mask.dimensions()
        ));
    }

    let mut out = background.clone();
    for ((bg, fg), m) in out.pixels_mut().zip(face.pixels()).zip(mask.pixels()) {
        let alpha = m[0] as f32 / 255.0;
        for c in 0..3 {
            bg[c] = (fg[c] as f32 * alpha + bg[c] as f32 * (1.0 - alpha)).round() as u8;
        }
    }
    Ok(out)
}

/// Reinhard 颜色迁移：在 LAB 空间把 `src` 的均值/标准差对齐到 `reference`
pub fn reinhard_color_transfer(src: &RgbImage, reference: &RgbImage) -> RgbImage {
    let src_lab = to_lab(src);
    let ref_lab = to_lab(reference);
    if src_lab.is_empty() || ref_lab.is_empty() {
        return src.clone();
    }

    let src_stats = lab_stats(&src_lab);
    let ref_stats = lab_stats(&ref_lab);

    let mut out = RgbImage::new(src.width(), src.height());
    for (pixel, lab) in out.pixels_mut().zip(src_lab) {
        let adjusted: Lab = Lab::new(
            adjust_channel(lab.l, src_stats[0], ref_stats[0]),
            adjust_channel(lab.a, src_stats[1], ref_stats[1]),
            adjust_channel(lab.b, src_stats[2], ref_stats[2]),
        );
        let rgb: Srgb<f32> = Srgb::from_color(adjusted);
        *pixel = Rgb([
            (rgb.red * 255.0).round().clamp(0.0, 255.0) as u8,
            (rgb.green * 255.0).round().clamp(0.0, 255.0) as u8,
            (rgb.blue * 255.0).round().clamp(0.0, 255.0) as u8,
        ]);
    }
    out
}

fn to_lab(img: &RgbImage) -> Vec<Lab> {
    img.pixels()
        .map(|p| {
            let rgb: Srgb<f32> = Srgb::<u8>::new(p[0], p[1], p[2]).into_format();
            Lab::from_color(rgb.into_linear())
        })
        .collect()
}

// (mean, std) for L, a, b
fn lab_stats(pixels: &[Lab]) -> [(f32, f32); 3] {
    let channels: [fn(&Lab) -> f32; 3] = [|p| p.l, |p| p.a, |p| p.b];
    channels.map(|get| mean_std(pixels.iter().map(get)))
}

fn mean_std(values: impl Iterator<Item = f32> + Clone) -> (f32, f32) {
    let n = values.clone().count().max(1) as f32;
    let mean = values.clone().sum::<f32>() / n;
    let variance = values.map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, variance.sqrt())
}

fn adjust_channel(val: f32, src: (f32, f32), target: (f32, f32)) -> f32 {
    let eps = 1e-6;
    ((val - src.0) / src.1.max(eps)) * target.1.max(eps) + target.0
}
