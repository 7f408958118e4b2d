use anyhow::{anyhow, Result};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// ArcFace 112x112 标准五点
const ARCFACE_DST: [[f32; 2]; 5] = [
    [38.2946, 51.6963],
    [73.5318, 51.5014],
    [56.0252, 71.7366],
    [41.5493, 92.3655],
    [70.7299, 92.2041],
];

/// GFPGAN 使用的 FFHQ 512x512 五点模板
pub const FFHQ_512: [[f32; 2]; 5] = [
    [192.98138, 239.94708],
    [318.90277, 240.1936],
    [256.63416, 314.01935],
    [201.26117, 371.41043],
    [313.08905, 371.15118],
];

/// ArcFace 模板缩放到任意输出尺寸。
///
/// 112 的整数倍直接缩放；其余尺寸按 128 基准缩放并在 x 方向补 8 像素偏移，
/// inswapper 的 128 输入走的就是这条分支。
pub fn arcface_template(size: u32) -> [[f32; 2]; 5] {
    let (ratio, diff_x) = if size % 112 == 0 {
        (size as f32 / 112.0, 0.0)
    } else {
        let ratio = size as f32 / 128.0;
        (ratio, 8.0 * ratio)
    };
    ARCFACE_DST.map(|[x, y]| [x * ratio + diff_x, y * ratio])
}

/// 2x3 仿射矩阵 `[a, b, c, d, e, f]`：
/// `x' = a*x + b*y + c`, `y' = d*x + e*y + f`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine2(pub [f32; 6]);

impl Affine2 {
    pub fn apply(&self, [x, y]: [f32; 2]) -> [f32; 2] {
        let [a, b, c, d, e, f] = self.0;
        [a * x + b * y + c, d * x + e * y + f]
    }

    pub fn invert(&self) -> Result<Affine2> {
        let [a, b, c, d, e, f] = self.0;
        let det = a * e - b * d;
        if det.abs() < 1e-9 {
            return Err(anyhow!("仿射矩阵不可逆"));
        }
        Ok(Affine2([
            e / det,
            -b / det,
            (b * f - c * e) / det,
            -d / det,
            a / det,
            (c * d - a * f) / det,
        ]))
    }

    /// 输出坐标整体缩放，再叠加平移
    pub fn scaled(&self, factor: f32, offset: f32) -> Affine2 {
        let m = self.0.map(|v| v * factor);
        Affine2([m[0], m[1], m[2] + offset, m[3], m[4], m[5] + offset])
    }

    fn projection(&self) -> Result<Projection> {
        let [a, b, c, d, e, f] = self.0;
        Projection::from_matrix([a, b, c, d, e, f, 0.0, 0.0, 1.0])
            .ok_or_else(|| anyhow!("仿射矩阵不可逆"))
    }
}

/// 最小二乘估计 src -> dst 的二维相似变换（旋转 + 等比缩放 + 平移）
pub fn estimate_similarity(src: &[[f32; 2]; 5], dst: &[[f32; 2]; 5]) -> Result<Affine2> {
    let n = src.len() as f32;
    let mean = |pts: &[[f32; 2]; 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), p| (ax + p[0], ay + p[1]));
        [sx / n, sy / n]
    };
    let ms = mean(src);
    let md = mean(dst);

    let (mut num_a, mut num_b, mut denom) = (0.0f32, 0.0f32, 0.0f32);
    for (s, d) in src.iter().zip(dst) {
        let (sx, sy) = (s[0] - ms[0], s[1] - ms[1]);
        let (dx, dy) = (d[0] - md[0], d[1] - md[1]);
        num_a += sx * dx + sy * dy;
        num_b += sx * dy - sy * dx;
        denom += sx * sx + sy * sy;
    }
    if denom < 1e-9 {
        return Err(anyhow!("关键点退化，无法估计对齐矩阵"));
    }

    let a = num_a / denom;
    let b = num_b / denom;
    let tx = md[0] - (a * ms[0] - b * ms[1]);
    let ty = md[1] - (b * ms[0] + a * ms[1]);
    Ok(Affine2([a, -b, tx, b, a, ty]))
}

/// 按 `m`（原图 -> 输出坐标）把 RGB 图像变换到 `size` 大小的新画布
pub fn warp_rgb(img: &RgbImage, m: &Affine2, size: (u32, u32), fill: Rgb<u8>) -> Result<RgbImage> {
    let mut out = RgbImage::from_pixel(size.0, size.1, fill);
    warp_into(img, &m.projection()?, Interpolation::Bilinear, fill, &mut out);
    Ok(out)
}

pub fn warp_gray(img: &GrayImage, m: &Affine2, size: (u32, u32)) -> Result<GrayImage> {
    let mut out = GrayImage::new(size.0, size.1);
    warp_into(img, &m.projection()?, Interpolation::Bilinear, Luma([0]), &mut out);
    Ok(out)
}

/// 根据五点关键点把人脸对齐裁剪为 `size` 的方图，返回裁剪图和对齐矩阵
pub fn norm_crop(
    img: &RgbImage,
    landmarks: &[[f32; 2]; 5],
    template: &[[f32; 2]; 5],
    size: u32,
    fill: Rgb<u8>,
) -> Result<(RgbImage, Affine2)> {
    let m = estimate_similarity(landmarks, template)?;
    let crop = warp_rgb(img, &m, (size, size), fill)?;
    Ok((crop, m))
}

/// cv2.GaussianBlur 在 sigma=0 时由核大小推算的 sigma
pub fn kernel_sigma(ksize: u32) -> f32 {
    0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8
}
