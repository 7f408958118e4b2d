use image::RgbImage;

pub mod enhance;

/// 对整帧图像做处理并返回新图像
pub trait ProcessFrame {
    fn process_image(&mut self, original_img: &RgbImage) -> anyhow::Result<RgbImage>;
}
