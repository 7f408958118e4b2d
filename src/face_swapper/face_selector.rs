use crate::face_processor::face_detector::BoundingBox;

/// 选中的人脸下标和对应的说明片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    pub message: String,
}

/// 源人脸：下标有效时使用指定人脸，否则退回第一个
pub fn select_source(count: usize, face_index: i64) -> Option<Selection> {
    if count == 0 {
        return None;
    }
    let selection = match usize::try_from(face_index) {
        Ok(index) if index < count => Selection {
            index,
            message: format!("使用第 {} 个面部 (共检测到 {} 个)", index + 1, count),
        },
        _ => Selection {
            index: 0,
            message: format!("使用第一个面部 (共检测到 {} 个)", count),
        },
    };
    Some(selection)
}

/// 目标人脸：边界框面积最大者，面积相同时取靠前的
pub fn select_target(boxes: &[BoundingBox]) -> Option<Selection> {
    match boxes {
        [] => None,
        [_] => Some(Selection {
            index: 0,
            message: "，替换目标图像中唯一的人脸".to_string(),
        }),
        _ => {
            let index = boxes
                .iter()
                .enumerate()
                .fold(0, |best, (i, b)| if b.area() > boxes[best].area() { i } else { best });
            Some(Selection {
                index,
                message: format!("，只替换目标图像中最大的人脸 (共检测到 {} 个)", boxes.len()),
            })
        }
    }
}
