use crate::face_processor::face_detector::{DetectedFace, FaceDetector};
use crate::face_processor::face_recognition::FaceRecognition;
use anyhow::Result;
use image::RgbImage;
use ndarray::Array1;

/// 检测结果加身份特征
#[derive(Debug, Clone)]
pub struct Face {
    pub detection: DetectedFace,
    pub embedding: Array1<f32>,
}

pub struct FaceAnalyser {
    detector: FaceDetector,
    recognition: FaceRecognition,
}

impl FaceAnalyser {
    pub fn new(detector: FaceDetector, recognition: FaceRecognition) -> Self {
        Self {
            detector,
            recognition,
        }
    }

    /// 只做检测，不提取特征
    pub fn detect(&mut self, img: &RgbImage) -> Result<Vec<DetectedFace>> {
        self.detector.detect(img)
    }

    /// 检测全部人脸并提取特征，顺序与检测器输出一致（置信度降序）
    pub fn get(&mut self, img: &RgbImage) -> Result<Vec<Face>> {
        let detections = self.detector.detect(img)?;
        detections
            .into_iter()
            .map(|detection| {
                let embedding = self.recognition.recognition(img, &detection.landmarks)?;
                Ok(Face {
                    detection,
                    embedding,
                })
            })
            .collect()
    }
}
