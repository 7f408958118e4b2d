use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

/// 推理流程中的失败原因
#[derive(Debug, thiserror::Error)]
pub enum FaceError {
    #[error("无法读取源图像或目标图像")]
    UnreadableImages,

    #[error("无法读取输入图像")]
    UnreadableImage,

    #[error("在源图像中未检测到面部")]
    NoSourceFace,

    #[error("在目标图像中未检测到面部")]
    NoTargetFace,

    #[error("模型不可用: {0}")]
    ModelUnavailable(String),

    #[error("{0:#}")]
    Inference(#[from] anyhow::Error),

    #[error("面部替换失败: {0}")]
    SwapFailed(Box<FaceError>),

    #[error("面部增强失败: {0}")]
    EnhanceFailed(Box<FaceError>),
}

/// HTTP 层错误，统一渲染为 `{"detail": ...}`
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        ApiError::Internal(format!("{context}: {err}"))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}
