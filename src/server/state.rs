use crate::config::ServerConfig;
use crate::service::face_service::FacePipeline;
use std::sync::Arc;

/// actix 各 worker 共享的应用状态
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<dyn FacePipeline>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(pipeline: Arc<dyn FacePipeline>, config: Arc<ServerConfig>) -> Self {
        Self { pipeline, config }
    }
}
