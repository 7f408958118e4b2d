pub mod config;
pub mod error;
pub mod frame;
pub mod utils;

pub mod face_processor {
    pub mod face_align;
    pub mod face_analyser;
    pub mod face_detector;
    pub mod face_recognition;
}

pub mod face_swapper {
    pub mod face_selector;
    pub mod inswapper;
}

pub mod models {
    pub mod model_store;
}

pub mod service {
    pub mod face_service;
}

pub mod server {
    pub mod cleanup;
    pub mod handlers;
    pub mod state;
    pub mod uploads;
}
