use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::Parser;
use ort::execution_providers::CPUExecutionProvider;
use std::sync::Arc;
use std::time::Duration;
use swapper_server::config::ServerConfig;
use swapper_server::server::cleanup::sweep_stale;
use swapper_server::server::handlers;
use swapper_server::server::state::AppState;
use swapper_server::service::face_service::FaceService;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

// 空闲模型卸载 + 过期临时文件清理
async fn maintenance_task(service: Arc<FaceService>, config: Arc<ServerConfig>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        interval.tick().await;
        if let Some(ttl) = config.model_ttl() {
            service.unload_idle(ttl);
        }
        if let Err(e) = sweep_stale(&config.temp_dir, config.temp_ttl()).await {
            log::warn!("清理临时目录失败: {}", e);
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info,actix_web=info"))
        .init();

    let config = Arc::new(ServerConfig::parse());

    // 初始化ONNX Runtime
    ort::init()
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .commit()?;

    for dir in [&config.temp_dir, &config.results_dir(), &config.models_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("无法创建目录 {}", dir.display()))?;
    }

    let service = Arc::new(FaceService::new(config.clone()));
    if config.preload {
        if let Err(e) = service.preload().await {
            log::error!("模型预加载失败: {:#}", e);
        }
    }

    tokio::spawn(maintenance_task(service.clone(), config.clone()));

    let state = web::Data::new(AppState::new(service, config.clone()));
    let bind = (config.host.clone(), config.port);
    log::info!("服务启动于 {}:{}，对外地址 {}", bind.0, bind.1, config.public_url());

    HttpServer::new(move || {
        let config = config.clone();
        App::new()
            .wrap(Logger::default())
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .configure(move |cfg| handlers::configure(cfg, &config))
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}
