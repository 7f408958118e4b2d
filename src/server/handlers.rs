use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::server::cleanup::ScratchFiles;
use crate::server::state::AppState;
use crate::server::uploads::{
    output_path, save_upload, scratch_path, temp_path, upload_extension, EnhanceForm, SwapForm,
};
use crate::service::face_service::{EnhanceJob, PipelineOutcome, SwapEnhanceJob, SwapJob};
use actix_files::{Files, NamedFile};
use actix_multipart::form::text::Text;
use actix_multipart::form::{MultipartForm, MultipartFormConfig};
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Serialize)]
struct ResultResponse {
    result_url: String,
    message: String,
}

/// 注册全部路由和静态目录
pub fn configure(cfg: &mut web::ServiceConfig, config: &ServerConfig) {
    let form_config = MultipartFormConfig::default()
        .total_limit(config.upload_limit())
        .memory_limit(config.upload_limit())
        .error_handler(|err, _req| {
            log::error!("表单解析错误: {}", err);
            ApiError::Unprocessable(format!("表单解析错误: {err}")).into()
        });

    cfg.app_data(form_config)
        .route("/", web::get().to(index))
        .route("/ping", web::get().to(|| async { HttpResponse::Ok().body("pong") }))
        .route("/image/{image_path:.*}", web::get().to(get_image))
        .route("/image_url", web::get().to(image_url))
        .route("/face_swap", web::post().to(face_swap))
        .route("/enhance_face", web::post().to(enhance_face))
        .route("/face_swap_and_enhance", web::post().to(face_swap_and_enhance))
        .service(Files::new("/static", config.static_dir.clone()));
}

async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "面部替换与增强 API 服务",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/face_swap": "面部替换接口",
            "/enhance_face": "面部增强与修复接口",
            "/image/{image_name}": "获取图像",
            "/image_url": "获取示例图像URL",
            "/face_swap_and_enhance": "面部替换与增强接口"
        }
    }))
}

async fn get_image(
    state: web::Data<AppState>,
    image_path: web::Path<String>,
) -> Result<NamedFile, ApiError> {
    let not_found = || ApiError::NotFound("图片不存在".to_string());
    let path = resolve_image_path(&state.config.images_dir(), &image_path).ok_or_else(not_found)?;
    if !path.is_file() {
        return Err(not_found());
    }
    NamedFile::open_async(&path).await.map_err(|_| not_found())
}

/// 把请求路径拼到图片目录下，拒绝 `..`、绝对路径等越界写法
fn resolve_image_path(images_dir: &Path, requested: &str) -> Option<PathBuf> {
    let relative = Path::new(requested);
    let mut components = relative.components().peekable();
    components.peek()?;
    if components.all(|c| matches!(c, Component::Normal(_))) {
        Some(images_dir.join(relative))
    } else {
        None
    }
}

async fn image_url(state: web::Data<AppState>) -> HttpResponse {
    let base = state.config.public_url();
    HttpResponse::Ok().json(json!({
        "source_url": format!("{base}/image/source.jpg"),
        "target_url": format!("{base}/image/target.jpg"),
        "result_example": format!("{base}/image/results/result_example.jpg"),
    }))
}

async fn face_swap(
    state: web::Data<AppState>,
    MultipartForm(form): MultipartForm<SwapForm>,
) -> Result<HttpResponse, ApiError> {
    let config = &state.config;
    let target_ext = upload_extension(form.target_image.file_name.as_deref());

    let mut scratch = ScratchFiles::new();
    let source = scratch.track(temp_path(
        &config.temp_dir,
        &upload_extension(form.source_image.file_name.as_deref()),
    ));
    let target = scratch.track(temp_path(&config.temp_dir, &target_ext));
    save_upload(&source, &form.source_image.data).await?;
    save_upload(&target, &form.target_image.data).await?;

    let output = prepare_output(config, form.output_name, "result", &target_ext).await?;
    let job = SwapJob {
        source,
        target,
        output: output.clone(),
        face_index: face_index(form.face_index),
    };

    let outcome = state
        .pipeline
        .swap(job)
        .await
        .map_err(|e| ApiError::internal("面部替换过程中发生错误", e))?;
    Ok(result_response(config, &output, outcome))
}

async fn enhance_face(
    state: web::Data<AppState>,
    MultipartForm(form): MultipartForm<EnhanceForm>,
) -> Result<HttpResponse, ApiError> {
    let config = &state.config;
    let ext = upload_extension(form.image.file_name.as_deref());

    let mut scratch = ScratchFiles::new();
    let input = scratch.track(temp_path(&config.temp_dir, &ext));
    save_upload(&input, &form.image.data).await?;

    let output = prepare_output(config, form.output_name, "enhanced", &ext).await?;
    let job = EnhanceJob {
        input,
        output: output.clone(),
    };

    let outcome = state
        .pipeline
        .enhance(job)
        .await
        .map_err(|e| ApiError::internal("面部增强过程中发生错误", e))?;
    Ok(result_response(config, &output, outcome))
}

async fn face_swap_and_enhance(
    state: web::Data<AppState>,
    MultipartForm(form): MultipartForm<SwapForm>,
) -> Result<HttpResponse, ApiError> {
    let config = &state.config;
    let target_ext = upload_extension(form.target_image.file_name.as_deref());

    let mut scratch = ScratchFiles::new();
    let source = scratch.track(temp_path(
        &config.temp_dir,
        &upload_extension(form.source_image.file_name.as_deref()),
    ));
    let target = scratch.track(temp_path(&config.temp_dir, &target_ext));
    let swapped = scratch.track(scratch_path(&config.temp_dir, &target_ext));
    save_upload(&source, &form.source_image.data).await?;
    save_upload(&target, &form.target_image.data).await?;

    let output = prepare_output(config, form.output_name, "enhanced_swap", &target_ext).await?;
    let job = SwapEnhanceJob {
        source,
        target,
        scratch: swapped,
        output: output.clone(),
        face_index: face_index(form.face_index),
    };

    let outcome = state
        .pipeline
        .swap_and_enhance(job)
        .await
        .map_err(|e| ApiError::internal("处理过程中发生错误", e))?;
    Ok(result_response(config, &output, outcome))
}

fn face_index(field: Option<Text<i64>>) -> i64 {
    field.map(Text::into_inner).unwrap_or(0)
}

async fn prepare_output(
    config: &ServerConfig,
    output_name: Option<Text<String>>,
    prefix: &str,
    ext: &str,
) -> Result<PathBuf, ApiError> {
    let results_dir = config.results_dir();
    tokio::fs::create_dir_all(&results_dir)
        .await
        .map_err(|e| ApiError::internal("无法创建结果目录", e))?;
    let name = output_name.map(Text::into_inner);
    Ok(output_path(&results_dir, name.as_deref(), prefix, ext))
}

fn result_response(config: &ServerConfig, output: &Path, outcome: PipelineOutcome) -> HttpResponse {
    let file_name = output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    log::info!("已生成 {}: {}", file_name, outcome.message);

    HttpResponse::Ok().json(ResultResponse {
        result_url: config.result_url(&file_name),
        message: outcome.message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaceError;
    use crate::service::face_service::FacePipeline;
    use actix_web::http::StatusCode;
    use actix_web::{test as actix_test, App};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    const BOUNDARY: &str = "----swapper-test-boundary";

    /// 不跑模型，直接把输入复制到输出
    struct MockPipeline {
        source_faces: usize,
    }

    #[async_trait]
    impl FacePipeline for MockPipeline {
        async fn swap(&self, job: SwapJob) -> Result<PipelineOutcome, FaceError> {
            if self.source_faces == 0 {
                return Err(FaceError::SwapFailed(Box::new(FaceError::NoSourceFace)));
            }
            tokio::fs::copy(&job.target, &job.output)
                .await
                .map_err(anyhow::Error::from)?;
            Ok(PipelineOutcome {
                message: format!("面部交换成功 (index {})", job.face_index),
            })
        }

        async fn enhance(&self, job: EnhanceJob) -> Result<PipelineOutcome, FaceError> {
            tokio::fs::copy(&job.input, &job.output)
                .await
                .map_err(anyhow::Error::from)?;
            Ok(PipelineOutcome {
                message: "面部增强成功".to_string(),
            })
        }
    }

    enum Part<'a> {
        File(&'a str, &'a str, &'a [u8]),
        Text(&'a str, &'a str),
    }

    fn multipart(parts: &[Part]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::File(name, file_name, data) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(data);
                }
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}")
                            .as_bytes(),
                    );
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn post(uri: &str, parts: &[Part]) -> actix_test::TestRequest {
        actix_test::TestRequest::post()
            .uri(uri)
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(multipart(parts))
    }

    fn test_config(root: &Path) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.static_dir = root.join("static");
        config.temp_dir = root.join("temp");
        config.public_url = "http://localhost:8001".to_string();
        config
    }

    macro_rules! app {
        ($config:expr, $faces:expr) => {{
            let config = Arc::new($config);
            let state = AppState::new(Arc::new(MockPipeline { source_faces: $faces }), config.clone());
            actix_test::init_service(
                App::new()
                    .app_data(web::Data::new(state))
                    .configure(|cfg| configure(cfg, &config)),
            )
            .await
        }};
    }

    async fn wait_until_empty(dir: &Path) -> bool {
        for _ in 0..100 {
            let empty = std::fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(true);
            if empty {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    #[actix_web::test]
    async fn index_and_ping() {
        let dir = tempfile::tempdir().unwrap();
        let app = app!(test_config(dir.path()), 1);

        let body: Value = actix_test::call_and_read_body_json(&app, actix_test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(body["message"], "面部替换与增强 API 服务");
        assert!(body["endpoints"]["/face_swap"].is_string());

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/ping").to_request()).await;
        assert_eq!(actix_test::read_body(resp).await, "pong");
    }

    #[actix_web::test]
    async fn image_url_uses_public_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.public_url = "https://faces.example.com/".to_string();
        let app = app!(config, 1);

        let body: Value =
            actix_test::call_and_read_body_json(&app, actix_test::TestRequest::get().uri("/image_url").to_request()).await;
        assert_eq!(body["source_url"], "https://faces.example.com/image/source.jpg");
        assert_eq!(
            body["result_example"],
            "https://faces.example.com/image/results/result_example.jpg"
        );
    }

    #[actix_web::test]
    async fn face_swap_writes_named_result_and_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let results = config.results_dir();
        let temp = config.temp_dir.clone();
        let app = app!(config, 1);

        let req = post(
            "/face_swap",
            &[
                Part::File("source_image", "s.png", b"source"),
                Part::File("target_image", "t.JPG", b"target"),
                Part::Text("output_name", "my_result"),
                Part::Text("face_index", "2"),
            ],
        )
        .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["result_url"], "http://localhost:8001/image/results/my_result.jpg");
        assert_eq!(body["message"], "面部交换成功 (index 2)");
        assert_eq!(std::fs::read(results.join("my_result.jpg")).unwrap(), b"target");
        assert!(wait_until_empty(&temp).await);
    }

    #[actix_web::test]
    async fn face_swap_generates_name_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let app = app!(test_config(dir.path()), 1);

        let req = post(
            "/face_swap",
            &[
                Part::File("source_image", "s", b"source"),
                Part::File("target_image", "t", b"target"),
            ],
        )
        .to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        let url = body["result_url"].as_str().unwrap();
        assert!(url.starts_with("http://localhost:8001/image/results/result_"));
        assert!(url.ends_with(".png"));
        assert_eq!(body["message"], "面部交换成功 (index 0)");
    }

    #[actix_web::test]
    async fn face_swap_failure_is_500_with_detail() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let temp = config.temp_dir.clone();
        let app = app!(config, 0);

        let req = post(
            "/face_swap",
            &[
                Part::File("source_image", "s.png", b"source"),
                Part::File("target_image", "t.png", b"target"),
            ],
        )
        .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(
            body["detail"],
            "面部替换过程中发生错误: 面部替换失败: 在源图像中未检测到面部"
        );
        assert!(wait_until_empty(&temp).await);
    }

    #[actix_web::test]
    async fn missing_upload_field_is_422() {
        let dir = tempfile::tempdir().unwrap();
        let app = app!(test_config(dir.path()), 1);

        let req = post("/face_swap", &[Part::File("source_image", "s.png", b"source")]).to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = actix_test::read_body_json(resp).await;
        assert!(body["detail"].as_str().unwrap().starts_with("表单解析错误"));
    }

    #[actix_web::test]
    async fn enhance_face_uses_enhanced_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let app = app!(test_config(dir.path()), 1);

        let req = post("/enhance_face", &[Part::File("image", "face.webp", b"pixels")]).to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        let url = body["result_url"].as_str().unwrap();
        assert!(url.starts_with("http://localhost:8001/image/results/enhanced_"));
        assert!(url.ends_with(".webp"));
        assert_eq!(body["message"], "面部增强成功");
    }

    #[actix_web::test]
    async fn swap_and_enhance_chains_both_steps() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let temp = config.temp_dir.clone();
        let app = app!(config, 1);

        let req = post(
            "/face_swap_and_enhance",
            &[
                Part::File("source_image", "s.png", b"source"),
                Part::File("target_image", "t.png", b"target"),
            ],
        )
        .to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        let url = body["result_url"].as_str().unwrap();
        assert!(url.starts_with("http://localhost:8001/image/results/enhanced_swap_"));
        assert_eq!(
            body["message"],
            "面部替换和增强成功! 面部交换成功 (index 0)，并且已进行面部增强处理"
        );
        assert!(wait_until_empty(&temp).await);
    }

    #[actix_web::test]
    async fn swap_and_enhance_failure_uses_generic_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let app = app!(test_config(dir.path()), 0);

        let req = post(
            "/face_swap_and_enhance",
            &[
                Part::File("source_image", "s.png", b"source"),
                Part::File("target_image", "t.png", b"target"),
            ],
        )
        .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(
            body["detail"],
            "处理过程中发生错误: 面部替换失败: 在源图像中未检测到面部"
        );
    }

    #[actix_web::test]
    async fn get_image_serves_files_and_404s() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.results_dir()).unwrap();
        std::fs::write(config.results_dir().join("a.png"), b"png-bytes").unwrap();
        let app = app!(config, 1);

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::get().uri("/image/results/a.png").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(actix_test::read_body(resp).await, "png-bytes");

        let resp = actix_test::call_service(
            &app,
            actix_test::TestRequest::get().uri("/image/results/missing.png").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["detail"], "图片不存在");

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/image/results").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn image_path_rejects_escapes() {
        let base = Path::new("static/images");
        assert_eq!(
            resolve_image_path(base, "results/a.png"),
            Some(PathBuf::from("static/images/results/a.png"))
        );
        assert_eq!(resolve_image_path(base, "../secret.txt"), None);
        assert_eq!(resolve_image_path(base, "results/../../x"), None);
        assert_eq!(resolve_image_path(base, "/etc/passwd"), None);
        assert_eq!(resolve_image_path(base, ""), None);
    }
}
