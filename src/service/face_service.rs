use crate::config::ServerConfig;
use crate::error::FaceError;
use crate::face_processor::face_analyser::FaceAnalyser;
use crate::face_processor::face_detector::{BoundingBox, FaceDetector};
use crate::face_processor::face_recognition::FaceRecognition;
use crate::face_swapper::face_selector::{select_source, select_target, Selection};
use crate::face_swapper::inswapper::InSwapper;
use crate::frame::enhance::FaceEnhancer;
use crate::frame::ProcessFrame;
use crate::models::model_store::ModelStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::{ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SwapJob {
    pub source: PathBuf,
    pub target: PathBuf,
    pub output: PathBuf,
    pub face_index: i64,
}

#[derive(Debug, Clone)]
pub struct EnhanceJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// 先换脸写入 `scratch`，再把 `scratch` 增强后写入 `output`
#[derive(Debug, Clone)]
pub struct SwapEnhanceJob {
    pub source: PathBuf,
    pub target: PathBuf,
    pub scratch: PathBuf,
    pub output: PathBuf,
    pub face_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub message: String,
}

#[async_trait]
pub trait FacePipeline: Send + Sync {
    async fn swap(&self, job: SwapJob) -> Result<PipelineOutcome, FaceError>;

    async fn enhance(&self, job: EnhanceJob) -> Result<PipelineOutcome, FaceError>;

    async fn swap_and_enhance(&self, job: SwapEnhanceJob) -> Result<PipelineOutcome, FaceError> {
        let swapped = self
            .swap(SwapJob {
                source: job.source,
                target: job.target,
                output: job.scratch.clone(),
                face_index: job.face_index,
            })
            .await?;
        self.enhance(EnhanceJob {
            input: job.scratch,
            output: job.output,
        })
        .await?;

        Ok(PipelineOutcome {
            message: format!(
                "面部替换和增强成功! {}，并且已进行面部增强处理",
                swapped.message
            ),
        })
    }
}

/// 懒加载的模型槽位，记录最近一次使用时间
struct ModelSlot<T> {
    instance: Option<T>,
    last_used: Instant,
}

impl<T> ModelSlot<T> {
    fn empty() -> Self {
        Self {
            instance: None,
            last_used: Instant::now(),
        }
    }

    fn get_or_load(&mut self, load: impl FnOnce() -> Result<T>) -> Result<&mut T> {
        self.last_used = Instant::now();
        let model = match self.instance.take() {
            Some(model) => model,
            None => load()?,
        };
        Ok(self.instance.insert(model))
    }

    fn unload_if_idle(&mut self, ttl: Duration) -> bool {
        if self.instance.is_some() && self.last_used.elapsed() >= ttl {
            self.instance = None;
            true
        } else {
            false
        }
    }
}

struct ModelPaths {
    detection: PathBuf,
    recognition: PathBuf,
    swap: PathBuf,
    enhance: PathBuf,
}

struct Models {
    config: Arc<ServerConfig>,
    paths: ModelPaths,
    analyser: Mutex<ModelSlot<FaceAnalyser>>,
    swapper: Mutex<ModelSlot<InSwapper>>,
    enhancer: Mutex<ModelSlot<FaceEnhancer>>,
}

impl Models {
    fn load_detector(&self) -> Result<FaceDetector> {
        FaceDetector::new(
            &self.paths.detection,
            self.config.det_size,
            self.config.det_thresh,
            self.config.nms_thresh,
            self.config.intra_threads,
        )
    }

    fn load_analyser(&self) -> Result<FaceAnalyser> {
        let recognition = FaceRecognition::new(&self.paths.recognition, self.config.intra_threads)?;
        Ok(FaceAnalyser::new(self.load_detector()?, recognition))
    }

    fn load_swapper(&self) -> Result<InSwapper> {
        InSwapper::new(
            &self.paths.swap,
            self.config.emap.as_deref(),
            self.config.color_transfer,
            self.config.intra_threads,
        )
    }

    fn load_enhancer(&self) -> Result<FaceEnhancer> {
        FaceEnhancer::new(
            &self.paths.enhance,
            self.load_detector()?,
            self.config.upscale,
            self.config.intra_threads,
        )
    }

    fn swap(&self, job: &SwapJob) -> Result<String, FaceError> {
        let (source_img, target_img) = match (read_rgb(&job.source), read_rgb(&job.target)) {
            (Ok(source), Ok(target)) => (source, target),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("{:#}", e);
                return Err(FaceError::UnreadableImages);
            }
        };

        let (source_faces, target_faces) = {
            let mut slot = self.analyser.lock().unwrap_or_else(PoisonError::into_inner);
            let analyser = slot.get_or_load(|| self.load_analyser())?;
            (analyser.get(&source_img)?, analyser.detect(&target_img)?)
        };

        let source = select_source(source_faces.len(), job.face_index).ok_or(FaceError::NoSourceFace)?;
        let boxes: Vec<BoundingBox> = target_faces.iter().map(|f| f.bbox).collect();
        let target = select_target(&boxes).ok_or(FaceError::NoTargetFace)?;

        let result = {
            let mut slot = self.swapper.lock().unwrap_or_else(PoisonError::into_inner);
            let swapper = slot.get_or_load(|| self.load_swapper())?;
            swapper.swap_face(
                &target_img,
                &target_faces[target.index],
                &source_faces[source.index].embedding,
            )?
        };

        save_rgb(&result, &job.output)?;
        Ok(swap_message(&source, &target))
    }

    fn enhance(&self, job: &EnhanceJob) -> Result<String, FaceError> {
        let img = read_rgb(&job.input).map_err(|e| {
            log::warn!("{:#}", e);
            FaceError::UnreadableImage
        })?;

        let result = {
            let mut slot = self.enhancer.lock().unwrap_or_else(PoisonError::into_inner);
            let enhancer = slot.get_or_load(|| self.load_enhancer())?;
            enhancer.process_image(&img)?
        };

        save_rgb(&result, &job.output)?;
        Ok("面部增强成功".to_string())
    }

    fn preload(&self) -> Result<()> {
        self.analyser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_load(|| self.load_analyser())?;
        self.swapper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_load(|| self.load_swapper())?;
        self.enhancer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_load(|| self.load_enhancer())?;
        Ok(())
    }

    /// 正在推理的槽位直接跳过，不等待锁
    fn unload_idle(&self, ttl: Duration) -> Vec<&'static str> {
        let mut unloaded = Vec::new();
        if unload_slot(&self.analyser, ttl) {
            unloaded.push("analyser");
        }
        if unload_slot(&self.swapper, ttl) {
            unloaded.push("inswapper");
        }
        if unload_slot(&self.enhancer, ttl) {
            unloaded.push("gfpgan");
        }
        unloaded
    }
}

fn unload_slot<T>(slot: &Mutex<ModelSlot<T>>, ttl: Duration) -> bool {
    match slot.try_lock() {
        Ok(mut guard) => guard.unload_if_idle(ttl),
        Err(TryLockError::Poisoned(e)) => e.into_inner().unload_if_idle(ttl),
        Err(TryLockError::WouldBlock) => false,
    }
}

/// 基于 ONNX 模型的换脸/增强流水线
pub struct FaceService {
    store: ModelStore,
    models: Arc<Models>,
}

impl FaceService {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let store = ModelStore::new(&config);
        let paths = ModelPaths {
            detection: store.detection_path(),
            recognition: store.recognition_path(),
            swap: store.swap_path(),
            enhance: store.enhance_path(),
        };
        let models = Models {
            config,
            paths,
            analyser: Mutex::new(ModelSlot::empty()),
            swapper: Mutex::new(ModelSlot::empty()),
            enhancer: Mutex::new(ModelSlot::empty()),
        };

        Self {
            store,
            models: Arc::new(models),
        }
    }

    /// 启动时确保权重存在并加载全部模型
    pub async fn preload(&self) -> Result<()> {
        self.store.ensure_swap_models().await?;
        self.store.ensure_enhance_models().await?;
        let models = Arc::clone(&self.models);
        let start = Instant::now();
        tokio::task::spawn_blocking(move || models.preload()).await??;
        log::info!("模型预加载完成，用时 {:?}", start.elapsed());
        Ok(())
    }

    /// 卸载空闲超过 `ttl` 的模型，只用 `try_lock`，可以在异步任务里直接调用
    pub fn unload_idle(&self, ttl: Duration) {
        for name in self.models.unload_idle(ttl) {
            log::info!("模型 {} 空闲超过 {:?}，已卸载", name, ttl);
        }
    }
}

#[async_trait]
impl FacePipeline for FaceService {
    async fn swap(&self, job: SwapJob) -> Result<PipelineOutcome, FaceError> {
        self.store.ensure_swap_models().await.map_err(unavailable)?;

        let models = Arc::clone(&self.models);
        let start = Instant::now();
        let message = run_blocking(move || models.swap(&job))
            .await
            .map_err(|e| FaceError::SwapFailed(Box::new(e)))?;
        log::info!("换脸完成，用时 {:?}", start.elapsed());

        Ok(PipelineOutcome {
            message: format!("面部交换成功 ({})", message),
        })
    }

    async fn enhance(&self, job: EnhanceJob) -> Result<PipelineOutcome, FaceError> {
        self.store.ensure_enhance_models().await.map_err(unavailable)?;

        let models = Arc::clone(&self.models);
        let start = Instant::now();
        let message = run_blocking(move || models.enhance(&job))
            .await
            .map_err(|e| FaceError::EnhanceFailed(Box::new(e)))?;
        log::info!("面部增强完成，用时 {:?}", start.elapsed());

        Ok(PipelineOutcome { message })
    }
}

fn unavailable(e: anyhow::Error) -> FaceError {
    FaceError::ModelUnavailable(format!("{e:#}"))
}

async fn run_blocking<F>(f: F) -> Result<String, FaceError>
where
    F: FnOnce() -> Result<String, FaceError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FaceError::Inference(anyhow!("推理任务异常退出: {e}")))?
}

fn swap_message(source: &Selection, target: &Selection) -> String {
    format!("{}{}", source.message, target.message)
}

/// 按内容识别格式读取图像，上传文件的扩展名不一定可靠
fn read_rgb(path: &Path) -> Result<RgbImage> {
    let img = ImageReader::open(path)
        .with_context(|| format!("无法打开图像 {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("无法解码图像 {}", path.display()))?;
    Ok(img.to_rgb8())
}

fn save_rgb(img: &RgbImage, path: &Path) -> Result<()> {
    img.save(path)
        .with_context(|| format!("无法保存结果图像 {}", path.display()))
}
