use crate::config::ServerConfig;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// 模型权重目录：负责定位文件，缺失时下载或复制
pub struct ModelStore {
    models_dir: PathBuf,
    detection_model: String,
    recognition_model: String,
    swap_model: String,
    enhance_model: String,
    swap_model_url: String,
    gfpgan_fallback: Option<PathBuf>,
    client: reqwest::Client,
    // 同一时间只允许一个下载/复制
    lock: Mutex<()>,
}

impl ModelStore {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            models_dir: config.models_dir.clone(),
            detection_model: config.detection_model.clone(),
            recognition_model: config.recognition_model.clone(),
            swap_model: config.swap_model.clone(),
            enhance_model: config.enhance_model.clone(),
            swap_model_url: config.swap_model_url.clone(),
            gfpgan_fallback: config.gfpgan_fallback.clone(),
            client: reqwest::Client::new(),
            lock: Mutex::new(()),
        }
    }

    pub fn detection_path(&self) -> PathBuf {
        self.models_dir.join(&self.detection_model)
    }

    pub fn recognition_path(&self) -> PathBuf {
        self.models_dir.join(&self.recognition_model)
    }

    pub fn swap_path(&self) -> PathBuf {
        self.models_dir.join(&self.swap_model)
    }

    pub fn enhance_path(&self) -> PathBuf {
        self.models_dir.join(&self.enhance_model)
    }

    /// 换脸需要检测、识别和 inswapper 三个模型，inswapper 缺失时自动下载
    pub async fn ensure_swap_models(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        require(&self.detection_path())?;
        require(&self.recognition_path())?;

        let swap_path = self.swap_path();
        if !swap_path.exists() {
            tokio::fs::create_dir_all(&self.models_dir).await?;
            self.download(&self.swap_model_url, &swap_path).await?;
        }
        Ok(())
    }

    /// 增强需要检测模型和 GFPGAN，GFPGAN 缺失时从备用路径复制
    pub async fn ensure_enhance_models(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        require(&self.detection_path())?;

        let enhance_path = self.enhance_path();
        if enhance_path.exists() {
            return Ok(());
        }
        let fallback = self
            .gfpgan_fallback
            .as_deref()
            .ok_or_else(|| anyhow!("缺少 GFPGAN 模型 {}", enhance_path.display()))?;
        require(fallback)?;

        tokio::fs::create_dir_all(&self.models_dir).await?;
        tokio::fs::copy(fallback, &enhance_path)
            .await
            .with_context(|| format!("无法复制 GFPGAN 模型 {}", fallback.display()))?;
        log::info!("已从 {} 复制 GFPGAN 模型", fallback.display());
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let mut part = dest.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);

        log::info!("正在下载模型 {} -> {}", url, dest.display());
        match self.download_to(url, &part).await {
            Ok(size) => {
                tokio::fs::rename(&part, dest).await?;
                log::info!("模型下载完成 {} ({} 字节)", dest.display(), size);
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e.context(format!("下载模型失败 {url}")))
            }
        }
    }

    async fn download_to(&self, url: &str, part: &Path) -> Result<u64> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(part).await?;
        let mut downloaded = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(downloaded)
    }
}

fn require(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(anyhow!("缺少模型文件 {}", path.display()))
    }
}
