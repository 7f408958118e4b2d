use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

const INSWAPPER_URL: &str =
    "https://github.com/dream80/roop_colab/releases/download/v0.0.1/inswapper_128.onnx";

/// 服务配置，命令行参数优先，其次读取环境变量
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "面部替换与增强 HTTP 服务", long_about = None)]
pub struct ServerConfig {
    #[arg(long, env = "SWAPPER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(short, long, env = "SWAPPER_PORT", default_value_t = 8001)]
    pub port: u16,

    /// 拼接结果链接时使用的对外地址
    #[arg(long, env = "SWAPPER_PUBLIC_URL", default_value = "http://localhost:8001")]
    pub public_url: String,

    #[arg(long, env = "SWAPPER_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    #[arg(long, env = "SWAPPER_TEMP_DIR", default_value = "temp")]
    pub temp_dir: PathBuf,

    #[arg(long, env = "SWAPPER_MODELS_DIR", default_value = "models")]
    pub models_dir: PathBuf,

    #[arg(long, default_value = "det_10g.onnx")]
    pub detection_model: String,

    #[arg(long, default_value = "w600k_r50.onnx")]
    pub recognition_model: String,

    #[arg(long, default_value = "inswapper_128.onnx")]
    pub swap_model: String,

    #[arg(long, default_value = "GFPGANv1.4.onnx")]
    pub enhance_model: String,

    /// 换脸模型缺失时的下载地址
    #[arg(long, env = "SWAPPER_SWAP_MODEL_URL", default_value = INSWAPPER_URL)]
    pub swap_model_url: String,

    /// GFPGAN 权重缺失时从该路径复制
    #[arg(long, env = "SWAPPER_GFPGAN_FALLBACK")]
    pub gfpgan_fallback: Option<PathBuf>,

    /// 覆盖 inswapper 模型内置的 emap 矩阵 (512x512 小端 f32)
    #[arg(long, env = "SWAPPER_EMAP")]
    pub emap: Option<PathBuf>,

    #[arg(long, default_value_t = 640)]
    pub det_size: u32,

    #[arg(long, default_value_t = 0.5)]
    pub det_thresh: f32,

    #[arg(long, default_value_t = 0.4)]
    pub nms_thresh: f32,

    #[arg(long, default_value_t = 2)]
    pub upscale: u32,

    #[arg(long, env = "SWAPPER_INTRA_THREADS", default_value_t = 4)]
    pub intra_threads: usize,

    /// 换脸结果贴回前做 Reinhard 颜色迁移
    #[arg(long)]
    pub color_transfer: bool,

    /// 启动时加载全部模型
    #[arg(long, env = "SWAPPER_PRELOAD")]
    pub preload: bool,

    /// 模型空闲多少秒后卸载，0 表示常驻
    #[arg(long, env = "SWAPPER_MODEL_TTL", default_value_t = 0)]
    pub model_ttl: u64,

    /// 临时文件保留秒数，超时由后台任务清理
    #[arg(long, env = "SWAPPER_TEMP_TTL", default_value_t = 3600)]
    pub temp_ttl: u64,

    #[arg(long, env = "SWAPPER_UPLOAD_LIMIT_MB", default_value_t = 50)]
    pub upload_limit_mb: usize,
}

impl ServerConfig {
    pub fn images_dir(&self) -> PathBuf {
        self.static_dir.join("images")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.images_dir().join("results")
    }

    pub fn public_url(&self) -> &str {
        self.public_url.trim_end_matches('/')
    }

    pub fn result_url(&self, file_name: &str) -> String {
        format!("{}/image/results/{}", self.public_url(), file_name)
    }

    pub fn model_ttl(&self) -> Option<Duration> {
        (self.model_ttl > 0).then(|| Duration::from_secs(self.model_ttl))
    }

    pub fn temp_ttl(&self) -> Duration {
        Duration::from_secs(self.temp_ttl)
    }

    pub fn upload_limit(&self) -> usize {
        self.upload_limit_mb * 1024 * 1024
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["swapper-server"])
    }
}
