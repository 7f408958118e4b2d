use crate::error::ApiError;
use actix_multipart::form::bytes::Bytes;
use actix_multipart::form::text::Text;
use actix_multipart::form::MultipartForm;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const DEFAULT_EXTENSION: &str = ".png";
const SUPPORTED_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "webp", "tif", "tiff"];

#[derive(Debug, MultipartForm)]
pub struct SwapForm {
    pub source_image: Bytes,
    pub target_image: Bytes,
    pub output_name: Option<Text<String>>,
    pub face_index: Option<Text<i64>>,
}

#[derive(Debug, MultipartForm)]
pub struct EnhanceForm {
    pub image: Bytes,
    pub output_name: Option<Text<String>>,
}

/// 上传文件名的扩展名（含点、小写），缺失或不支持时用 `.png`
pub fn upload_extension(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .map(|ext| format!(".{ext}"))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

pub fn temp_path(temp_dir: &Path, ext: &str) -> PathBuf {
    temp_dir.join(format!("{}{}", Uuid::new_v4(), ext))
}

/// 换脸+增强的中间结果
pub fn scratch_path(temp_dir: &Path, ext: &str) -> PathBuf {
    temp_dir.join(format!("swap_{}{}", Uuid::new_v4(), ext))
}

/// 结果文件路径：有 `output_name` 时用它，否则 `<prefix>_<uuid>`
pub fn output_path(results_dir: &Path, output_name: Option<&str>, prefix: &str, ext: &str) -> PathBuf {
    let stem = output_name
        .and_then(sanitize_stem)
        .unwrap_or_else(|| format!("{}_{}", prefix, Uuid::new_v4()));
    results_dir.join(format!("{stem}{ext}"))
}

/// 只保留文件名部分，路径分隔符和控制字符等替换为 `_`
pub fn sanitize_stem(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

pub async fn save_upload(path: &Path, data: &[u8]) -> Result<(), ApiError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ApiError::internal("无法保存上传的图像", e))?;
    }
    tokio::fs::write(path, data)
        .await
        .map_err(|e| ApiError::internal("无法保存上传的图像", e))?;
    log::debug!("已保存上传文件 {} ({} 字节)", path.display(), data.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_from_upload_name() {
        assert_eq!(upload_extension(Some("face.JPG")), ".jpg");
        assert_eq!(upload_extension(Some("dir/photo.webp")), ".webp");
        assert_eq!(upload_extension(Some("noext")), ".png");
        assert_eq!(upload_extension(Some("script.sh")), ".png");
        assert_eq!(upload_extension(None), ".png");
    }

    #[test]
    fn temp_names_are_unique() {
        let dir = Path::new("temp");
        let a = temp_path(dir, ".jpg");
        let b = temp_path(dir, ".jpg");
        assert_ne!(a, b);
        assert!(a.starts_with("temp"));
        assert_eq!(a.extension().unwrap(), "jpg");
        let scratch = scratch_path(dir, ".png");
        assert!(scratch.file_name().unwrap().to_str().unwrap().starts_with("swap_"));
    }

    #[test]
    fn output_name_or_prefixed_uuid() {
        let dir = Path::new("results");
        assert_eq!(
            output_path(dir, Some("my_result"), "result", ".jpg"),
            PathBuf::from("results/my_result.jpg")
        );

        let generated = output_path(dir, None, "enhanced_swap", ".png");
        let name = generated.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("enhanced_swap_"));
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), "enhanced_swap_".len() + 36 + ".png".len());
    }

    #[test]
    fn sanitize_strips_directories_and_symbols() {
        assert_eq!(sanitize_stem("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_stem("a b?c").as_deref(), Some("a_b_c"));
        assert_eq!(sanitize_stem("结果图").as_deref(), Some("结果图"));
        assert_eq!(sanitize_stem(".."), None);
        assert_eq!(sanitize_stem(""), None);
    }

    #[test]
    fn blank_output_name_falls_back_to_prefix() {
        let path = output_path(Path::new("r"), Some("/"), "result", ".png");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("result_"));
    }

    #[tokio::test]
    async fn save_upload_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp").join("x.png");
        save_upload(&path, b"abc").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }
}
