use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 请求期间产生的临时文件，离开作用域时统一删除（无论处理成功与否）
#[derive(Debug, Default)]
pub struct ScratchFiles {
    paths: Vec<PathBuf>,
}

impl ScratchFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个临时文件并原样返回路径
    pub fn track(&mut self, path: PathBuf) -> PathBuf {
        self.paths.push(path.clone());
        path
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        let paths = std::mem::take(&mut self.paths);
        if paths.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_all(&paths));
            }
            Err(_) => remove_all(&paths),
        }
    }
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => log::debug!("已删除临时文件 {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("删除临时文件 {} 失败: {}", path.display(), e),
        }
    }
}

/// 删除 `dir` 下修改时间早于 `max_age` 的文件，返回删除数量
pub async fn sweep_stale(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()?
            .elapsed()
            .unwrap_or_default();
        if age >= max_age {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!("清理过期文件 {} 失败: {}", entry.path().display(), e),
            }
        }
    }

    if removed > 0 {
        log::info!("已清理 {} 个过期临时文件", removed);
    }
    Ok(removed)
}
