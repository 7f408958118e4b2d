use anyhow::{Context, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;

/// 加载 ONNX 模型并返回会话及首个输入名、全部输出名
pub fn load_session(model_path: &Path, intra_threads: usize) -> Result<(Session, String, Vec<String>)> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .commit_from_file(model_path)
        .with_context(|| format!("无法加载模型 {}", model_path.display()))?;

    let input_name = session
        .inputs
        .first()
        .map(|input| input.name.clone())
        .context("模型没有输入")?;
    let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();

    log::info!("已加载模型 {}", model_path.display());
    Ok((session, input_name, output_names))
}
