use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use prost::Message;
use std::path::Path;

const TENSOR_FLOAT: i32 = 1;

// onnx.proto 中读取 initializer 需要的字段，其余字段解码时跳过

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    pub dims: Vec<i64>,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(float, repeated, tag = "4")]
    pub float_data: Vec<f32>,
    #[prost(string, tag = "8")]
    pub name: String,
    #[prost(bytes = "bytes", tag = "9")]
    pub raw_data: Bytes,
}

/// 读取模型图中最后一个 float initializer，返回形状和数据
pub fn last_initializer(model_path: &Path) -> Result<(Vec<usize>, Vec<f32>)> {
    let buf = std::fs::read(model_path)
        .with_context(|| format!("无法读取模型 {}", model_path.display()))?;
    let model = ModelProto::decode(Bytes::from(buf))
        .with_context(|| format!("无法解析 ONNX 模型 {}", model_path.display()))?;
    let tensor = model
        .graph
        .and_then(|graph| graph.initializer.into_iter().last())
        .context("模型图中没有 initializer")?;
    tensor_values(tensor)
}

fn tensor_values(tensor: TensorProto) -> Result<(Vec<usize>, Vec<f32>)> {
    ensure!(
        tensor.data_type == TENSOR_FLOAT,
        "initializer {} 不是 float 类型 (data_type = {})",
        tensor.name,
        tensor.data_type
    );

    let values = if tensor.raw_data.is_empty() {
        tensor.float_data
    } else {
        ensure!(tensor.raw_data.len() % 4 == 0, "initializer {} 的数据长度不是 4 的倍数", tensor.name);
        tensor
            .raw_data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    };

    let dims = tensor
        .dims
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("initializer {} 的形状非法", tensor.name))?;
    ensure!(
        dims.iter().product::<usize>() == values.len(),
        "initializer {} 的形状 {:?} 与数据长度 {} 不一致",
        tensor.name,
        dims,
        values.len()
    );
    Ok((dims, values))
}
