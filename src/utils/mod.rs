pub mod onnx;
pub mod onnx_proto;
pub mod process_img;
