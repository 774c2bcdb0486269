// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 后端
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{path::Path, time::Instant};

use ndarray::Array4;
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::TensorRef,
};
use tracing::{debug, info};

use super::{BackendKind, InferenceError, Model, ModelLoadError, RawDetection, YoloLayout};
use crate::preprocess::{InputShape, PreprocessedInput};

/// ONNX YOLO 模型
pub struct OnnxModel {
  session: Session,
  input_shape: InputShape,
  num_classes: usize,
  layout: YoloLayout,
}

impl OnnxModel {
  /// 创建推理会话并用空白输入预热，预热输出用于校验类别数量
  pub fn load(
    weights: &Path,
    input_shape: InputShape,
    num_classes: usize,
  ) -> Result<Self, ModelLoadError> {
    let mut session = Session::builder()
      .map_err(|e| ModelLoadError::Runtime(e.to_string()))?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(|e| ModelLoadError::Runtime(e.to_string()))?
      .commit_from_file(weights)
      .map_err(|e| ModelLoadError::Runtime(e.to_string()))?;
    info!("ONNX 会话已创建: {}", weights.display());

    let blank = Array4::<f32>::zeros((
      1,
      3,
      input_shape.height as usize,
      input_shape.width as usize,
    ));
    let start = Instant::now();
    let (shape, _) = run(&mut session, &blank).map_err(|e| match e {
      InferenceError::ShapeMismatch { .. } => ModelLoadError::InvalidShape(e.to_string()),
      other => ModelLoadError::Runtime(other.to_string()),
    })?;
    debug!(
      "预热完成，输出形状 {:?}，耗时 {:?}",
      shape,
      start.elapsed()
    );

    let layout = YoloLayout::detect(&shape, num_classes).ok_or_else(|| {
      ModelLoadError::ClassCountMismatch {
        labels: num_classes,
        model: YoloLayout::guess_classes(&shape),
      }
    })?;
    info!("模型输出布局: {:?}", layout);

    Ok(Self {
      session,
      input_shape,
      num_classes,
      layout,
    })
  }
}

fn run(session: &mut Session, tensor: &Array4<f32>) -> Result<(Vec<usize>, Vec<f32>), InferenceError> {
  let input = TensorRef::from_array_view(tensor.view())
    .map_err(|e| InferenceError::ShapeMismatch {
      expected: "NCHW f32 tensor".to_string(),
      actual: e.to_string(),
    })?;

  let outputs = session
    .run(ort::inputs![input])
    .map_err(|e| InferenceError::Backend(e.to_string()))?;

  let (shape, data) = outputs[0]
    .try_extract_tensor::<f32>()
    .map_err(|e| InferenceError::Backend(format!("Failed to extract tensor: {e}")))?;

  let shape = shape.iter().map(|&d| d.max(0) as usize).collect();
  Ok((shape, data.to_vec()))
}

impl Model for OnnxModel {
  fn backend_kind(&self) -> BackendKind {
    BackendKind::Onnx
  }

  fn input_shape(&self) -> InputShape {
    self.input_shape
  }

  fn num_classes(&self) -> Option<usize> {
    Some(self.num_classes)
  }

  fn infer(&mut self, input: &PreprocessedInput) -> Result<Vec<RawDetection>, InferenceError> {
    let (shape, data) = run(&mut self.session, &input.tensor)?;
    self.layout.decode(&shape, &data, self.num_classes)
  }
}
