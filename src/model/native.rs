// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/model/native.rs - 保留的原生格式后端
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

use std::{convert::Infallible, path::Path};

use tracing::warn;

use super::{BackendKind, InferenceError, Model, ModelLoadError, RawDetection};
use crate::preprocess::{InputShape, PreprocessedInput};

/// 原生格式后端（.pt / .pth / .rknn）
///
/// 接口与 ONNX 后端相同，但尚无实现：`load` 总是返回错误，
/// 因此该类型的值无法被构造。
pub struct NativeModel {
  never: Infallible,
}

impl NativeModel {
  pub fn load(weights: &Path) -> Result<Self, ModelLoadError> {
    warn!("原生模型后端尚未实现: {}", weights.display());
    Err(ModelLoadError::UnsupportedBackend(format!(
      "native backend is not implemented ({})",
      weights.display()
    )))
  }
}

impl Model for NativeModel {
  fn backend_kind(&self) -> BackendKind {
    BackendKind::Native
  }

  fn input_shape(&self) -> InputShape {
    match self.never {}
  }

  fn num_classes(&self) -> Option<usize> {
    match self.never {}
  }

  fn infer(&mut self, _input: &PreprocessedInput) -> Result<Vec<RawDetection>, InferenceError> {
    match self.never {}
  }
}
