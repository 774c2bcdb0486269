// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/model.rs - 模型
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

//! # 模型模块
//!
//! 模型通过 URL 描述：
//!
//! - `onnx:///path/model.onnx?labels=/path/classes.txt&size=640`
//! - `native:///path/model.rknn` 保留的原生后端，目前总是加载失败
//! - `model:///path/model.onnx` 按扩展名选择后端
//!
//! 未指定 `labels` 时使用权重文件同目录下的 `class_names.txt`。

use std::{
  fmt,
  path::{Path, PathBuf},
  sync::Arc,
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl,
  frame::BoundingBox,
  preprocess::{InputShape, PreprocessedInput},
  query_param, url_path,
};

mod native;
#[cfg(feature = "model_onnx")]
mod onnx;
mod yolo;

pub use self::native::NativeModel;
#[cfg(feature = "model_onnx")]
pub use self::onnx::OnnxModel;
pub use self::yolo::YoloLayout;

/// 默认类别文件名
pub const DEFAULT_LABEL_FILE: &str = "class_names.txt";

/// 模型加载错误
#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("模型文件不存在: {0}")]
  MissingFile(PathBuf),
  #[error("I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("类别文件无效: {0}")]
  InvalidLabels(String),
  #[error("类别数量不匹配: 类别文件 {labels} 个, 模型输出 {model} 个")]
  ClassCountMismatch { labels: usize, model: usize },
  #[error("不支持的模型后端: {0}")]
  UnsupportedBackend(String),
  #[error("模型后端未编译: {0}")]
  BackendUnavailable(&'static str),
  #[error("Invalid input shape: {0}")]
  InvalidShape(String),
  #[error("Runtime error: {0}")]
  Runtime(String),
  #[error("无效的模型地址: {0}")]
  InvalidUrl(String),
}

/// 推理错误
#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("Shape mismatch: expected {expected}, got {actual}")]
  ShapeMismatch { expected: String, actual: String },
  #[error("Backend error: {0}")]
  Backend(String),
  /// 后端已无法继续使用，模型会被卸载
  #[error("Unrecoverable backend failure: {0}")]
  Unrecoverable(String),
}

impl InferenceError {
  pub fn is_fatal(&self) -> bool {
    matches!(self, InferenceError::Unrecoverable(_))
  }
}

/// 模型后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
  Onnx,
  /// 保留的原生格式后端（.pt / .rknn 等）
  Native,
}

impl BackendKind {
  /// 按权重文件扩展名选择后端
  pub fn from_extension(path: &Path) -> Option<Self> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
      "onnx" => Some(BackendKind::Onnx),
      "pt" | "pth" | "rknn" => Some(BackendKind::Native),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      BackendKind::Onnx => "onnx",
      BackendKind::Native => "native",
    }
  }
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 模型空间中的原始候选框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
  pub bbox: BoundingBox,
  pub class_id: usize,
  pub score: f32,
}

/// 检测模型接口
pub trait Model: Send {
  fn backend_kind(&self) -> BackendKind;

  fn input_shape(&self) -> InputShape;

  /// 模型输出的类别数量，未知时返回 `None`
  fn num_classes(&self) -> Option<usize>;

  fn infer(&mut self, input: &PreprocessedInput) -> Result<Vec<RawDetection>, InferenceError>;
}

/// 已加载、可运行的模型及其类别列表
///
/// 同一个句柄上的推理由内部互斥锁串行化。
pub struct ModelHandle<M: Model = Detector> {
  name: String,
  kind: BackendKind,
  class_names: Arc<[String]>,
  input_shape: InputShape,
  model: Mutex<M>,
}

impl<M: Model> ModelHandle<M> {
  /// 包装一个模型，类别数量必须与模型输出一致
  pub fn new(
    name: impl Into<String>,
    model: M,
    class_names: Vec<String>,
  ) -> Result<Self, ModelLoadError> {
    if class_names.is_empty() {
      return Err(ModelLoadError::InvalidLabels("类别列表为空".to_string()));
    }
    if let Some(classes) = model.num_classes()
      && classes != class_names.len()
    {
      return Err(ModelLoadError::ClassCountMismatch {
        labels: class_names.len(),
        model: classes,
      });
    }

    Ok(Self {
      name: name.into(),
      kind: model.backend_kind(),
      input_shape: model.input_shape(),
      class_names: class_names.into(),
      model: Mutex::new(model),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn kind(&self) -> BackendKind {
    self.kind
  }

  pub fn input_shape(&self) -> InputShape {
    self.input_shape
  }

  pub fn class_names(&self) -> &Arc<[String]> {
    &self.class_names
  }

  pub fn class_name(&self, class_id: usize) -> Option<&str> {
    self.class_names.get(class_id).map(String::as_str)
  }

  pub fn infer(&self, input: &PreprocessedInput) -> Result<Vec<RawDetection>, InferenceError> {
    let actual = input.shape();
    if actual != self.input_shape {
      return Err(InferenceError::ShapeMismatch {
        expected: format!("{}x{}", self.input_shape.width, self.input_shape.height),
        actual: format!("{}x{}", actual.width, actual.height),
      });
    }
    self.model.lock().infer(input)
  }
}

impl<M: Model> fmt::Debug for ModelHandle<M> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModelHandle")
      .field("name", &self.name)
      .field("kind", &self.kind)
      .field("classes", &self.class_names.len())
      .field("input_shape", &self.input_shape)
      .finish()
  }
}

/// 模型描述
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
  pub kind: BackendKind,
  pub weights: PathBuf,
  /// 类别文件，缺省为权重同目录下的 `class_names.txt`
  pub labels: Option<PathBuf>,
  pub input_shape: InputShape,
}

impl ModelSpec {
  /// 按扩展名选择后端
  pub fn from_path(weights: impl Into<PathBuf>) -> Result<Self, ModelLoadError> {
    let weights = weights.into();
    let kind = BackendKind::from_extension(&weights).ok_or_else(|| {
      ModelLoadError::UnsupportedBackend(format!("无法识别的模型文件: {}", weights.display()))
    })?;
    Ok(Self {
      kind,
      weights,
      labels: None,
      input_shape: InputShape::default(),
    })
  }

  pub fn with_labels(mut self, labels: impl Into<PathBuf>) -> Self {
    self.labels = Some(labels.into());
    self
  }

  pub fn with_input_shape(mut self, input_shape: InputShape) -> Self {
    self.input_shape = input_shape;
    self
  }

  /// 实际使用的类别文件路径
  pub fn labels_path(&self) -> PathBuf {
    self
      .labels
      .clone()
      .unwrap_or_else(|| self.weights.with_file_name(DEFAULT_LABEL_FILE))
  }

  /// 用于展示和记录的模型标识
  pub fn display_name(&self) -> String {
    self
      .weights
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| self.weights.display().to_string())
  }
}

impl FromUrl for ModelSpec {
  type Error = ModelLoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let weights = url_path(url);
    let kind = match url.scheme() {
      "onnx" => BackendKind::Onnx,
      "native" => BackendKind::Native,
      "model" => BackendKind::from_extension(&weights).ok_or_else(|| {
        ModelLoadError::UnsupportedBackend(format!("无法识别的模型文件: {}", weights.display()))
      })?,
      other => {
        error!("Unknown model scheme: {}", other);
        return Err(ModelLoadError::InvalidUrl(format!(
          "unknown model scheme '{}'",
          other
        )));
      }
    };

    let labels = url
      .query_pairs()
      .find(|(k, _)| k == "labels")
      .map(|(_, v)| PathBuf::from(v.into_owned()));

    let size = query_param::<u32>(url, "size").map_err(ModelLoadError::InvalidUrl)?;
    let width = query_param::<u32>(url, "width").map_err(ModelLoadError::InvalidUrl)?;
    let height = query_param::<u32>(url, "height").map_err(ModelLoadError::InvalidUrl)?;
    let default = size.map(InputShape::square).unwrap_or_default();
    let input_shape = InputShape::new(
      width.unwrap_or(default.width),
      height.unwrap_or(default.height),
    );
    if input_shape.width == 0 || input_shape.height == 0 {
      return Err(ModelLoadError::InvalidShape(format!(
        "{}x{}",
        input_shape.width, input_shape.height
      )));
    }

    Ok(Self {
      kind,
      weights,
      labels,
      input_shape,
    })
  }
}

/// 解析类别文件内容：每行一个类别名
///
/// 每行首尾空白会被去除，末尾的空行被忽略，中间的空行视为错误。
pub fn parse_labels(text: &str) -> Result<Vec<String>, ModelLoadError> {
  let mut labels: Vec<String> = text.lines().map(|line| line.trim().to_string()).collect();
  while labels.last().is_some_and(|l| l.is_empty()) {
    labels.pop();
  }

  if labels.is_empty() {
    return Err(ModelLoadError::InvalidLabels("类别列表为空".to_string()));
  }
  if let Some(index) = labels.iter().position(String::is_empty) {
    return Err(ModelLoadError::InvalidLabels(format!(
      "第 {} 行为空",
      index + 1
    )));
  }

  Ok(labels)
}

/// 读取类别文件
pub fn load_labels(path: &Path) -> Result<Vec<String>, ModelLoadError> {
  if !path.is_file() {
    return Err(ModelLoadError::MissingFile(path.to_path_buf()));
  }
  let text = std::fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  parse_labels(&text)
}

/// 具体的模型后端
pub enum Detector {
  #[cfg(feature = "model_onnx")]
  Onnx(OnnxModel),
  Native(NativeModel),
}

impl Detector {
  pub fn load(
    kind: BackendKind,
    weights: &Path,
    input_shape: InputShape,
    num_classes: usize,
  ) -> Result<Self, ModelLoadError> {
    match kind {
      BackendKind::Onnx => {
        #[cfg(feature = "model_onnx")]
        {
          OnnxModel::load(weights, input_shape, num_classes).map(Detector::Onnx)
        }
        #[cfg(not(feature = "model_onnx"))]
        {
          let _ = (weights, input_shape, num_classes);
          Err(ModelLoadError::BackendUnavailable("onnx"))
        }
      }
      BackendKind::Native => NativeModel::load(weights).map(Detector::Native),
    }
  }
}

impl Model for Detector {
  fn backend_kind(&self) -> BackendKind {
    match self {
      #[cfg(feature = "model_onnx")]
      Detector::Onnx(model) => model.backend_kind(),
      Detector::Native(model) => model.backend_kind(),
    }
  }

  fn input_shape(&self) -> InputShape {
    match self {
      #[cfg(feature = "model_onnx")]
      Detector::Onnx(model) => model.input_shape(),
      Detector::Native(model) => model.input_shape(),
    }
  }

  fn num_classes(&self) -> Option<usize> {
    match self {
      #[cfg(feature = "model_onnx")]
      Detector::Onnx(model) => model.num_classes(),
      Detector::Native(model) => model.num_classes(),
    }
  }

  fn infer(&mut self, input: &PreprocessedInput) -> Result<Vec<RawDetection>, InferenceError> {
    match self {
      #[cfg(feature = "model_onnx")]
      Detector::Onnx(model) => model.infer(input),
      Detector::Native(model) => model.infer(input),
    }
  }
}

impl ModelHandle<Detector> {
  /// 加载模型：读取类别文件、创建后端并预热，任何一步失败都不会产生句柄
  pub fn load(spec: &ModelSpec) -> Result<Self, ModelLoadError> {
    if !spec.weights.is_file() {
      return Err(ModelLoadError::MissingFile(spec.weights.clone()));
    }

    let class_names = load_labels(&spec.labels_path())?;
    info!(
      "加载模型 {} ({}, {} 个类别, 输入 {}x{})",
      spec.weights.display(),
      spec.kind,
      class_names.len(),
      spec.input_shape.width,
      spec.input_shape.height
    );

    let detector = Detector::load(
      spec.kind,
      &spec.weights,
      spec.input_shape,
      class_names.len(),
    )?;
    ModelHandle::new(spec.display_name(), detector, class_names)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::preprocess::{Enhancement, prepare};
  use crate::frame::Frame;

  struct Fixed {
    classes: usize,
  }

  impl Model for Fixed {
    fn backend_kind(&self) -> BackendKind {
      BackendKind::Onnx
    }

    fn input_shape(&self) -> InputShape {
      InputShape::square(32)
    }

    fn num_classes(&self) -> Option<usize> {
      Some(self.classes)
    }

    fn infer(&mut self, _input: &PreprocessedInput) -> Result<Vec<RawDetection>, InferenceError> {
      Ok(vec![RawDetection {
        bbox: BoundingBox::new(1.0, 1.0, 4.0, 4.0),
        class_id: 0,
        score: 0.5,
      }])
    }
  }

  fn labels(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn labels_are_trimmed_and_trailing_blanks_ignored() {
    let parsed = parse_labels("anchor\r\n  rod \n\n\n").unwrap();
    assert_eq!(parsed, labels(&["anchor", "rod"]));
  }

  #[test]
  fn blank_line_inside_labels_is_rejected() {
    assert!(matches!(
      parse_labels("anchor\n\nrod\n"),
      Err(ModelLoadError::InvalidLabels(_))
    ));
    assert!(matches!(
      parse_labels("\n \n"),
      Err(ModelLoadError::InvalidLabels(_))
    ));
  }

  #[test]
  fn class_count_mismatch_is_a_load_error() {
    let result = ModelHandle::new("fixed", Fixed { classes: 2 }, labels(&["anchor"]));
    assert!(matches!(
      result,
      Err(ModelLoadError::ClassCountMismatch {
        labels: 1,
        model: 2
      })
    ));
  }

  #[test]
  fn handle_rejects_wrong_tensor_shape() {
    let handle = ModelHandle::new("fixed", Fixed { classes: 1 }, labels(&["anchor"])).unwrap();
    let frame = Frame {
      image: image::RgbImage::new(10, 10),
      timestamp: std::time::Duration::ZERO,
      sequence: 0,
    };
    let good = prepare(&frame, InputShape::square(32), &Enhancement::disabled());
    assert_eq!(handle.infer(&good).unwrap().len(), 1);

    let bad = prepare(&frame, InputShape::square(64), &Enhancement::disabled());
    assert!(matches!(
      handle.infer(&bad),
      Err(InferenceError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn model_url_parsing() {
    let url = Url::parse("onnx:///opt/models/best.onnx?labels=/opt/models/names.txt&size=320")
      .unwrap();
    let spec = ModelSpec::from_url(&url).unwrap();
    assert_eq!(spec.kind, BackendKind::Onnx);
    assert_eq!(spec.weights, PathBuf::from("/opt/models/best.onnx"));
    assert_eq!(spec.labels_path(), PathBuf::from("/opt/models/names.txt"));
    assert_eq!(spec.input_shape, InputShape::square(320));
    assert_eq!(spec.display_name(), "best.onnx");

    let url = Url::parse("model:///opt/models/best.pt").unwrap();
    let spec = ModelSpec::from_url(&url).unwrap();
    assert_eq!(spec.kind, BackendKind::Native);
    assert_eq!(
      spec.labels_path(),
      PathBuf::from("/opt/models/class_names.txt")
    );
    assert_eq!(spec.input_shape, InputShape::square(640));
  }

  #[test]
  fn unknown_extension_is_rejected() {
    assert!(matches!(
      ModelSpec::from_path("weights.bin"),
      Err(ModelLoadError::UnsupportedBackend(_))
    ));
  }

  #[test]
  fn missing_weights_is_a_load_error() {
    let spec = ModelSpec::from_path("/definitely/not/here.onnx").unwrap();
    assert!(matches!(
      ModelHandle::load(&spec),
      Err(ModelLoadError::MissingFile(_))
    ));
  }

  #[test]
  fn native_backend_is_reserved() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("best.rknn");
    std::fs::write(&weights, b"weights").unwrap();
    std::fs::write(dir.path().join(DEFAULT_LABEL_FILE), "anchor\n").unwrap();

    let spec = ModelSpec::from_path(&weights).unwrap();
    assert_eq!(spec.kind, BackendKind::Native);
    assert!(matches!(
      ModelHandle::load(&spec),
      Err(ModelLoadError::UnsupportedBackend(_))
    ));
  }
}
