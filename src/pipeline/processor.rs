// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/pipeline/processor.rs - 单帧处理
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

use std::{
  collections::BTreeMap,
  sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
  },
  time::{Duration, Instant},
};

use chrono::Local;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
  frame::Frame,
  model::{Detector, InferenceError, Model, ModelHandle},
  postprocess::{Detection, FrameContext, Postprocessor, Thresholds, class_histogram},
  preprocess::{Enhancement, prepare},
};

/// 同一模型连续多少帧推理失败后视为不可恢复
pub const MAX_CONSECUTIVE_INFERENCE_ERRORS: u32 = 5;

/// 每帧开始时读取的一组设置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSettings {
  pub thresholds: Thresholds,
  pub enhancement: Enhancement,
  pub max_detections: usize,
}

/// 一帧的处理结果
#[derive(Debug, Clone)]
pub struct FrameResult {
  pub frame: Frame,
  pub detections: Vec<Detection>,
  /// 本帧各类别数量
  pub class_counts: BTreeMap<String, usize>,
  /// 为本帧打分的模型，未加载模型时为 `None`
  pub model: Option<String>,
  /// 预处理、推理与后处理总耗时
  pub latency: Duration,
}

/// 单帧处理器
///
/// 设置与模型句柄在帧开始时各取一次快照，整帧都使用同一份；
/// 其他线程的修改从下一帧开始生效。
pub struct FrameProcessor<M: Model = Detector> {
  settings: Mutex<FrameSettings>,
  model: Mutex<Option<Arc<ModelHandle<M>>>>,
  last_error: Mutex<Option<String>>,
  failures: AtomicU32,
}

impl<M: Model> FrameProcessor<M> {
  pub fn new(settings: FrameSettings) -> Self {
    Self {
      settings: Mutex::new(settings),
      model: Mutex::new(None),
      last_error: Mutex::new(None),
      failures: AtomicU32::new(0),
    }
  }

  pub fn settings(&self) -> FrameSettings {
    *self.settings.lock()
  }

  pub fn set_thresholds(&self, thresholds: Thresholds) {
    self.settings.lock().thresholds = thresholds;
  }

  pub fn set_enhancement(&self, enhancement: Enhancement) {
    self.settings.lock().enhancement = enhancement;
  }

  pub fn model(&self) -> Option<Arc<ModelHandle<M>>> {
    self.model.lock().clone()
  }

  /// 替换当前模型，返回旧句柄
  ///
  /// 正在处理的帧持有旧句柄的引用，会用旧句柄完成；旧句柄在最后一个引用释放后才被销毁。
  pub fn replace_model(&self, model: Option<Arc<ModelHandle<M>>>) -> Option<Arc<ModelHandle<M>>> {
    if model.is_some() {
      *self.last_error.lock() = None;
    }
    self.failures.store(0, Ordering::Relaxed);
    std::mem::replace(&mut *self.model.lock(), model)
  }

  /// 后端不可恢复时卸载该句柄；若已被换成其他句柄则不做处理
  fn retire(&self, handle: &Arc<ModelHandle<M>>, reason: String) {
    let mut current = self.model.lock();
    if current.as_ref().is_some_and(|active| Arc::ptr_eq(active, handle)) {
      error!("模型 {} 不可用，已卸载: {}", handle.name(), reason);
      *current = None;
      *self.last_error.lock() = Some(reason);
    }
  }

  /// 最近一次模型失效的原因
  pub fn last_error(&self) -> Option<String> {
    self.last_error.lock().clone()
  }

  /// 记录一次推理失败，必要时把错误升级为不可恢复并卸载模型
  fn on_failure(&self, model: &Arc<ModelHandle<M>>, err: InferenceError) -> InferenceError {
    let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
    let err = if !err.is_fatal() && failures >= MAX_CONSECUTIVE_INFERENCE_ERRORS {
      warn!("模型 {} 连续 {} 帧推理失败", model.name(), failures);
      InferenceError::Unrecoverable(format!("连续 {} 帧推理失败: {}", failures, err))
    } else {
      err
    };
    if err.is_fatal() {
      self.retire(model, err.to_string());
    }
    err
  }

  /// 处理一帧
  pub fn process(&self, frame: Frame) -> Result<FrameResult, InferenceError> {
    let settings = self.settings();
    let model = self.model();
    let start = Instant::now();

    let Some(model) = model else {
      return Ok(FrameResult {
        frame,
        detections: Vec::new(),
        class_counts: BTreeMap::new(),
        model: None,
        latency: start.elapsed(),
      });
    };

    let input = prepare(&frame, model.input_shape(), &settings.enhancement);
    let raw = model
      .infer(&input)
      .map_err(|e| self.on_failure(&model, e))?;
    self.failures.store(0, Ordering::Relaxed);

    let context = FrameContext {
      class_names: model.class_names(),
      frame_id: frame.sequence,
      timestamp: Local::now(),
    };
    let detections = Postprocessor::new(settings.thresholds, settings.max_detections).filter(
      raw,
      &input.transform,
      &context,
    );
    let latency = start.elapsed();
    debug!(
      "帧 {} 推理完成: {} 个目标，耗时 {:.2?}",
      frame.sequence,
      detections.len(),
      latency
    );

    Ok(FrameResult {
      class_counts: class_histogram(&detections),
      frame,
      detections,
      model: Some(model.name().to_string()),
      latency,
    })
  }
}

impl<M: Model> Drop for FrameProcessor<M> {
  fn drop(&mut self) {
    if let Some(model) = self.model.get_mut().take() {
      info!("释放模型 {}", model.name());
    }
  }
}
