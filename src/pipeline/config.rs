// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/pipeline/config.rs - 流水线配置
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

use serde::{Deserialize, Serialize};

use crate::{
  input::StreamOptions,
  postprocess::{DEFAULT_MAX_DETECTIONS, Thresholds},
  preprocess::{Enhancement, InputShape},
};

/// 流水线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub thresholds: Thresholds,
  pub enhancement: Enhancement,
  /// 模型 URL 未指定尺寸时使用的输入尺寸
  pub input_shape: InputShape,
  /// 每解码 `skip + 1` 帧处理 1 帧（输入 URL 中的 `skip` 优先）
  pub skip: u32,
  /// 最大处理帧率（输入 URL 中的 `max_fps` 优先）
  pub max_fps: Option<f64>,
  pub max_detections: usize,
  /// 处理指定帧数后停止
  pub frame_limit: Option<u64>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      thresholds: Thresholds::default(),
      enhancement: Enhancement::default(),
      input_shape: InputShape::default(),
      skip: 0,
      max_fps: None,
      max_detections: DEFAULT_MAX_DETECTIONS,
      frame_limit: None,
    }
  }
}

impl PipelineConfig {
  pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
    self.thresholds = thresholds;
    self
  }

  pub fn with_enhancement(mut self, enhancement: Enhancement) -> Self {
    self.enhancement = enhancement;
    self
  }

  pub fn with_input_shape(mut self, input_shape: InputShape) -> Self {
    self.input_shape = input_shape;
    self
  }

  pub fn with_skip(mut self, skip: u32) -> Self {
    self.skip = skip;
    self
  }

  pub fn with_max_fps(mut self, max_fps: Option<f64>) -> Self {
    self.max_fps = max_fps;
    self
  }

  pub fn with_max_detections(mut self, max_detections: usize) -> Self {
    self.max_detections = max_detections;
    self
  }

  pub fn with_frame_limit(mut self, frame_limit: Option<u64>) -> Self {
    self.frame_limit = frame_limit;
    self
  }

  pub fn stream_options(&self) -> StreamOptions {
    StreamOptions {
      skip: self.skip,
      max_fps: self.max_fps,
    }
  }
}
