// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/postprocess.rs - 置信度过滤、非极大值抑制与坐标还原
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

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::{frame::BoundingBox, model::RawDetection, preprocess::LetterboxTransform};

/// 默认置信度阈值
pub const DEFAULT_CONFIDENCE: f32 = 0.45;
/// 默认 NMS IOU 阈值
pub const DEFAULT_IOU: f32 = 0.45;
/// 单帧最多保留的检测数量
pub const DEFAULT_MAX_DETECTIONS: usize = 1000;
/// 进入 NMS 的候选数量上限
pub const MAX_NMS_CANDIDATES: usize = 30000;

/// 检测阈值
///
/// 反序列化经过 [`Thresholds::new`]，配置文件中的越界值同样被限制。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "ThresholdsFields")]
pub struct Thresholds {
  pub confidence: f32,
  pub iou: f32,
}

#[derive(Deserialize)]
#[serde(default)]
struct ThresholdsFields {
  confidence: f32,
  iou: f32,
}

impl Default for ThresholdsFields {
  fn default() -> Self {
    Self {
      confidence: DEFAULT_CONFIDENCE,
      iou: DEFAULT_IOU,
    }
  }
}

impl From<ThresholdsFields> for Thresholds {
  fn from(fields: ThresholdsFields) -> Self {
    Thresholds::new(fields.confidence, fields.iou)
  }
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      confidence: DEFAULT_CONFIDENCE,
      iou: DEFAULT_IOU,
    }
  }
}

impl Thresholds {
  /// 两个阈值都限制在 [0, 1]，NaN 取默认值
  pub fn new(confidence: f32, iou: f32) -> Self {
    let clamp = |value: f32, default: f32| {
      if value.is_nan() {
        default
      } else {
        value.clamp(0.0, 1.0)
      }
    };
    Self {
      confidence: clamp(confidence, DEFAULT_CONFIDENCE),
      iou: clamp(iou, DEFAULT_IOU),
    }
  }

  /// 候选是否通过置信度过滤
  ///
  /// 阈值为 1 时不接受任何候选。
  pub fn passes(&self, score: f32) -> bool {
    self.confidence < 1.0 && score >= self.confidence
  }
}

/// 最终检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  /// 检测时间
  pub timestamp: DateTime<Local>,
  pub frame_id: u64,
  pub class_name: String,
  /// 原图坐标
  pub bbox: BoundingBox,
  pub confidence: f32,
}

/// 当前帧的上下文：类别列表来自为该帧打分的模型
#[derive(Debug, Clone)]
pub struct FrameContext<'a> {
  pub class_names: &'a [String],
  pub frame_id: u64,
  pub timestamp: DateTime<Local>,
}

impl FrameContext<'_> {
  fn class_name(&self, class_id: usize) -> String {
    self
      .class_names
      .get(class_id)
      .cloned()
      .unwrap_or_else(|| format!("class_{}", class_id))
  }
}

/// 按得分降序稳定排序，得分相同时保持模型输出顺序
fn sort_by_score(candidates: &mut [RawDetection]) {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// 按类别分组的贪心非极大值抑制
///
/// 与同类别、得分更高且未被抑制的框 IOU 大于 `iou_threshold` 的框被抑制。
/// 输出按得分降序排列。
pub fn non_max_suppression(mut candidates: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
  sort_by_score(&mut candidates);

  let mut kept_by_class: BTreeMap<usize, Vec<BoundingBox>> = BTreeMap::new();
  let mut kept = Vec::with_capacity(candidates.len());

  for candidate in candidates {
    let same_class = kept_by_class.entry(candidate.class_id).or_default();
    if same_class
      .iter()
      .any(|bbox| bbox.iou(&candidate.bbox) > iou_threshold)
    {
      continue;
    }
    same_class.push(candidate.bbox);
    kept.push(candidate);
  }

  kept
}

/// 后处理器
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Postprocessor {
  pub thresholds: Thresholds,
  pub max_detections: usize,
}

impl Default for Postprocessor {
  fn default() -> Self {
    Self {
      thresholds: Thresholds::default(),
      max_detections: DEFAULT_MAX_DETECTIONS,
    }
  }
}

impl Postprocessor {
  pub fn new(thresholds: Thresholds, max_detections: usize) -> Self {
    Self {
      thresholds,
      max_detections,
    }
  }

  /// 置信度过滤与 NMS，结果仍在模型空间
  pub fn suppress(&self, raw: Vec<RawDetection>) -> Vec<RawDetection> {
    let mut candidates: Vec<RawDetection> = raw
      .into_iter()
      .filter(|d| self.thresholds.passes(d.score))
      .collect();

    if candidates.len() > MAX_NMS_CANDIDATES {
      sort_by_score(&mut candidates);
      candidates.truncate(MAX_NMS_CANDIDATES);
    }

    let mut kept = non_max_suppression(candidates, self.thresholds.iou);
    kept.truncate(self.max_detections);
    kept
  }

  /// 完整后处理：过滤、NMS、还原到原图坐标并裁剪到画面内
  pub fn filter(
    &self,
    raw: Vec<RawDetection>,
    transform: &LetterboxTransform,
    context: &FrameContext<'_>,
  ) -> Vec<Detection> {
    let width = transform.source_width as f32;
    let height = transform.source_height as f32;

    self
      .suppress(raw)
      .into_iter()
      .map(|d| Detection {
        timestamp: context.timestamp,
        frame_id: context.frame_id,
        class_name: context.class_name(d.class_id),
        bbox: transform.to_original(&d.bbox).clip(width, height),
        confidence: d.score,
      })
      .collect()
  }
}

/// 单帧的类别直方图
pub fn class_histogram(detections: &[Detection]) -> BTreeMap<String, usize> {
  let mut histogram = BTreeMap::new();
  for detection in detections {
    *histogram.entry(detection.class_name.clone()).or_insert(0) += 1;
  }
  histogram
}
