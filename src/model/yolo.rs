// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/model/yolo.rs - YOLO 输出解码
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

use super::{InferenceError, RawDetection};
use crate::frame::BoundingBox;

/// YOLO 输出张量布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YoloLayout {
  /// YOLOv5：`[1, N, 5 + nc]`，每行为 cx, cy, w, h, objectness, 类别概率
  AnchorMajor,
  /// YOLOv8：`[1, 4 + nc, N]`，没有 objectness
  FeatureMajor,
}

impl YoloLayout {
  /// 根据输出形状与类别数判断布局
  pub fn detect(shape: &[usize], num_classes: usize) -> Option<Self> {
    match shape {
      [1, _, features] if *features == 5 + num_classes => Some(YoloLayout::AnchorMajor),
      [1, features, _] if *features == 4 + num_classes => Some(YoloLayout::FeatureMajor),
      _ => None,
    }
  }

  /// 从输出形状推测模型的类别数（仅用于错误信息）
  pub fn guess_classes(shape: &[usize]) -> usize {
    match shape {
      [1, rows, cols] if rows > cols => cols.saturating_sub(5),
      [1, rows, _] => rows.saturating_sub(4),
      _ => 0,
    }
  }

  /// 解码输出张量，丢弃得分不大于 0 的候选
  pub fn decode(
    &self,
    shape: &[usize],
    data: &[f32],
    num_classes: usize,
  ) -> Result<Vec<RawDetection>, InferenceError> {
    let expected: usize = shape.iter().product();
    if shape.len() != 3 || data.len() != expected || Self::detect(shape, num_classes) != Some(*self)
    {
      return Err(InferenceError::ShapeMismatch {
        expected: self.describe(num_classes),
        actual: format!("{:?} ({} values)", shape, data.len()),
      });
    }

    let mut detections = Vec::new();
    match self {
      YoloLayout::AnchorMajor => {
        let stride = 5 + num_classes;
        for row in data.chunks_exact(stride) {
          let objectness = row[4];
          let Some((class_id, class_score)) = best_class(row[5..].iter().copied()) else {
            continue;
          };
          let score = objectness * class_score;
          if score > 0.0 {
            detections.push(RawDetection {
              bbox: BoundingBox::from_center(row[0], row[1], row[2], row[3]),
              class_id,
              score,
            });
          }
        }
      }
      YoloLayout::FeatureMajor => {
        let anchors = shape[2];
        let at = |feature: usize, anchor: usize| data[feature * anchors + anchor];
        for anchor in 0..anchors {
          let scores = (0..num_classes).map(|c| at(4 + c, anchor));
          let Some((class_id, score)) = best_class(scores) else {
            continue;
          };
          if score > 0.0 {
            detections.push(RawDetection {
              bbox: BoundingBox::from_center(
                at(0, anchor),
                at(1, anchor),
                at(2, anchor),
                at(3, anchor),
              ),
              class_id,
              score,
            });
          }
        }
      }
    }

    Ok(detections)
  }

  fn describe(&self, num_classes: usize) -> String {
    match self {
      YoloLayout::AnchorMajor => format!("[1, N, {}]", 5 + num_classes),
      YoloLayout::FeatureMajor => format!("[1, {}, N]", 4 + num_classes),
    }
  }
}

/// 最高类别分数，分数相同时取较小的类别索引
fn best_class(scores: impl Iterator<Item = f32>) -> Option<(usize, f32)> {
  scores.enumerate().fold(None, |best, (id, score)| match best {
    Some((_, best_score)) if best_score >= score => best,
    _ => Some((id, score)),
  })
}
