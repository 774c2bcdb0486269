// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/frame.rs - 帧与边界框定义
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

use std::time::Duration;

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// 帧数据
///
/// 由输入源产生后不再修改。
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 媒体时间戳
  pub timestamp: Duration,
  /// 帧序号（同一输入源内从 0 开始，每输出一帧加 1）
  pub sequence: u64,
}

impl Frame {
  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }
}

/// 轴对齐边界框，坐标为 [x_min, y_min, x_max, y_max]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x_min: f32,
  pub y_min: f32,
  pub x_max: f32,
  pub y_max: f32,
}

impl BoundingBox {
  pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
    Self {
      x_min,
      y_min,
      x_max,
      y_max,
    }
  }

  /// 由左上角坐标和宽高构造
  pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self::new(x, y, x + width, y + height)
  }

  /// 由中心点坐标和宽高构造（YOLO 输出格式）
  pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
    let (half_w, half_h) = (width / 2.0, height / 2.0);
    Self::new(cx - half_w, cy - half_h, cx + half_w, cy + half_h)
  }

  pub fn x(&self) -> f32 {
    self.x_min
  }

  pub fn y(&self) -> f32 {
    self.y_min
  }

  pub fn width(&self) -> f32 {
    (self.x_max - self.x_min).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.y_max - self.y_min).max(0.0)
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  /// 计算两个边界框的交集面积
  pub fn intersection(&self, other: &BoundingBox) -> f32 {
    let x1 = self.x_min.max(other.x_min);
    let y1 = self.y_min.max(other.y_min);
    let x2 = self.x_max.min(other.x_max);
    let y2 = self.y_max.min(other.y_max);

    (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
  }

  /// 计算两个边界框的 IoU
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let intersection = self.intersection(other);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }

  /// 将边界框限制在 [0, width] x [0, height] 范围内
  pub fn clip(&self, width: f32, height: f32) -> Self {
    Self {
      x_min: self.x_min.clamp(0.0, width),
      y_min: self.y_min.clamp(0.0, height),
      x_max: self.x_max.clamp(0.0, width),
      y_max: self.y_max.clamp(0.0, height),
    }
  }

  pub fn approx_eq(&self, other: &BoundingBox, tolerance: f32) -> bool {
    (self.x_min - other.x_min).abs() <= tolerance
      && (self.y_min - other.y_min).abs() <= tolerance
      && (self.x_max - other.x_max).abs() <= tolerance
      && (self.y_max - other.y_max).abs() <= tolerance
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn iou_of_identical_boxes_is_one() {
    let a = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
    assert!((a.iou(&a) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn iou_of_disjoint_boxes_is_zero() {
    let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
    assert_eq!(a.iou(&b), 0.0);
  }

  #[test]
  fn iou_of_half_overlap() {
    let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
    // 交集 50，并集 150
    assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
  }

  #[test]
  fn degenerate_boxes_have_zero_iou() {
    let a = BoundingBox::new(5.0, 5.0, 5.0, 5.0);
    assert_eq!(a.iou(&a), 0.0);
  }

  #[test]
  fn center_and_xywh_constructors_agree() {
    let a = BoundingBox::from_center(20.0, 30.0, 10.0, 20.0);
    let b = BoundingBox::from_xywh(15.0, 20.0, 10.0, 20.0);
    assert!(a.approx_eq(&b, 1e-6));
    assert_eq!(a.width(), 10.0);
    assert_eq!(a.height(), 20.0);
  }

  #[test]
  fn clip_keeps_box_inside_frame() {
    let a = BoundingBox::new(-5.0, 10.0, 120.0, 90.0).clip(100.0, 80.0);
    assert_eq!(a, BoundingBox::new(0.0, 10.0, 100.0, 80.0));
  }
}
