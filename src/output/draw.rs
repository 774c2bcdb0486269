// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/output/draw.rs - 检测框绘制与文本记录
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

use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  postprocess::{Detection, class_histogram},
  preprocess::hsv_to_rgb,
};

const PALETTE_SIZE: usize = 16;
const BORDER_THICKNESS: u32 = 2;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 18.0;
const LABEL_PADDING: i32 = 2;
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

// 告警横幅：顶部 50 像素压暗到 40%，红色文字，最多两行
const BANNER_HEIGHT: u32 = 50;
const BANNER_KEEP: f32 = 0.4;
const BANNER_FONT_SIZE: f32 = 22.0;
const BANNER_TEXT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BANNER_MARGIN: i32 = 10;
const BANNER_MAX_LINES: usize = 2;

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("无效的字体文件: {0}")]
  InvalidFont(PathBuf),
}

/// 读取 TrueType/OpenType 字体文件
pub fn load_font(path: &Path) -> Result<FontVec, DrawError> {
  let data = std::fs::read(path).map_err(|source| DrawError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  FontVec::try_from_vec(data).map_err(|_| DrawError::InvalidFont(path.to_path_buf()))
}

/// 告警横幅文字，如 `2026-01-02 08:00:00 ALARM: anchor:2, rod:1`；没有检测时为 `None`
pub fn alarm_text(detections: &[Detection]) -> Option<String> {
  let first = detections.first()?;
  let summary = class_histogram(detections)
    .iter()
    .map(|(name, count)| format!("{}:{}", name, count))
    .collect::<Vec<_>>()
    .join(", ");
  Some(format!(
    "{} ALARM: {}",
    first.timestamp.format("%Y-%m-%d %H:%M:%S"),
    summary
  ))
}

/// 在图像上绘制检测框，同一类别总是同一颜色
///
/// 加载了字体时在框上方标注类别与置信度；`alarm` 开启时在顶部叠加告警横幅。
/// 没有字体时只画框和横幅底色。
pub struct Draw {
  colors: Vec<Rgb<u8>>,
  thickness: u32,
  font: Option<FontVec>,
  alarm: bool,
}

impl Default for Draw {
  fn default() -> Self {
    let colors = (0..PALETTE_SIZE)
      .map(|i| hsv_to_rgb(i as f32 / PALETTE_SIZE as f32 * 360.0, 0.8, 0.9))
      .collect();
    Self {
      colors,
      thickness: BORDER_THICKNESS,
      font: None,
      alarm: false,
    }
  }
}

impl Draw {
  /// 按输出 URL 的参数创建：`font=/path/font.ttf` 启用文字标签，`alarm` 启用告警横幅
  ///
  /// 字体加载失败时记录警告并退回只画框。
  pub fn from_query(url: &Url) -> Self {
    let mut draw = Self::default();
    draw.alarm = url.query_pairs().any(|(k, _)| k == "alarm");

    let font = url
      .query_pairs()
      .find(|(k, _)| k == "font")
      .map(|(_, v)| PathBuf::from(v.as_ref()));
    if let Some(path) = font {
      match load_font(&path) {
        Ok(font) => {
          info!("已加载标签字体: {}", path.display());
          draw.font = Some(font);
        }
        Err(e) => warn!("{}，只绘制检测框", e),
      }
    }
    draw
  }

  pub fn with_font(mut self, font: FontVec) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_alarm(mut self, alarm: bool) -> Self {
    self.alarm = alarm;
    self
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn color_of(&self, class_name: &str) -> Rgb<u8> {
    let hash = class_name
      .bytes()
      .fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
    self.colors[hash % self.colors.len()]
  }

  pub fn draw_detections_on_image(&self, image: &mut RgbImage, detections: &[Detection]) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    for detection in detections {
      let bbox = detection.bbox.clip(w, h);
      let x = bbox.x_min.floor() as i32;
      let y = bbox.y_min.floor() as i32;
      let width = bbox.width().ceil() as u32;
      let height = bbox.height().ceil() as u32;
      if width == 0 || height == 0 {
        continue;
      }

      let color = self.color_of(&detection.class_name);
      // 向内加粗
      for t in 0..self.thickness {
        let inner_w = width.saturating_sub(2 * t);
        let inner_h = height.saturating_sub(2 * t);
        if inner_w == 0 || inner_h == 0 {
          break;
        }
        let rect = Rect::at(x + t as i32, y + t as i32).of_size(inner_w, inner_h);
        draw_hollow_rect_mut(image, rect, color);
      }

      if let Some(font) = &self.font {
        let label = format!("{} {:.2}", detection.class_name, detection.confidence);
        self.draw_label(image, font, &label, (x, y), color);
      }
    }

    if self.alarm
      && let Some(text) = alarm_text(detections)
    {
      self.draw_banner(image, &text);
    }
  }

  /// 标签放在框的上方，放不下时放进框内
  fn draw_label(
    &self,
    image: &mut RgbImage,
    font: &FontVec,
    label: &str,
    (x, y): (i32, i32),
    color: Rgb<u8>,
  ) {
    let scale = PxScale::from(LABEL_FONT_SIZE);
    let (text_w, text_h) = text_size(scale, font, label);
    let box_h = text_h as i32 + 2 * LABEL_PADDING;
    let label_y = if y - box_h >= 0 { y - box_h } else { y };
    let label_x = x.max(0);

    let max_width = (image.width() as i32 - label_x).max(0) as u32;
    let box_w = (text_w + 2 * LABEL_PADDING as u32).min(max_width);
    if box_w == 0 {
      return;
    }
    draw_filled_rect_mut(image, Rect::at(label_x, label_y).of_size(box_w, box_h as u32), color);
    draw_text_mut(
      image,
      LABEL_TEXT_COLOR,
      label_x + LABEL_PADDING,
      label_y + LABEL_PADDING,
      scale,
      font,
      label,
    );
  }

  fn draw_banner(&self, image: &mut RgbImage, text: &str) {
    let height = BANNER_HEIGHT.min(image.height());
    for y in 0..height {
      for x in 0..image.width() {
        let pixel = image.get_pixel_mut(x, y);
        for c in pixel.0.iter_mut() {
          *c = (*c as f32 * BANNER_KEEP).round() as u8;
        }
      }
    }

    let Some(font) = &self.font else {
      return;
    };
    let scale = PxScale::from(BANNER_FONT_SIZE);
    let max_width = (image.width() as i32 - 2 * BANNER_MARGIN).max(0) as u32;
    let lines = wrap_words(text, max_width, |line| text_size(scale, font, line).0);
    let line_height = height as i32 / BANNER_MAX_LINES as i32;
    for (i, line) in lines.iter().take(BANNER_MAX_LINES).enumerate() {
      draw_text_mut(
        image,
        BANNER_TEXT_COLOR,
        BANNER_MARGIN,
        BANNER_MARGIN / 2 + i as i32 * line_height,
        scale,
        font,
        line,
      );
    }
  }

  pub fn draw_detection(&self, image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut image = image.clone();
    self.draw_detections_on_image(&mut image, detections);
    image
  }
}

/// 按空格折行，使每行宽度不超过 `max_width`；单个超宽的词独占一行
fn wrap_words(text: &str, max_width: u32, width_of: impl Fn(&str) -> u32) -> Vec<String> {
  let mut lines = Vec::new();
  let mut current = String::new();
  for word in text.split_whitespace() {
    let candidate = if current.is_empty() {
      word.to_string()
    } else {
      format!("{} {}", current, word)
    };
    if width_of(&candidate) <= max_width || current.is_empty() {
      current = candidate;
    } else {
      lines.push(std::mem::replace(&mut current, word.to_string()));
    }
  }
  if !current.is_empty() {
    lines.push(current);
  }
  lines
}

/// 把检测结果写成与图像同名的 txt 文件
pub struct Record {
  pub label_with_name: bool,
}

impl Record {
  pub fn lines(&self, detections: &[Detection], class_names: &[String]) -> Vec<String> {
    detections
      .iter()
      .map(|d| {
        let name = if self.label_with_name {
          d.class_name.clone()
        } else {
          class_names
            .iter()
            .position(|n| *n == d.class_name)
            .map(|i| i.to_string())
            .unwrap_or_else(|| d.class_name.clone())
        };
        format!(
          "{}, {:.4}, {:.1}, {:.1}, {:.1}, {:.1}",
          name, d.confidence, d.bbox.x_min, d.bbox.y_min, d.bbox.x_max, d.bbox.y_max
        )
      })
      .collect()
  }

  pub fn record(
    &self,
    detections: &[Detection],
    class_names: &[String],
    path: &Path,
  ) -> Result<(), std::io::Error> {
    let records = self.lines(detections, class_names);
    std::fs::write(path.with_extension("txt"), records.join("\n"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::BoundingBox;
  use chrono::Local;

  fn detection(class_name: &str, bbox: BoundingBox) -> Detection {
    Detection {
      timestamp: Local::now(),
      frame_id: 0,
      class_name: class_name.to_string(),
      bbox,
      confidence: 0.875,
    }
  }

  #[test]
  fn draws_border_in_class_color() {
    let draw = Draw::default();
    let image = RgbImage::new(20, 20);
    let d = detection("anchor", BoundingBox::new(2.0, 2.0, 12.0, 12.0));
    let out = draw.draw_detection(&image, &[d]);

    let color = draw.color_of("anchor");
    assert_eq!(*out.get_pixel(2, 2), color);
    assert_eq!(*out.get_pixel(3, 3), color);
    assert_eq!(*out.get_pixel(7, 7), Rgb([0, 0, 0]));
    // 原图不变
    assert_eq!(*image.get_pixel(2, 2), Rgb([0, 0, 0]));
  }

  #[test]
  fn boxes_outside_the_image_are_clipped() {
    let draw = Draw::default();
    let mut image = RgbImage::new(10, 10);
    let d = detection("rod", BoundingBox::new(-5.0, -5.0, 30.0, 30.0));
    draw.draw_detections_on_image(&mut image, &[d]);
    assert_eq!(*image.get_pixel(0, 0), draw.color_of("rod"));
  }

  #[test]
  fn alarm_banner_darkens_the_top_strip() {
    let draw = Draw::default().with_alarm(true);
    let image = RgbImage::from_pixel(40, 80, Rgb([200, 100, 50]));
    let d = detection("anchor", BoundingBox::new(10.0, 60.0, 30.0, 75.0));

    let out = draw.draw_detection(&image, &[d]);
    assert_eq!(*out.get_pixel(0, 0), Rgb([80, 40, 20]));
    assert_eq!(*out.get_pixel(0, 49), Rgb([80, 40, 20]));
    assert_eq!(*out.get_pixel(0, 50), Rgb([200, 100, 50]));

    // 没有检测时不加横幅
    let out = draw.draw_detection(&image, &[]);
    assert_eq!(out, image);
  }

  #[test]
  fn alarm_text_counts_each_class() {
    assert_eq!(alarm_text(&[]), None);

    let boxes = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
    let detections = [
      detection("rod", boxes),
      detection("anchor", boxes),
      detection("anchor", boxes),
    ];
    let text = alarm_text(&detections).unwrap();
    assert!(text.ends_with(" ALARM: anchor:2, rod:1"), "{}", text);
  }

  #[test]
  fn wrap_keeps_lines_within_width() {
    // 每个字符宽 1
    let lines = wrap_words("2026-01-02 08:00:00 ALARM: anchor:2", 20, |s| s.len() as u32);
    assert_eq!(lines, vec!["2026-01-02 08:00:00", "ALARM: anchor:2"]);
    assert_eq!(wrap_words("averyveryverylongword", 4, |s| s.len() as u32).len(), 1);
  }

  #[test]
  fn missing_font_falls_back_to_boxes() {
    assert!(matches!(
      load_font(Path::new("/nonexistent/maogan/font.ttf")),
      Err(DrawError::Io { .. })
    ));

    let dir = tempfile::tempdir().unwrap();
    let bogus = dir.path().join("font.ttf");
    std::fs::write(&bogus, b"not a font").unwrap();
    assert!(matches!(load_font(&bogus), Err(DrawError::InvalidFont(_))));

    let url = Url::parse(&format!("image:///tmp/out.png?alarm&font={}", bogus.display())).unwrap();
    let draw = Draw::from_query(&url);
    assert!(!draw.has_font());
    assert!(draw.alarm);
  }

  #[test]
  fn record_lines_use_name_or_index() {
    let names = vec!["anchor".to_string(), "rod".to_string()];
    let d = detection("rod", BoundingBox::new(1.0, 2.0, 3.0, 4.0));

    let by_name = Record {
      label_with_name: true,
    };
    assert_eq!(
      by_name.lines(std::slice::from_ref(&d), &names),
      vec!["rod, 0.8750, 1.0, 2.0, 3.0, 4.0".to_string()]
    );

    let by_id = Record {
      label_with_name: false,
    };
    assert_eq!(
      by_id.lines(&[d], &names),
      vec!["1, 0.8750, 1.0, 2.0, 3.0, 4.0".to_string()]
    );
  }
}
