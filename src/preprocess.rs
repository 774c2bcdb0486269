// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/preprocess.rs - 图像增强与 letterbox 预处理
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

use std::borrow::Cow;

use image::{Rgb, RgbImage, imageops::FilterType};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::frame::{BoundingBox, Frame};

/// letterbox 填充色
pub const PAD_COLOR: [u8; 3] = [114, 114, 114];

/// 增强系数的取值范围
const FACTOR_MIN: f32 = 0.0;
const FACTOR_MAX: f32 = 2.0;

/// 模型输入尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
  pub width: u32,
  pub height: u32,
}

impl InputShape {
  pub const fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub const fn square(size: u32) -> Self {
    Self::new(size, size)
  }
}

impl Default for InputShape {
  fn default() -> Self {
    Self::square(640)
  }
}

/// 亮度、对比度、饱和度调整参数
///
/// 反序列化时各系数同样限制在 [0, 2]。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "EnhancementFields")]
pub struct Enhancement {
  pub enabled: bool,
  pub brightness: f32,
  pub contrast: f32,
  pub saturation: f32,
}

#[derive(Deserialize)]
#[serde(default)]
struct EnhancementFields {
  enabled: bool,
  brightness: f32,
  contrast: f32,
  saturation: f32,
}

impl Default for EnhancementFields {
  fn default() -> Self {
    let defaults = Enhancement::default();
    Self {
      enabled: defaults.enabled,
      brightness: defaults.brightness,
      contrast: defaults.contrast,
      saturation: defaults.saturation,
    }
  }
}

impl From<EnhancementFields> for Enhancement {
  fn from(fields: EnhancementFields) -> Self {
    Enhancement {
      enabled: fields.enabled,
      ..Enhancement::new(fields.brightness, fields.contrast, fields.saturation)
    }
  }
}

impl Default for Enhancement {
  fn default() -> Self {
    Self {
      enabled: false,
      brightness: 1.0,
      contrast: 1.0,
      saturation: 1.0,
    }
  }
}

fn clamp_factor(value: f32) -> f32 {
  if value.is_nan() {
    1.0
  } else {
    value.clamp(FACTOR_MIN, FACTOR_MAX)
  }
}

impl Enhancement {
  /// 启用增强，各系数限制在 [0, 2]
  pub fn new(brightness: f32, contrast: f32, saturation: f32) -> Self {
    Self {
      enabled: true,
      brightness: clamp_factor(brightness),
      contrast: clamp_factor(contrast),
      saturation: clamp_factor(saturation),
    }
  }

  pub fn disabled() -> Self {
    Self::default()
  }

  /// 是否会改变图像
  pub fn is_identity(&self) -> bool {
    !self.enabled
      || (clamp_factor(self.brightness) == 1.0
        && clamp_factor(self.contrast) == 1.0
        && clamp_factor(self.saturation) == 1.0)
  }

  /// 对图像应用增强，返回新图像
  pub fn apply(&self, image: &RgbImage) -> RgbImage {
    let mut out = image.clone();
    self.apply_in_place(&mut out);
    out
  }

  pub fn apply_in_place(&self, image: &mut RgbImage) {
    if self.is_identity() {
      return;
    }

    let brightness = clamp_factor(self.brightness);
    let contrast = clamp_factor(self.contrast);
    let saturation = clamp_factor(self.saturation);

    // 亮度：每个通道加上 (b - 1) * 50
    if brightness != 1.0 {
      let beta = ((brightness - 1.0) * 50.0).trunc();
      for pixel in image.pixels_mut() {
        for c in pixel.0.iter_mut() {
          *c = saturate(*c as f32 + beta);
        }
      }
    }

    // 对比度：每个通道乘以 c
    if contrast != 1.0 {
      for pixel in image.pixels_mut() {
        for c in pixel.0.iter_mut() {
          *c = saturate(*c as f32 * contrast);
        }
      }
    }

    // 饱和度：在 HSV 空间缩放 S
    if saturation != 1.0 {
      for pixel in image.pixels_mut() {
        *pixel = scale_saturation(*pixel, saturation);
      }
    }
  }
}

fn saturate(value: f32) -> u8 {
  value.round().clamp(0.0, 255.0) as u8
}

fn scale_saturation(pixel: Rgb<u8>, factor: f32) -> Rgb<u8> {
  let (h, s, v) = rgb_to_hsv(pixel);
  if s <= 0.0 {
    // 灰度像素，饱和度为 0
    return pixel;
  }
  hsv_to_rgb(h, (s * factor).clamp(0.0, 1.0), v)
}

/// RGB 转 HSV，色相单位为度，饱和度与明度在 [0, 1]
pub(crate) fn rgb_to_hsv(pixel: Rgb<u8>) -> (f32, f32, f32) {
  let [r, g, b] = pixel.0.map(|c| c as f32 / 255.0);
  let max = r.max(g).max(b);
  let min = r.min(g).min(b);
  let delta = max - min;

  if max <= 0.0 || delta <= 0.0 {
    return (0.0, 0.0, max);
  }

  let hue = if max == r {
    60.0 * ((g - b) / delta).rem_euclid(6.0)
  } else if max == g {
    60.0 * ((b - r) / delta + 2.0)
  } else {
    60.0 * ((r - g) / delta + 4.0)
  };
  (hue, delta / max, max)
}

/// HSV 转 RGB，色相超出 [0, 360) 时取模
pub(crate) fn hsv_to_rgb(hue: f32, s: f32, v: f32) -> Rgb<u8> {
  let hue = hue.rem_euclid(360.0);
  let chroma = v * s;
  let x = chroma * (1.0 - ((hue / 60.0).rem_euclid(2.0) - 1.0).abs());
  let m = v - chroma;
  let (r, g, b) = match (hue / 60.0) as u32 {
    0 => (chroma, x, 0.0),
    1 => (x, chroma, 0.0),
    2 => (0.0, chroma, x),
    3 => (0.0, x, chroma),
    4 => (x, 0.0, chroma),
    _ => (chroma, 0.0, x),
  };

  Rgb([
    saturate((r + m) * 255.0),
    saturate((g + m) * 255.0),
    saturate((b + m) * 255.0),
  ])
}

/// letterbox 变换参数，用于在模型空间与原图空间之间映射坐标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
  /// 缩放比例（原图 -> 模型）
  pub scale: f32,
  /// 水平填充（模型空间像素）
  pub pad_x: f32,
  /// 垂直填充（模型空间像素）
  pub pad_y: f32,
  pub source_width: u32,
  pub source_height: u32,
}

impl LetterboxTransform {
  /// 计算把 `source` 尺寸的图像放入 `target` 时使用的缩放与填充
  pub fn fit(source_width: u32, source_height: u32, target: InputShape) -> Self {
    if source_width == 0 || source_height == 0 {
      return Self {
        scale: 1.0,
        pad_x: 0.0,
        pad_y: 0.0,
        source_width,
        source_height,
      };
    }

    let scale = (target.width as f32 / source_width as f32)
      .min(target.height as f32 / source_height as f32);
    let (new_width, new_height) = Self::scaled_size(source_width, source_height, scale, target);

    Self {
      scale,
      pad_x: ((target.width - new_width) / 2) as f32,
      pad_y: ((target.height - new_height) / 2) as f32,
      source_width,
      source_height,
    }
  }

  fn scaled_size(width: u32, height: u32, scale: f32, target: InputShape) -> (u32, u32) {
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, target.width.max(1));
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, target.height.max(1));
    (new_width, new_height)
  }

  /// 缩放后（不含填充）的图像尺寸
  pub fn resized_size(&self, target: InputShape) -> (u32, u32) {
    Self::scaled_size(self.source_width, self.source_height, self.scale, target)
  }

  /// 模型空间 -> 原图空间
  pub fn to_original(&self, bbox: &BoundingBox) -> BoundingBox {
    BoundingBox::new(
      (bbox.x_min - self.pad_x) / self.scale,
      (bbox.y_min - self.pad_y) / self.scale,
      (bbox.x_max - self.pad_x) / self.scale,
      (bbox.y_max - self.pad_y) / self.scale,
    )
  }

  /// 原图空间 -> 模型空间
  pub fn to_model(&self, bbox: &BoundingBox) -> BoundingBox {
    BoundingBox::new(
      bbox.x_min * self.scale + self.pad_x,
      bbox.y_min * self.scale + self.pad_y,
      bbox.x_max * self.scale + self.pad_x,
      bbox.y_max * self.scale + self.pad_y,
    )
  }
}

/// 预处理后的模型输入
#[derive(Debug, Clone)]
pub struct PreprocessedInput {
  /// NCHW 张量，形状 (1, 3, H, W)，RGB，数值范围 [0, 1]
  pub tensor: Array4<f32>,
  pub transform: LetterboxTransform,
}

impl PreprocessedInput {
  pub fn shape(&self) -> InputShape {
    let dims = self.tensor.dim();
    InputShape::new(dims.3 as u32, dims.2 as u32)
  }
}

/// 对图像做 letterbox：等比缩放后居中放入目标尺寸，其余区域用 [`PAD_COLOR`] 填充
pub fn letterbox(image: &RgbImage, target: InputShape) -> (RgbImage, LetterboxTransform) {
  let transform = LetterboxTransform::fit(image.width(), image.height(), target);
  let mut canvas = RgbImage::from_pixel(target.width, target.height, Rgb(PAD_COLOR));

  if image.width() == 0 || image.height() == 0 {
    return (canvas, transform);
  }

  let (new_width, new_height) = transform.resized_size(target);
  let resized = if (new_width, new_height) == image.dimensions() {
    Cow::Borrowed(image)
  } else {
    Cow::Owned(image::imageops::resize(
      image,
      new_width,
      new_height,
      FilterType::Triangle,
    ))
  };

  image::imageops::replace(
    &mut canvas,
    &*resized,
    transform.pad_x as i64,
    transform.pad_y as i64,
  );
  (canvas, transform)
}

/// 将 RGB 图像转换为 NCHW 浮点张量
pub fn to_nchw_tensor(image: &RgbImage) -> Array4<f32> {
  let (width, height) = image.dimensions();
  let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
  for (x, y, pixel) in image.enumerate_pixels() {
    for c in 0..3 {
      tensor[[0, c, y as usize, x as usize]] = pixel.0[c] as f32 / 255.0;
    }
  }
  tensor
}

/// 预处理一帧：增强（在缩放之前）-> letterbox -> 归一化张量
pub fn prepare(frame: &Frame, target: InputShape, enhancement: &Enhancement) -> PreprocessedInput {
  let enhanced = if enhancement.is_identity() {
    Cow::Borrowed(&frame.image)
  } else {
    Cow::Owned(enhancement.apply(&frame.image))
  };

  let (canvas, transform) = letterbox(&enhanced, target);
  PreprocessedInput {
    tensor: to_nchw_tensor(&canvas),
    transform,
  }
}
