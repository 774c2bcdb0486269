// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::{path::Path, time::Duration};

use image::{ImageReader, RgbImage};
use tracing::error;
use url::Url;

use super::{DecodedFrame, InputSource, InputSourceType, SourceError};
use crate::{FromUrl, FromUrlWithScheme, url_path};

/// 单张图片输入，只产生一帧
pub struct ImageFileInput {
  image: Option<RgbImage>,
  width: u32,
  height: u32,
}

impl ImageFileInput {
  pub fn open(path: &Path) -> Result<Self, SourceError> {
    let image = read_rgb_image(path)?;
    let (width, height) = image.dimensions();
    Ok(Self {
      image: Some(image),
      width,
      height,
    })
  }
}

/// 读取并解码图片为 RGB
pub(crate) fn read_rgb_image(path: &Path) -> Result<RgbImage, SourceError> {
  let reader = ImageReader::open(path).map_err(|source| SourceError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  let image = reader
    .with_guessed_format()
    .map_err(|source| SourceError::Io {
      path: path.to_path_buf(),
      source,
    })?
    .decode()
    .map_err(|source| SourceError::Decode {
      path: path.to_path_buf(),
      source,
    })?;
  Ok(image.to_rgb8())
}

impl FromUrl for ImageFileInput {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(SourceError::SchemeMismatch(url.scheme().to_string()));
    }

    Self::open(&url_path(url))
  }
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl Iterator for ImageFileInput {
  type Item = Result<DecodedFrame, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take().map(|image| {
      Ok(DecodedFrame {
        image,
        timestamp: Duration::ZERO,
      })
    })
  }
}

impl InputSource for ImageFileInput {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Image
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    None
  }

  fn close(&mut self) {
    self.image = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yields_exactly_one_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("belt.png");
    RgbImage::from_pixel(8, 6, image::Rgb([10, 20, 30]))
      .save(&path)
      .unwrap();

    let url = Url::from_file_path(&path)
      .map(|u| Url::parse(&u.as_str().replacen("file", "image", 1)).unwrap())
      .unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    assert_eq!((input.width(), input.height()), (8, 6));

    let frame = input.next().unwrap().unwrap();
    assert_eq!(frame.timestamp, Duration::ZERO);
    assert_eq!(frame.image.get_pixel(0, 0).0, [10, 20, 30]);
    assert!(input.next().is_none());
  }

  #[test]
  fn missing_file_is_a_source_error() {
    let url = Url::parse("image:///definitely/not/here.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(SourceError::Io { .. })
    ));
  }
}
