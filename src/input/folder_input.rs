// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/input/folder_input.rs - 图片序列输入
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
  path::{Path, PathBuf},
  time::Duration,
};

use tracing::{debug, error};
use url::Url;

use super::{
  DecodedFrame, InputSource, InputSourceType, SourceError, frame_interval,
  read_image_file::read_rgb_image,
};
use crate::{FromUrl, FromUrlWithScheme, query_param, url_path};

const DEFAULT_FPS: f64 = 25.0;
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// 图片序列输入
///
/// 将目录中的图片按文件名排序后逐帧输出，时间戳为 `index / fps`。
pub struct FolderInput {
  files: Vec<PathBuf>,
  index: usize,
  fps: f64,
  width: u32,
  height: u32,
}

impl FolderInput {
  pub fn open(dir: &Path, fps: f64) -> Result<Self, SourceError> {
    frame_interval(fps).map_err(SourceError::InvalidUrl)?;

    let entries = std::fs::read_dir(dir).map_err(|source| SourceError::Io {
      path: dir.to_path_buf(),
      source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|source| SourceError::Io {
        path: dir.to_path_buf(),
        source,
      })?;
      let path = entry.path();
      if path.is_file() && is_image_file(&path) {
        files.push(path);
      }
    }
    files.sort();

    let first = files
      .first()
      .ok_or_else(|| SourceError::EmptyFolder(dir.to_path_buf()))?;
    let (width, height) = image::image_dimensions(first).map_err(|source| SourceError::Decode {
      path: first.clone(),
      source,
    })?;

    debug!("图片序列 {} 共 {} 帧", dir.display(), files.len());

    Ok(Self {
      files,
      index: 0,
      fps,
      width,
      height,
    })
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }
}

fn is_image_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}

impl FromUrl for FolderInput {
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

    let fps = query_param::<f64>(url, "fps")
      .map_err(SourceError::InvalidUrl)?
      .unwrap_or(DEFAULT_FPS);
    frame_interval(fps).map_err(SourceError::InvalidUrl)?;

    Self::open(&url_path(url), fps)
  }
}

impl FromUrlWithScheme for FolderInput {
  const SCHEME: &'static str = "folder";
}

impl Iterator for FolderInput {
  type Item = Result<DecodedFrame, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    let path = self.files.get(self.index)?;
    let timestamp =
      Duration::try_from_secs_f64(self.index as f64 / self.fps).unwrap_or(Duration::MAX);
    self.index += 1;

    Some(read_rgb_image(path).map(|image| DecodedFrame { image, timestamp }))
  }
}

impl InputSource for FolderInput {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Folder
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    Some(self.fps)
  }

  fn close(&mut self) {
    self.index = self.files.len();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  #[test]
  fn frames_are_sorted_by_name() {
    let dir = tempfile::tempdir().unwrap();
    for (name, value) in [("002.png", 2u8), ("000.png", 0), ("001.png", 1)] {
      RgbImage::from_pixel(4, 4, Rgb([value, value, value]))
        .save(dir.path().join(name))
        .unwrap();
    }
    std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

    let input = FolderInput::open(dir.path(), 10.0).unwrap();
    assert_eq!(input.len(), 3);

    let frames: Vec<DecodedFrame> = input.collect::<Result<_, _>>().unwrap();
    let values: Vec<u8> = frames.iter().map(|f| f.image.get_pixel(0, 0).0[0]).collect();
    assert_eq!(values, vec![0, 1, 2]);
    assert_eq!(frames[2].timestamp, Duration::from_millis(200));
  }

  #[test]
  fn fps_must_give_a_representable_interval() {
    let dir = tempfile::tempdir().unwrap();
    RgbImage::new(4, 4).save(dir.path().join("000.png")).unwrap();

    for fps in ["0", "1e-20"] {
      let url = Url::parse(&format!("folder://{}?fps={}", dir.path().display(), fps)).unwrap();
      assert!(
        matches!(FolderInput::from_url(&url), Err(SourceError::InvalidUrl(_))),
        "fps={}",
        fps
      );
    }
    assert!(matches!(
      FolderInput::open(dir.path(), 1e-20),
      Err(SourceError::InvalidUrl(_))
    ));
  }

  #[test]
  fn empty_folder_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      FolderInput::open(dir.path(), 25.0),
      Err(SourceError::EmptyFolder(_))
    ));
  }
}
