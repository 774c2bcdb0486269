// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/output/directory_record.rs - 按日期归档检测帧
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
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{Datelike, Local};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  output::{
    Render,
    draw::{Draw, Record},
  },
  postprocess::Detection,
  url_path,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

pub enum DrawWrapper {
  Draw(Box<Draw>),
  Record(Record),
}

impl DrawWrapper {
  pub fn with(kind: &str, uri: &url::Url) -> Self {
    match kind {
      "record-name" => DrawWrapper::Record(Record {
        label_with_name: true,
      }),
      "record-id" => DrawWrapper::Record(Record {
        label_with_name: false,
      }),
      _ => DrawWrapper::Draw(Box::new(Draw::from_query(uri))),
    }
  }

  fn save_result(
    &self,
    path: &Path,
    frame: &Frame,
    detections: &[Detection],
    class_names: &[String],
  ) -> Result<(), DirectoryRecordOutputError> {
    match self {
      DrawWrapper::Draw(draw) => {
        draw.draw_detection(&frame.image, detections).save(path)?;
      }
      DrawWrapper::Record(record) => {
        frame.image.save(path)?;
        record.record(detections, class_names, path)?;
      }
    };
    Ok(())
  }
}

/// 把检测帧保存到 `目录/年/月/日/时-分-秒-序号.png`
///
/// `record` 参数保存原图并附带 txt 标注（`record=id` 使用类别序号），
/// 默认只保存有检测结果的帧，带 `always` 参数时保存全部帧。
/// 标注图支持 `font=` 与 `alarm` 参数，见 [`Draw::from_query`]。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: DrawWrapper,
  class_names: Vec<String>,
  frame_counter: AtomicU32,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let kind = uri
      .query_pairs()
      .find(|(k, _)| k == "record")
      .map(|(_, v)| if v == "id" { "record-id" } else { "record-name" })
      .unwrap_or("draw");
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: url_path(uri),
      draw: DrawWrapper::with(kind, uri),
      class_names: Vec::new(),
      frame_counter: AtomicU32::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  /// `record=id` 时用于查找类别序号
  pub fn with_class_names(mut self, class_names: &[String]) -> Self {
    self.class_names = class_names.to_vec();
    self
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Local::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    let id = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
    Ok(directory.join(format!("{}-{:04X}.png", now.format("%H-%M-%S"), id)))
  }
}

impl Render for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &Frame, detections: &[Detection]) -> Result<(), Self::Error> {
    if !self.always && detections.is_empty() {
      return Ok(());
    }
    let path = self.frame_path()?;
    self
      .draw
      .save_result(&path, frame, detections, &self.class_names)?;
    debug!("帧 {} 已保存到 {}", frame.sequence, path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::BoundingBox;
  use image::RgbImage;
  use std::time::Duration;

  fn frame() -> Frame {
    Frame {
      image: RgbImage::new(16, 16),
      timestamp: Duration::ZERO,
      sequence: 3,
    }
  }

  fn files_under(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
      for entry in std::fs::read_dir(current).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          stack.push(path);
        } else {
          files.push(path);
        }
      }
    }
    files.sort();
    files
  }

  #[test]
  fn skips_empty_frames_unless_always() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::from_directory_path(dir.path()).unwrap();
    let url = url::Url::parse(&url.as_str().replacen("file", "folder", 1)).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    output.render_result(&frame(), &[]).unwrap();
    assert!(files_under(dir.path()).is_empty());

    let mut always = url.clone();
    always.set_query(Some("always"));
    let output = DirectoryRecordOutput::from_url(&always).unwrap();
    output.render_result(&frame(), &[]).unwrap();
    assert_eq!(files_under(dir.path()).len(), 1);
  }

  #[test]
  fn record_mode_writes_labels_next_to_image() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::from_directory_path(dir.path()).unwrap();
    let mut url = url::Url::parse(&url.as_str().replacen("file", "folder", 1)).unwrap();
    url.set_query(Some("record=id"));
    let output = DirectoryRecordOutput::from_url(&url)
      .unwrap()
      .with_class_names(&["anchor".to_string()]);

    let detection = Detection {
      timestamp: Local::now(),
      frame_id: 3,
      class_name: "anchor".to_string(),
      bbox: BoundingBox::new(1.0, 1.0, 5.0, 5.0),
      confidence: 0.5,
    };
    output.render_result(&frame(), &[detection]).unwrap();

    let files = files_under(dir.path());
    assert_eq!(files.len(), 2);
    let txt = files
      .iter()
      .find(|p| p.extension().is_some_and(|e| e == "txt"))
      .unwrap();
    assert_eq!(
      std::fs::read_to_string(txt).unwrap(),
      "0, 0.5000, 1.0, 1.0, 5.0, 5.0"
    );
  }
}
