// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/output.rs - 检测结果输出
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

use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, postprocess::Detection};

pub trait Render: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, detections: &[Detection]) -> Result<(), Self::Error>;
}

pub mod draw;

mod directory_record;
mod save_image_file;
#[cfg(feature = "save_video_file")]
mod save_video_file;

pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};
#[cfg(feature = "save_video_file")]
pub use self::save_video_file::{SaveVideoFileError, SaveVideoFileOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[cfg(feature = "save_video_file")]
  #[error("保存视频文件错误: {0}")]
  SaveVideoFileError(#[from] SaveVideoFileError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  SaveImageFileOutput(SaveImageFileOutput),
  DirectoryRecordOutput(DirectoryRecordOutput),
  #[cfg(feature = "save_video_file")]
  SaveVideoFileOutput(SaveVideoFileOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let scheme = url.scheme();
    #[cfg(feature = "save_video_file")]
    if scheme == SaveVideoFileOutput::SCHEME {
      let output = SaveVideoFileOutput::from_url(url)?;
      return Ok(OutputWrapper::SaveVideoFileOutput(output));
    }
    if scheme == SaveImageFileOutput::SCHEME {
      let output = SaveImageFileOutput::from_url(url)?;
      Ok(OutputWrapper::SaveImageFileOutput(output))
    } else if scheme == DirectoryRecordOutput::SCHEME {
      let output = DirectoryRecordOutput::from_url(url)?;
      Ok(OutputWrapper::DirectoryRecordOutput(output))
    } else {
      Err(OutputError::SchemeMismatch(format!(
        "不支持的输出方式 '{}'",
        scheme
      )))
    }
  }
}

impl OutputWrapper {
  pub fn with_class_names(self, class_names: &[String]) -> Self {
    match self {
      OutputWrapper::DirectoryRecordOutput(output) => {
        OutputWrapper::DirectoryRecordOutput(output.with_class_names(class_names))
      }
      other => other,
    }
  }

  /// 结束需要收尾的输出（视频文件在此写完）
  pub fn finish(&self) {
    #[cfg(feature = "save_video_file")]
    if let OutputWrapper::SaveVideoFileOutput(output) = self {
      output.finish();
    }
  }
}

impl Render for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &Frame, detections: &[Detection]) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(frame, detections)
        .map_err(OutputError::from),
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_result(frame, detections)
        .map_err(OutputError::from),
      #[cfg(feature = "save_video_file")]
      OutputWrapper::SaveVideoFileOutput(output) => output
        .render_result(frame, detections)
        .map_err(OutputError::from),
    }
  }
}
