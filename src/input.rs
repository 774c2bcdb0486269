// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/input.rs - 视频/图像输入
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

//! # 输入源模块
//!
//! 所有输入源都通过 URL 描述：
//!
//! - `image:///path/to/a.jpg` 单张图片
//! - `folder:///path/to/frames?fps=25` 按文件名排序的图片序列
//! - `video:///path/to/a.mp4` 视频文件（`gstreamer_input` 特性）
//! - `camera:///dev/video0?width=640&height=480` V4L2 摄像头（`v4l2_input` 特性）
//!
//! 任意输入源都支持 `?skip=N` 与 `?max_fps=F`，由 [`FrameStream`] 统一处理。

use std::{
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, query_param};

mod folder_input;
mod read_image_file;

pub use self::folder_input::FolderInput;
pub use self::read_image_file::ImageFileInput;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::GStreamerInput;

#[cfg(feature = "v4l2_input")]
mod v4l2_input;
#[cfg(feature = "v4l2_input")]
pub use self::v4l2_input::V4l2Input;

/// 输入源错误
#[derive(Error, Debug)]
pub enum SourceError {
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
  #[error("无效的输入地址: {0}")]
  InvalidUrl(String),
  #[error("I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("无法解码图片 {path}: {source}")]
  Decode {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
  #[error("目录中没有可用的图片: {0}")]
  EmptyFolder(PathBuf),
  #[error("Device error: {0}")]
  Device(String),
  #[error("GStreamer error: {0}")]
  GStreamer(String),
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
}

/// 解码后的原始帧（尚未分配序号）
#[derive(Debug, Clone)]
pub struct DecodedFrame {
  pub image: RgbImage,
  /// 媒体时间戳
  pub timestamp: Duration,
}

/// 输入源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSourceType {
  /// 图片文件
  Image,
  /// 图片序列
  Folder,
  /// 视频文件
  Video,
  /// 摄像头
  Camera,
}

/// 关闭标志
///
/// 由控制器在关闭输入源时设置。阻塞读取的输入源按短超时等待，
/// 每次超时后检查该标志，已设置时结束读取并返回 `None`。
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }
}

/// 帧率对应的帧间隔
///
/// 帧率必须为正的有限值，且间隔能用 `Duration` 表示。
pub(crate) fn frame_interval(fps: f64) -> Result<Duration, String> {
  if !(fps.is_finite() && fps > 0.0) {
    return Err(format!("帧率必须为正数: {}", fps));
  }
  Duration::try_from_secs_f64(1.0 / fps).map_err(|e| format!("帧率 {} 过小: {}", fps, e))
}

/// 输入源 trait
///
/// `next` 返回 `None` 表示流结束。摄像头在 `close` 之前不会结束。
pub trait InputSource: Iterator<Item = Result<DecodedFrame, SourceError>> + Send {
  /// 获取输入源类型
  fn source_type(&self) -> InputSourceType;

  /// 获取帧宽度
  fn width(&self) -> u32;

  /// 获取帧高度
  fn height(&self) -> u32;

  /// 获取帧率（如果适用）
  fn fps(&self) -> Option<f64>;

  /// 关闭输入源，之后 `next` 只返回 `None`
  fn close(&mut self) {}

  /// 设置关闭标志；会长时间阻塞在 `next` 中的输入源需要保存并定期检查
  fn set_cancel(&mut self, _cancel: CancelFlag) {}
}

/// 按 URL scheme 分派的输入源
pub enum InputWrapper {
  ImageFile(ImageFileInput),
  Folder(FolderInput),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerInput),
  #[cfg(feature = "v4l2_input")]
  V4l2(V4l2Input),
}

impl FromUrl for InputWrapper {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let scheme = url.scheme();
    if scheme == ImageFileInput::SCHEME {
      return Ok(InputWrapper::ImageFile(ImageFileInput::from_url(url)?));
    }
    if scheme == FolderInput::SCHEME {
      return Ok(InputWrapper::Folder(FolderInput::from_url(url)?));
    }
    #[cfg(feature = "gstreamer_input")]
    {
      if scheme == GStreamerInput::SCHEME {
        return Ok(InputWrapper::GStreamer(GStreamerInput::from_url(url)?));
      }
    }
    #[cfg(feature = "v4l2_input")]
    {
      if scheme == V4l2Input::SCHEME {
        return Ok(InputWrapper::V4l2(V4l2Input::from_url(url)?));
      }
    }
    Err(SourceError::SchemeMismatch(scheme.to_string()))
  }
}

impl InputWrapper {
  fn inner(&self) -> &dyn InputSource {
    match self {
      InputWrapper::ImageFile(input) => input,
      InputWrapper::Folder(input) => input,
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input,
      #[cfg(feature = "v4l2_input")]
      InputWrapper::V4l2(input) => input,
    }
  }

  fn inner_mut(&mut self) -> &mut dyn InputSource {
    match self {
      InputWrapper::ImageFile(input) => input,
      InputWrapper::Folder(input) => input,
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input,
      #[cfg(feature = "v4l2_input")]
      InputWrapper::V4l2(input) => input,
    }
  }
}

impl Iterator for InputWrapper {
  type Item = Result<DecodedFrame, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.inner_mut().next()
  }
}

impl InputSource for InputWrapper {
  fn source_type(&self) -> InputSourceType {
    self.inner().source_type()
  }

  fn width(&self) -> u32 {
    self.inner().width()
  }

  fn height(&self) -> u32 {
    self.inner().height()
  }

  fn fps(&self) -> Option<f64> {
    self.inner().fps()
  }

  fn close(&mut self) {
    self.inner_mut().close()
  }

  fn set_cancel(&mut self, cancel: CancelFlag) {
    self.inner_mut().set_cancel(cancel)
  }
}

/// 帧率限制选项
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamOptions {
  /// 每解码 `skip + 1` 帧输出 1 帧
  pub skip: u32,
  /// 按媒体时间限制的最大帧率
  pub max_fps: Option<f64>,
}

impl StreamOptions {
  pub fn from_url(url: &Url) -> Result<Self, SourceError> {
    Self::from_url_or(url, Self::default())
  }

  /// 读取 URL 中的 `skip` 与 `max_fps`，缺失的项使用 `defaults`
  pub fn from_url_or(url: &Url, defaults: StreamOptions) -> Result<Self, SourceError> {
    let skip = query_param::<u32>(url, "skip")
      .map_err(SourceError::InvalidUrl)?
      .unwrap_or(defaults.skip);
    let max_fps = query_param::<f64>(url, "max_fps")
      .map_err(SourceError::InvalidUrl)?
      .or(defaults.max_fps);
    if let Some(fps) = max_fps {
      frame_interval(fps).map_err(|e| SourceError::InvalidUrl(format!("max_fps: {}", e)))?;
    }
    Ok(Self { skip, max_fps })
  }

  fn min_interval(&self) -> Option<Duration> {
    self.max_fps.and_then(|fps| frame_interval(fps).ok())
  }
}

/// 已打开的帧流
///
/// 负责跳帧、限制帧率并分配帧序号。被跳过的帧既不输出也不计数，
/// 序号从 0 开始，每输出一帧加 1。
pub struct FrameStream {
  descriptor: String,
  source: Box<dyn InputSource>,
  options: StreamOptions,
  decoded: u64,
  next_sequence: u64,
  last_emitted: Option<Duration>,
  cancel: CancelFlag,
  closed: bool,
}

impl FrameStream {
  /// 根据 URL 打开输入源，失败时不产生任何状态
  pub fn open(url: &Url) -> Result<Self, SourceError> {
    Self::open_with(url, StreamOptions::default())
  }

  /// 同 [`FrameStream::open`]，URL 中未指定的帧率选项使用 `defaults`
  pub fn open_with(url: &Url, defaults: StreamOptions) -> Result<Self, SourceError> {
    let options = StreamOptions::from_url_or(url, defaults)?;
    let source = InputWrapper::from_url(url)?;
    info!(
      "打开输入源: {} ({}x{}, fps: {:?})",
      url,
      source.width(),
      source.height(),
      source.fps()
    );
    Ok(Self::new(url.to_string(), Box::new(source), options))
  }

  pub fn new(
    descriptor: impl Into<String>,
    source: Box<dyn InputSource>,
    options: StreamOptions,
  ) -> Self {
    Self {
      descriptor: descriptor.into(),
      source,
      options,
      decoded: 0,
      next_sequence: 0,
      last_emitted: None,
      cancel: CancelFlag::new(),
      closed: false,
    }
  }

  /// 绑定关闭标志，标志设置后 `next_frame` 返回 `None`
  pub fn set_cancel(&mut self, cancel: CancelFlag) {
    self.source.set_cancel(cancel.clone());
    self.cancel = cancel;
  }

  /// 输入源标识
  pub fn descriptor(&self) -> &str {
    &self.descriptor
  }

  pub fn source_type(&self) -> InputSourceType {
    self.source.source_type()
  }

  pub fn width(&self) -> u32 {
    self.source.width()
  }

  pub fn height(&self) -> u32 {
    self.source.height()
  }

  pub fn fps(&self) -> Option<f64> {
    self.source.fps()
  }

  /// 下一帧，`None` 表示流结束
  pub fn next_frame(&mut self) -> Option<Result<Frame, SourceError>> {
    loop {
      if self.closed || self.cancel.is_cancelled() {
        return None;
      }

      let decoded = match self.source.next()? {
        Ok(decoded) => decoded,
        Err(e) => return Some(Err(e)),
      };

      let index = self.decoded;
      self.decoded += 1;

      if self.options.skip > 0 && index % (u64::from(self.options.skip) + 1) != 0 {
        continue;
      }

      if let Some(interval) = self.options.min_interval()
        && let Some(last) = self.last_emitted
        && decoded.timestamp.saturating_sub(last) < interval
      {
        debug!("跳过帧 {}（帧率限制）", index);
        continue;
      }

      self.last_emitted = Some(decoded.timestamp);
      let sequence = self.next_sequence;
      self.next_sequence += 1;

      return Some(Ok(Frame {
        image: decoded.image,
        timestamp: decoded.timestamp,
        sequence,
      }));
    }
  }

  pub fn close(&mut self) {
    if !self.closed {
      info!("关闭输入源: {}", self.descriptor);
      self.closed = true;
      self.source.close();
    }
  }
}

impl Iterator for FrameStream {
  type Item = Result<Frame, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.next_frame()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Counting {
    total: u64,
    emitted: u64,
    period: Duration,
  }

  impl Iterator for Counting {
    type Item = Result<DecodedFrame, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
      if self.emitted == self.total {
        return None;
      }
      let timestamp = self.period * self.emitted as u32;
      self.emitted += 1;
      Some(Ok(DecodedFrame {
        image: RgbImage::new(4, 4),
        timestamp,
      }))
    }
  }

  impl InputSource for Counting {
    fn source_type(&self) -> InputSourceType {
      InputSourceType::Video
    }

    fn width(&self) -> u32 {
      4
    }

    fn height(&self) -> u32 {
      4
    }

    fn fps(&self) -> Option<f64> {
      None
    }
  }

  fn stream(total: u64, options: StreamOptions) -> FrameStream {
    let source = Counting {
      total,
      emitted: 0,
      period: Duration::from_millis(40),
    };
    FrameStream::new("test", Box::new(source), options)
  }

  fn sequences(stream: FrameStream) -> Vec<(u64, Duration)> {
    stream
      .map(|frame| frame.map(|f| (f.sequence, f.timestamp)))
      .collect::<Result<_, _>>()
      .unwrap()
  }

  #[test]
  fn sequence_ids_are_contiguous() {
    let ids: Vec<u64> = sequences(stream(5, StreamOptions::default()))
      .into_iter()
      .map(|(s, _)| s)
      .collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
  }

  #[test]
  fn skipped_frames_do_not_consume_ids() {
    let options = StreamOptions {
      skip: 2,
      max_fps: None,
    };
    let frames = sequences(stream(10, options));
    let ids: Vec<u64> = frames.iter().map(|(s, _)| *s).collect();
    let stamps: Vec<u64> = frames.iter().map(|(_, t)| t.as_millis() as u64).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert_eq!(stamps, vec![0, 120, 240, 360]);
  }

  #[test]
  fn max_fps_drops_frames_in_media_time() {
    // 源帧率 25，限制为 10：间隔至少 100ms
    let options = StreamOptions {
      skip: 0,
      max_fps: Some(10.0),
    };
    let frames = sequences(stream(10, options));
    let stamps: Vec<u64> = frames.iter().map(|(_, t)| t.as_millis() as u64).collect();
    assert_eq!(stamps, vec![0, 120, 240, 360]);
    let ids: Vec<u64> = frames.iter().map(|(s, _)| *s).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
  }

  #[test]
  fn closed_stream_ends() {
    let mut s = stream(10, StreamOptions::default());
    assert!(s.next_frame().is_some());
    s.close();
    assert!(s.next_frame().is_none());
  }

  #[test]
  fn stream_options_from_url() {
    let url = Url::parse("folder:///tmp/frames?skip=3&max_fps=12.5").unwrap();
    let options = StreamOptions::from_url(&url).unwrap();
    assert_eq!(options.skip, 3);
    assert_eq!(options.max_fps, Some(12.5));

    let defaults = StreamOptions {
      skip: 1,
      max_fps: Some(5.0),
    };
    let url = Url::parse("folder:///tmp/frames?skip=4").unwrap();
    let options = StreamOptions::from_url_or(&url, defaults).unwrap();
    assert_eq!(options.skip, 4);
    assert_eq!(options.max_fps, Some(5.0));

    for bad in ["0", "-2", "1e-20", "inf"] {
      let url = Url::parse(&format!("folder:///tmp/frames?max_fps={}", bad)).unwrap();
      assert!(
        matches!(StreamOptions::from_url(&url), Err(SourceError::InvalidUrl(_))),
        "max_fps={}",
        bad
      );
    }
  }

  #[test]
  fn unrepresentable_max_fps_is_ignored_when_set_directly() {
    let options = StreamOptions {
      skip: 0,
      max_fps: Some(1e-20),
    };
    assert_eq!(sequences(stream(3, options)).len(), 3);
  }

  #[test]
  fn cancelled_stream_ends() {
    let mut s = stream(10, StreamOptions::default());
    let cancel = CancelFlag::new();
    s.set_cancel(cancel.clone());
    assert!(s.next_frame().is_some());
    cancel.cancel();
    assert!(s.next_frame().is_none());
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://example.com/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(SourceError::SchemeMismatch(_))
    ));
  }
}
