// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频文件输入
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

//! # GStreamer 视频输入
//!
//! 通过 `filesrc ! decodebin ! videoconvert` 解码视频文件，按文件顺序输出 RGB 帧。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```

use std::{path::Path, time::Duration};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{error, info, warn};
use url::Url;

use super::{CancelFlag, DecodedFrame, InputSource, InputSourceType, SourceError};
use crate::{FromUrl, FromUrlWithScheme, url_path};

/// 等待预滚（首帧）的超时
const PREROLL_TIMEOUT_SECS: u64 = 10;
/// 单次拉取样本的超时，超时后检查总线错误与关闭标志
const PULL_TIMEOUT_MS: u64 = 500;

impl From<gst::glib::Error> for SourceError {
  fn from(err: gst::glib::Error) -> Self {
    SourceError::GStreamer(err.to_string())
  }
}

impl From<gst::glib::BoolError> for SourceError {
  fn from(err: gst::glib::BoolError) -> Self {
    SourceError::GStreamer(err.to_string())
  }
}

impl From<gst::StateChangeError> for SourceError {
  fn from(err: gst::StateChangeError) -> Self {
    SourceError::GStreamer(err.to_string())
  }
}

/// GStreamer 视频文件输入
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  width: u32,
  height: u32,
  fps: Option<f64>,
  emitted: u64,
  finished: bool,
  cancel: CancelFlag,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn open(path: &Path) -> Result<Self, SourceError> {
    if !path.is_file() {
      return Err(SourceError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "video file not found"),
      });
    }

    gst::init()?;

    let description = format!(
      "filesrc location=\"{}\" ! decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink name=sink sync=false max-buffers=4",
      path.display()
    );
    info!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| SourceError::GStreamer("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| SourceError::GStreamer("Failed to get appsink element".to_string()))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| SourceError::GStreamer("Failed to convert element to appsink".to_string()))?;

    pipeline.set_state(gst::State::Playing)?;

    let mut input = GStreamerInput {
      pipeline,
      appsink,
      width: 0,
      height: 0,
      fps: None,
      emitted: 0,
      finished: false,
      cancel: CancelFlag::new(),
    };

    // 预滚样本同时也是 pull_sample 返回的第一帧，这里只用来读取视频信息
    let preroll = input
      .appsink
      .try_pull_preroll(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS))
      .ok_or_else(|| {
        input
          .bus_error()
          .unwrap_or_else(|| SourceError::GStreamer("无法解码视频首帧".to_string()))
      })?;
    let caps = preroll
      .caps()
      .ok_or_else(|| SourceError::GStreamer("No caps in sample".to_string()))?;
    let video_info = gst_video::VideoInfo::from_caps(caps)
      .map_err(|_| SourceError::GStreamer("Failed to get video info from caps".to_string()))?;

    input.width = video_info.width();
    input.height = video_info.height();
    let fps = video_info.fps();
    if fps.numer() > 0 && fps.denom() > 0 {
      input.fps = Some(fps.numer() as f64 / fps.denom() as f64);
    }

    Ok(input)
  }

  fn bus_error(&self) -> Option<SourceError> {
    let bus = self.pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error])?;
    match message.view() {
      gst::MessageView::Error(err) => Some(SourceError::GStreamer(format!(
        "{} ({:?})",
        err.error(),
        err.debug()
      ))),
      _ => None,
    }
  }

  fn fallback_timestamp(&self) -> Duration {
    match self.fps {
      Some(fps) => Duration::from_secs_f64(self.emitted as f64 / fps),
      None => Duration::ZERO,
    }
  }
}

impl FromUrl for GStreamerInput {
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

impl FromUrlWithScheme for GStreamerInput {
  const SCHEME: &'static str = "video";
}

impl Iterator for GStreamerInput {
  type Item = Result<DecodedFrame, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }

    loop {
      if let Some(sample) = self
        .appsink
        .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
      {
        let timestamp = sample
          .buffer()
          .and_then(|buffer| buffer.pts())
          .map(|pts| Duration::from_nanos(pts.nseconds()))
          .unwrap_or_else(|| self.fallback_timestamp());
        self.emitted += 1;
        return Some(convert_sample(&sample).map(|image| DecodedFrame { image, timestamp }));
      }

      if self.appsink.is_eos() {
        info!("视频读取完毕，共 {} 帧", self.emitted);
        self.finished = true;
        return None;
      }

      if let Some(err) = self.bus_error() {
        self.finished = true;
        return Some(Err(err));
      }

      if self.cancel.is_cancelled() {
        info!("视频读取已取消，已输出 {} 帧", self.emitted);
        self.finished = true;
        return None;
      }
    }
  }
}

impl InputSource for GStreamerInput {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Video
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    self.fps
  }

  fn close(&mut self) {
    self.finished = true;
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }

  fn set_cancel(&mut self, cancel: CancelFlag) {
    self.cancel = cancel;
  }
}

fn convert_sample(sample: &gst::Sample) -> Result<RgbImage, SourceError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| SourceError::GStreamer("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| SourceError::GStreamer("No caps in sample".to_string()))?;

  let video_info = gst_video::VideoInfo::from_caps(caps)
    .map_err(|_| SourceError::GStreamer("Failed to get video info from caps".to_string()))?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer
    .map_readable()
    .map_err(|e| SourceError::GStreamer(format!("Failed to map buffer for reading: {}", e)))?;
  let data = map.as_slice();

  let row_bytes = width * 3;
  let expected = stride * height.saturating_sub(1) + row_bytes;
  if data.len() < expected {
    return Err(SourceError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  // 每行可能带有对齐填充，逐行拷贝
  let mut pixels = Vec::with_capacity(row_bytes * height);
  for row in 0..height {
    let start = row * stride;
    pixels.extend_from_slice(&data[start..start + row_bytes]);
  }

  RgbImage::from_raw(width as u32, height as u32, pixels)
    .ok_or_else(|| SourceError::GStreamer("无法创建 RGB 图像".to_string()))
}
