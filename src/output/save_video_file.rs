// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/output/save_video_file.rs - 标注视频输出
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

//! # 视频文件输出
//!
//! 把标注后的帧通过 GStreamer 编码为视频文件：
//!
//! - `video:///path/to/out.mp4` 默认 25 fps
//! - `video:///path/to/out.mkv?fps=30&alarm&font=/path/font.ttf`
//!
//! 容器按扩展名选择（mp4 / mkv / avi / webm，其他按 mp4 处理）。
//! 首帧决定视频尺寸，尺寸不同的后续帧缩放到首帧尺寸。
//! 输出结束（`finish` 或销毁）时发送 EOS 并等待文件写完。

use std::path::{Path, PathBuf};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use image::{RgbImage, imageops::FilterType};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  output::{Render, draw::Draw},
  postprocess::Detection,
  query_param, url_path,
};

const DEFAULT_FPS: u32 = 25;
const MIN_FPS: u32 = 1;
const MAX_FPS: u32 = 120;
/// 等待编码管道处理完 EOS 的上限
const EOS_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum SaveVideoFileError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("参数错误: {0}")]
  InvalidParameter(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("GStreamer 错误: {0}")]
  GStreamer(String),
}

impl From<gst::glib::Error> for SaveVideoFileError {
  fn from(err: gst::glib::Error) -> Self {
    SaveVideoFileError::GStreamer(err.to_string())
  }
}

impl From<gst::glib::BoolError> for SaveVideoFileError {
  fn from(err: gst::glib::BoolError) -> Self {
    SaveVideoFileError::GStreamer(err.to_string())
  }
}

impl From<gst::StateChangeError> for SaveVideoFileError {
  fn from(err: gst::StateChangeError) -> Self {
    SaveVideoFileError::GStreamer(err.to_string())
  }
}

/// 按扩展名选择编码器与容器
fn encoder_description(path: &Path) -> &'static str {
  let extension = path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| ext.to_ascii_lowercase());
  match extension.as_deref() {
    Some("mkv") => "video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux",
    Some("avi") => "video/x-raw,format=I420 ! x264enc ! avimux",
    Some("webm") => "vp8enc ! webmmux",
    _ => {
      "video/x-raw,format=I420 ! x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux"
    }
  }
}

fn pipeline_description(path: &Path) -> String {
  format!(
    "appsrc name=src ! videoconvert ! {} ! filesink location=\"{}\"",
    encoder_description(path),
    path.display()
  )
}

/// GStreamer 的 RGB 帧每行按 4 字节对齐
fn padded_rows(image: &RgbImage) -> Vec<u8> {
  let row_bytes = image.width() as usize * 3;
  let stride = (row_bytes + 3) & !3;
  if stride == row_bytes {
    return image.as_raw().clone();
  }

  let mut data = vec![0u8; stride * image.height() as usize];
  for (row, chunk) in image.as_raw().chunks_exact(row_bytes).enumerate() {
    data[row * stride..row * stride + row_bytes].copy_from_slice(chunk);
  }
  data
}

/// 运行中的编码管道
struct Encoder {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  width: u32,
  height: u32,
  fps: u32,
  frames: u64,
}

impl Encoder {
  fn start(path: &Path, width: u32, height: u32, fps: u32) -> Result<Self, SaveVideoFileError> {
    gst::init()?;

    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let description = pipeline_description(path);
    info!("视频编码管道: {}", description);
    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| SaveVideoFileError::GStreamer("Failed to create pipeline".to_string()))?;
    let appsrc = pipeline
      .by_name("src")
      .ok_or_else(|| SaveVideoFileError::GStreamer("Failed to get appsrc element".to_string()))?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| SaveVideoFileError::GStreamer("Failed to convert element to appsrc".to_string()))?;

    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", width as i32)
      .field("height", height as i32)
      .field("framerate", gst::Fraction::new(fps as i32, 1))
      .build();
    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);
    pipeline.set_state(gst::State::Playing)?;

    info!(
      "开始写入视频 {}: {}x{} @ {} fps",
      path.display(),
      width,
      height,
      fps
    );
    Ok(Self {
      pipeline,
      appsrc,
      width,
      height,
      fps,
      frames: 0,
    })
  }

  fn push(&mut self, image: RgbImage) -> Result<(), SaveVideoFileError> {
    let image = if image.dimensions() == (self.width, self.height) {
      image
    } else {
      image::imageops::resize(&image, self.width, self.height, FilterType::Triangle)
    };

    let frame_duration = 1_000_000_000 / u64::from(self.fps);
    let mut buffer = gst::Buffer::from_mut_slice(padded_rows(&image));
    {
      let buffer = buffer
        .get_mut()
        .ok_or_else(|| SaveVideoFileError::GStreamer("视频缓冲区不可写".to_string()))?;
      buffer.set_pts(gst::ClockTime::from_nseconds(self.frames * frame_duration));
      buffer.set_duration(gst::ClockTime::from_nseconds(frame_duration));
    }

    self
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| SaveVideoFileError::GStreamer(format!("Failed to push buffer: {:?}", e)))?;
    self.frames += 1;
    Ok(())
  }

  fn finish(self, path: &Path) {
    if let Err(e) = self.appsrc.end_of_stream() {
      warn!("无法结束视频流: {:?}", e);
    }

    if let Some(bus) = self.pipeline.bus() {
      let message = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      );
      match message.as_ref().map(|m| m.view()) {
        Some(gst::MessageView::Eos(_)) => {}
        Some(gst::MessageView::Error(err)) => {
          error!("视频编码出错: {} ({:?})", err.error(), err.debug());
        }
        _ => warn!("等待视频编码结束超时: {}", path.display()),
      }
    }

    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
    info!("视频已保存: {} ({} 帧)", path.display(), self.frames);
  }
}

/// 把标注后的帧写入视频文件
pub struct SaveVideoFileOutput {
  path: PathBuf,
  fps: u32,
  draw: Draw,
  encoder: Mutex<Option<Encoder>>,
}

impl FromUrlWithScheme for SaveVideoFileOutput {
  const SCHEME: &'static str = "video";
}

impl FromUrl for SaveVideoFileOutput {
  type Error = SaveVideoFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveVideoFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let fps = query_param::<u32>(uri, "fps")
      .map_err(SaveVideoFileError::InvalidParameter)?
      .unwrap_or(DEFAULT_FPS);
    if !(MIN_FPS..=MAX_FPS).contains(&fps) {
      return Err(SaveVideoFileError::InvalidParameter(format!(
        "FPS {} 超出有效范围 [{}, {}]",
        fps, MIN_FPS, MAX_FPS
      )));
    }

    Ok(SaveVideoFileOutput {
      path: url_path(uri),
      fps,
      draw: Draw::from_query(uri),
      encoder: Mutex::new(None),
    })
  }
}

impl SaveVideoFileOutput {
  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn fps(&self) -> u32 {
    self.fps
  }

  /// 结束编码并写完文件；之后再渲染会开始一个新文件
  pub fn finish(&self) {
    if let Some(encoder) = self.encoder.lock().take() {
      encoder.finish(&self.path);
    }
  }
}

impl Render for SaveVideoFileOutput {
  type Error = SaveVideoFileError;

  fn render_result(&self, frame: &Frame, detections: &[Detection]) -> Result<(), Self::Error> {
    let image = self.draw.draw_detection(&frame.image, detections);
    let mut encoder = self.encoder.lock();
    if encoder.is_none() {
      *encoder = Some(Encoder::start(
        &self.path,
        image.width(),
        image.height(),
        self.fps,
      )?);
    }
    match encoder.as_mut() {
      Some(encoder) => encoder.push(image),
      None => Ok(()),
    }
  }
}

impl Drop for SaveVideoFileOutput {
  fn drop(&mut self) {
    self.finish();
  }
}
