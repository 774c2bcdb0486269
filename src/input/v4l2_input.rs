// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/input/v4l2_input.rs - V4L2 摄像头输入
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
  io::ErrorKind,
  pin::Pin,
  time::{Duration, Instant},
};

use image::RgbImage;
use tracing::{debug, error, info};
use url::Url;
use v4l::{
  FourCC, buffer::Type, io::mmap::Stream, io::traits::CaptureStream, prelude::*,
  video::Capture,
};

use super::{CancelFlag, DecodedFrame, InputSource, InputSourceType, SourceError};
use crate::{FromUrl, FromUrlWithScheme, query_param, url_path};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const CAPTURE_BUFFERS: u32 = 4;
/// 单次等待帧的超时，超时后检查关闭标志再重试
const CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

/// V4L2 摄像头输入
///
/// 在 `close` 或关闭标志设置之前不会结束；采集失败时返回错误而不是 `None`。
///
/// 由于 v4l 库的 Stream 需要引用 Device，使用 `Pin<Box<Device>>`
/// 保证 Device 的内存地址稳定，从而可以创建引用它的 Stream。
pub struct V4l2Input {
  /// 捕获流（生命周期与 device 关联，必须先于 device 释放）
  stream: Option<Stream<'static>>,
  /// V4L2 设备
  device: Pin<Box<Device>>,
  width: u32,
  height: u32,
  start_time: Instant,
  cancel: CancelFlag,
}

impl V4l2Input {
  pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, SourceError> {
    let device = Box::pin(
      Device::with_path(device_path)
        .map_err(|e| SourceError::Device(format!("无法打开设备 {}: {}", device_path, e)))?,
    );

    let mut format = device
      .format()
      .map_err(|e| SourceError::Device(format!("无法读取设备格式: {}", e)))?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device
      .set_format(&format)
      .map_err(|e| SourceError::Device(format!("无法设置设备格式: {}", e)))?;

    if format.fourcc != FourCC::new(b"YUYV") {
      return Err(SourceError::Device(format!(
        "设备不支持 YUYV 格式: {}",
        format.fourcc
      )));
    }

    info!(
      "摄像头 {} 已打开: {}x{}",
      device_path, format.width, format.height
    );

    let mut input = Self {
      stream: None,
      device,
      width: format.width,
      height: format.height,
      start_time: Instant::now(),
      cancel: CancelFlag::new(),
    };

    // SAFETY: device 被 Pin<Box> 固定在堆上不会移动；stream 存储在同一结构体中，
    // 并在 Drop 中先于 device 释放
    let device_ref: &Device = &input.device;
    let mut stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, CAPTURE_BUFFERS)
        .map_err(|e| SourceError::Device(format!("无法创建捕获流: {}", e)))?
    };
    stream.set_timeout(CAPTURE_TIMEOUT);
    input.stream = Some(stream);
    input.start_time = Instant::now();

    Ok(input)
  }
}

/// 将 YUYV 格式转换为 RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  for chunk in yuyv.chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

impl Drop for V4l2Input {
  fn drop(&mut self) {
    self.stream.take();
  }
}

impl FromUrl for V4l2Input {
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

    let width = query_param::<u32>(url, "width")
      .map_err(SourceError::InvalidUrl)?
      .unwrap_or(DEFAULT_WIDTH);
    let height = query_param::<u32>(url, "height")
      .map_err(SourceError::InvalidUrl)?
      .unwrap_or(DEFAULT_HEIGHT);

    let path = url_path(url);
    Self::open(&path.to_string_lossy(), width, height)
  }
}

impl FromUrlWithScheme for V4l2Input {
  const SCHEME: &'static str = "camera";
}

impl Iterator for V4l2Input {
  type Item = Result<DecodedFrame, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let stream = self.stream.as_mut()?;

      let result = match stream.next() {
        Ok((buffer, _meta)) => {
          let rgb = yuyv_to_rgb(buffer, self.width, self.height);
          RgbImage::from_raw(self.width, self.height, rgb)
            .map(|image| DecodedFrame {
              image,
              timestamp: self.start_time.elapsed(),
            })
            .ok_or_else(|| SourceError::Device("无法创建 RGB 图像".to_string()))
        }
        Err(e) if e.kind() == ErrorKind::TimedOut => {
          if self.cancel.is_cancelled() {
            break;
          }
          debug!("等待摄像头帧超时，重试");
          continue;
        }
        Err(e) => Err(SourceError::Device(format!("无法捕获帧: {}", e))),
      };
      return Some(result);
    }

    info!("摄像头读取已取消");
    self.stream.take();
    None
  }
}

impl InputSource for V4l2Input {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Camera
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
    self.stream.take();
  }

  fn set_cancel(&mut self, cancel: CancelFlag) {
    self.cancel = cancel;
  }
}
