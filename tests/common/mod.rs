// 该文件是 Maogan （锚杆检测） 项目的一部分。
// tests/common/mod.rs - 集成测试公用的模型与输入源
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

#![allow(dead_code)]

use std::{
  sync::mpsc::Receiver,
  time::{Duration, Instant},
};

use image::{Rgb, RgbImage};
use maogan::{
  frame::BoundingBox,
  input::{CancelFlag, DecodedFrame, InputSource, InputSourceType, SourceError},
  model::{BackendKind, InferenceError, Model, ModelHandle, RawDetection},
  preprocess::{InputShape, PreprocessedInput},
};

pub const FRAME_SIZE: u32 = 64;
pub const MODEL_SIZE: u32 = 32;

/// 每帧输出同一个检测框的模型
pub struct ScriptedModel {
  detection: RawDetection,
  fail_after: Option<usize>,
  calls: usize,
}

impl ScriptedModel {
  /// 模型坐标 (4, 4) - (12, 12)，类别 0，得分 0.9
  pub fn new() -> Self {
    Self {
      detection: RawDetection {
        bbox: BoundingBox::new(4.0, 4.0, 12.0, 12.0),
        class_id: 0,
        score: 0.9,
      },
      fail_after: None,
      calls: 0,
    }
  }

  /// 前 `n` 次推理正常，之后后端报告不可恢复错误
  pub fn failing_after(n: usize) -> Self {
    Self {
      fail_after: Some(n),
      ..Self::new()
    }
  }
}

impl Model for ScriptedModel {
  fn backend_kind(&self) -> BackendKind {
    BackendKind::Onnx
  }

  fn input_shape(&self) -> InputShape {
    InputShape::square(MODEL_SIZE)
  }

  fn num_classes(&self) -> Option<usize> {
    Some(1)
  }

  fn infer(&mut self, _input: &PreprocessedInput) -> Result<Vec<RawDetection>, InferenceError> {
    self.calls += 1;
    if let Some(limit) = self.fail_after
      && self.calls > limit
    {
      return Err(InferenceError::Unrecoverable("device lost".to_string()));
    }
    Ok(vec![self.detection])
  }
}

pub fn handle(name: &str, label: &str) -> ModelHandle<ScriptedModel> {
  ModelHandle::new(name, ScriptedModel::new(), vec![label.to_string()]).unwrap()
}

fn blank_frame(index: u64) -> DecodedFrame {
  DecodedFrame {
    image: RgbImage::from_pixel(FRAME_SIZE, FRAME_SIZE, Rgb([40, 40, 40])),
    timestamp: Duration::from_millis(index * 40),
  }
}

/// 内存中的帧序列，可在指定序号前阻塞直到收到信号
pub struct VecSource {
  remaining: u64,
  emitted: u64,
  gate: Option<(u64, Receiver<()>)>,
  failures: u32,
}

impl VecSource {
  pub fn new(frames: u64) -> Self {
    Self {
      remaining: frames,
      emitted: 0,
      gate: None,
      failures: 0,
    }
  }

  /// 输出第 `index` 帧之前等待 `signal`
  pub fn gated(frames: u64, index: u64, signal: Receiver<()>) -> Self {
    Self {
      gate: Some((index, signal)),
      ..Self::new(frames)
    }
  }

  /// 一直返回读取错误
  pub fn broken() -> Self {
    Self {
      failures: u32::MAX,
      ..Self::new(0)
    }
  }
}

impl Iterator for VecSource {
  type Item = Result<DecodedFrame, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.failures > 0 {
      self.failures -= 1;
      return Some(Err(SourceError::Device("read failed".to_string())));
    }
    if self.remaining == 0 {
      return None;
    }
    let at_gate = matches!(&self.gate, Some((index, _)) if *index == self.emitted);
    if at_gate && let Some((_, signal)) = self.gate.take() {
      let _ = signal.recv_timeout(Duration::from_secs(10));
    }
    self.remaining -= 1;
    let frame = blank_frame(self.emitted);
    self.emitted += 1;
    Some(Ok(frame))
  }
}

impl InputSource for VecSource {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Video
  }

  fn width(&self) -> u32 {
    FRAME_SIZE
  }

  fn height(&self) -> u32 {
    FRAME_SIZE
  }

  fn fps(&self) -> Option<f64> {
    Some(25.0)
  }
}

/// 输出一帧后停在读取中的输入源
///
/// 带 `release` 时阻塞到发送端被丢弃，不理会关闭标志；
/// 否则像摄像头一样按短超时等待，并在每次超时后检查关闭标志。
pub struct StalledSource {
  emitted: bool,
  cancel: CancelFlag,
  release: Option<Receiver<()>>,
}

impl StalledSource {
  pub fn polling() -> Self {
    Self {
      emitted: false,
      cancel: CancelFlag::new(),
      release: None,
    }
  }

  pub fn blocking(release: Receiver<()>) -> Self {
    Self {
      release: Some(release),
      ..Self::polling()
    }
  }
}

impl Iterator for StalledSource {
  type Item = Result<DecodedFrame, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    if !self.emitted {
      self.emitted = true;
      return Some(Ok(blank_frame(0)));
    }
    match &self.release {
      Some(release) => {
        let _ = release.recv();
      }
      None => {
        while !self.cancel.is_cancelled() {
          std::thread::sleep(Duration::from_millis(10));
        }
      }
    }
    None
  }
}

impl InputSource for StalledSource {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Camera
  }

  fn width(&self) -> u32 {
    FRAME_SIZE
  }

  fn height(&self) -> u32 {
    FRAME_SIZE
  }

  fn fps(&self) -> Option<f64> {
    None
  }

  fn set_cancel(&mut self, cancel: CancelFlag) {
    self.cancel = cancel;
  }
}

/// 轮询直到条件成立或超时
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(2));
  }
  condition()
}
