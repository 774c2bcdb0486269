// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/pipeline/controller.rs - 流水线控制器与工作线程
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
  sync::Arc,
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use tracing::{info, warn};
use url::Url;

use super::{FrameHandoff, FrameProcessor, FrameResult, FrameSettings, PipelineConfig, PipelineError};
use crate::{
  export::{ExportError, ExportFormat, export},
  input::{CancelFlag, FrameStream, InputSource},
  model::{BackendKind, Detector, Model, ModelHandle, ModelSpec},
  postprocess::Thresholds,
  preprocess::Enhancement,
  session::{DetectionSession, SessionSnapshot},
};

/// 连续多少次读取失败后放弃输入源
const MAX_CONSECUTIVE_SOURCE_ERRORS: u32 = 5;
/// 轮询工作线程状态的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// 关闭时等待工作线程退出的上限，超时后分离该线程
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// 工作线程退出原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
  /// 输入源结束
  EndOfStream,
  /// 达到配置的帧数
  FrameLimitReached,
  /// 被关闭
  Cancelled,
  /// 输入源连续出错
  SourceFailed(String),
}

/// 检测器状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorStatus {
  Ready {
    name: String,
    kind: BackendKind,
    classes: usize,
  },
  /// 没有可用的检测器，`reason` 为最近一次模型失效的原因
  Unavailable { reason: Option<String> },
}

impl DetectorStatus {
  pub fn is_ready(&self) -> bool {
    matches!(self, DetectorStatus::Ready { .. })
  }
}

struct ActiveSource {
  descriptor: String,
  cancel: CancelFlag,
  handoff: Arc<FrameHandoff<FrameResult>>,
  thread: Option<JoinHandle<WorkerExit>>,
}

impl ActiveSource {
  fn join(&mut self) -> Option<WorkerExit> {
    let thread = self.thread.take()?;
    match thread.join() {
      Ok(exit) => Some(exit),
      Err(_) => Some(WorkerExit::SourceFailed("工作线程异常退出".to_string())),
    }
  }

  /// 在 `timeout` 内等待工作线程退出
  ///
  /// 超时说明输入源阻塞在读取中且不响应关闭标志，此时分离线程；
  /// 它之后醒来也不会再交出结果或写入统计。
  fn join_within(&mut self, timeout: Duration) -> Option<WorkerExit> {
    let deadline = Instant::now() + timeout;
    while self
      .thread
      .as_ref()
      .is_some_and(|thread| !thread.is_finished())
    {
      if Instant::now() >= deadline {
        warn!(
          "输入源 {} 未在 {:?} 内停止读取，分离工作线程",
          self.descriptor, timeout
        );
        self.thread.take();
        return Some(WorkerExit::Cancelled);
      }
      thread::sleep(POLL_INTERVAL);
    }
    self.join()
  }
}

/// 流水线控制器
///
/// 展示端通过控制器打开输入源、修改阈值、切换模型、读取快照和导出。
/// 每个控制器拥有自己的模型句柄与检测会话，多个控制器互不影响。
pub struct PipelineController<M: Model + 'static = Detector> {
  config: PipelineConfig,
  processor: Arc<FrameProcessor<M>>,
  session: Option<DetectionSession>,
  active: Option<ActiveSource>,
  last_exit: Option<WorkerExit>,
}

impl<M: Model + 'static> PipelineController<M> {
  pub fn new(config: PipelineConfig) -> Self {
    let processor = FrameProcessor::new(FrameSettings {
      thresholds: config.thresholds,
      enhancement: config.enhancement,
      max_detections: config.max_detections,
    });
    Self {
      config,
      processor: Arc::new(processor),
      session: None,
      active: None,
      last_exit: None,
    }
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// 按 URL 打开输入源；失败时保持原有状态不变
  pub fn open(&mut self, url: &Url) -> Result<(), PipelineError> {
    let stream = FrameStream::open_with(url, self.config.stream_options())?;
    self.open_stream(stream)
  }

  /// 使用自定义输入源
  pub fn open_source(
    &mut self,
    descriptor: impl Into<String>,
    source: Box<dyn InputSource>,
  ) -> Result<(), PipelineError> {
    let stream = FrameStream::new(descriptor, source, self.config.stream_options());
    self.open_stream(stream)
  }

  /// 关闭当前输入源，为新的帧流创建会话并启动工作线程
  pub fn open_stream(&mut self, mut stream: FrameStream) -> Result<(), PipelineError> {
    self.close();

    let descriptor = stream.descriptor().to_string();
    let model = self.processor.model();
    if model.is_none() {
      warn!("未加载模型，输入源 {} 的帧不会产生检测结果", descriptor);
    }

    let session = DetectionSession::new(
      Some(descriptor.clone()),
      self.processor.settings().thresholds,
      model.map(|m| m.name().to_string()),
    );
    let cancel = CancelFlag::new();
    stream.set_cancel(cancel.clone());
    let handoff = Arc::new(FrameHandoff::new());

    let worker = Worker {
      stream,
      processor: self.processor.clone(),
      session: session.clone(),
      handoff: handoff.clone(),
      cancel: cancel.clone(),
      frame_limit: self.config.frame_limit,
    };
    let thread = thread::Builder::new()
      .name("maogan-worker".to_string())
      .spawn(move || worker.run())
      .map_err(PipelineError::Worker)?;

    info!("开始处理输入源: {}", descriptor);
    self.session = Some(session);
    self.last_exit = None;
    self.active = Some(ActiveSource {
      descriptor,
      cancel,
      handoff,
      thread: Some(thread),
    });
    Ok(())
  }

  /// 修改阈值，从下一帧开始生效
  pub fn set_thresholds(&self, thresholds: Thresholds) {
    info!(
      "设置阈值: 置信度 {:.2}, IOU {:.2}",
      thresholds.confidence, thresholds.iou
    );
    self.processor.set_thresholds(thresholds);
    if let Some(session) = &self.session {
      session.set_thresholds(thresholds);
    }
  }

  pub fn thresholds(&self) -> Thresholds {
    self.processor.settings().thresholds
  }

  /// 修改图像增强参数，从下一帧开始生效
  pub fn set_enhancement(&self, enhancement: Enhancement) {
    self.processor.set_enhancement(enhancement);
  }

  /// 切换模型，返回旧句柄
  ///
  /// 正在处理的帧用旧句柄完成，下一帧开始使用新句柄。
  pub fn swap_model(&self, handle: ModelHandle<M>) -> Option<Arc<ModelHandle<M>>> {
    info!(
      "切换模型: {} ({} 个类别)",
      handle.name(),
      handle.class_names().len()
    );
    let name = handle.name().to_string();
    let previous = self.processor.replace_model(Some(Arc::new(handle)));
    if let Some(session) = &self.session {
      session.set_model(Some(name));
    }
    previous
  }

  /// 卸载模型，之后的帧不再产生检测结果
  pub fn unload_model(&self) -> Option<Arc<ModelHandle<M>>> {
    info!("卸载模型");
    let previous = self.processor.replace_model(None);
    if let Some(session) = &self.session {
      session.set_model(None);
    }
    previous
  }

  pub fn detector_status(&self) -> DetectorStatus {
    match self.processor.model() {
      Some(model) => DetectorStatus::Ready {
        name: model.name().to_string(),
        kind: model.kind(),
        classes: model.class_names().len(),
      },
      None => DetectorStatus::Unavailable {
        reason: self.processor.last_error(),
      },
    }
  }

  /// 当前模型的类别名称
  pub fn class_names(&self) -> Option<Arc<[String]>> {
    self
      .processor
      .model()
      .map(|model| model.class_names().clone())
  }

  pub fn detector_available(&self) -> bool {
    self.detector_status().is_ready()
  }

  /// 当前会话；未打开过输入源时为 `None`
  pub fn session(&self) -> Option<&DetectionSession> {
    self.session.as_ref()
  }

  pub fn snapshot(&self) -> Option<SessionSnapshot> {
    self.session.as_ref().map(DetectionSession::snapshot)
  }

  /// 导出当前会话，返回写入的文件路径
  pub fn export(&self, format: ExportFormat, destination: &Path) -> Result<PathBuf, PipelineError> {
    let snapshot = self.snapshot().ok_or(ExportError::EmptySession)?;
    Ok(export(&snapshot, format, destination)?)
  }

  pub fn clear_history(&self) {
    if let Some(session) = &self.session {
      session.clear();
    }
  }

  /// 取走最新的一帧结果（不等待）
  pub fn latest_result(&self) -> Option<FrameResult> {
    self.active.as_ref()?.handoff.try_take()
  }

  /// 等待下一帧结果
  pub fn wait_result(&self, timeout: Duration) -> Option<FrameResult> {
    self.active.as_ref()?.handoff.take_timeout(timeout)
  }

  /// 被新结果覆盖而未被取走的帧数
  pub fn dropped_results(&self) -> u64 {
    self
      .active
      .as_ref()
      .map(|active| active.handoff.dropped())
      .unwrap_or(0)
  }

  pub fn is_running(&self) -> bool {
    self
      .active
      .as_ref()
      .and_then(|active| active.thread.as_ref())
      .is_some_and(|thread| !thread.is_finished())
  }

  /// 等待工作线程自行结束（输入源耗尽或达到帧数），超时返回 `None`
  ///
  /// 已结束时返回退出原因。交接槽中的最后一帧仍可取走。
  pub fn wait_until_finished(&mut self, timeout: Duration) -> Option<WorkerExit> {
    let deadline = Instant::now() + timeout;
    loop {
      let Some(active) = self.active.as_mut() else {
        return self.last_exit.clone();
      };
      let finished = active
        .thread
        .as_ref()
        .is_none_or(|thread| thread.is_finished());
      if finished {
        if let Some(exit) = active.join() {
          info!("输入源 {} 处理结束: {:?}", active.descriptor, exit);
          self.last_exit = Some(exit);
        }
        return self.last_exit.clone();
      }
      if Instant::now() >= deadline {
        return None;
      }
      thread::sleep(POLL_INTERVAL);
    }
  }

  /// 上一次工作线程的退出原因
  pub fn last_exit(&self) -> Option<&WorkerExit> {
    self.last_exit.as_ref()
  }

  /// 关闭输入源
  ///
  /// 正在进行的推理会完成但结果被丢弃；返回后不会再有新的结果或统计。
  /// 最多等待工作线程 2 秒。
  pub fn close(&mut self) -> Option<WorkerExit> {
    let mut active = self.active.take()?;
    active.cancel.cancel();
    active.handoff.close();
    if let Some(session) = &self.session {
      session.close();
    }
    if let Some(exit) = active.join_within(CLOSE_TIMEOUT) {
      info!("输入源 {} 已关闭: {:?}", active.descriptor, exit);
      self.last_exit = Some(exit);
    }
    self.last_exit.clone()
  }
}

impl PipelineController<Detector> {
  /// 加载并切换模型；加载失败时当前模型保持不变
  pub fn load_model(&self, spec: &ModelSpec) -> Result<(), PipelineError> {
    let handle = ModelHandle::load(spec)?;
    self.swap_model(handle);
    Ok(())
  }
}

impl<M: Model + 'static> Drop for PipelineController<M> {
  fn drop(&mut self) {
    self.close();
  }
}

struct Worker<M: Model + 'static> {
  stream: FrameStream,
  processor: Arc<FrameProcessor<M>>,
  session: DetectionSession,
  handoff: Arc<FrameHandoff<FrameResult>>,
  cancel: CancelFlag,
  frame_limit: Option<u64>,
}

impl<M: Model + 'static> Worker<M> {
  fn cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  fn run(mut self) -> WorkerExit {
    let mut frames = 0u64;
    let mut source_errors = 0u32;

    let exit = loop {
      if self.cancelled() {
        break WorkerExit::Cancelled;
      }
      if let Some(limit) = self.frame_limit
        && frames >= limit
      {
        info!("达到指定帧数 {}，停止处理", limit);
        break WorkerExit::FrameLimitReached;
      }

      let frame = match self.stream.next_frame() {
        None if self.cancelled() => break WorkerExit::Cancelled,
        None => break WorkerExit::EndOfStream,
        Some(Err(_)) if self.cancelled() => break WorkerExit::Cancelled,
        Some(Err(e)) => {
          source_errors += 1;
          warn!(
            "读取帧失败 ({}/{}): {}",
            source_errors, MAX_CONSECUTIVE_SOURCE_ERRORS, e
          );
          if source_errors >= MAX_CONSECUTIVE_SOURCE_ERRORS {
            break WorkerExit::SourceFailed(e.to_string());
          }
          continue;
        }
        Some(Ok(frame)) => {
          source_errors = 0;
          frame
        }
      };
      frames += 1;

      let sequence = frame.sequence;
      match self.processor.process(frame) {
        Ok(result) => {
          if self.cancelled() {
            break WorkerExit::Cancelled;
          }
          if !self.session.record(&result.detections) || !self.handoff.publish(result) {
            break WorkerExit::Cancelled;
          }
        }
        Err(e) => {
          warn!("帧 {} 推理失败，已跳过: {}", sequence, e);
        }
      }
    };

    self.stream.close();
    exit
  }
}
