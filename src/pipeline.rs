// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/pipeline.rs - 检测流水线
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

//! # 检测流水线
//!
//! 输入源 -> 预处理 -> 模型 -> 后处理 -> 统计，在独立的工作线程上运行。
//! 每帧结果通过单槽 [`FrameHandoff`] 交给展示端，来不及取走的旧结果会被新结果覆盖。
//! 阈值与模型的修改只在帧与帧之间生效。

use thiserror::Error;

use crate::{
  export::ExportError,
  input::SourceError,
  model::{InferenceError, ModelLoadError},
};

mod config;
mod controller;
mod handoff;
mod processor;

pub use self::config::PipelineConfig;
pub use self::controller::{DetectorStatus, PipelineController, WorkerExit};
pub use self::handoff::FrameHandoff;
pub use self::processor::{FrameProcessor, FrameResult, FrameSettings};

/// 流水线错误
#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("输入源错误: {0}")]
  Source(#[from] SourceError),
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] ModelLoadError),
  #[error("推理错误: {0}")]
  Inference(#[from] InferenceError),
  #[error("导出错误: {0}")]
  Export(#[from] ExportError),
  #[error("无法启动工作线程: {0}")]
  Worker(#[source] std::io::Error),
}
