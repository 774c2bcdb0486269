// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/session.rs - 检测会话与统计
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

use std::{collections::BTreeMap, fmt::Write, sync::Arc};

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::postprocess::{Detection, Thresholds};

#[derive(Debug)]
struct SessionState {
  source: Option<String>,
  thresholds: Thresholds,
  model: Option<String>,
  history: Vec<Detection>,
  class_counts: BTreeMap<String, usize>,
  frames_processed: u64,
  created_at: DateTime<Local>,
  closed: bool,
}

/// 一个输入源对应的检测会话
///
/// 克隆得到的是同一会话的共享引用。写入（`record`）与读取（`snapshot`）
/// 在同一把读写锁下进行，读取方不会看到只记录了一半的帧。
#[derive(Debug, Clone)]
pub struct DetectionSession {
  state: Arc<RwLock<SessionState>>,
}

impl DetectionSession {
  pub fn new(source: Option<String>, thresholds: Thresholds, model: Option<String>) -> Self {
    Self {
      state: Arc::new(RwLock::new(SessionState {
        source,
        thresholds,
        model,
        history: Vec::new(),
        class_counts: BTreeMap::new(),
        frames_processed: 0,
        created_at: Local::now(),
        closed: false,
      })),
    }
  }

  /// 记录一帧的检测结果；会话已关闭时忽略并返回 `false`
  pub fn record(&self, detections: &[Detection]) -> bool {
    let mut state = self.state.write();
    if state.closed {
      debug!("会话已关闭，丢弃 {} 个检测", detections.len());
      return false;
    }
    state.frames_processed += 1;
    for detection in detections {
      *state
        .class_counts
        .entry(detection.class_name.clone())
        .or_insert(0) += 1;
      state.history.push(detection.clone());
    }
    debug!(
      "记录 {} 个检测，累计 {}",
      detections.len(),
      state.history.len()
    );
    true
  }

  /// 停止记录；已有的历史仍可读取、导出与清空
  pub fn close(&self) {
    self.state.write().closed = true;
  }

  pub fn is_closed(&self) -> bool {
    self.state.read().closed
  }

  /// 只读快照
  pub fn snapshot(&self) -> SessionSnapshot {
    let state = self.state.read();
    SessionSnapshot {
      source: state.source.clone(),
      thresholds: state.thresholds,
      model: state.model.clone(),
      detections: state.history.clone(),
      class_counts: state.class_counts.clone(),
      frames_processed: state.frames_processed,
      created_at: state.created_at,
    }
  }

  /// 清空历史与计数，保留阈值与模型选择
  pub fn clear(&self) {
    let mut state = self.state.write();
    info!("清空检测历史（{} 条）", state.history.len());
    state.history.clear();
    state.class_counts.clear();
    state.frames_processed = 0;
  }

  pub fn set_thresholds(&self, thresholds: Thresholds) {
    self.state.write().thresholds = thresholds;
  }

  pub fn set_model(&self, model: Option<String>) {
    self.state.write().model = model;
  }

  pub fn thresholds(&self) -> Thresholds {
    self.state.read().thresholds
  }

  pub fn model(&self) -> Option<String> {
    self.state.read().model.clone()
  }

  pub fn source(&self) -> Option<String> {
    self.state.read().source.clone()
  }

  pub fn len(&self) -> usize {
    self.state.read().history.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state.read().history.is_empty()
  }
}

impl Default for DetectionSession {
  fn default() -> Self {
    Self::new(None, Thresholds::default(), None)
  }
}

/// 会话的只读视图
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
  pub source: Option<String>,
  pub thresholds: Thresholds,
  pub model: Option<String>,
  pub detections: Vec<Detection>,
  pub class_counts: BTreeMap<String, usize>,
  pub frames_processed: u64,
  pub created_at: DateTime<Local>,
}

impl SessionSnapshot {
  pub fn total(&self) -> usize {
    self.detections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.detections.is_empty()
  }

  /// 最近的 n 条检测
  pub fn recent(&self, n: usize) -> &[Detection] {
    let start = self.detections.len().saturating_sub(n);
    &self.detections[start..]
  }

  /// 各类别数量及占比
  pub fn summary_text(&self) -> String {
    if self.class_counts.is_empty() {
      return "未检测到目标".to_string();
    }

    let total: usize = self.class_counts.values().sum();
    let mut summary = String::from("检测统计:\n");
    let _ = writeln!(summary, "总计: {}", total);
    for (class_name, count) in &self.class_counts {
      let percentage = *count as f64 / total as f64 * 100.0;
      let _ = writeln!(summary, "{}: {} ({:.1}%)", class_name, count, percentage);
    }
    summary
  }
}
