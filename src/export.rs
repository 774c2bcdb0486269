// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/export.rs - 检测结果导出（TXT / CSV / JSON）
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

//! # 导出
//!
//! 导出文件是对外的稳定格式，列顺序与字段名不应改变：
//!
//! - CSV：`timestamp,frame_id,class,x,y,width,height,confidence`
//! - JSON：`{"summary": {...}, "detections": [...]}`，检测记录字段与 CSV 列相同
//! - TXT：可读报告，包含各类别统计与逐条记录

use std::{
  collections::BTreeMap,
  fmt::{self, Write as _},
  path::{Path, PathBuf},
  str::FromStr,
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::{postprocess::Detection, session::SessionSnapshot};

/// 时间戳格式
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
/// CSV 表头
pub const CSV_HEADER: [&str; 8] = [
  "timestamp",
  "frame_id",
  "class",
  "x",
  "y",
  "width",
  "height",
  "confidence",
];

/// 导出错误，导出失败不会修改会话，可以安全重试
#[derive(Error, Debug)]
pub enum ExportError {
  #[error("没有可导出的检测记录")]
  EmptySession,
  #[error("无法写入 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Serialize error: {0}")]
  Serialize(#[from] serde_json::Error),
  #[error("未知的导出格式: {0}")]
  UnknownFormat(String),
  #[error("Parse error at line {line}: {message}")]
  Parse { line: usize, message: String },
}

/// 导出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
  Txt,
  Csv,
  Json,
}

impl ExportFormat {
  pub fn extension(&self) -> &'static str {
    match self {
      ExportFormat::Txt => "txt",
      ExportFormat::Csv => "csv",
      ExportFormat::Json => "json",
    }
  }

  /// 根据文件扩展名判断格式
  pub fn from_path(path: &Path) -> Result<Self, ExportError> {
    let ext = path
      .extension()
      .and_then(|ext| ext.to_str())
      .ok_or_else(|| ExportError::UnknownFormat(path.display().to_string()))?;
    ext.parse()
  }

  /// 目标为目录时使用的默认文件名
  pub fn default_file_name(&self, now: DateTime<Local>) -> String {
    let stamp = now.format("%Y%m%d_%H%M%S");
    match self {
      ExportFormat::Txt => format!("report_{}.txt", stamp),
      ExportFormat::Csv => format!("detections_{}.csv", stamp),
      ExportFormat::Json => format!("detections_{}.json", stamp),
    }
  }
}

impl FromStr for ExportFormat {
  type Err = ExportError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "txt" => Ok(ExportFormat::Txt),
      "csv" => Ok(ExportFormat::Csv),
      "json" => Ok(ExportFormat::Json),
      _ => Err(ExportError::UnknownFormat(s.to_string())),
    }
  }
}

impl fmt::Display for ExportFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.extension())
  }
}

/// 一条导出记录，字段与 CSV 列一一对应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
  pub timestamp: String,
  pub frame_id: u64,
  pub class: String,
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
  pub confidence: f32,
}

impl From<&Detection> for DetectionRecord {
  fn from(detection: &Detection) -> Self {
    Self {
      timestamp: detection.timestamp.format(TIMESTAMP_FORMAT).to_string(),
      frame_id: detection.frame_id,
      class: detection.class_name.clone(),
      x: detection.bbox.x(),
      y: detection.bbox.y(),
      width: detection.bbox.width(),
      height: detection.bbox.height(),
      confidence: detection.confidence,
    }
  }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonSummary {
  pub total_detections: usize,
  pub per_class: BTreeMap<String, usize>,
  pub frames_processed: u64,
  pub source: Option<String>,
  pub model: Option<String>,
  pub confidence_threshold: f32,
  pub iou_threshold: f32,
  pub generated_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonReport {
  pub summary: JsonSummary,
  pub detections: Vec<DetectionRecord>,
}

/// 导出会话快照
///
/// `destination` 为已存在的目录时使用默认文件名。先写入临时文件再重命名，
/// 失败时不会留下不完整的目标文件。返回实际写入的路径。
pub fn export(
  snapshot: &SessionSnapshot,
  format: ExportFormat,
  destination: &Path,
) -> Result<PathBuf, ExportError> {
  if snapshot.is_empty() {
    error!("导出失败: 会话为空");
    return Err(ExportError::EmptySession);
  }

  let now = Local::now();
  let path = if destination.is_dir() {
    destination.join(format.default_file_name(now))
  } else {
    destination.to_path_buf()
  };

  let content = match format {
    ExportFormat::Txt => render_txt(snapshot, now),
    ExportFormat::Csv => render_csv(snapshot),
    ExportFormat::Json => render_json(snapshot, now)?,
  };

  write_atomic(&path, content.as_bytes())?;
  info!(
    "已导出 {} 条检测记录到 {} ({})",
    snapshot.total(),
    path.display(),
    format
  );
  Ok(path)
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ExportError> {
  let io_error = |source| ExportError::Io {
    path: path.to_path_buf(),
    source,
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| {
      io_error(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "destination has no file name",
      ))
    })?
    .to_string_lossy();
  let tmp = path.with_file_name(format!(".{}.tmp", file_name));

  std::fs::write(&tmp, content).map_err(io_error)?;
  std::fs::rename(&tmp, path).map_err(|source| {
    let _ = std::fs::remove_file(&tmp);
    io_error(source)
  })
}

/// 文本报告
pub fn render_txt(snapshot: &SessionSnapshot, now: DateTime<Local>) -> String {
  let heavy = "=".repeat(50);
  let light = "-".repeat(50);
  let mut out = String::new();

  let _ = writeln!(out, "{}", heavy);
  let _ = writeln!(out, "皮带传送带锚杆检测报告");
  let _ = writeln!(out, "{}\n", heavy);
  let _ = writeln!(out, "生成时间: {}", now.format("%Y-%m-%d %H:%M:%S"));
  if let Some(source) = &snapshot.source {
    let _ = writeln!(out, "输入源: {}", source);
  }
  if let Some(model) = &snapshot.model {
    let _ = writeln!(out, "模型: {}", model);
  }
  let _ = writeln!(
    out,
    "置信度阈值: {:.2}  IOU 阈值: {:.2}",
    snapshot.thresholds.confidence, snapshot.thresholds.iou
  );
  let _ = writeln!(out, "已处理帧数: {}\n", snapshot.frames_processed);

  out.push_str(&snapshot.summary_text());
  out.push('\n');
  let _ = writeln!(out, "{}", light);
  let _ = writeln!(out, "详细检测记录:");
  let _ = writeln!(out, "{}", light);

  for (i, detection) in snapshot.detections.iter().enumerate() {
    let bbox = &detection.bbox;
    let _ = writeln!(out, "\n检测 #{}:", i + 1);
    let _ = writeln!(
      out,
      "  时间: {}",
      detection.timestamp.format(TIMESTAMP_FORMAT)
    );
    let _ = writeln!(out, "  帧ID: {}", detection.frame_id);
    let _ = writeln!(out, "  类别: {}", detection.class_name);
    let _ = writeln!(out, "  置信度: {:.2}", detection.confidence);
    let _ = writeln!(
      out,
      "  位置: ({:.1}, {:.1}) - ({:.1}, {:.1})",
      bbox.x_min, bbox.y_min, bbox.x_max, bbox.y_max
    );
  }

  out
}

fn csv_field(value: &str) -> String {
  if value.contains([',', '"', '\n', '\r']) {
    format!("\"{}\"", value.replace('"', "\"\""))
  } else {
    value.to_string()
  }
}

/// CSV，每条检测一行
pub fn render_csv(snapshot: &SessionSnapshot) -> String {
  let mut out = CSV_HEADER.join(",");
  out.push('\n');
  for record in snapshot.detections.iter().map(DetectionRecord::from) {
    let _ = writeln!(
      out,
      "{},{},{},{},{},{},{},{}",
      csv_field(&record.timestamp),
      record.frame_id,
      csv_field(&record.class),
      record.x,
      record.y,
      record.width,
      record.height,
      record.confidence
    );
  }
  out
}

/// JSON 报告
pub fn render_json(snapshot: &SessionSnapshot, now: DateTime<Local>) -> Result<String, ExportError> {
  let report = JsonReport {
    summary: JsonSummary {
      total_detections: snapshot.total(),
      per_class: snapshot.class_counts.clone(),
      frames_processed: snapshot.frames_processed,
      source: snapshot.source.clone(),
      model: snapshot.model.clone(),
      confidence_threshold: snapshot.thresholds.confidence,
      iou_threshold: snapshot.thresholds.iou,
      generated_at: now.format(TIMESTAMP_FORMAT).to_string(),
    },
    detections: snapshot.detections.iter().map(DetectionRecord::from).collect(),
  };
  Ok(serde_json::to_string_pretty(&report)?)
}

fn split_csv_line(line: &str) -> Vec<String> {
  let mut fields = Vec::new();
  let mut field = String::new();
  let mut quoted = false;
  let mut chars = line.chars().peekable();

  while let Some(c) = chars.next() {
    match (c, quoted) {
      ('"', true) if chars.peek() == Some(&'"') => {
        field.push('"');
        chars.next();
      }
      ('"', _) => quoted = !quoted,
      (',', false) => fields.push(std::mem::take(&mut field)),
      _ => field.push(c),
    }
  }
  fields.push(field);
  fields
}

/// 解析导出的 CSV
pub fn parse_csv(text: &str) -> Result<Vec<DetectionRecord>, ExportError> {
  let mut lines = text.lines().enumerate().filter(|(_, l)| !l.is_empty());

  let header = lines.next().map(|(_, l)| split_csv_line(l)).unwrap_or_default();
  if header != CSV_HEADER {
    return Err(ExportError::Parse {
      line: 1,
      message: format!("unexpected header: {:?}", header),
    });
  }

  lines
    .map(|(index, line)| {
      let line_no = index + 1;
      let parse_error = |message: String| ExportError::Parse {
        line: line_no,
        message,
      };
      let fields = split_csv_line(line);
      let [timestamp, frame_id, class, x, y, width, height, confidence] =
        <[String; 8]>::try_from(fields)
          .map_err(|f| parse_error(format!("expected 8 fields, got {}", f.len())))?;

      let number = |name: &str, value: &str| {
        value
          .parse::<f32>()
          .map_err(|e| parse_error(format!("invalid {}: {}", name, e)))
      };

      Ok(DetectionRecord {
        frame_id: frame_id
          .parse()
          .map_err(|e| parse_error(format!("invalid frame_id: {}", e)))?,
        x: number("x", &x)?,
        y: number("y", &y)?,
        width: number("width", &width)?,
        height: number("height", &height)?,
        confidence: number("confidence", &confidence)?,
        timestamp,
        class,
      })
    })
    .collect()
}

/// 读取 CSV 文件
pub fn read_csv(path: &Path) -> Result<Vec<DetectionRecord>, ExportError> {
  let text = std::fs::read_to_string(path).map_err(|source| ExportError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  parse_csv(&text)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{frame::BoundingBox, postprocess::Thresholds, session::DetectionSession};

  fn session() -> DetectionSession {
    let session = DetectionSession::new(
      Some("folder:///belt".to_string()),
      Thresholds::default(),
      Some("best.onnx".to_string()),
    );
    let detection = |frame_id, class_name: &str, x| Detection {
      timestamp: Local::now(),
      frame_id,
      class_name: class_name.to_string(),
      bbox: BoundingBox::from_xywh(x, 20.0, 30.0, 40.0),
      confidence: 0.875,
    };
    session.record(&[detection(0, "anchor", 10.0), detection(0, "rod, bent", 50.0)]);
    session.record(&[detection(1, "anchor", 12.5)]);
    session
  }

  #[test]
  fn empty_session_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = DetectionSession::default().snapshot();
    for format in [ExportFormat::Txt, ExportFormat::Csv, ExportFormat::Json] {
      assert!(matches!(
        export(&snapshot, format, dir.path()),
        Err(ExportError::EmptySession)
      ));
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
  }

  #[test]
  fn csv_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = session().snapshot();
    let path = export(&snapshot, ExportFormat::Csv, &dir.path().join("out.csv")).unwrap();

    let records = read_csv(&path).unwrap();
    assert_eq!(records.len(), snapshot.total());

    let mut per_class = BTreeMap::new();
    for record in &records {
      *per_class.entry(record.class.clone()).or_insert(0usize) += 1;
    }
    assert_eq!(per_class, snapshot.class_counts);
    assert_eq!(records[1].class, "rod, bent");
    assert_eq!(records[2].x, 12.5);
    assert_eq!(records[2].width, 30.0);
  }

  #[test]
  fn csv_header_is_fixed() {
    let csv = render_csv(&session().snapshot());
    assert!(csv.starts_with("timestamp,frame_id,class,x,y,width,height,confidence\n"));
  }

  #[test]
  fn json_has_summary_and_detections() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = session().snapshot();
    let path = export(&snapshot, ExportFormat::Json, dir.path()).unwrap();
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("detections_") && name.ends_with(".json"));

    let value: serde_json::Value =
      serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["summary"]["total_detections"], 3);
    assert_eq!(value["summary"]["per_class"]["anchor"], 2);
    assert_eq!(value["detections"].as_array().unwrap().len(), 3);
    assert_eq!(value["detections"][0]["class"], "anchor");
    assert_eq!(value["detections"][0]["frame_id"], 0);
  }

  #[test]
  fn txt_report_lists_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = export(&session().snapshot(), ExportFormat::Txt, dir.path()).unwrap();
    assert!(
      path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("report_")
    );

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("皮带传送带锚杆检测报告"));
    assert!(text.contains("总计: 3"));
    assert!(text.contains("检测 #3:"));
    assert!(text.contains("置信度: 0.88") || text.contains("置信度: 0.87"));
  }

  #[test]
  fn export_does_not_touch_session() {
    let dir = tempfile::tempdir().unwrap();
    let session = session();
    let before = session.snapshot();
    export(&before, ExportFormat::Csv, dir.path()).unwrap();
    let after = session.snapshot();
    assert_eq!(before.detections, after.detections);
    assert_eq!(before.class_counts, after.class_counts);
  }

  #[test]
  fn unwritable_destination_is_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = session().snapshot();
    let missing = dir.path().join("missing").join("out.csv");
    assert!(matches!(
      export(&snapshot, ExportFormat::Csv, &missing),
      Err(ExportError::Io { .. })
    ));

    std::fs::create_dir(dir.path().join("missing")).unwrap();
    assert!(export(&snapshot, ExportFormat::Csv, &missing).is_ok());
  }

  #[test]
  fn format_from_extension() {
    assert_eq!(
      ExportFormat::from_path(Path::new("a/b.JSON")).unwrap(),
      ExportFormat::Json
    );
    assert!(matches!(
      ExportFormat::from_path(Path::new("a/b.xlsx")),
      Err(ExportError::UnknownFormat(_))
    ));
  }
}
