// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::Parser;
use url::Url;

use maogan::{
  pipeline::PipelineConfig,
  postprocess::Thresholds,
  preprocess::Enhancement,
};

/// Maogan 锚杆检测参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型
  /// 支持格式:
  /// - onnx:///path/best.onnx?labels=/path/classes.txt&size=640
  /// - model:///path/best.onnx （按扩展名选择后端）
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,

  /// 输入来源
  /// 支持格式:
  /// - 图片: image:///path/a.jpg
  /// - 图片序列: folder:///path/frames?fps=25
  /// - 视频: video:///path/a.mp4
  /// - V4L2: camera:///dev/video0?width=640&height=480
  /// 均可附加 skip=N 与 max_fps=F
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 标注图像输出
  /// - image:///path/out.png
  /// - folder:///path/records?always&record=name
  /// - video:///path/out.mp4?fps=25
  /// 可附加 font=/path/font.ttf（类别标签）与 alarm（顶部告警横幅）
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,

  /// 结束时导出检测记录（按扩展名 txt/csv/json 选择格式，目录则导出全部格式），可重复
  #[arg(long, value_name = "PATH")]
  pub export: Vec<PathBuf>,

  /// 流水线配置文件（JSON），命令行参数优先
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub iou: Option<f32>,

  /// 最大处理帧数
  #[arg(long, value_name = "COUNT")]
  pub frame_number: Option<u64>,

  /// 亮度系数 (0.0 - 2.0)，指定任一增强参数即启用图像增强
  #[arg(long, value_name = "FACTOR")]
  pub brightness: Option<f32>,

  /// 对比度系数 (0.0 - 2.0)
  #[arg(long, value_name = "FACTOR")]
  pub contrast: Option<f32>,

  /// 饱和度系数 (0.0 - 2.0)
  #[arg(long, value_name = "FACTOR")]
  pub saturation: Option<f32>,
}

impl Args {
  /// 在基础配置上应用命令行参数
  pub fn apply(&self, mut config: PipelineConfig) -> PipelineConfig {
    if self.confidence.is_some() || self.iou.is_some() {
      let base = config.thresholds;
      config.thresholds = Thresholds::new(
        self.confidence.unwrap_or(base.confidence),
        self.iou.unwrap_or(base.iou),
      );
    }

    if self.brightness.is_some() || self.contrast.is_some() || self.saturation.is_some() {
      let base = config.enhancement;
      config.enhancement = Enhancement::new(
        self.brightness.unwrap_or(base.brightness),
        self.contrast.unwrap_or(base.contrast),
        self.saturation.unwrap_or(base.saturation),
      );
    }

    if self.frame_number.is_some() {
      config.frame_limit = self.frame_number;
    }
    config
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use maogan::postprocess::{DEFAULT_CONFIDENCE, DEFAULT_IOU};

  #[test]
  fn command_line_overrides_config() {
    let args = Args::parse_from([
      "maogan",
      "--input",
      "image:///tmp/a.png",
      "--confidence",
      "0.6",
      "--contrast",
      "1.5",
      "--export",
      "/tmp/a.csv",
      "--export",
      "/tmp/reports",
    ]);
    let config = args.apply(PipelineConfig::default());
    assert_eq!(config.thresholds, Thresholds::new(0.6, DEFAULT_IOU));
    assert!(config.enhancement.enabled);
    assert_eq!(config.enhancement.contrast, 1.5);
    assert_eq!(config.enhancement.brightness, 1.0);
    assert_eq!(args.export.len(), 2);
    assert_eq!(config.frame_limit, None);
  }

  #[test]
  fn defaults_leave_config_untouched() {
    let args = Args::parse_from(["maogan", "--input", "camera:///dev/video0"]);
    let config = args.apply(PipelineConfig::default());
    assert_eq!(config, PipelineConfig::default());
    assert_eq!(config.thresholds.confidence, DEFAULT_CONFIDENCE);
  }
}
