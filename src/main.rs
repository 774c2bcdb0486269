// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/main.rs - 命令行入口
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

mod args;

use std::{path::Path, sync::mpsc, thread, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "save_image_file")]
use maogan::output::{OutputWrapper, Render};
use maogan::{
  FromUrl,
  export::ExportFormat,
  model::ModelSpec,
  pipeline::{PipelineConfig, PipelineController},
};

const RESULT_POLL: Duration = Duration::from_millis(200);

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
  let Some(path) = path else {
    return Ok(PipelineConfig::default());
  };
  let text = std::fs::read_to_string(path)
    .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
  serde_json::from_str(&text).with_context(|| format!("配置文件格式错误 {}", path.display()))
}

fn export_all(controller: &PipelineController, destinations: &[std::path::PathBuf]) {
  for destination in destinations {
    let formats = if destination.is_dir() {
      vec![ExportFormat::Txt, ExportFormat::Csv, ExportFormat::Json]
    } else {
      match ExportFormat::from_path(destination) {
        Ok(format) => vec![format],
        Err(e) => {
          error!("无法导出到 {}: {}", destination.display(), e);
          continue;
        }
      }
    };
    for format in formats {
      if let Err(e) = controller.export(format, destination) {
        error!("导出 {} 失败: {}", format, e);
      }
    }
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();
  let config = args.apply(load_config(args.config.as_deref())?);

  info!("输入来源: {}", args.input);
  info!(
    "置信度阈值: {:.2}, IOU 阈值: {:.2}",
    config.thresholds.confidence, config.thresholds.iou
  );

  let mut controller: PipelineController = PipelineController::new(config);

  if let Some(model) = &args.model {
    info!("模型: {}", model);
    let mut spec = ModelSpec::from_url(model)?;
    let sized = model
      .query_pairs()
      .any(|(k, _)| k == "size" || k == "width" || k == "height");
    if !sized {
      spec = spec.with_input_shape(controller.config().input_shape);
    }
    controller.load_model(&spec)?;
  } else {
    warn!("未指定模型，仅预览输入");
  }

  #[cfg(feature = "save_image_file")]
  let output = match &args.output {
    Some(url) => {
      let class_names = controller
        .class_names()
        .map(|names| names.to_vec())
        .unwrap_or_default();
      Some(OutputWrapper::from_url(url)?.with_class_names(&class_names))
    }
    None => None,
  };
  #[cfg(not(feature = "save_image_file"))]
  if args.output.is_some() {
    warn!("未启用 save_image_file 特性，忽略输出参数");
  }

  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法设置 Ctrl-C 处理")?;

  controller.open(&args.input)?;

  loop {
    if rx.try_recv().is_ok() {
      warn!("中断信号接收，停止处理");
      controller.close();
      break;
    }

    let result = match controller.wait_result(RESULT_POLL) {
      Some(result) => result,
      None if controller.is_running() => continue,
      // 工作线程已结束，取走交接槽中可能剩下的最后一帧
      None => match controller.latest_result() {
        Some(result) => result,
        None => break,
      },
    };

    info!(
      "帧 {}: {} 个目标，耗时 {:.2?}",
      result.frame.sequence,
      result.detections.len(),
      result.latency
    );
    #[cfg(feature = "save_image_file")]
    if let Some(output) = &output
      && let Err(e) = output.render_result(&result.frame, &result.detections)
    {
      warn!("保存输出失败: {}", e);
    }
  }

  #[cfg(feature = "save_image_file")]
  if let Some(output) = &output {
    output.finish();
  }

  if let Some(exit) = controller.wait_until_finished(Duration::from_secs(5)) {
    info!("处理结束: {:?}", exit);
  }
  if controller.dropped_results() > 0 {
    info!("未展示的帧: {}", controller.dropped_results());
  }

  if let Some(snapshot) = controller.snapshot() {
    info!(
      "共处理 {} 帧\n{}",
      snapshot.frames_processed,
      snapshot.summary_text()
    );
  }
  export_all(&controller, &args.export);

  Ok(())
}
