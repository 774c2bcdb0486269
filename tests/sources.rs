// 该文件是 Maogan （锚杆检测） 项目的一部分。
// tests/sources.rs - 通过 URL 打开输入源的集成测试
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

mod common;

use std::{path::Path, time::Duration};

use image::{Rgb, RgbImage};
use url::Url;

use maogan::{
  input::{FrameStream, InputSourceType},
  pipeline::{PipelineConfig, PipelineController, WorkerExit},
};

use common::{ScriptedModel, handle};

const TIMEOUT: Duration = Duration::from_secs(10);

fn write_frames(dir: &Path, count: usize) {
  for i in 0..count {
    let image = RgbImage::from_pixel(48, 32, Rgb([(i * 20) as u8, 0, 0]));
    image.save(dir.join(format!("frame_{:02}.png", i))).unwrap();
  }
}

fn folder_url(dir: &Path, query: &str) -> Url {
  Url::parse(&format!("folder://{}?{}", dir.display(), query)).unwrap()
}

#[test]
fn folder_frames_are_ordered_and_skipped() {
  let dir = tempfile::tempdir().unwrap();
  write_frames(dir.path(), 6);

  let mut stream = FrameStream::open(&folder_url(dir.path(), "fps=10&skip=1")).unwrap();
  assert_eq!(stream.source_type(), InputSourceType::Folder);
  assert_eq!((stream.width(), stream.height()), (48, 32));

  let frames: Vec<_> = stream.by_ref().map(|f| f.unwrap()).collect();
  let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
  assert_eq!(sequences, vec![0, 1, 2]);
  // 保留第 0、2、4 张
  let reds: Vec<u8> = frames.iter().map(|f| f.image.get_pixel(0, 0)[0]).collect();
  assert_eq!(reds, vec![0, 40, 80]);
}

#[test]
fn max_fps_follows_media_time() {
  let dir = tempfile::tempdir().unwrap();
  write_frames(dir.path(), 6);

  let stream = FrameStream::open(&folder_url(dir.path(), "fps=10&max_fps=4")).unwrap();
  let timestamps: Vec<Duration> = stream.map(|f| f.unwrap().timestamp).collect();
  assert_eq!(timestamps.len(), 2);
  assert!(timestamps[1] - timestamps[0] >= Duration::from_millis(250));
}

#[test]
fn controller_runs_a_folder_source() {
  let dir = tempfile::tempdir().unwrap();
  write_frames(dir.path(), 5);

  let mut controller: PipelineController<ScriptedModel> =
    PipelineController::new(PipelineConfig::default().with_skip(1));
  controller.swap_model(handle("anchor.onnx", "anchor"));
  controller.open(&folder_url(dir.path(), "fps=25")).unwrap();
  assert_eq!(controller.wait_until_finished(TIMEOUT), Some(WorkerExit::EndOfStream));

  let snapshot = controller.snapshot().unwrap();
  // 配置中的 skip 作为默认值
  assert_eq!(snapshot.frames_processed, 3);
  assert_eq!(snapshot.total(), 3);
  assert!(snapshot.source.unwrap().starts_with("folder://"));
}

#[test]
fn empty_folder_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let mut controller: PipelineController<ScriptedModel> =
    PipelineController::new(PipelineConfig::default());
  assert!(controller.open(&folder_url(dir.path(), "fps=25")).is_err());
  assert!(controller.snapshot().is_none());
  assert!(!controller.is_running());
}

#[test]
fn single_image_yields_one_frame() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("belt.png");
  RgbImage::from_pixel(20, 10, Rgb([1, 2, 3])).save(&path).unwrap();

  let url = Url::parse(&format!("image://{}", path.display())).unwrap();
  let mut stream = FrameStream::open(&url).unwrap();
  assert_eq!(stream.source_type(), InputSourceType::Image);
  let frame = stream.next_frame().unwrap().unwrap();
  assert_eq!(frame.sequence, 0);
  assert_eq!(frame.timestamp, Duration::ZERO);
  assert!(stream.next_frame().is_none());
}
