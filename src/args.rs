// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
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

use clap::{Parser, Subcommand};

use trajector::config::TrajectorConfig;

/// Trajector 目标跟踪与轨迹可视化
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 处理视频文件
  File(FileArgs),
  /// 处理摄像头画面
  Webcam(WebcamArgs),
}

/// 两个子命令共用的参数
#[derive(clap::Args, Debug)]
pub struct CommonArgs {
  /// 配置文件
  #[arg(short, long, default_value = "config/trajector.json", value_name = "FILE")]
  pub config: PathBuf,

  /// 外部检测器输出（JSON lines），覆盖配置文件
  #[arg(long, value_name = "FILE")]
  pub detections: Option<PathBuf>,

  /// 外部跟踪器输出（JSON lines），覆盖配置文件
  #[arg(long, value_name = "FILE")]
  pub tracks: Option<PathBuf>,

  /// 标签字体文件，覆盖配置文件
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
}

impl CommonArgs {
  /// 命令行参数覆盖配置文件
  pub fn apply(&self, config: &mut TrajectorConfig) {
    if let Some(detections) = self.detections.as_ref() {
      config.detector.detections = Some(detections.clone());
    }
    if let Some(tracks) = self.tracks.as_ref() {
      config.tracker.tracks = Some(tracks.clone());
    }
    if let Some(font) = self.font.as_ref() {
      config.visualizer.font_path = Some(font.clone());
    }
  }
}

#[derive(clap::Args, Debug)]
pub struct FileArgs {
  /// 输入视频文件、图像目录或输入 URL
  /// 支持格式:
  /// - 图像目录或单张图像
  /// - 视频: *.mp4, *.avi, *.mkv 等（需 gstreamer_input 特性）
  /// - URL: frames://, gst://file
  #[arg(value_name = "INPUT")]
  pub input: String,

  /// 输出视频文件，默认为 <输入名>_tracked.<扩展名>
  #[arg(short, long, value_name = "OUTPUT")]
  pub output: Option<PathBuf>,

  #[command(flatten)]
  pub common: CommonArgs,

  /// 不显示预览窗口
  #[arg(long)]
  pub no_preview: bool,

  /// 处理结束后生成轨迹热力图
  #[arg(long)]
  pub heatmap: bool,

  /// 显示状态栏
  #[arg(long)]
  pub show_status: bool,

  /// 不输出进度
  #[arg(long)]
  pub quiet: bool,

  /// 将处理汇总写入 JSON 文件
  #[arg(long, value_name = "FILE")]
  pub summary: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct WebcamArgs {
  /// 摄像头编号、设备路径或输入 URL
  #[arg(short = 'i', long, default_value = "0", value_name = "CAMERA")]
  pub camera: String,

  #[command(flatten)]
  pub common: CommonArgs,

  /// 录制处理后的视频
  #[arg(short, long)]
  pub save: bool,

  /// 录像、截图与热力图的输出目录
  #[arg(short, long, default_value = "output", value_name = "DIR")]
  pub output: PathBuf,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_file_defaults() {
    let args = Args::parse_from(["trajector", "file", "clip.mp4", "--quiet"]);
    let Command::File(file) = args.command else {
      panic!("expected file command");
    };
    assert_eq!(file.input, "clip.mp4");
    assert!(file.quiet);
    assert!(!file.no_preview);
    assert_eq!(file.common.config, PathBuf::from("config/trajector.json"));
  }

  #[test]
  fn test_webcam_overrides() {
    let args = Args::parse_from([
      "trajector",
      "webcam",
      "-i",
      "2",
      "--save",
      "--detections",
      "cam.jsonl",
    ]);
    let Command::Webcam(webcam) = args.command else {
      panic!("expected webcam command");
    };
    assert_eq!(webcam.camera, "2");
    assert!(webcam.save);
    assert_eq!(webcam.output, PathBuf::from("output"));

    let mut config = TrajectorConfig::default();
    webcam.common.apply(&mut config);
    assert_eq!(config.detector.detections, Some(PathBuf::from("cam.jsonl")));
    assert!(config.tracker.tracks.is_none());
  }
}
