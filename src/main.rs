// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/main.rs - 项目主程序
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

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trajector::config::TrajectorConfig;
use trajector::input::{open_camera, open_source};
use trajector::output::default_output_path;
use trajector::task::{FileTask, LiveTask, Task, build_pipeline, install_interrupt_flag};
use trajector::tracker::{AssociationEngine, TrajectoryTracker};

use args::{Args, Command, CommonArgs, FileArgs, WebcamArgs};

fn load_config(common: &CommonArgs) -> Result<TrajectorConfig> {
  let mut config = TrajectorConfig::load_or_default(&common.config)?;
  common.apply(&mut config);
  Ok(config)
}

fn run_file(args: FileArgs) -> Result<()> {
  let config = load_config(&args.common)?;
  let mut pipeline = build_pipeline(&config)?;

  let output = args
    .output
    .clone()
    .unwrap_or_else(|| default_output_path(Path::new(&args.input)));
  info!("处理: {}", args.input);

  let source = open_source(&args.input).with_context(|| format!("无法打开输入: {}", args.input))?;
  let task = FileTask {
    output,
    preview: !args.no_preview,
    heatmap: args.heatmap,
    show_status: args.show_status,
    show_progress: !args.quiet,
    summary: args.summary,
    stop: Some(install_interrupt_flag()?),
  };
  task.run_task(source, &mut pipeline)?;
  Ok(())
}

fn run_webcam(args: WebcamArgs) -> Result<()> {
  let config = load_config(&args.common)?;
  let mut pipeline = build_pipeline(&config)?;

  info!("正在打开摄像头 {}...", args.camera);
  let source = open_camera(&args.camera).with_context(|| format!("无法打开摄像头: {}", args.camera))?;

  let tracker_config = config.tracker.clone();
  let reset = move |old: &TrajectoryTracker<AssociationEngine>| -> Result<TrajectoryTracker<AssociationEngine>> {
    let engine = old.association().restart(&tracker_config)?;
    Ok(TrajectoryTracker::with_capacity(
      engine,
      tracker_config.trajectory_capacity,
    ))
  };

  let task = LiveTask::new(&args.output, reset)
    .with_record(args.save)
    .with_stop_flag(install_interrupt_flag()?);
  task.run_task(source, &mut pipeline)?;
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  match args.command {
    Command::File(file) => run_file(file),
    Command::Webcam(webcam) => run_webcam(webcam),
  }
}
