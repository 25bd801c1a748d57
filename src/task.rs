// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/task.rs - 文件与摄像头任务
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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{thread, time::Duration};

use anyhow::Context;
use tracing::{info, warn};

use crate::config::TrajectorConfig;
use crate::detector::{Detector, ReplayDetector};
use crate::input::VideoSource;
use crate::output::draw::{StatusOverlay, TrajectoryRenderer};
use crate::output::{
  PreviewEvent, create_preview, create_video_writer, heatmap_path, save_png,
};
use crate::pipeline::{
  FrameMetadata, OutputGuard, SourceGuard, TrackingPipeline, VideoRunOptions, VideoSummary,
};
use crate::tracker::{AssociationEngine, Tracker, TrajectoryTracker, tracker_from_config};

/// 收到中断信号后等待正常退出的时间
const FORCE_EXIT_SECS: u64 = 30;

/// 进度输出间隔（帧）
const PROGRESS_INTERVAL: u64 = 30;

pub type DefaultPipeline = TrackingPipeline<ReplayDetector, TrajectoryTracker<AssociationEngine>>;

/// 由配置构建流水线
pub fn build_pipeline(config: &TrajectorConfig) -> anyhow::Result<DefaultPipeline> {
  let detections = config
    .detector
    .detections
    .as_ref()
    .context("未指定检测结果文件，请通过 --detections 或配置文件提供")?;
  let detector = ReplayDetector::open(detections)
    .with_context(|| format!("无法加载检测结果: {}", detections.display()))?;
  let tracker = tracker_from_config(&config.tracker).context("无法创建跟踪器")?;

  let mut renderer =
    TrajectoryRenderer::new(config.visualizer.renderer(), config.visualizer.heatmap());
  if let Some(font) = config.visualizer.font_path.as_ref() {
    renderer = renderer.with_font_path(font);
  }

  info!("检测类别数: {}", detector.class_names().len());
  Ok(TrackingPipeline::new(detector, tracker, renderer).with_filter(config.detector.filter()))
}

/// 安装 Ctrl-C 处理函数，返回停止标志
pub fn install_interrupt_flag() -> anyhow::Result<Arc<AtomicBool>> {
  let stop = Arc::new(AtomicBool::new(false));
  let flag = stop.clone();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    flag.store(true, Ordering::SeqCst);
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(FORCE_EXIT_SECS));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法设置 Ctrl-C 处理函数")?;
  Ok(stop)
}

fn timestamp() -> String {
  chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn status_overlay<D: Detector, T: Tracker>(pipeline: &mut TrackingPipeline<D, T>) {
  let font = pipeline.renderer().font().cloned();
  pipeline.add_frame_processor(StatusOverlay::new(font));
}

pub trait Task<S, D, T>: Sized {
  type Output;

  fn run_task(
    self,
    source: S,
    pipeline: &mut TrackingPipeline<D, T>,
  ) -> anyhow::Result<Self::Output>;
}

/// 处理视频文件
#[derive(Debug, Clone, Default)]
pub struct FileTask {
  pub output: PathBuf,
  pub preview: bool,
  pub heatmap: bool,
  pub show_status: bool,
  pub show_progress: bool,
  pub summary: Option<PathBuf>,
  pub stop: Option<Arc<AtomicBool>>,
}

impl<S: VideoSource, D: Detector, T: Tracker> Task<S, D, T> for FileTask {
  type Output = VideoSummary;

  fn run_task(
    self,
    mut source: S,
    pipeline: &mut TrackingPipeline<D, T>,
  ) -> anyhow::Result<VideoSummary> {
    if self.show_status {
      status_overlay(pipeline);
    }
    info!("输出文件: {}", self.output.display());

    let mut options = VideoRunOptions::default().with_output_path(&self.output);
    if let Some(stop) = self.stop.clone() {
      options = options.with_stop_flag(stop);
    }
    if self.show_progress {
      options = options.with_progress(|current, total| {
        if total > 0 && current % PROGRESS_INTERVAL == 0 {
          let progress = current as f64 / total as f64 * 100.0;
          info!("进度: {}/{} 帧 ({:.1}%)", current, total, progress);
        }
      });
    }
    if self.preview {
      match create_preview("Trajector") {
        Ok(preview) => options.preview = Some(preview),
        Err(e) => warn!("无法打开预览窗口，继续处理: {}", e),
      }
    }

    let summary = pipeline
      .process_video(&mut source, options)
      .context("视频处理失败")?;

    info!("处理完成!");
    info!("已处理帧数: {}", summary.frames_processed);
    info!("跟踪目标数: {}", summary.total_objects_tracked);

    if self.heatmap {
      let props = &summary.source_properties;
      let heatmap = pipeline.generate_heatmap((props.width, props.height));
      let path = heatmap_path(&self.output);
      save_png(&path, &heatmap).context("无法保存热力图")?;
      info!("热力图已保存: {}", path.display());
    }

    if let Some(path) = self.summary.as_ref() {
      write_summary(path, &summary)?;
    }

    Ok(summary)
  }
}

fn write_summary(path: &Path, summary: &VideoSummary) -> anyhow::Result<()> {
  let file = std::fs::File::create(path)
    .with_context(|| format!("无法创建汇总文件: {}", path.display()))?;
  serde_json::to_writer_pretty(file, summary).context("无法写入汇总文件")?;
  info!("汇总已保存: {}", path.display());
  Ok(())
}

/// 摄像头实时处理
///
/// 预览窗口按键：`q` 退出，`s` 截图，`h` 保存热力图，`r` 重置跟踪。
pub struct LiveTask<R> {
  pub output_dir: PathBuf,
  pub record: bool,
  pub stop: Option<Arc<AtomicBool>>,
  /// 由旧跟踪器构造新的跟踪器
  pub reset: R,
}

impl<R> LiveTask<R> {
  pub fn new(output_dir: impl Into<PathBuf>, reset: R) -> Self {
    Self {
      output_dir: output_dir.into(),
      record: false,
      stop: None,
      reset,
    }
  }

  pub fn with_record(mut self, record: bool) -> Self {
    self.record = record;
    self
  }

  pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = Some(stop);
    self
  }
}

impl<S, D, T, R> Task<S, D, T> for LiveTask<R>
where
  S: VideoSource,
  D: Detector,
  T: Tracker,
  R: FnMut(&T) -> anyhow::Result<T>,
{
  /// 已处理的帧数
  type Output = u64;

  fn run_task(mut self, mut source: S, pipeline: &mut TrackingPipeline<D, T>) -> anyhow::Result<u64> {
    status_overlay(pipeline);
    let mut source = SourceGuard(&mut source);
    let props = source.0.properties();

    info!("控制键: q 退出, s 截图, h 保存热力图, r 重置跟踪");

    let writer = if self.record {
      std::fs::create_dir_all(&self.output_dir)
        .with_context(|| format!("无法创建输出目录: {}", self.output_dir.display()))?;
      let path = self.output_dir.join(format!("webcam_{}.mp4", timestamp()));
      info!("录制到: {}", path.display());
      Some(create_video_writer(&path, props.width, props.height, props.fps)?)
    } else {
      None
    };
    let preview = match create_preview("Webcam Tracking") {
      Ok(preview) => Some(preview),
      Err(e) => {
        warn!("无法打开预览窗口，仅能通过 Ctrl-C 退出: {}", e);
        None
      }
    };
    let mut outputs = OutputGuard::new(writer, preview);

    let mut frame_count = 0u64;
    loop {
      if self.stop.as_ref().is_some_and(|s| s.load(Ordering::SeqCst)) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      let Some(frame) = source.0.read() else {
        break;
      };

      let metadata = FrameMetadata {
        frame_number: Some(frame_count),
        source_properties: Some(props.clone()),
        ..Default::default()
      };
      let result = pipeline.process_frame(&frame, metadata)?;

      if let Some(writer) = outputs.writer.as_mut() {
        writer.write(&result.frame)?;
      }

      let event = match outputs.preview.as_mut() {
        Some(preview) => preview.show(&result.frame)?,
        None => PreviewEvent::Continue,
      };
      match event {
        PreviewEvent::Key('s') => {
          let path = self.output_dir.join(format!("screenshot_{}.png", timestamp()));
          save_png(&path, &result.frame).context("无法保存截图")?;
          info!("截图已保存: {}", path.display());
        }
        PreviewEvent::Key('h') => {
          let heatmap = pipeline.generate_heatmap(frame.dimensions());
          let path = self.output_dir.join(format!("heatmap_{}.png", timestamp()));
          save_png(&path, &heatmap).context("无法保存热力图")?;
          info!("热力图已保存: {}", path.display());
        }
        PreviewEvent::Key('r') => {
          let fresh = (self.reset)(pipeline.tracker())?;
          pipeline.replace_tracker(fresh);
        }
        event if event.is_quit() => break,
        _ => {}
      }

      frame_count += 1;
    }

    outputs.finish()?;
    drop(source);

    info!("总帧数: {}", frame_count);
    Ok(frame_count)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_build_pipeline_requires_detections() {
    let config = TrajectorConfig::default();
    let err = build_pipeline(&config).err().map(|e| e.to_string());
    assert!(err.is_some_and(|e| e.contains("--detections")));
  }

  #[test]
  fn test_timestamp_format() {
    let ts = timestamp();
    assert_eq!(ts.len(), 15);
    assert_eq!(ts.as_bytes()[8], b'_');
  }
}
