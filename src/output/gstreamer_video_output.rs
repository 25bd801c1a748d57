// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
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

//! # GStreamer 视频文件输出
//!
//! 按扩展名选择封装格式：
//!
//! - **MP4** (H.264)，未知扩展名也按 MP4 处理
//! - **MKV** (Matroska)
//! - **AVI**
//! - **WebM** (VP8)

use std::path::{Path, PathBuf};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};

use super::{OutputError, VideoWriter};

#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("Buffer creation error")]
  BufferCreationError,
  #[error("帧尺寸 {actual:?} 与输出 {expected:?} 不一致")]
  FrameSizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

const EOS_TIMEOUT_SECS: u64 = 10;

fn encoder_pipeline(path: &Path) -> String {
  let location = path.display();
  let extension = path
    .extension()
    .and_then(|e| e.to_str())
    .map(str::to_lowercase);
  match extension.as_deref() {
    Some("mkv") => format!(
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux ! filesink location=\"{}\"",
      location
    ),
    Some("avi") => format!(
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc ! avimux ! filesink location=\"{}\"",
      location
    ),
    Some("webm") => format!(
      "appsrc name=src ! videoconvert ! vp8enc ! webmmux ! filesink location=\"{}\"",
      location
    ),
    _ => format!(
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! mp4mux ! filesink location=\"{}\"",
      location
    ),
  }
}

/// GStreamer 视频文件输出
pub struct GStreamerVideoOutput {
  path: PathBuf,
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  width: u32,
  height: u32,
  /// 每帧时长（纳秒）
  frame_duration: u64,
  frame_count: u64,
  finished: bool,
}

impl GStreamerVideoOutput {
  pub fn new(
    path: impl AsRef<Path>,
    width: u32,
    height: u32,
    fps: f64,
  ) -> Result<Self, GStreamerVideoOutputError> {
    let path = path.as_ref();
    gst::init()?;

    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent).map_err(|e| {
          GStreamerVideoOutputError::PipelineError(format!("无法创建输出目录: {}", e))
        })?;
      }
    }

    let pipeline_desc = encoder_pipeline(path);
    info!("Creating video output pipeline: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| {
        GStreamerVideoOutputError::PipelineError("Failed to create pipeline".to_string())
      })?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;

    // 帧率以 1/1000 精度表示，兼容 29.97 这类非整数帧率
    let fps = if fps > 0.0 { fps } else { 30.0 };
    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", width as i32)
      .field("height", height as i32)
      .field("framerate", gst::Fraction::new((fps * 1000.0).round() as i32, 1000))
      .build();

    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);

    pipeline.set_state(gst::State::Playing)?;

    info!(
      "Video output initialized: {}x{} @ {} fps -> {}",
      width,
      height,
      fps,
      path.display()
    );

    Ok(GStreamerVideoOutput {
      path: path.to_path_buf(),
      pipeline,
      appsrc,
      width,
      height,
      frame_duration: (1e9 / fps).round() as u64,
      frame_count: 0,
      finished: false,
    })
  }

  fn push_frame(&mut self, frame: &RgbImage) -> Result<(), GStreamerVideoOutputError> {
    if frame.dimensions() != (self.width, self.height) {
      return Err(GStreamerVideoOutputError::FrameSizeMismatch {
        expected: (self.width, self.height),
        actual: frame.dimensions(),
      });
    }

    let data = frame.as_raw();
    let mut buffer = gst::Buffer::with_size(data.len())
      .map_err(|_| GStreamerVideoOutputError::BufferCreationError)?;

    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or(GStreamerVideoOutputError::BufferCreationError)?;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(
        self.frame_count * self.frame_duration,
      ));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(self.frame_duration));
      let mut buffer_map = buffer_ref.map_writable().map_err(|_| {
        GStreamerVideoOutputError::PipelineError("Failed to map buffer".to_string())
      })?;
      buffer_map.copy_from_slice(data);
    }
    self.frame_count += 1;

    self.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("Failed to push buffer: {:?}", e))
    })?;

    Ok(())
  }

  fn close(&mut self) -> Result<(), GStreamerVideoOutputError> {
    if self.finished {
      return Ok(());
    }
    self.finished = true;

    // 发送 EOS 并等待封装器写完文件尾
    let eos = self.appsrc.end_of_stream();
    if let (Ok(_), Some(bus)) = (eos, self.pipeline.bus()) {
      let message = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      );
      match message.as_ref().map(|m| m.view()) {
        Some(gst::MessageView::Error(err)) => {
          error!("视频输出管道错误: {}", err.error());
        }
        None => warn!("等待 EOS 超时: {}", self.path.display()),
        _ => {}
      }
    }

    self.pipeline.set_state(gst::State::Null)?;
    info!(
      "Video output closed. Total frames written: {} -> {}",
      self.frame_count,
      self.path.display()
    );
    Ok(())
  }
}

impl VideoWriter for GStreamerVideoOutput {
  fn write(&mut self, frame: &RgbImage) -> Result<(), OutputError> {
    Ok(self.push_frame(frame)?)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    Ok(self.close()?)
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("Failed to stop GStreamer video output pipeline: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_container_by_extension() {
    assert!(encoder_pipeline(Path::new("a.MKV")).contains("matroskamux"));
    assert!(encoder_pipeline(Path::new("a.webm")).contains("vp8enc"));
    assert!(encoder_pipeline(Path::new("a.mov")).contains("mp4mux"));
  }
}
