// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频文件与摄像头输入
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

//! # GStreamer 输入
//!
//! 通过 `appsink` 拉取 RGB 帧。
//!
//! - `gst://file/path/to/video.mp4`：任意 GStreamer 能解码的视频文件
//! - `gst://camera/dev/video0?width=640&height=480&fps=30&rotate=90`：摄像头
//!
//! 需要系统安装 GStreamer 开发库：
//!
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
  DEFAULT_CAMERA_FPS, LIVE_FRAME_COUNT, SourceKind, SourceProperties, VideoSource,
};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("输入不存在: {0}")]
  NotFound(PathBuf),
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  #[error("Unsupported video format")]
  UnsupportedFormat,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

const GSTREAMER_INPUT_SCHEME: &str = "gst";

enum PipelineItem {
  FileSource(String),
  CameraSource {
    camera: String,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
  },
  VideoFlip {
    method: u32,
  },
  TargetFormat,
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => {
        format!("filesrc location=\"{}\" ! decodebin", path)
      }
      PipelineItem::CameraSource {
        camera,
        width,
        height,
        fps,
      } => {
        let mut caps = String::from("video/x-raw");
        if let Some(width) = width {
          caps.push_str(&format!(",width={}", width));
        }
        if let Some(height) = height {
          caps.push_str(&format!(",height={}", height));
        }
        if let Some(fps) = fps {
          caps.push_str(&format!(",framerate={}/1", fps));
        }
        format!("v4l2src device={} ! {}", camera, caps)
      }
      PipelineItem::VideoFlip { method } => format!("videoflip method={}", method),
      PipelineItem::TargetFormat => "videoconvert ! video/x-raw,format=RGB".to_string(),
    }
  }
}

fn video_flip(rotate: Option<&str>) -> Option<PipelineItem> {
  let method = match rotate? {
    "90" => 1,
    "180" => 2,
    "270" => 3,
    _ => return None,
  };
  Some(PipelineItem::VideoFlip { method })
}

fn query_map(url: &Url) -> HashMap<String, String> {
  url
    .query_pairs()
    .map(|(k, v)| (String::from(k), String::from(v)))
    .collect()
}

fn url_path(url: &Url) -> String {
  urlencoding::decode(url.path())
    .map(|p| p.into_owned())
    .unwrap_or_else(|_| url.path().to_string())
}

/// 以 appsink 结尾的解码管道
struct AppSinkPipeline {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  width: u32,
  height: u32,
  fps: Option<f64>,
  /// 构造时为读取视频信息而提前拉取的第一帧
  pending: Option<RgbImage>,
  frames_read: u64,
  open: bool,
}

impl AppSinkPipeline {
  fn launch(items: &[PipelineItem], live: bool) -> Result<Self, GStreamerInputError> {
    gst::init()?;

    let basic_pipeline = items
      .iter()
      .map(PipelineItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    // 文件源不能丢帧，摄像头只保留最新的帧
    let sink = if live {
      "appsink max-buffers=2 drop=true name=sink"
    } else {
      "appsink sync=false name=sink"
    };
    let full_pipeline = format!("{} ! {}", basic_pipeline, sink);
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    let sample = match appsink.pull_sample() {
      Ok(sample) => sample,
      Err(e) => {
        let _ = pipeline.set_state(gst::State::Null);
        return Err(GStreamerInputError::PipelineError(format!(
          "无法获取第一帧: {}",
          e
        )));
      }
    };
    let fps = sample
      .caps()
      .and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok())
      .map(|info| info.fps())
      .filter(|fps| fps.numer() > 0 && fps.denom() > 0)
      .map(|fps| fps.numer() as f64 / fps.denom() as f64);
    let first = sample_to_image(&sample)?;

    Ok(Self {
      pipeline,
      appsink,
      width: first.width(),
      height: first.height(),
      fps,
      pending: Some(first),
      frames_read: 0,
      open: true,
    })
  }

  fn duration_secs(&self) -> Option<f64> {
    self
      .pipeline
      .query_duration::<gst::ClockTime>()
      .map(|d| d.nseconds() as f64 / 1e9)
  }

  fn read(&mut self) -> Option<RgbImage> {
    if !self.open {
      return None;
    }
    let frame = match self.pending.take() {
      Some(frame) => frame,
      None => {
        // EOS 时 pull_sample 返回错误
        let sample = match self.appsink.pull_sample() {
          Ok(sample) => sample,
          Err(_) if self.appsink.is_eos() => {
            debug!("GStreamer 输入结束");
            return None;
          }
          Err(e) => {
            error!("Failed to pull sample: {}", e);
            return None;
          }
        };
        match sample_to_image(&sample) {
          Ok(frame) => frame,
          Err(e) => {
            error!("Failed to fetch sample: {}", e);
            return None;
          }
        }
      }
    };
    self.frames_read += 1;
    Some(frame)
  }

  fn release(&mut self) {
    if self.open {
      self.open = false;
      self.pending = None;
      if let Err(e) = self.pipeline.set_state(gst::State::Null) {
        warn!("Failed to stop GStreamer pipeline: {}", e);
      }
    }
  }
}

impl Drop for AppSinkPipeline {
  fn drop(&mut self) {
    self.release();
  }
}

fn sample_to_image(sample: &gst::Sample) -> Result<RgbImage, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;
  let row = width * 3;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  let expected_size = stride * height.saturating_sub(1) + row;
  if data.len() < expected_size {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected: expected_size,
      actual: data.len(),
    });
  }

  let swap = match video_info.format() {
    gst_video::VideoFormat::Rgb => false,
    gst_video::VideoFormat::Bgr => true,
    _ => return Err(GStreamerInputError::UnsupportedFormat),
  };

  let mut pixels = Vec::with_capacity(row * height);
  for y in 0..height {
    let line = &data[y * stride..y * stride + row];
    if swap {
      for px in line.chunks_exact(3) {
        pixels.extend_from_slice(&[px[2], px[1], px[0]]);
      }
    } else {
      pixels.extend_from_slice(line);
    }
  }

  RgbImage::from_raw(width as u32, height as u32, pixels)
    .ok_or_else(|| GStreamerInputError::PipelineError("无法创建 RGB 图像".to_string()))
}

/// 视频文件输入
pub struct GStreamerFileSource {
  path: PathBuf,
  inner: AppSinkPipeline,
  frame_count: i64,
}

impl GStreamerFileSource {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, GStreamerInputError> {
    Self::open_with(path.as_ref(), None)
  }

  fn open_with(path: &Path, rotate: Option<&str>) -> Result<Self, GStreamerInputError> {
    if !path.exists() {
      return Err(GStreamerInputError::NotFound(path.to_path_buf()));
    }
    let mut items = vec![PipelineItem::FileSource(path.display().to_string())];
    items.push(PipelineItem::TargetFormat);
    if let Some(flip) = video_flip(rotate) {
      items.push(flip);
    }

    let inner = AppSinkPipeline::launch(&items, false)?;
    // 时长未知时总帧数记为 0
    let frame_count = match (inner.duration_secs(), inner.fps) {
      (Some(secs), Some(fps)) => (secs * fps).round() as i64,
      _ => 0,
    };
    info!(
      "视频文件 {}: {}x{} @ {:.2} fps, {} 帧",
      path.display(),
      inner.width,
      inner.height,
      inner.fps.unwrap_or(0.0),
      frame_count
    );

    Ok(Self {
      path: path.to_path_buf(),
      inner,
      frame_count,
    })
  }
}

impl FromUrl for GStreamerFileSource {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != GSTREAMER_INPUT_SCHEME || url.host_str() != Some("file") {
      return Err(GStreamerInputError::SchemeMismatch);
    }
    let query = query_map(url);
    Self::open_with(
      Path::new(&url_path(url)),
      query.get("rotate").map(String::as_str),
    )
  }
}

impl FromUrlWithScheme for GStreamerFileSource {
  const SCHEME: &'static str = GSTREAMER_INPUT_SCHEME;
}

impl VideoSource for GStreamerFileSource {
  fn read(&mut self) -> Option<RgbImage> {
    self.inner.read()
  }

  fn properties(&self) -> SourceProperties {
    SourceProperties {
      width: self.inner.width,
      height: self.inner.height,
      fps: self.inner.fps.unwrap_or(0.0),
      frame_count: self.frame_count,
      current_frame: self.inner.frames_read,
      kind: SourceKind::File {
        path: self.path.clone(),
      },
    }
  }

  fn release(&mut self) {
    self.inner.release();
  }

  fn is_open(&self) -> bool {
    self.inner.open
  }
}

/// 摄像头输入（v4l2src）
pub struct GStreamerCameraSource {
  device: String,
  inner: AppSinkPipeline,
}

impl GStreamerCameraSource {
  pub fn open(device: &str) -> Result<Self, GStreamerInputError> {
    Self::open_with(device, &HashMap::new())
  }

  fn open_with(device: &str, query: &HashMap<String, String>) -> Result<Self, GStreamerInputError> {
    let parse = |key: &str| query.get(key).and_then(|v| v.parse::<u32>().ok());
    let mut items = vec![PipelineItem::CameraSource {
      camera: device.to_string(),
      width: parse("width"),
      height: parse("height"),
      fps: parse("fps"),
    }];
    items.push(PipelineItem::TargetFormat);
    if let Some(flip) = video_flip(query.get("rotate").map(String::as_str)) {
      items.push(flip);
    }

    let inner = AppSinkPipeline::launch(&items, true)?;
    info!(
      "摄像头 {}: {}x{} @ {:.2} fps",
      device,
      inner.width,
      inner.height,
      inner.fps.unwrap_or(DEFAULT_CAMERA_FPS)
    );
    Ok(Self {
      device: device.to_string(),
      inner,
    })
  }
}

impl FromUrl for GStreamerCameraSource {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != GSTREAMER_INPUT_SCHEME || url.host_str() != Some("camera") {
      return Err(GStreamerInputError::SchemeMismatch);
    }
    Self::open_with(&url_path(url), &query_map(url))
  }
}

impl FromUrlWithScheme for GStreamerCameraSource {
  const SCHEME: &'static str = GSTREAMER_INPUT_SCHEME;
}

impl VideoSource for GStreamerCameraSource {
  fn read(&mut self) -> Option<RgbImage> {
    self.inner.read()
  }

  fn properties(&self) -> SourceProperties {
    SourceProperties {
      width: self.inner.width,
      height: self.inner.height,
      fps: self.inner.fps.unwrap_or(DEFAULT_CAMERA_FPS),
      frame_count: LIVE_FRAME_COUNT,
      current_frame: self.inner.frames_read,
      kind: SourceKind::Camera {
        device: self.device.clone(),
      },
    }
  }

  fn release(&mut self) {
    self.inner.release();
  }

  fn is_open(&self) -> bool {
    self.inner.open
  }
}
