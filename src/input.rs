// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/input.rs - 视频输入源
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

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::FromUrl;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageSequenceError, ImageSequenceSource};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerCameraSource, GStreamerFileSource, GStreamerInputError};

#[cfg(feature = "v4l2_input")]
mod v4l2_source;
#[cfg(feature = "v4l2_input")]
pub use self::v4l2_source::{V4l2Source, V4l2SourceError};

/// 直播源没有总帧数
pub const LIVE_FRAME_COUNT: i64 = -1;

/// 摄像头未报告帧率时的默认值
pub const DEFAULT_CAMERA_FPS: f64 = 30.0;

/// 输入源类型
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
  File { path: PathBuf },
  Camera { device: String },
}

/// 输入源属性
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SourceProperties {
  pub width: u32,
  pub height: u32,
  pub fps: f64,
  /// 总帧数，直播源为 -1
  pub frame_count: i64,
  /// 已读取的帧数
  pub current_frame: u64,
  #[serde(flatten)]
  pub kind: SourceKind,
}

impl SourceProperties {
  pub fn is_live(&self) -> bool {
    self.frame_count < 0
  }
}

/// 视频输入源
///
/// 文件源和直播源共用同一套接口，流水线不区分二者。
pub trait VideoSource {
  /// 读取下一帧，结束或采集失败时返回 `None`
  fn read(&mut self) -> Option<RgbImage>;

  fn properties(&self) -> SourceProperties;

  /// 释放底层资源，可重复调用
  fn release(&mut self);

  fn is_open(&self) -> bool;
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
  fn read(&mut self) -> Option<RgbImage> {
    (**self).read()
  }

  fn properties(&self) -> SourceProperties {
    (**self).properties()
  }

  fn release(&mut self) {
    (**self).release()
  }

  fn is_open(&self) -> bool {
    (**self).is_open()
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[error("输入不存在: {0}")]
  NotFound(PathBuf),
  #[cfg(feature = "read_image_file")]
  #[error("图像序列输入错误: {0}")]
  ImageSequenceError(#[from] ImageSequenceError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[cfg(feature = "v4l2_input")]
  #[error("V4L2 输入错误: {0}")]
  V4l2SourceError(#[from] V4l2SourceError),
  #[error("URL 解析错误: {0}")]
  UrlError(#[from] url::ParseError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("不支持的输入 {0}，请启用 {1} 特性")]
  Unsupported(String, &'static str),
}

pub enum SourceWrapper {
  #[cfg(feature = "read_image_file")]
  ImageSequence(ImageSequenceSource),
  #[cfg(feature = "gstreamer_input")]
  GStreamerFile(GStreamerFileSource),
  #[cfg(feature = "gstreamer_input")]
  GStreamerCamera(GStreamerCameraSource),
  #[cfg(feature = "v4l2_input")]
  V4l2(V4l2Source),
}

impl FromUrl for SourceWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageSequenceSource::SCHEME {
        return Ok(SourceWrapper::ImageSequence(ImageSequenceSource::from_url(url)?));
      }
    }
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerFileSource::SCHEME {
        return match url.host_str() {
          Some("camera") => Ok(SourceWrapper::GStreamerCamera(
            GStreamerCameraSource::from_url(url)?,
          )),
          _ => Ok(SourceWrapper::GStreamerFile(GStreamerFileSource::from_url(url)?)),
        };
      }
    }
    #[cfg(feature = "v4l2_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4l2Source::SCHEME {
        return Ok(SourceWrapper::V4l2(V4l2Source::from_url(url)?));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

macro_rules! dispatch {
  ($self:expr, $source:ident => $body:expr) => {
    match $self {
      #[cfg(feature = "read_image_file")]
      SourceWrapper::ImageSequence($source) => $body,
      #[cfg(feature = "gstreamer_input")]
      SourceWrapper::GStreamerFile($source) => $body,
      #[cfg(feature = "gstreamer_input")]
      SourceWrapper::GStreamerCamera($source) => $body,
      #[cfg(feature = "v4l2_input")]
      SourceWrapper::V4l2($source) => $body,
    }
  };
}

impl VideoSource for SourceWrapper {
  fn read(&mut self) -> Option<RgbImage> {
    dispatch!(self, source => source.read())
  }

  fn properties(&self) -> SourceProperties {
    dispatch!(self, source => source.properties())
  }

  fn release(&mut self) {
    dispatch!(self, source => source.release())
  }

  fn is_open(&self) -> bool {
    dispatch!(self, source => source.is_open())
  }
}

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

pub(crate) fn is_image_path(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
    .unwrap_or(false)
}

/// 从 URL、设备路径、摄像头编号或文件路径打开输入源
///
/// - `frames://`、`gst://`、`v4l2://` 开头的按 URL 解析
/// - 纯数字视为摄像头编号，对应 `/dev/video<N>`
/// - `/dev/video*` 为摄像头
/// - 目录或图片文件为图像序列
/// - 其他文件交给 GStreamer 解码
pub fn open_source(input: &str) -> Result<SourceWrapper, InputError> {
  if input.contains("://") {
    let url = url::Url::parse(input)?;
    return SourceWrapper::from_url(&url);
  }

  if input.parse::<u32>().is_ok() || input.starts_with("/dev/video") {
    return open_camera(input);
  }

  let path = Path::new(input);
  if !path.exists() {
    return Err(InputError::NotFound(path.to_path_buf()));
  }

  if path.is_dir() || is_image_path(path) {
    #[cfg(feature = "read_image_file")]
    {
      info!("打开图像序列: {}", path.display());
      return Ok(SourceWrapper::ImageSequence(ImageSequenceSource::open(path)?));
    }
    #[cfg(not(feature = "read_image_file"))]
    return Err(InputError::Unsupported(input.to_string(), "read_image_file"));
  }

  #[cfg(feature = "gstreamer_input")]
  {
    info!("打开视频文件: {}", path.display());
    Ok(SourceWrapper::GStreamerFile(GStreamerFileSource::open(path)?))
  }
  #[cfg(not(feature = "gstreamer_input"))]
  Err(InputError::Unsupported(input.to_string(), "gstreamer_input"))
}

/// 摄像头编号映射为 `/dev/video<N>`，其他输入原样返回
pub fn camera_device(camera: &str) -> String {
  match camera.parse::<u32>() {
    Ok(index) => format!("/dev/video{}", index),
    Err(_) => camera.to_string(),
  }
}

/// 由摄像头编号、设备路径或 URL 打开摄像头
pub fn open_camera(camera: &str) -> Result<SourceWrapper, InputError> {
  if camera.contains("://") {
    let url = url::Url::parse(camera)?;
    return SourceWrapper::from_url(&url);
  }
  open_device(&camera_device(camera))
}

/// 打开摄像头设备，优先使用 V4L2，其次 GStreamer
fn open_device(device: &str) -> Result<SourceWrapper, InputError> {
  #[cfg(feature = "v4l2_input")]
  {
    info!("打开 V4L2 摄像头: {}", device);
    Ok(SourceWrapper::V4l2(V4l2Source::open(device)?))
  }
  #[cfg(all(not(feature = "v4l2_input"), feature = "gstreamer_input"))]
  {
    info!("打开 GStreamer 摄像头: {}", device);
    Ok(SourceWrapper::GStreamerCamera(GStreamerCameraSource::open(device)?))
  }
  #[cfg(not(any(feature = "v4l2_input", feature = "gstreamer_input")))]
  Err(InputError::Unsupported(device.to_string(), "v4l2_input"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_missing_file_fails_at_open() {
    let err = open_source("/nonexistent/clip.mp4").err().unwrap();
    assert!(matches!(err, InputError::NotFound(_)));
  }

  #[test]
  fn test_unknown_scheme() {
    let err = open_source("rtmp://example.com/live").err().unwrap();
    assert!(matches!(err, InputError::SchemeMismatch));
  }

  #[test]
  fn test_camera_index_maps_to_device() {
    assert_eq!(camera_device("0"), "/dev/video0");
    assert_eq!(camera_device("12"), "/dev/video12");
    assert_eq!(camera_device("/dev/video2"), "/dev/video2");
  }

  #[test]
  fn test_camera_url_goes_through_scheme_dispatch() {
    let err = open_camera("rtmp://example.com/live").err().unwrap();
    assert!(matches!(err, InputError::SchemeMismatch));
  }

  #[cfg(not(any(feature = "v4l2_input", feature = "gstreamer_input")))]
  #[test]
  fn test_default_camera_opens_video0() {
    let err = open_camera("0").err().unwrap();
    assert!(matches!(err, InputError::Unsupported(ref device, _) if device == "/dev/video0"));
  }

  #[test]
  fn test_image_extension_detection() {
    assert!(is_image_path(Path::new("a/b/frame.PNG")));
    assert!(!is_image_path(Path::new("clip.mp4")));
  }

  #[test]
  fn test_properties_serialize_flat() {
    let props = SourceProperties {
      width: 640,
      height: 480,
      fps: 30.0,
      frame_count: LIVE_FRAME_COUNT,
      current_frame: 0,
      kind: SourceKind::Camera {
        device: "/dev/video0".to_string(),
      },
    };
    let value = serde_json::to_value(&props).unwrap();
    assert_eq!(value["type"], "camera");
    assert_eq!(value["frame_count"], -1);
    assert!(props.is_live());
  }
}
