// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/input/v4l2_source.rs - V4L2 摄像头输入源
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

use std::pin::Pin;

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use super::{DEFAULT_CAMERA_FPS, LIVE_FRAME_COUNT, SourceKind, SourceProperties, VideoSource};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum V4l2SourceError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("无法打开设备 {device}: {source}")]
  OpenError {
    device: String,
    #[source]
    source: std::io::Error,
  },
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
}

const V4L2_SCHEME: &str = "v4l2";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

/// V4L2 摄像头输入源，以 YUYV 采集并转换为 RGB
///
/// v4l 的 Stream 需要引用 Device，Device 放在 Pin<Box> 中保证地址稳定，
/// 从而可以创建引用它的 Stream。
pub struct V4l2Source {
  device_path: String,
  // 字段顺序即 drop 顺序：stream 必须先于 device 释放
  stream: Option<Stream<'static>>,
  device: Option<Pin<Box<Device>>>,
  frame_index: u64,
  width: u32,
  height: u32,
  fps: f64,
}

impl V4l2Source {
  pub fn open(device_path: &str) -> Result<Self, V4l2SourceError> {
    Self::open_with_size(device_path, DEFAULT_WIDTH, DEFAULT_HEIGHT)
  }

  pub fn open_with_size(
    device_path: &str,
    width: u32,
    height: u32,
  ) -> Result<Self, V4l2SourceError> {
    let device = Box::pin(Device::with_path(device_path).map_err(|source| {
      V4l2SourceError::OpenError {
        device: device_path.to_string(),
        source,
      }
    })?);

    let mut format = device.format()?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format)?;

    let fps = device
      .params()
      .ok()
      .map(|params| params.interval)
      .filter(|interval| interval.numerator > 0)
      .map(|interval| interval.denominator as f64 / interval.numerator as f64)
      .unwrap_or(DEFAULT_CAMERA_FPS);

    // SAFETY: device 被 Pin<Box> 固定在堆上，不会移动；
    // stream 在 release 和 drop 中总是先于 device 释放。
    let device_ref: &Device = &device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, 4)?
    };

    info!(
      "V4L2 设备 {}: {}x{} @ {:.1} fps",
      device_path, format.width, format.height, fps
    );

    Ok(Self {
      device_path: device_path.to_string(),
      stream: Some(stream),
      device: Some(device),
      frame_index: 0,
      width: format.width,
      height: format.height,
      fps,
    })
  }
}

/// 将 YUYV 格式转换为 RGB
pub(crate) fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  for chunk in yuyv.chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

impl FromUrl for V4l2Source {
  type Error = V4l2SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != V4L2_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        V4L2_SCHEME,
        url.scheme()
      );
      return Err(V4l2SourceError::SchemaMismatch);
    }

    // v4l2:///dev/video0?width=1280&height=720
    let device_path = if url.path().is_empty() || url.path() == "/" {
      "/dev/video0".to_string()
    } else {
      url.path().to_string()
    };
    let query = |key: &str| {
      url
        .query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse::<u32>().ok())
    };

    Self::open_with_size(
      &device_path,
      query("width").unwrap_or(DEFAULT_WIDTH),
      query("height").unwrap_or(DEFAULT_HEIGHT),
    )
  }
}

impl FromUrlWithScheme for V4l2Source {
  const SCHEME: &'static str = V4L2_SCHEME;
}

impl VideoSource for V4l2Source {
  fn read(&mut self) -> Option<RgbImage> {
    let stream = self.stream.as_mut()?;

    match stream.next() {
      Ok((buffer, _meta)) => {
        let rgb = yuyv_to_rgb(buffer, self.width, self.height);
        match RgbImage::from_raw(self.width, self.height, rgb) {
          Some(image) => {
            self.frame_index += 1;
            Some(image)
          }
          None => {
            error!("无法创建 RGB 图像: 缓冲区大小 {}", buffer.len());
            None
          }
        }
      }
      Err(e) => {
        error!("无法捕获帧: {}", e);
        None
      }
    }
  }

  fn properties(&self) -> SourceProperties {
    SourceProperties {
      width: self.width,
      height: self.height,
      fps: self.fps,
      frame_count: LIVE_FRAME_COUNT,
      current_frame: self.frame_index,
      kind: SourceKind::Camera {
        device: self.device_path.clone(),
      },
    }
  }

  fn release(&mut self) {
    if self.stream.take().is_some() {
      debug!("释放 V4L2 设备: {}", self.device_path);
    }
    self.device.take();
  }

  fn is_open(&self) -> bool {
    self.stream.is_some()
  }
}

impl Drop for V4l2Source {
  fn drop(&mut self) {
    self.release();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_yuyv_gray() {
    // U = V = 128 时为灰度
    let rgb = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1);
    assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
  }
}
