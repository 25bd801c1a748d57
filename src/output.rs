// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/output.rs - 输出定义
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
use thiserror::Error;
use tracing::info;

pub mod draw;

mod save_video_file;
pub use self::save_video_file::{SaveVideoFileError, SaveVideoFileOutput};

#[cfg(feature = "gstreamer_output")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_video_output::{GStreamerVideoOutput, GStreamerVideoOutputError};

#[cfg(feature = "gstreamer_output")]
mod preview;
#[cfg(feature = "gstreamer_output")]
pub use self::preview::{GStreamerPreview, PreviewError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("保存视频文件错误: {0}")]
  SaveVideoFileError(#[from] SaveVideoFileError),
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer 视频输出错误: {0}")]
  GStreamerVideoOutputError(#[from] GStreamerVideoOutputError),
  #[cfg(feature = "gstreamer_output")]
  #[error("预览窗口错误: {0}")]
  PreviewError(#[from] PreviewError),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("不支持的输出，请启用 {0} 特性")]
  Unsupported(&'static str),
}

/// 视频写出
pub trait VideoWriter {
  /// 写入一帧
  fn write(&mut self, frame: &RgbImage) -> Result<(), OutputError>;

  /// 完成写入，可重复调用
  fn finish(&mut self) -> Result<(), OutputError>;
}

impl<W: VideoWriter + ?Sized> VideoWriter for Box<W> {
  fn write(&mut self, frame: &RgbImage) -> Result<(), OutputError> {
    (**self).write(frame)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    (**self).finish()
  }
}

/// 预览窗口的反馈
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewEvent {
  Continue,
  /// 用户按键
  Key(char),
  /// 窗口被关闭
  Closed,
}

impl PreviewEvent {
  /// `q` 或关闭窗口表示结束
  pub fn is_quit(&self) -> bool {
    matches!(self, PreviewEvent::Key('q') | PreviewEvent::Closed)
  }
}

/// 预览窗口
pub trait Preview {
  fn show(&mut self, frame: &RgbImage) -> Result<PreviewEvent, OutputError>;

  /// 关闭窗口，可重复调用
  fn close(&mut self);
}

impl<P: Preview + ?Sized> Preview for Box<P> {
  fn show(&mut self, frame: &RgbImage) -> Result<PreviewEvent, OutputError> {
    (**self).show(frame)
  }

  fn close(&mut self) {
    (**self).close()
  }
}

/// 按编译特性选择视频写出方式：GStreamer 优先，否则调用 ffmpeg 命令行
pub fn create_video_writer(
  path: impl AsRef<Path>,
  width: u32,
  height: u32,
  fps: f64,
) -> Result<Box<dyn VideoWriter>, OutputError> {
  let path = path.as_ref();
  #[cfg(feature = "gstreamer_output")]
  {
    Ok(Box::new(GStreamerVideoOutput::new(path, width, height, fps)?))
  }
  #[cfg(not(feature = "gstreamer_output"))]
  {
    info!("使用 ffmpeg 写出 {}x{} 视频: {}", width, height, path.display());
    Ok(Box::new(SaveVideoFileOutput::new(path, fps)?))
  }
}

/// 打开预览窗口
pub fn create_preview(title: &str) -> Result<Box<dyn Preview>, OutputError> {
  #[cfg(feature = "gstreamer_output")]
  {
    Ok(Box::new(GStreamerPreview::new(title)?))
  }
  #[cfg(not(feature = "gstreamer_output"))]
  {
    let _ = title;
    Err(OutputError::Unsupported("gstreamer_output"))
  }
}

/// `<stem>_tracked.<ext>`，与输入放在同一目录
pub fn default_output_path(input: &Path) -> PathBuf {
  let stem = input
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_else(|| "output".to_string());
  let name = match input.extension() {
    Some(ext) => format!("{}_tracked.{}", stem, ext.to_string_lossy()),
    None => format!("{}_tracked.mp4", stem),
  };
  input.with_file_name(name)
}

/// `<输出去掉扩展名>.heatmap.png`
pub fn heatmap_path(output: &Path) -> PathBuf {
  output.with_extension("heatmap.png")
}

/// 保存 PNG 图像，自动创建父目录
pub fn save_png(path: impl AsRef<Path>, image: &RgbImage) -> Result<(), OutputError> {
  let path = path.as_ref();
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      std::fs::create_dir_all(parent)?;
    }
  }
  image.save_with_format(path, image::ImageFormat::Png)?;
  info!("图像已保存: {}", path.display());
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_output_path() {
    assert_eq!(
      default_output_path(Path::new("videos/street.mp4")),
      PathBuf::from("videos/street_tracked.mp4")
    );
    assert_eq!(
      default_output_path(Path::new("frames")),
      PathBuf::from("frames_tracked.mp4")
    );
  }

  #[test]
  fn test_heatmap_path() {
    assert_eq!(
      heatmap_path(Path::new("out/street_tracked.mp4")),
      PathBuf::from("out/street_tracked.heatmap.png")
    );
  }

  #[test]
  fn test_preview_quit_events() {
    assert!(PreviewEvent::Key('q').is_quit());
    assert!(PreviewEvent::Closed.is_quit());
    assert!(!PreviewEvent::Key('s').is_quit());
    assert!(!PreviewEvent::Continue.is_quit());
  }

  #[test]
  fn test_save_png_creates_parent() {
    let dir = std::env::temp_dir().join(format!("trajector-png-{}", std::process::id()));
    let path = dir.join("nested/heatmap.png");
    save_png(&path, &RgbImage::new(4, 4)).unwrap();
    assert!(path.exists());
    std::fs::remove_dir_all(&dir).unwrap();
  }
}
