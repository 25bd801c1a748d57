// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/input/read_image_file.rs - 图像序列输入
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

use image::{ImageReader, RgbImage, imageops};
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use super::{SourceKind, SourceProperties, VideoSource, is_image_path};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum ImageSequenceError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("输入不存在: {0}")]
  NotFound(PathBuf),
  #[error("目录中没有图片: {0}")]
  Empty(PathBuf),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

const READ_IMAGE_FILE_SCHEME: &str = "frames";

/// 图像序列默认帧率
pub const DEFAULT_SEQUENCE_FPS: f64 = 25.0;

/// 把一个目录下的图片（按文件名排序）或单张图片当作视频读取
pub struct ImageSequenceSource {
  path: PathBuf,
  files: Vec<PathBuf>,
  index: usize,
  fps: f64,
  width: u32,
  height: u32,
  open: bool,
}

impl ImageSequenceSource {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageSequenceError> {
    let path = path.as_ref();
    if !path.exists() {
      return Err(ImageSequenceError::NotFound(path.to_path_buf()));
    }

    let files = if path.is_dir() {
      let mut files = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image_path(p))
        .collect::<Vec<_>>();
      files.sort();
      files
    } else {
      vec![path.to_path_buf()]
    };

    let first = files
      .first()
      .ok_or_else(|| ImageSequenceError::Empty(path.to_path_buf()))?;
    let (width, height) = image::image_dimensions(first)?;
    debug!(
      "图像序列 {}: {} 帧, {}x{}",
      path.display(),
      files.len(),
      width,
      height
    );

    Ok(Self {
      path: path.to_path_buf(),
      files,
      index: 0,
      fps: DEFAULT_SEQUENCE_FPS,
      width,
      height,
      open: true,
    })
  }

  pub fn with_fps(mut self, fps: f64) -> Self {
    if fps > 0.0 {
      self.fps = fps;
    }
    self
  }

  /// 跳转到指定帧，越界时返回 false
  pub fn seek(&mut self, frame_number: u64) -> bool {
    match usize::try_from(frame_number) {
      Ok(index) if index < self.files.len() && self.open => {
        self.index = index;
        true
      }
      _ => false,
    }
  }

  fn load(&self, path: &Path) -> Result<RgbImage, ImageSequenceError> {
    let image = ImageReader::open(path)?.decode()?.to_rgb8();
    if image.dimensions() == (self.width, self.height) {
      Ok(image)
    } else {
      warn!(
        "{} 尺寸 {:?} 与序列不一致，缩放到 {}x{}",
        path.display(),
        image.dimensions(),
        self.width,
        self.height
      );
      Ok(imageops::resize(
        &image,
        self.width,
        self.height,
        imageops::FilterType::Triangle,
      ))
    }
  }
}

impl FromUrl for ImageSequenceSource {
  type Error = ImageSequenceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != READ_IMAGE_FILE_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        READ_IMAGE_FILE_SCHEME,
        url.scheme()
      );
      return Err(ImageSequenceError::SchemaMismatch);
    }

    let path = urlencoding::decode(url.path())
      .map(|p| p.into_owned())
      .unwrap_or_else(|_| url.path().to_string());
    let fps = url
      .query_pairs()
      .find(|(k, _)| k == "fps")
      .and_then(|(_, v)| v.parse::<f64>().ok())
      .unwrap_or(DEFAULT_SEQUENCE_FPS);

    Ok(Self::open(path)?.with_fps(fps))
  }
}

impl FromUrlWithScheme for ImageSequenceSource {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl VideoSource for ImageSequenceSource {
  fn read(&mut self) -> Option<RgbImage> {
    if !self.open {
      return None;
    }
    let path = self.files.get(self.index)?.clone();
    self.index += 1;
    match self.load(&path) {
      Ok(image) => Some(image),
      Err(e) => {
        error!("无法读取帧 {}: {}", path.display(), e);
        None
      }
    }
  }

  fn properties(&self) -> SourceProperties {
    SourceProperties {
      width: self.width,
      height: self.height,
      fps: self.fps,
      frame_count: self.files.len() as i64,
      current_frame: self.index as u64,
      kind: SourceKind::File {
        path: self.path.clone(),
      },
    }
  }

  fn release(&mut self) {
    if self.open {
      debug!("释放图像序列: {}", self.path.display());
      self.open = false;
    }
  }

  fn is_open(&self) -> bool {
    self.open
  }
}

impl Drop for ImageSequenceSource {
  fn drop(&mut self) {
    self.release();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_frames(dir: &Path, count: u8) {
    std::fs::create_dir_all(dir).unwrap();
    for i in 0..count {
      let image = RgbImage::from_pixel(8, 6, image::Rgb([i * 10, 0, 0]));
      image.save(dir.join(format!("frame_{:03}.png", i))).unwrap();
    }
    std::fs::write(dir.join("notes.txt"), "not a frame").unwrap();
  }

  fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("trajector-{}-{}", name, std::process::id()))
  }

  #[test]
  fn test_reads_sorted_frames_until_exhausted() {
    let dir = temp_dir("sequence");
    write_frames(&dir, 3);

    let mut source = ImageSequenceSource::open(&dir).unwrap();
    let props = source.properties();
    assert_eq!((props.width, props.height), (8, 6));
    assert_eq!(props.frame_count, 3);
    assert_eq!(props.fps, DEFAULT_SEQUENCE_FPS);

    let reds: Vec<u8> = std::iter::from_fn(|| source.read())
      .map(|f| f.get_pixel(0, 0).0[0])
      .collect();
    assert_eq!(reds, vec![0, 10, 20]);
    assert_eq!(source.properties().current_frame, 3);

    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn test_release_is_idempotent() {
    let dir = temp_dir("release");
    write_frames(&dir, 2);

    let mut source = ImageSequenceSource::open(&dir).unwrap();
    source.release();
    source.release();
    assert!(!source.is_open());
    assert!(source.read().is_none());

    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn test_release_after_corrupt_frame() {
    let dir = temp_dir("corrupt");
    write_frames(&dir, 1);
    std::fs::write(dir.join("frame_001.png"), b"\x89PNG garbage").unwrap();

    let mut source = ImageSequenceSource::open(&dir).unwrap();
    assert_eq!(source.properties().frame_count, 2);
    assert!(source.read().is_some());
    assert!(source.read().is_none());
    assert_eq!(source.properties().current_frame, 2);

    source.release();
    source.release();
    assert!(!source.is_open());
    assert!(source.read().is_none());
    assert_eq!((source.properties().width, source.properties().height), (8, 6));
    drop(source);

    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn test_seek_and_url() {
    let dir = temp_dir("seek");
    write_frames(&dir, 3);

    let url = Url::parse(&format!("frames://{}?fps=12", dir.display())).unwrap();
    let mut source = ImageSequenceSource::from_url(&url).unwrap();
    assert_eq!(source.properties().fps, 12.0);
    assert!(source.seek(2));
    assert!(!source.seek(3));
    assert_eq!(source.read().unwrap().get_pixel(0, 0).0[0], 20);
    assert!(source.read().is_none());

    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn test_empty_directory() {
    let dir = temp_dir("empty");
    std::fs::create_dir_all(&dir).unwrap();
    assert!(matches!(
      ImageSequenceSource::open(&dir),
      Err(ImageSequenceError::Empty(_))
    ));
    std::fs::remove_dir_all(&dir).unwrap();
  }
}
