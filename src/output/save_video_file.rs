// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/output/save_video_file.rs - 通过 ffmpeg 保存视频文件
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

//! 视频文件输出
//!
//! 帧先以 PNG 序列缓存在输出文件旁的 `<output>.frames` 目录，
//! `finish` 时调用 ffmpeg 命令行编码为 H.264，随后删除缓存目录。
//!
//! 需要系统安装 ffmpeg 命令行工具。

use std::path::{Path, PathBuf};
use std::process::Command;

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{OutputError, VideoWriter};

#[derive(Error, Debug)]
pub enum SaveVideoFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("视频编码错误: {0}")]
  EncodingError(String),
  #[error("参数验证错误: {0}")]
  ValidationError(String),
}

const MIN_FPS: f64 = 1.0;
const MAX_FPS: f64 = 240.0;

/// 视频帧缓存
struct FrameBuffer {
  temp_dir: PathBuf,
  frames: usize,
  size: Option<(u32, u32)>,
}

impl FrameBuffer {
  fn new(output_path: &Path) -> Result<Self, SaveVideoFileError> {
    let mut temp_dir = output_path.as_os_str().to_owned();
    temp_dir.push(".frames");
    let temp_dir = PathBuf::from(temp_dir);
    std::fs::create_dir_all(&temp_dir)?;

    Ok(FrameBuffer {
      temp_dir,
      frames: 0,
      size: None,
    })
  }

  fn add_frame(&mut self, image: &RgbImage) -> Result<(), SaveVideoFileError> {
    let size = image.dimensions();
    match self.size {
      None => self.size = Some(size),
      Some(expected) if expected != size => {
        return Err(SaveVideoFileError::ValidationError(format!(
          "帧尺寸 {:?} 与首帧 {:?} 不一致",
          size, expected
        )));
      }
      Some(_) => {}
    }

    let frame_path = self.temp_dir.join(format!("frame_{:06}.png", self.frames));
    image.save(&frame_path)?;
    self.frames += 1;

    Ok(())
  }

  fn encode_to_video(&self, output_path: &Path, fps: f64) -> Result<(), SaveVideoFileError> {
    if self.frames == 0 {
      info!("没有帧可以编码为视频，跳过编码过程");
      return Ok(());
    }

    info!(
      "开始编码视频: {} 帧 @ {} fps -> {}",
      self.frames,
      fps,
      output_path.display()
    );

    if let Some(parent) = output_path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let ffmpeg_result = Command::new("ffmpeg")
      .arg("-y")
      .arg("-loglevel")
      .arg("error")
      .arg("-framerate")
      .arg(fps.to_string())
      .arg("-i")
      .arg(self.temp_dir.join("frame_%06d.png"))
      // yuv420p 要求宽高为偶数
      .arg("-vf")
      .arg("pad=ceil(iw/2)*2:ceil(ih/2)*2")
      .arg("-c:v")
      .arg("libx264")
      .arg("-pix_fmt")
      .arg("yuv420p")
      .arg("-preset")
      .arg("fast")
      .arg("-crf")
      .arg("23")
      .arg(output_path)
      .output();

    match ffmpeg_result {
      Ok(output) => {
        if output.status.success() {
          info!("视频编码成功: {}", output_path.display());
          Ok(())
        } else {
          let stderr = String::from_utf8_lossy(&output.stderr);
          error!("ffmpeg 错误: {}", stderr);
          Err(SaveVideoFileError::EncodingError(format!(
            "ffmpeg 失败: {}",
            stderr
          )))
        }
      }
      Err(e) => {
        error!("无法执行 ffmpeg: {}", e);
        Err(SaveVideoFileError::EncodingError(format!(
          "无法执行 ffmpeg (请确保已安装): {}",
          e
        )))
      }
    }
  }

  fn cleanup(&self) {
    if let Err(e) = std::fs::remove_dir_all(&self.temp_dir) {
      warn!("清理临时目录失败: {}", e);
    }
  }
}

/// RAII 守卫确保清理总是执行
struct CleanupGuard<'a>(&'a FrameBuffer);

impl<'a> Drop for CleanupGuard<'a> {
  fn drop(&mut self) {
    self.0.cleanup();
  }
}

pub struct SaveVideoFileOutput {
  path: PathBuf,
  fps: f64,
  buffer: Option<FrameBuffer>,
  finished: bool,
}

impl SaveVideoFileOutput {
  pub fn new(path: impl AsRef<Path>, fps: f64) -> Result<Self, SaveVideoFileError> {
    if !(MIN_FPS..=MAX_FPS).contains(&fps) {
      return Err(SaveVideoFileError::ValidationError(format!(
        "FPS {} 超出有效范围 [{}, {}]",
        fps, MIN_FPS, MAX_FPS
      )));
    }
    Ok(SaveVideoFileOutput {
      path: path.as_ref().to_path_buf(),
      fps,
      buffer: None,
      finished: false,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn frames_written(&self) -> usize {
    self.buffer.as_ref().map_or(0, |b| b.frames)
  }

  fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SaveVideoFileError> {
    if self.finished {
      return Err(SaveVideoFileError::ValidationError(
        "视频已完成编码，不能继续写入".to_string(),
      ));
    }
    if self.buffer.is_none() {
      self.buffer = Some(FrameBuffer::new(&self.path)?);
      debug!("初始化视频帧缓冲区: {}", self.path.display());
    }
    match self.buffer.as_mut() {
      Some(buffer) => buffer.add_frame(frame),
      None => Ok(()),
    }
  }

  fn finish_encoding(&mut self) -> Result<(), SaveVideoFileError> {
    if self.finished {
      return Ok(());
    }
    self.finished = true;
    match self.buffer.take() {
      Some(buffer) => {
        let _cleanup = CleanupGuard(&buffer);
        buffer.encode_to_video(&self.path, self.fps)
      }
      None => Ok(()),
    }
  }
}

impl VideoWriter for SaveVideoFileOutput {
  fn write(&mut self, frame: &RgbImage) -> Result<(), OutputError> {
    Ok(self.write_frame(frame)?)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    Ok(self.finish_encoding()?)
  }
}

impl Drop for SaveVideoFileOutput {
  fn drop(&mut self) {
    if let Err(e) = self.finish_encoding() {
      error!("编码视频时出错: {}", e);
    }
  }
}
