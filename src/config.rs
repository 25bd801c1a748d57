// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/config.rs - 配置文件
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

//! # 配置
//!
//! 配置文件为 JSON 格式，所有字段都有默认值，只需写出需要覆盖的部分：
//!
//! ```json
//! {
//!   "detector": { "detections": "video.dets.jsonl", "confidence_threshold": 0.4 },
//!   "tracker": { "tracks": "video.tracks.jsonl", "trajectory_capacity": 500 },
//!   "visualizer": { "trajectory_length": 30, "show_heatmap": true }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::detector::DetectionFilter;
use crate::heatmap::HeatmapConfig;
use crate::output::draw::RendererConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("配置文件格式错误 {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct TrajectorConfig {
  pub detector: DetectorConfig,
  pub tracker: TrackerConfig,
  pub visualizer: VisualizerConfig,
}

impl TrajectorConfig {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    info!("已加载配置文件: {}", path.display());
    Ok(config)
  }

  /// 配置文件存在时加载，否则使用默认配置
  pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    if path.exists() {
      Self::load(path)
    } else {
      info!("配置文件 {} 不存在，使用默认配置", path.display());
      Ok(Self::default())
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DetectorConfig {
  /// 外部检测器离线输出（JSON lines）
  pub detections: Option<PathBuf>,
  pub classes: Option<Vec<u32>>,
  pub confidence_threshold: f32,
}

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      detections: None,
      classes: None,
      confidence_threshold: 0.5,
    }
  }
}

impl DetectorConfig {
  pub fn filter(&self) -> DetectionFilter {
    DetectionFilter {
      classes: self.classes.clone(),
      confidence_threshold: self.confidence_threshold,
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TrackerConfig {
  /// 外部跟踪器离线输出（JSON lines）
  pub tracks: Option<PathBuf>,
  /// 每个身份保留的最大轨迹点数，None 表示不限制
  pub trajectory_capacity: Option<usize>,
  pub track_threshold: f32,
  pub lost_track_buffer: usize,
  pub match_threshold: f32,
  pub activation_threshold: f32,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      tracks: None,
      trajectory_capacity: None,
      track_threshold: 0.25,
      lost_track_buffer: 30,
      match_threshold: 0.8,
      activation_threshold: 0.25,
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct VisualizerConfig {
  pub trajectory_length: usize,
  pub trajectory_thickness: u32,
  pub show_bbox: bool,
  pub show_id: bool,
  pub show_trajectory: bool,
  pub font_path: Option<PathBuf>,
  pub show_heatmap: bool,
  pub heatmap_alpha: f32,
  pub heatmap_update_interval: u32,
  pub heatmap_decay: f32,
  pub heatmap_radius: i32,
  pub heatmap_blur_sigma: f32,
}

impl Default for VisualizerConfig {
  fn default() -> Self {
    let renderer = RendererConfig::default();
    let heatmap = HeatmapConfig::default();
    Self {
      trajectory_length: renderer.trajectory_length,
      trajectory_thickness: renderer.trajectory_thickness,
      show_bbox: renderer.show_bbox,
      show_id: renderer.show_id,
      show_trajectory: renderer.show_trajectory,
      font_path: None,
      show_heatmap: heatmap.enabled,
      heatmap_alpha: heatmap.alpha,
      heatmap_update_interval: heatmap.update_interval,
      heatmap_decay: heatmap.decay_factor,
      heatmap_radius: heatmap.stamp_radius,
      heatmap_blur_sigma: heatmap.blur_sigma,
    }
  }
}

impl VisualizerConfig {
  pub fn renderer(&self) -> RendererConfig {
    RendererConfig {
      trajectory_length: self.trajectory_length,
      trajectory_thickness: self.trajectory_thickness,
      show_bbox: self.show_bbox,
      show_id: self.show_id,
      show_trajectory: self.show_trajectory,
    }
  }

  pub fn heatmap(&self) -> HeatmapConfig {
    HeatmapConfig {
      enabled: self.show_heatmap,
      alpha: self.heatmap_alpha.clamp(0.0, 1.0),
      update_interval: self.heatmap_update_interval.max(1),
      decay_factor: self.heatmap_decay.clamp(0.0, 1.0),
      stamp_radius: self.heatmap_radius,
      blur_sigma: self.heatmap_blur_sigma,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_config_keeps_defaults() {
    let json = r#"{ "visualizer": { "trajectory_length": 12, "show_heatmap": true } }"#;
    let config: TrajectorConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.visualizer.trajectory_length, 12);
    assert!(config.visualizer.show_heatmap);
    assert!(config.visualizer.show_bbox);
    assert_eq!(config.detector.confidence_threshold, 0.5);
    assert!(config.tracker.trajectory_capacity.is_none());
  }

  #[test]
  fn test_heatmap_settings_are_clamped() {
    let config = VisualizerConfig {
      heatmap_alpha: 3.0,
      heatmap_decay: -1.0,
      heatmap_update_interval: 0,
      ..Default::default()
    };
    let heatmap = config.heatmap();
    assert_eq!(heatmap.alpha, 1.0);
    assert_eq!(heatmap.decay_factor, 0.0);
    assert_eq!(heatmap.update_interval, 1);
  }

  #[test]
  fn test_missing_config_falls_back_to_default() {
    let config = TrajectorConfig::load_or_default("/nonexistent/trajector.json").unwrap();
    assert_eq!(config.visualizer.trajectory_length, 50);
  }
}
