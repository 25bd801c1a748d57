// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/heatmap.rs - 轨迹密度热力图
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

//! # 热力图
//!
//! 把轨迹点累积为单通道强度场，经高斯模糊和归一化后按 jet 色带着色，
//! 再以半透明方式叠加到画面上。缓存的始终是未着色的原始强度场。

use image::{ImageBuffer, Luma, Rgb, RgbImage, imageops};
use imageproc::drawing::draw_filled_circle_mut;
use tracing::debug;

use crate::tracker::TrajectoryStore;

/// 单通道强度场
pub type HeatField = ImageBuffer<Luma<f32>, Vec<f32>>;

const NORMALIZE_EPSILON: f32 = 1e-8;

#[derive(Debug, Clone)]
pub struct HeatmapConfig {
  pub enabled: bool,
  /// 叠加不透明度，[0, 1]
  pub alpha: f32,
  /// 每隔多少次叠加重新生成一次热力图
  pub update_interval: u32,
  /// 上一次强度场保留的比例，[0, 1]
  pub decay_factor: f32,
  /// 每个轨迹点印章的半径（像素）
  pub stamp_radius: i32,
  pub blur_sigma: f32,
}

impl Default for HeatmapConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      alpha: 0.6,
      update_interval: 10,
      decay_factor: 0.95,
      stamp_radius: 20,
      blur_sigma: 3.5,
    }
  }
}

/// 热力图累积器
///
/// 持有衰减强度场缓存和最近一次着色结果。
pub struct HeatmapAccumulator {
  config: HeatmapConfig,
  field: Option<HeatField>,
  render: Option<RgbImage>,
  calls_since_render: u32,
}

impl Default for HeatmapAccumulator {
  fn default() -> Self {
    Self::new(HeatmapConfig::default())
  }
}

impl HeatmapAccumulator {
  pub fn new(config: HeatmapConfig) -> Self {
    Self {
      config,
      field: None,
      render: None,
      calls_since_render: 0,
    }
  }

  pub fn config(&self) -> &HeatmapConfig {
    &self.config
  }

  pub fn is_enabled(&self) -> bool {
    self.config.enabled
  }

  pub fn toggle(&mut self, enabled: bool) {
    self.config.enabled = enabled;
  }

  pub fn set_opacity(&mut self, alpha: f32) {
    self.config.alpha = alpha.clamp(0.0, 1.0);
  }

  pub fn set_decay_factor(&mut self, decay: f32) {
    self.config.decay_factor = decay.clamp(0.0, 1.0);
  }

  /// 清空强度场缓存和着色缓存
  pub fn reset_cache(&mut self) {
    self.field = None;
    self.render = None;
    self.calls_since_render = 0;
  }

  /// 衰减累积后的原始强度场
  pub fn cached_field(&self) -> Option<&HeatField> {
    self.field.as_ref()
  }

  /// 全部轨迹点的静态热力图，`shape` 为 (宽, 高)
  pub fn create_static_heatmap(&self, shape: (u32, u32), trajectories: &TrajectoryStore) -> RgbImage {
    let (width, height) = shape;
    let mut field = HeatField::new(width, height);
    for point in trajectories.points() {
      draw_filled_circle_mut(&mut field, *point, self.config.stamp_radius, Luma([1.0]));
    }

    let blurred = blur_field(&field, self.config.blur_sigma);
    let (min, max) = field_range(&blurred);
    let scale = max - min + NORMALIZE_EPSILON;
    colorize(&blurred, |v| (v - min) / scale)
  }

  /// 带时间衰减的热力图
  ///
  /// 第 i 个点（共 n 个）以强度 (i+1)/n 印章，新的贡献与
  /// `decay_factor` 倍的上一次强度场相加后缓存。
  pub fn create_decaying_heatmap(
    &mut self,
    shape: (u32, u32),
    trajectories: &TrajectoryStore,
  ) -> RgbImage {
    let (width, height) = shape;
    let mut fresh = HeatField::new(width, height);
    for (_, points) in trajectories.iter() {
      let n = points.len() as f32;
      for (i, point) in points.iter().enumerate() {
        let weight = (i + 1) as f32 / n;
        draw_filled_circle_mut(&mut fresh, *point, self.config.stamp_radius, Luma([weight]));
      }
    }

    let decay = self.config.decay_factor;
    let field = match self.field.take() {
      Some(previous) => {
        let previous = if previous.dimensions() == shape {
          previous
        } else {
          debug!("热力图尺寸变化 {:?} -> {:?}", previous.dimensions(), shape);
          resize_nearest(&previous, width, height)
        };
        let mut combined = fresh;
        for (out, prev) in combined.pixels_mut().zip(previous.pixels()) {
          out.0[0] += decay * prev.0[0];
        }
        combined
      }
      None => fresh,
    };

    let blurred = blur_field(&field, self.config.blur_sigma);
    self.field = Some(field);

    let (_, max) = field_range(&blurred);
    if max > 0.0 {
      colorize(&blurred, |v| v / max)
    } else {
      colorize(&blurred, |_| 0.0)
    }
  }

  /// 把热力图按不透明度叠加到画面上
  ///
  /// 每 `update_interval` 次调用才重新生成一次，其余调用复用上一次着色结果。
  /// `window` 为每个身份参与累积的最近点数。
  pub fn overlay(
    &mut self,
    frame: &RgbImage,
    trajectories: &TrajectoryStore,
    window: usize,
  ) -> RgbImage {
    if !self.config.enabled {
      return frame.clone();
    }

    let stale = self
      .render
      .as_ref()
      .is_none_or(|render| render.dimensions() != frame.dimensions());
    if stale || self.calls_since_render >= self.config.update_interval {
      let recent = trajectories.recent(window);
      self.render = Some(self.create_decaying_heatmap(frame.dimensions(), &recent));
      self.calls_since_render = 0;
    }
    self.calls_since_render += 1;

    let alpha = self.config.alpha;
    let mut out = frame.clone();
    if let Some(render) = self.render.as_ref() {
      for (pixel, heat) in out.pixels_mut().zip(render.pixels()) {
        for c in 0..3 {
          let blended = pixel.0[c] as f32 * (1.0 - alpha) + heat.0[c] as f32 * alpha;
          pixel.0[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
      }
    }
    out
  }
}

/// 高斯模糊，`sigma` 不大于 0 时原样返回
fn blur_field(field: &HeatField, sigma: f32) -> HeatField {
  if sigma <= 0.0 {
    return field.clone();
  }
  imageops::blur(field, sigma)
}

fn field_range(field: &HeatField) -> (f32, f32) {
  let mut values = field.pixels().map(|p| p.0[0]).filter(|v| v.is_finite());
  match values.next() {
    Some(first) => values.fold((first, first), |(min, max), v| (min.min(v), max.max(v))),
    None => (0.0, 0.0),
  }
}

fn resize_nearest(field: &HeatField, width: u32, height: u32) -> HeatField {
  let (src_w, src_h) = field.dimensions();
  if src_w == 0 || src_h == 0 {
    return HeatField::new(width, height);
  }
  HeatField::from_fn(width, height, |x, y| {
    let sx = (x as u64 * src_w as u64 / width as u64) as u32;
    let sy = (y as u64 * src_h as u64 / height as u64) as u32;
    *field.get_pixel(sx, sy)
  })
}

fn colorize(field: &HeatField, normalize: impl Fn(f32) -> f32) -> RgbImage {
  RgbImage::from_fn(field.width(), field.height(), |x, y| {
    jet(normalize(field.get_pixel(x, y).0[0]))
  })
}

/// jet 色带：0 为深蓝，1 为深红
pub fn jet(value: f32) -> Rgb<u8> {
  let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
  let channel = |offset: f32| {
    let c = (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
    (c * 255.0).round() as u8
  };
  Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store(points: &[(u64, Vec<(i32, i32)>)]) -> TrajectoryStore {
    points.iter().cloned().collect()
  }

  #[test]
  fn test_static_heatmap_on_empty_store_is_uniform() {
    let heatmap = HeatmapAccumulator::default();
    let image = heatmap.create_static_heatmap((32, 24), &TrajectoryStore::new());
    assert_eq!(image.dimensions(), (32, 24));
    let first = *image.get_pixel(0, 0);
    assert!(image.pixels().all(|p| *p == first));
    assert_eq!(first, jet(0.0));
  }

  #[test]
  fn test_static_heatmap_peaks_at_points() {
    let heatmap = HeatmapAccumulator::default();
    let trajectories = store(&[(1, vec![(50, 50)])]);
    let image = heatmap.create_static_heatmap((100, 100), &trajectories);
    assert_eq!(image.dimensions(), (100, 100));
    // 中心偏红，远角为底色
    assert!(image.get_pixel(50, 50).0[0] > 100);
    assert_eq!(*image.get_pixel(0, 0), jet(0.0));
  }

  #[test]
  fn test_zero_decay_equals_fresh_contribution() {
    let mut heatmap = HeatmapAccumulator::new(HeatmapConfig {
      decay_factor: 0.0,
      stamp_radius: 2,
      ..Default::default()
    });
    heatmap.create_decaying_heatmap((20, 20), &store(&[(1, vec![(5, 5)])]));
    heatmap.create_decaying_heatmap((20, 20), &store(&[(1, vec![(10, 10), (15, 15)])]));

    let field = heatmap.cached_field().unwrap();
    assert_eq!(field.get_pixel(5, 5).0[0], 0.0);
    assert_eq!(field.get_pixel(10, 10).0[0], 0.5);
    assert_eq!(field.get_pixel(15, 15).0[0], 1.0);
  }

  #[test]
  fn test_full_decay_without_contributions_keeps_field() {
    let mut heatmap = HeatmapAccumulator::new(HeatmapConfig {
      decay_factor: 1.0,
      ..Default::default()
    });
    heatmap.create_decaying_heatmap((40, 30), &store(&[(1, vec![(10, 10), (20, 20)])]));
    let before = heatmap.cached_field().unwrap().clone();

    heatmap.create_decaying_heatmap((40, 30), &TrajectoryStore::new());
    assert_eq!(heatmap.cached_field().unwrap(), &before);
  }

  #[test]
  fn test_decaying_heatmap_resizes_cache() {
    let mut heatmap = HeatmapAccumulator::default();
    heatmap.create_decaying_heatmap((10, 10), &store(&[(1, vec![(5, 5)])]));
    let image = heatmap.create_decaying_heatmap((20, 16), &TrajectoryStore::new());
    assert_eq!(image.dimensions(), (20, 16));
    assert_eq!(heatmap.cached_field().unwrap().dimensions(), (20, 16));
    assert!(heatmap.cached_field().unwrap().pixels().all(|p| p.0[0].is_finite()));
  }

  #[test]
  fn test_blur_keeps_intensity_above_one() {
    let field = HeatField::from_pixel(16, 16, Luma([5.0]));
    let blurred = blur_field(&field, 2.0);
    assert!((blurred.get_pixel(8, 8).0[0] - 5.0).abs() < 1e-3);
  }

  #[test]
  fn test_accumulated_field_still_peaks_at_top_color() {
    let mut heatmap = HeatmapAccumulator::new(HeatmapConfig {
      decay_factor: 1.0,
      ..Default::default()
    });
    let trajectories = store(&[(1, vec![(20, 15)])]);
    for _ in 0..3 {
      heatmap.create_decaying_heatmap((40, 30), &trajectories);
    }
    let image = heatmap.create_decaying_heatmap((40, 30), &trajectories);
    assert_eq!(heatmap.cached_field().unwrap().get_pixel(20, 15).0[0], 4.0);
    assert!(image.pixels().any(|p| *p == jet(1.0)));
  }

  #[test]
  fn test_setters_clamp() {
    let mut heatmap = HeatmapAccumulator::default();
    heatmap.set_opacity(1.7);
    heatmap.set_decay_factor(-0.2);
    assert_eq!(heatmap.config().alpha, 1.0);
    assert_eq!(heatmap.config().decay_factor, 0.0);
  }

  #[test]
  fn test_overlay_disabled_returns_copy() {
    let mut heatmap = HeatmapAccumulator::default();
    let frame = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
    let out = heatmap.overlay(&frame, &store(&[(1, vec![(4, 4)])]), 50);
    assert_eq!(out, frame);
    assert!(heatmap.cached_field().is_none());
  }

  #[test]
  fn test_overlay_reuses_render_between_intervals() {
    let mut heatmap = HeatmapAccumulator::new(HeatmapConfig {
      enabled: true,
      alpha: 1.0,
      update_interval: 3,
      stamp_radius: 3,
      ..Default::default()
    });
    let frame = RgbImage::new(32, 32);
    let first = heatmap.overlay(&frame, &store(&[(1, vec![(8, 8)])]), 50);
    // 第 2、3 次复用缓存，即使轨迹已经变化
    let moved = store(&[(1, vec![(24, 24)])]);
    assert_eq!(heatmap.overlay(&frame, &moved, 50), first);
    assert_eq!(heatmap.overlay(&frame, &moved, 50), first);
    assert_ne!(heatmap.overlay(&frame, &moved, 50), first);
  }

  #[test]
  fn test_jet_endpoints() {
    assert_eq!(jet(0.0), Rgb([0, 0, 128]));
    assert_eq!(jet(1.0), Rgb([128, 0, 0]));
    assert_eq!(jet(f32::NAN), jet(0.0));
  }
}
