// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/output/draw.rs - 跟踪结果与轨迹绘制
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
  draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detection::{Point, TrackedObject};
use crate::heatmap::{HeatmapAccumulator, HeatmapConfig};
use crate::pipeline::{FrameProcessor, ProcessorContext};
use crate::tracker::TrajectoryStore;

const PALETTE_SIZE: usize = 100;
const BOX_THICKNESS: i32 = 2;
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_OFFSET: (i32, i32) = (-20, -10);
const DOT_EVERY: usize = 5;
const DOT_MAX_RADIUS: f32 = 3.0;
const STATUS_FONT_SIZE: f32 = 22.0;
const STATUS_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

// 未指定字体时依次尝试的系统字体
const SYSTEM_FONT_PATHS: [&str; 6] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
  "/System/Library/Fonts/Supplemental/Arial.ttf",
  "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件 {path}: {source}")]
  FontIo {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("字体文件格式无效: {0}")]
  InvalidFont(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RendererConfig {
  /// 每条轨迹最多绘制的点数
  pub trajectory_length: usize,
  /// 最新一段轨迹的线宽
  pub trajectory_thickness: u32,
  pub show_bbox: bool,
  pub show_id: bool,
  pub show_trajectory: bool,
}

impl Default for RendererConfig {
  fn default() -> Self {
    Self {
      trajectory_length: 50,
      trajectory_thickness: 2,
      show_bbox: true,
      show_id: true,
      show_trajectory: true,
    }
  }
}

/// 从文件加载字体
pub fn load_font(path: impl AsRef<Path>) -> Result<FontArc, DrawError> {
  let path = path.as_ref();
  let data = std::fs::read(path).map_err(|source| DrawError::FontIo {
    path: path.to_path_buf(),
    source,
  })?;
  FontArc::try_from_vec(data).map_err(|_| DrawError::InvalidFont(path.to_path_buf()))
}

/// 尝试常见的系统字体
pub fn load_system_font() -> Option<FontArc> {
  SYSTEM_FONT_PATHS
    .iter()
    .filter(|p| Path::new(p).exists())
    .find_map(|p| match load_font(p) {
      Ok(font) => {
        debug!("使用系统字体: {}", p);
        Some(font)
      }
      Err(e) => {
        debug!("{}", e);
        None
      }
    })
}

/// HSV 转 RGB，h 为角度
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0).round() as u8,
    ((g + m) * 255.0).round() as u8,
    ((b + m) * 255.0).round() as u8,
  ])
}

/// 色相均匀分布的调色板，色相按 2 度取整
fn generate_palette(n: usize) -> Vec<Rgb<u8>> {
  (0..n)
    .map(|i| {
      let half_degrees = (180 * i / n) as f32;
      hsv_to_rgb(half_degrees * 2.0, 1.0, 1.0)
    })
    .collect()
}

/// 将线段裁剪到画面外扩 `margin` 像素的范围内，完全在外时返回 `None`
fn clip_segment(
  start: Point,
  end: Point,
  (width, height): (u32, u32),
  margin: f64,
) -> Option<((f64, f64), (f64, f64))> {
  let (x0, y0) = (start.0 as f64, start.1 as f64);
  let (dx, dy) = (end.0 as f64 - x0, end.1 as f64 - y0);
  let x_max = width as f64 - 1.0 + margin;
  let y_max = height as f64 - 1.0 + margin;

  // Liang-Barsky
  let (mut t0, mut t1) = (0.0f64, 1.0f64);
  for (p, q) in [
    (-dx, x0 + margin),
    (dx, x_max - x0),
    (-dy, y0 + margin),
    (dy, y_max - y0),
  ] {
    if p == 0.0 {
      if q < 0.0 {
        return None;
      }
      continue;
    }
    let r = q / p;
    if p < 0.0 {
      if r > t1 {
        return None;
      }
      t0 = t0.max(r);
    } else {
      if r < t0 {
        return None;
      }
      t1 = t1.min(r);
    }
  }
  Some((
    (x0 + t0 * dx, y0 + t0 * dy),
    (x0 + t1 * dx, y0 + t1 * dy),
  ))
}

/// 点是否落在画面外扩 `margin` 像素的范围内
fn near_frame(image: &RgbImage, point: Point, margin: i32) -> bool {
  let (width, height) = image.dimensions();
  let x = point.0 as i64;
  let y = point.1 as i64;
  let margin = margin as i64;
  x >= -margin && x < width as i64 + margin && y >= -margin && y < height as i64 + margin
}

/// 以方形笔刷绘制粗线
fn draw_thick_line(image: &mut RgbImage, start: Point, end: Point, thickness: u32, color: Rgb<u8>) {
  let t = thickness.max(1) as i32;
  let Some((a, b)) = clip_segment(start, end, image.dimensions(), t as f64) else {
    return;
  };
  let low = -(t - 1) / 2;
  for dx in low..low + t {
    for dy in low..low + t {
      let (dx, dy) = (dx as f64, dy as f64);
      draw_line_segment_mut(
        image,
        ((a.0 + dx) as f32, (a.1 + dy) as f32),
        ((b.0 + dx) as f32, (b.1 + dy) as f32),
        color,
      );
    }
  }
}

/// 跟踪结果渲染器
///
/// 依次叠加热力图、边框、身份标签和轨迹，不修改输入帧。
pub struct TrajectoryRenderer {
  config: RendererConfig,
  palette: Vec<Rgb<u8>>,
  font: Option<FontArc>,
  font_scale: PxScale,
  font_warned: bool,
  heatmap: HeatmapAccumulator,
}

impl Default for TrajectoryRenderer {
  fn default() -> Self {
    Self::new(RendererConfig::default(), HeatmapConfig::default())
  }
}

impl TrajectoryRenderer {
  /// 创建渲染器，字体取自系统字体目录
  pub fn new(config: RendererConfig, heatmap: HeatmapConfig) -> Self {
    Self {
      config,
      palette: generate_palette(PALETTE_SIZE),
      font: load_system_font(),
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      font_warned: false,
      heatmap: HeatmapAccumulator::new(heatmap),
    }
  }

  pub fn with_font(mut self, font: Option<FontArc>) -> Self {
    self.font = font;
    self
  }

  /// 指定字体文件，加载失败时保留原字体
  pub fn with_font_path(self, path: impl AsRef<Path>) -> Self {
    match load_font(&path) {
      Ok(font) => {
        info!("已加载字体: {}", path.as_ref().display());
        self.with_font(Some(font))
      }
      Err(e) => {
        warn!("{}", e);
        self
      }
    }
  }

  pub fn font(&self) -> Option<&FontArc> {
    self.font.as_ref()
  }

  pub fn config(&self) -> &RendererConfig {
    &self.config
  }

  pub fn config_mut(&mut self) -> &mut RendererConfig {
    &mut self.config
  }

  pub fn heatmap(&self) -> &HeatmapAccumulator {
    &self.heatmap
  }

  pub fn heatmap_mut(&mut self) -> &mut HeatmapAccumulator {
    &mut self.heatmap
  }

  pub fn color_for(&self, id: u64) -> Rgb<u8> {
    self.palette[(id % self.palette.len() as u64) as usize]
  }

  /// 绘制一帧，返回新图像
  pub fn draw_frame(
    &mut self,
    frame: &RgbImage,
    tracked_objects: &[TrackedObject],
    trajectories: &TrajectoryStore,
  ) -> RgbImage {
    let mut canvas = self
      .heatmap
      .overlay(frame, trajectories, self.config.trajectory_length);

    if self.config.show_id && self.font.is_none() && !tracked_objects.is_empty() && !self.font_warned {
      warn!("未找到可用字体，跳过身份标签绘制");
      self.font_warned = true;
    }

    for object in tracked_objects {
      let color = self.color_for(object.id);
      if self.config.show_bbox {
        self.draw_box(&mut canvas, &object.bbox, color);
      }
      if self.config.show_id {
        self.draw_label(&mut canvas, object, color);
      }
      if self.config.show_trajectory {
        self.draw_trajectory(&mut canvas, &object.trajectory, color);
      }
    }

    canvas
  }

  fn draw_box(&self, image: &mut RgbImage, bbox: &[f32; 4], color: Rgb<u8>) {
    // 画面外的边仍留在画面外
    let (width, height) = image.dimensions();
    let clamp_x = |v: f32| (v as i32).clamp(-BOX_THICKNESS, width as i32 - 1 + BOX_THICKNESS);
    let clamp_y = |v: f32| (v as i32).clamp(-BOX_THICKNESS, height as i32 - 1 + BOX_THICKNESS);
    let x_min = clamp_x(bbox[0]);
    let y_min = clamp_y(bbox[1]);
    let x_max = clamp_x(bbox[2]);
    let y_max = clamp_y(bbox[3]);

    for inset in 0..BOX_THICKNESS {
      let width = x_max - x_min + 1 - 2 * inset;
      let height = y_max - y_min + 1 - 2 * inset;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + inset, y_min + inset).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }
  }

  fn draw_label(&self, image: &mut RgbImage, object: &TrackedObject, color: Rgb<u8>) {
    let Some(font) = self.font.as_ref() else {
      return;
    };
    let label = format!("ID: {}", object.id);
    let (text_width, text_height) = text_size(self.font_scale, font, &label);
    // 文字底边位于中心上方
    let x = object.center.0.saturating_add(LABEL_OFFSET.0);
    let y = object
      .center
      .1
      .saturating_add(LABEL_OFFSET.1)
      .saturating_sub(text_height as i32);
    let margin = text_width.max(text_height) as i32;
    if !near_frame(image, (x, y), margin) {
      return;
    }
    draw_text_mut(image, color, x, y, self.font_scale, font, &label);
  }

  fn draw_trajectory(&self, image: &mut RgbImage, trajectory: &[Point], color: Rgb<u8>) {
    if trajectory.len() < 2 {
      return;
    }
    let start = trajectory.len().saturating_sub(self.config.trajectory_length);
    let points = &trajectory[start..];
    let n = points.len();

    // 越新的线段越粗
    for i in 1..n {
      let thickness = (self.config.trajectory_thickness as usize * i / n).max(1) as u32;
      draw_thick_line(image, points[i - 1], points[i], thickness, color);
    }

    for (k, point) in points.iter().step_by(DOT_EVERY).enumerate() {
      let radius = ((DOT_MAX_RADIUS * k as f32 / n as f32) as i32).max(1);
      if near_frame(image, *point, radius) {
        draw_filled_circle_mut(image, *point, radius, color);
      }
    }
  }
}

/// 左上角显示 `Frame: <n> | Objects: <k>`
pub struct StatusOverlay {
  font: Option<FontArc>,
  scale: PxScale,
}

impl StatusOverlay {
  pub fn new(font: Option<FontArc>) -> Self {
    if font.is_none() {
      warn!("未找到可用字体，状态栏不会显示");
    }
    Self {
      font,
      scale: PxScale::from(STATUS_FONT_SIZE),
    }
  }

  pub fn status_text(ctx: &ProcessorContext) -> String {
    format!(
      "Frame: {} | Objects: {}",
      ctx.metadata.frame_number.unwrap_or(0),
      ctx.tracked_objects.len()
    )
  }
}

impl FrameProcessor for StatusOverlay {
  fn process(&mut self, mut frame: RgbImage, ctx: &ProcessorContext) -> RgbImage {
    if let Some(font) = self.font.as_ref() {
      draw_text_mut(
        &mut frame,
        STATUS_COLOR,
        10,
        10,
        self.scale,
        font,
        &Self::status_text(ctx),
      );
    }
    frame
  }
}
