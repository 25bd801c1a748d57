// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/detection.rs - 检测与跟踪结果定义
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

use serde::{Deserialize, Serialize};

/// 像素坐标 (x, y)
pub type Point = (i32, i32);

/// 单次检测结果
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Detection {
  /// 像素坐标 [x_min, y_min, x_max, y_max]
  pub bbox: [f32; 4],
  pub confidence: f32,
  pub class_id: u32,
  #[serde(default)]
  pub class_name: String,
}

impl Detection {
  pub fn new(bbox: [f32; 4], confidence: f32, class_id: u32, class_name: impl Into<String>) -> Self {
    Self {
      bbox,
      confidence,
      class_id,
      class_name: class_name.into(),
    }
  }

  #[inline]
  pub fn width(&self) -> f32 {
    self.bbox[2] - self.bbox[0]
  }

  #[inline]
  pub fn height(&self) -> f32 {
    self.bbox[3] - self.bbox[1]
  }

  /// 边框中心，取整到像素
  #[inline]
  pub fn center(&self) -> Point {
    box_center(&self.bbox)
  }

  pub fn iou(&self, other: &Detection) -> f32 {
    let ix_min = self.bbox[0].max(other.bbox[0]);
    let iy_min = self.bbox[1].max(other.bbox[1]);
    let ix_max = self.bbox[2].min(other.bbox[2]);
    let iy_max = self.bbox[3].min(other.bbox[3]);
    let inter = (ix_max - ix_min).max(0.0) * (iy_max - iy_min).max(0.0);
    let union = self.width() * self.height() + other.width() * other.height() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
  }
}

#[inline]
pub(crate) fn box_center(bbox: &[f32; 4]) -> Point {
  (
    ((bbox[0] + bbox[2]) / 2.0) as i32,
    ((bbox[1] + bbox[3]) / 2.0) as i32,
  )
}

/// 带有持久身份的检测结果
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackedObject {
  pub id: u64,
  pub bbox: [f32; 4],
  pub center: Point,
  pub confidence: f32,
  pub class_id: u32,
  #[serde(default)]
  pub class_name: String,
  /// 历史中心点，最旧的在前
  pub trajectory: Vec<Point>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_center_is_truncated_midpoint() {
    let det = Detection::new([100.0, 100.0, 201.0, 151.0], 0.9, 0, "person");
    assert_eq!(det.center(), (150, 125));
  }

  #[test]
  fn test_iou() {
    let a = Detection::new([0.0, 0.0, 10.0, 10.0], 0.9, 0, "");
    let b = Detection::new([5.0, 0.0, 15.0, 10.0], 0.9, 0, "");
    let c = Detection::new([20.0, 20.0, 30.0, 30.0], 0.9, 0, "");
    assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    assert_eq!(a.iou(&c), 0.0);
    assert!((a.iou(&a) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn test_detection_json_shape() {
    let json = r#"{"bbox":[1,2,3,4],"confidence":0.5,"class_id":2}"#;
    let det: Detection = serde_json::from_str(json).unwrap();
    assert_eq!(det.bbox, [1.0, 2.0, 3.0, 4.0]);
    assert_eq!(det.class_id, 2);
    assert!(det.class_name.is_empty());
  }
}
