// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/detector.rs - 目标检测器接口
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

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use image::RgbImage;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detection::Detection;

// COCO 80 类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

pub fn coco_class_name(class_id: u32) -> &'static str {
  COCO_CLASSES
    .get(class_id as usize)
    .copied()
    .unwrap_or("unknown")
}

/// 检测结果过滤条件
#[derive(Debug, Clone)]
pub struct DetectionFilter {
  /// 只保留这些类别，None 表示保留全部
  pub classes: Option<Vec<u32>>,
  pub confidence_threshold: f32,
}

impl Default for DetectionFilter {
  fn default() -> Self {
    Self {
      classes: None,
      confidence_threshold: 0.5,
    }
  }
}

impl DetectionFilter {
  pub fn accepts(&self, detection: &Detection) -> bool {
    detection.confidence >= self.confidence_threshold
      && self
        .classes
        .as_ref()
        .is_none_or(|classes| classes.contains(&detection.class_id))
  }
}

/// 目标检测器
///
/// 推理本身由外部模型完成，实现此 trait 即可接入流水线。
pub trait Detector {
  type Error: std::error::Error + Send + Sync + 'static;

  fn detect(
    &mut self,
    frame: &RgbImage,
    filter: &DetectionFilter,
  ) -> Result<Vec<Detection>, Self::Error>;

  /// 类别编号到名称的映射
  fn class_names(&self) -> BTreeMap<u32, String>;
}

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("第 {line} 行解析失败: {source}")]
  ParseError {
    line: usize,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Deserialize)]
struct DetectionRecord {
  frame: u64,
  #[serde(default)]
  detections: Vec<Detection>,
}

/// 回放外部模型离线生成的检测结果
///
/// 文件为 JSON lines，每行一帧：
/// `{"frame": 0, "detections": [{"bbox": [x1, y1, x2, y2], "confidence": 0.9, "class_id": 0}]}`。
/// 没有记录的帧视为无检测。
pub struct ReplayDetector {
  records: BTreeMap<u64, Vec<Detection>>,
  cursor: u64,
}

impl ReplayDetector {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, DetectorError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let detector = Self::from_reader(BufReader::new(file))?;
    info!(
      "已加载检测记录: {} ({} 帧)",
      path.display(),
      detector.records.len()
    );
    Ok(detector)
  }

  pub fn from_reader(reader: impl BufRead) -> Result<Self, DetectorError> {
    let mut records = BTreeMap::new();
    for (index, line) in reader.lines().enumerate() {
      let line = line?;
      if line.trim().is_empty() {
        continue;
      }
      let record: DetectionRecord =
        serde_json::from_str(&line).map_err(|source| DetectorError::ParseError {
          line: index + 1,
          source,
        })?;
      let mut detections = record.detections;
      for det in detections.iter_mut() {
        if det.class_name.is_empty() {
          det.class_name = coco_class_name(det.class_id).to_string();
        }
      }
      if records.insert(record.frame, detections).is_some() {
        warn!("帧 {} 的检测记录重复，使用最后一条", record.frame);
      }
    }
    Ok(Self { records, cursor: 0 })
  }

  /// 下一次 `detect` 读取的帧号
  pub fn cursor(&self) -> u64 {
    self.cursor
  }

  pub fn rewind(&mut self) {
    self.cursor = 0;
  }
}

impl Detector for ReplayDetector {
  type Error = DetectorError;

  fn detect(
    &mut self,
    _frame: &RgbImage,
    filter: &DetectionFilter,
  ) -> Result<Vec<Detection>, Self::Error> {
    let frame = self.cursor;
    self.cursor += 1;
    let detections: Vec<Detection> = self
      .records
      .get(&frame)
      .map(|dets| dets.iter().filter(|d| filter.accepts(d)).cloned().collect())
      .unwrap_or_default();
    debug!("帧 {}: 回放 {} 个检测结果", frame, detections.len());
    Ok(detections)
  }

  fn class_names(&self) -> BTreeMap<u32, String> {
    let mut names: BTreeMap<u32, String> = COCO_CLASSES
      .iter()
      .enumerate()
      .map(|(id, name)| (id as u32, name.to_string()))
      .collect();
    for det in self.records.values().flatten() {
      names.insert(det.class_id, det.class_name.clone());
    }
    names
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const RECORDS: &str = r#"{"frame": 0, "detections": [{"bbox": [0, 0, 10, 10], "confidence": 0.9, "class_id": 0}, {"bbox": [5, 5, 20, 20], "confidence": 0.3, "class_id": 2}]}

{"frame": 2, "detections": [{"bbox": [1, 1, 11, 11], "confidence": 0.8, "class_id": 2, "class_name": "vehicle"}]}
"#;

  #[test]
  fn test_replay_applies_filter_and_skips_missing_frames() {
    let mut detector = ReplayDetector::from_reader(RECORDS.as_bytes()).unwrap();
    let frame = RgbImage::new(4, 4);
    let filter = DetectionFilter::default();

    let first = detector.detect(&frame, &filter).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].class_name, "person");

    assert!(detector.detect(&frame, &filter).unwrap().is_empty());

    let third = detector.detect(&frame, &filter).unwrap();
    assert_eq!(third[0].class_name, "vehicle");
    assert_eq!(detector.cursor(), 3);
  }

  #[test]
  fn test_class_filter() {
    let mut detector = ReplayDetector::from_reader(RECORDS.as_bytes()).unwrap();
    let filter = DetectionFilter {
      classes: Some(vec![2]),
      confidence_threshold: 0.1,
    };
    let dets = detector.detect(&RgbImage::new(1, 1), &filter).unwrap();
    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].class_id, 2);
    assert_eq!(detector.class_names().get(&2).map(String::as_str), Some("vehicle"));
  }

  #[test]
  fn test_parse_error_reports_line() {
    let err = ReplayDetector::from_reader("{\"frame\": 0}\nnot json\n".as_bytes())
      .err()
      .unwrap();
    assert!(matches!(err, DetectorError::ParseError { line: 2, .. }));
  }
}
