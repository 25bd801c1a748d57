// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/tracker/replay.rs - 回放离线跟踪结果
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

use serde::Deserialize;
use tracing::{info, warn};

use super::{AssociatedBox, TrackAssociation, TrackerError};
use crate::detection::Detection;
use crate::detector::coco_class_name;

#[derive(Deserialize)]
struct TrackRecord {
  frame: u64,
  #[serde(default)]
  tracks: Vec<AssociatedBox>,
}

/// 回放外部跟踪器离线给出的身份分配
///
/// 每行一帧：`{"frame": 0, "tracks": [{"id": 1, "bbox": [..], "confidence": 0.9, "class_id": 0}]}`。
/// 本帧的检测结果只用于判断是否有目标，身份和框均以记录为准。
pub struct ReplayAssociation {
  records: BTreeMap<u64, Vec<AssociatedBox>>,
  cursor: u64,
}

impl ReplayAssociation {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, TrackerError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let association = Self::from_reader(BufReader::new(file))?;
    info!(
      "已加载跟踪记录: {} ({} 帧)",
      path.display(),
      association.records.len()
    );
    Ok(association)
  }

  pub fn from_reader(reader: impl BufRead) -> Result<Self, TrackerError> {
    let mut records = BTreeMap::new();
    for (index, line) in reader.lines().enumerate() {
      let line = line?;
      if line.trim().is_empty() {
        continue;
      }
      let record: TrackRecord =
        serde_json::from_str(&line).map_err(|source| TrackerError::ParseError {
          line: index + 1,
          source,
        })?;
      let mut tracks = record.tracks;
      for track in tracks.iter_mut() {
        if track.class_name.is_empty() {
          track.class_name = coco_class_name(track.class_id).to_string();
        }
      }
      if records.insert(record.frame, tracks).is_some() {
        warn!("帧 {} 的跟踪记录重复，使用最后一条", record.frame);
      }
    }
    Ok(Self { records, cursor: 0 })
  }

  pub fn cursor(&self) -> u64 {
    self.cursor
  }

  /// 从指定帧继续回放
  pub fn with_cursor(mut self, cursor: u64) -> Self {
    self.cursor = cursor;
    self
  }
}

impl TrackAssociation for ReplayAssociation {
  type Error = TrackerError;

  fn associate(&mut self, _detections: &[Detection]) -> Result<Vec<AssociatedBox>, Self::Error> {
    let frame = self.cursor;
    self.cursor += 1;
    Ok(self.records.get(&frame).cloned().unwrap_or_default())
  }

  fn skip_frame(&mut self) {
    self.cursor += 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tracker::{Tracker, TrajectoryTracker};

  const RECORDS: &str = r#"{"frame": 0, "tracks": [{"id": 4, "bbox": [0, 0, 10, 10], "confidence": 0.9, "class_id": 0}]}
{"frame": 2, "tracks": [{"id": 4, "bbox": [10, 0, 20, 10], "confidence": 0.9, "class_id": 0}]}
"#;

  #[test]
  fn test_replay_stays_aligned_across_empty_frames() {
    let association = ReplayAssociation::from_reader(RECORDS.as_bytes()).unwrap();
    let mut tracker = TrajectoryTracker::new(association);
    let det = Detection::new([0.0, 0.0, 10.0, 10.0], 0.9, 0, "person");

    let first = tracker.update(std::slice::from_ref(&det), (10, 10)).unwrap();
    assert_eq!(first[0].id, 4);
    assert_eq!(first[0].class_name, "person");

    assert!(tracker.update(&[], (10, 10)).unwrap().is_empty());

    let third = tracker.update(&[det], (10, 10)).unwrap();
    assert_eq!(third[0].center, (15, 5));
    assert_eq!(third[0].trajectory, vec![(5, 5), (15, 5)]);
    assert_eq!(tracker.association().cursor(), 3);
  }
}
