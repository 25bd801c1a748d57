// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/tracker/bytetrack.rs - trackforge ByteTrack 关联引擎
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

use trackforge::trackers::byte_track::ByteTrack;
use tracing::info;

use super::{AssociatedBox, TrackAssociation, TrackerError};
use crate::config::TrackerConfig;
use crate::detection::Detection;

pub struct ByteTrackAssociation {
  inner: ByteTrack,
}

impl ByteTrackAssociation {
  pub fn new(config: &TrackerConfig) -> Self {
    info!(
      "ByteTrack: track_thresh={} buffer={} match_thresh={} det_thresh={}",
      config.track_threshold,
      config.lost_track_buffer,
      config.match_threshold,
      config.activation_threshold
    );
    Self {
      inner: ByteTrack::new(
        config.track_threshold as _,
        config.lost_track_buffer as _,
        config.match_threshold as _,
        config.activation_threshold as _,
      ),
    }
  }
}

impl TrackAssociation for ByteTrackAssociation {
  type Error = TrackerError;

  fn associate(&mut self, detections: &[Detection]) -> Result<Vec<AssociatedBox>, Self::Error> {
    // ByteTrack 使用 [x, y, w, h]
    let input: Vec<_> = detections
      .iter()
      .map(|d| {
        (
          [
            d.bbox[0] as _,
            d.bbox[1] as _,
            d.width() as _,
            d.height() as _,
          ],
          d.confidence as _,
          d.class_id as _,
        )
      })
      .collect();

    let tracks = self.inner.update(input);

    let boxes = tracks
      .into_iter()
      .map(|t| {
        let x = t.tlwh[0] as f32;
        let y = t.tlwh[1] as f32;
        let bbox = [x, y, x + t.tlwh[2] as f32, y + t.tlwh[3] as f32];
        // 类别取与跟踪框重叠最大的检测
        let target = Detection::new(bbox, 0.0, 0, "");
        let source = detections
          .iter()
          .max_by(|a, b| target.iou(a).total_cmp(&target.iou(b)));
        AssociatedBox {
          id: t.track_id as u64,
          bbox,
          confidence: t.score as f32,
          class_id: source.map(|d| d.class_id).unwrap_or_default(),
          class_name: source.map(|d| d.class_name.clone()).unwrap_or_default(),
        }
      })
      .collect();
    Ok(boxes)
  }
}
