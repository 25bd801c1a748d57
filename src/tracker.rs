// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/tracker.rs - 多目标跟踪接口与轨迹存储
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

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::TrackerConfig;
use crate::detection::{Detection, Point, TrackedObject, box_center};

mod replay;
pub use self::replay::ReplayAssociation;

#[cfg(feature = "trackforge")]
mod bytetrack;
#[cfg(feature = "trackforge")]
pub use self::bytetrack::ByteTrackAssociation;

#[derive(Error, Debug)]
pub enum TrackerError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("第 {line} 行解析失败: {source}")]
  ParseError {
    line: usize,
    #[source]
    source: serde_json::Error,
  },
  #[error("未配置跟踪记录文件，且未启用 {0} 特性")]
  NoAssociation(&'static str),
}

/// 按身份保存的历史中心点
///
/// 身份第一次出现时创建条目，之后只追加。设置 `capacity` 后每条历史
/// 变为定长环形缓冲，丢弃最旧的点。
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct TrajectoryStore {
  tracks: BTreeMap<u64, VecDeque<Point>>,
  #[serde(skip)]
  capacity: Option<usize>,
}

impl TrajectoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity: Option<usize>) -> Self {
    Self {
      tracks: BTreeMap::new(),
      capacity: capacity.filter(|c| *c > 0),
    }
  }

  pub fn capacity(&self) -> Option<usize> {
    self.capacity
  }

  pub fn push(&mut self, id: u64, point: Point) {
    let history = self.tracks.entry(id).or_default();
    history.push_back(point);
    if let Some(capacity) = self.capacity {
      while history.len() > capacity {
        history.pop_front();
      }
    }
  }

  pub fn get(&self, id: u64) -> Option<&VecDeque<Point>> {
    self.tracks.get(&id)
  }

  pub fn iter(&self) -> impl Iterator<Item = (u64, &VecDeque<Point>)> {
    self.tracks.iter().map(|(id, points)| (*id, points))
  }

  /// 所有身份的全部点
  pub fn points(&self) -> impl Iterator<Item = &Point> {
    self.tracks.values().flatten()
  }

  pub fn len(&self) -> usize {
    self.tracks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tracks.is_empty()
  }

  /// 每个身份只保留最近 `window` 个点的副本
  pub fn recent(&self, window: usize) -> TrajectoryStore {
    Self {
      tracks: self
        .tracks
        .iter()
        .map(|(id, points)| {
          let skip = points.len().saturating_sub(window);
          (*id, points.iter().skip(skip).copied().collect())
        })
        .collect(),
      capacity: self.capacity,
    }
  }

  pub fn to_map(&self) -> BTreeMap<u64, Vec<Point>> {
    self
      .tracks
      .iter()
      .map(|(id, points)| (*id, points.iter().copied().collect()))
      .collect()
  }
}

impl FromIterator<(u64, Vec<Point>)> for TrajectoryStore {
  fn from_iter<I: IntoIterator<Item = (u64, Vec<Point>)>>(iter: I) -> Self {
    Self {
      tracks: iter
        .into_iter()
        .map(|(id, points)| (id, points.into()))
        .collect(),
      capacity: None,
    }
  }
}

/// 多目标跟踪器
pub trait Tracker {
  type Error: std::error::Error + Send + Sync + 'static;

  /// `frame_shape` 为 (宽, 高)
  fn update(
    &mut self,
    detections: &[Detection],
    frame_shape: (u32, u32),
  ) -> Result<Vec<TrackedObject>, Self::Error>;

  fn trajectories(&self) -> &TrajectoryStore;
}

/// 外部关联引擎给出的一个带身份的框
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AssociatedBox {
  pub id: u64,
  pub bbox: [f32; 4],
  pub confidence: f32,
  pub class_id: u32,
  #[serde(default)]
  pub class_name: String,
}

/// 数据关联引擎（框匹配、运动预测、身份生命周期）
pub trait TrackAssociation {
  type Error: std::error::Error + Send + Sync + 'static;

  fn associate(&mut self, detections: &[Detection]) -> Result<Vec<AssociatedBox>, Self::Error>;

  /// 当前帧没有检测结果，未调用 `associate`
  fn skip_frame(&mut self) {}
}

/// 把任意关联引擎包装为带轨迹历史的 [`Tracker`]
pub struct TrajectoryTracker<A> {
  association: A,
  store: TrajectoryStore,
}

impl<A: TrackAssociation> TrajectoryTracker<A> {
  pub fn new(association: A) -> Self {
    Self::with_capacity(association, None)
  }

  pub fn with_capacity(association: A, capacity: Option<usize>) -> Self {
    Self {
      association,
      store: TrajectoryStore::with_capacity(capacity),
    }
  }

  pub fn association(&self) -> &A {
    &self.association
  }
}

impl<A: TrackAssociation> Tracker for TrajectoryTracker<A> {
  type Error = A::Error;

  fn update(
    &mut self,
    detections: &[Detection],
    frame_shape: (u32, u32),
  ) -> Result<Vec<TrackedObject>, Self::Error> {
    if detections.is_empty() {
      self.association.skip_frame();
      return Ok(Vec::new());
    }

    let boxes = self.association.associate(detections)?;
    debug!(
      "跟踪更新: {} 个检测 -> {} 个目标 (帧尺寸 {:?})",
      detections.len(),
      boxes.len(),
      frame_shape
    );

    let tracked = boxes
      .into_iter()
      .map(|b| {
        let center = box_center(&b.bbox);
        self.store.push(b.id, center);
        let trajectory = self
          .store
          .get(b.id)
          .map(|points| points.iter().copied().collect())
          .unwrap_or_default();
        TrackedObject {
          id: b.id,
          bbox: b.bbox,
          center,
          confidence: b.confidence,
          class_id: b.class_id,
          class_name: b.class_name,
          trajectory,
        }
      })
      .collect();
    Ok(tracked)
  }

  fn trajectories(&self) -> &TrajectoryStore {
    &self.store
  }
}

/// 可选的关联引擎
pub enum AssociationEngine {
  Replay(ReplayAssociation),
  #[cfg(feature = "trackforge")]
  ByteTrack(ByteTrackAssociation),
}

impl AssociationEngine {
  /// 配置了跟踪记录时回放记录，否则使用 ByteTrack
  pub fn from_config(config: &TrackerConfig) -> Result<Self, TrackerError> {
    if let Some(path) = config.tracks.as_ref() {
      return Ok(AssociationEngine::Replay(ReplayAssociation::open(path)?));
    }
    #[cfg(feature = "trackforge")]
    {
      Ok(AssociationEngine::ByteTrack(ByteTrackAssociation::new(config)))
    }
    #[cfg(not(feature = "trackforge"))]
    {
      Err(TrackerError::NoAssociation("trackforge"))
    }
  }

  /// 重新开始跟踪的新引擎，回放记录保持帧对齐
  pub fn restart(&self, config: &TrackerConfig) -> Result<Self, TrackerError> {
    match self {
      AssociationEngine::Replay(replay) => {
        let cursor = replay.cursor();
        let fresh = match config.tracks.as_ref() {
          Some(path) => ReplayAssociation::open(path)?,
          None => return Self::from_config(config),
        };
        Ok(AssociationEngine::Replay(fresh.with_cursor(cursor)))
      }
      #[cfg(feature = "trackforge")]
      AssociationEngine::ByteTrack(_) => Ok(AssociationEngine::ByteTrack(
        ByteTrackAssociation::new(config),
      )),
    }
  }
}

impl TrackAssociation for AssociationEngine {
  type Error = TrackerError;

  fn associate(&mut self, detections: &[Detection]) -> Result<Vec<AssociatedBox>, Self::Error> {
    match self {
      AssociationEngine::Replay(a) => a.associate(detections),
      #[cfg(feature = "trackforge")]
      AssociationEngine::ByteTrack(a) => a.associate(detections),
    }
  }

  fn skip_frame(&mut self) {
    match self {
      AssociationEngine::Replay(a) => a.skip_frame(),
      #[cfg(feature = "trackforge")]
      AssociationEngine::ByteTrack(a) => a.skip_frame(),
    }
  }
}

/// 由配置构建跟踪器
pub fn tracker_from_config(
  config: &TrackerConfig,
) -> Result<TrajectoryTracker<AssociationEngine>, TrackerError> {
  Ok(TrajectoryTracker::with_capacity(
    AssociationEngine::from_config(config)?,
    config.trajectory_capacity,
  ))
}
