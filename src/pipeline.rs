// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/pipeline.rs - 检测、跟踪与绘制流水线
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

//! # 跟踪流水线
//!
//! 每一帧依次经过：检测 → 跟踪 → 绘制 → 自定义帧处理器。
//! [`TrackingPipeline::process_video`] 在此基础上驱动整个视频源，
//! 并负责视频写出和预览窗口的生命周期。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::detection::{Detection, Point, TrackedObject};
use crate::detector::{DetectionFilter, Detector};
use crate::input::{SourceProperties, VideoSource};
use crate::output::draw::TrajectoryRenderer;
use crate::output::{OutputError, Preview, VideoWriter, create_video_writer};
use crate::tracker::Tracker;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("检测失败: {0}")]
  Detector(#[source] BoxError),
  #[error("跟踪失败: {0}")]
  Tracker(#[source] BoxError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
}

/// 调用方随帧附带的信息
#[derive(Serialize, Debug, Clone, Default)]
pub struct FrameMetadata {
  pub frame_number: Option<u64>,
  pub source_properties: Option<SourceProperties>,
  pub extra: serde_json::Map<String, serde_json::Value>,
}

impl FrameMetadata {
  pub fn with_frame_number(mut self, frame_number: u64) -> Self {
    self.frame_number = Some(frame_number);
    self
  }
}

/// 帧处理器看到的当前帧信息
pub struct ProcessorContext<'a> {
  pub detections: &'a [Detection],
  pub tracked_objects: &'a [TrackedObject],
  pub metadata: &'a FrameMetadata,
}

/// 绘制之后的自定义处理步骤
pub trait FrameProcessor {
  fn process(&mut self, frame: RgbImage, ctx: &ProcessorContext<'_>) -> RgbImage;
}

impl<F> FrameProcessor for F
where
  F: FnMut(RgbImage, &ProcessorContext<'_>) -> RgbImage,
{
  fn process(&mut self, frame: RgbImage, ctx: &ProcessorContext<'_>) -> RgbImage {
    self(frame, ctx)
  }
}

/// 帮助闭包推导参数类型
///
/// ```ignore
/// pipeline.add_frame_processor(processor_fn(|frame, ctx| frame));
/// ```
pub fn processor_fn<F>(f: F) -> F
where
  F: FnMut(RgbImage, &ProcessorContext<'_>) -> RgbImage,
{
  f
}

/// 单帧处理结果
#[derive(Debug, Clone)]
pub struct FrameResult {
  pub frame: RgbImage,
  pub detections: Vec<Detection>,
  pub tracked_objects: Vec<TrackedObject>,
  pub metadata: FrameMetadata,
}

/// 视频处理汇总
#[derive(Serialize, Debug, Clone)]
pub struct VideoSummary {
  pub frames_processed: u64,
  /// 出现过的身份数量
  pub total_objects_tracked: usize,
  pub trajectories: BTreeMap<u64, Vec<Point>>,
  pub source_properties: SourceProperties,
  /// 因按键、关闭窗口或中断信号提前结束
  pub stopped_early: bool,
}

/// 进度回调，参数为 (帧序号, 总帧数)，直播源总帧数为 -1
pub type ProgressCallback<'a> = Box<dyn FnMut(u64, i64) + 'a>;

/// `process_video` 的可选项
#[derive(Default)]
pub struct VideoRunOptions<'a> {
  /// 按源的尺寸和帧率写出到该路径
  pub output_path: Option<PathBuf>,
  /// 直接指定写出器，优先于 `output_path`
  pub writer: Option<Box<dyn VideoWriter + 'a>>,
  pub preview: Option<Box<dyn Preview + 'a>>,
  pub progress: Option<ProgressCallback<'a>>,
  pub stop: Option<Arc<AtomicBool>>,
}

impl<'a> VideoRunOptions<'a> {
  pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.output_path = Some(path.into());
    self
  }

  pub fn with_writer(mut self, writer: impl VideoWriter + 'a) -> Self {
    self.writer = Some(Box::new(writer));
    self
  }

  pub fn with_preview(mut self, preview: impl Preview + 'a) -> Self {
    self.preview = Some(Box::new(preview));
    self
  }

  pub fn with_progress(mut self, progress: impl FnMut(u64, i64) + 'a) -> Self {
    self.progress = Some(Box::new(progress));
    self
  }

  pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = Some(stop);
    self
  }
}

/// 写出器与预览窗口守卫，任何退出路径都只释放一次
pub(crate) struct OutputGuard<'a> {
  pub(crate) writer: Option<Box<dyn VideoWriter + 'a>>,
  pub(crate) preview: Option<Box<dyn Preview + 'a>>,
}

impl<'a> OutputGuard<'a> {
  pub(crate) fn new(
    writer: Option<Box<dyn VideoWriter + 'a>>,
    preview: Option<Box<dyn Preview + 'a>>,
  ) -> Self {
    Self { writer, preview }
  }

  pub(crate) fn finish(&mut self) -> Result<(), OutputError> {
    if let Some(mut preview) = self.preview.take() {
      preview.close();
    }
    match self.writer.take() {
      Some(mut writer) => writer.finish(),
      None => Ok(()),
    }
  }
}

impl Drop for OutputGuard<'_> {
  fn drop(&mut self) {
    if let Err(e) = self.finish() {
      error!("关闭视频输出失败: {}", e);
    }
  }
}

/// 视频源守卫
pub(crate) struct SourceGuard<'s, S: VideoSource + ?Sized>(pub(crate) &'s mut S);

impl<S: VideoSource + ?Sized> Drop for SourceGuard<'_, S> {
  fn drop(&mut self) {
    self.0.release();
  }
}

/// 检测、跟踪与绘制流水线
pub struct TrackingPipeline<D, T> {
  detector: D,
  tracker: T,
  renderer: TrajectoryRenderer,
  filter: DetectionFilter,
  processors: Vec<Box<dyn FrameProcessor>>,
}

impl<D: Detector, T: Tracker> TrackingPipeline<D, T> {
  pub fn new(detector: D, tracker: T, renderer: TrajectoryRenderer) -> Self {
    Self {
      detector,
      tracker,
      renderer,
      filter: DetectionFilter::default(),
      processors: Vec::new(),
    }
  }

  pub fn with_filter(mut self, filter: DetectionFilter) -> Self {
    self.filter = filter;
    self
  }

  pub fn filter(&self) -> &DetectionFilter {
    &self.filter
  }

  pub fn detector(&self) -> &D {
    &self.detector
  }

  pub fn tracker(&self) -> &T {
    &self.tracker
  }

  pub fn renderer(&self) -> &TrajectoryRenderer {
    &self.renderer
  }

  pub fn renderer_mut(&mut self) -> &mut TrajectoryRenderer {
    &mut self.renderer
  }

  /// 注册帧处理器，按注册顺序执行
  pub fn add_frame_processor(&mut self, processor: impl FrameProcessor + 'static) {
    self.processors.push(Box::new(processor));
    debug!("已注册帧处理器，共 {} 个", self.processors.len());
  }

  /// 处理单帧
  pub fn process_frame(
    &mut self,
    frame: &RgbImage,
    metadata: FrameMetadata,
  ) -> Result<FrameResult, PipelineError> {
    let detections = self
      .detector
      .detect(frame, &self.filter)
      .map_err(|e| PipelineError::Detector(Box::new(e)))?;

    let tracked_objects = self
      .tracker
      .update(&detections, frame.dimensions())
      .map_err(|e| PipelineError::Tracker(Box::new(e)))?;

    let mut rendered = self
      .renderer
      .draw_frame(frame, &tracked_objects, self.tracker.trajectories());

    let ctx = ProcessorContext {
      detections: &detections,
      tracked_objects: &tracked_objects,
      metadata: &metadata,
    };
    for processor in self.processors.iter_mut() {
      rendered = processor.process(rendered, &ctx);
    }

    Ok(FrameResult {
      frame: rendered,
      detections,
      tracked_objects,
      metadata,
    })
  }

  /// 处理整个视频源，直到源结束或收到停止请求
  pub fn process_video<S: VideoSource + ?Sized>(
    &mut self,
    source: &mut S,
    options: VideoRunOptions<'_>,
  ) -> Result<VideoSummary, PipelineError> {
    let VideoRunOptions {
      output_path,
      writer,
      preview,
      mut progress,
      stop,
    } = options;

    let mut source = SourceGuard(source);
    let properties = source.0.properties();
    info!(
      "开始处理视频: {}x{} @ {:.2} fps, 总帧数 {}",
      properties.width, properties.height, properties.fps, properties.frame_count
    );

    let writer = match (writer, output_path) {
      (Some(writer), _) => Some(writer),
      (None, Some(path)) => Some(create_video_writer(
        &path,
        properties.width,
        properties.height,
        properties.fps,
      )?),
      (None, None) => None,
    };
    let mut outputs = OutputGuard::new(writer, preview);

    let mut frames_processed = 0u64;
    let mut stopped_early = false;

    loop {
      if stop.as_ref().is_some_and(|s| s.load(Ordering::SeqCst)) {
        warn!("收到停止请求，结束处理");
        stopped_early = true;
        break;
      }

      let Some(frame) = source.0.read() else {
        break;
      };

      let metadata = FrameMetadata {
        frame_number: Some(frames_processed),
        source_properties: Some(source.0.properties()),
        ..Default::default()
      };
      let result = self.process_frame(&frame, metadata)?;

      if let Some(writer) = outputs.writer.as_mut() {
        writer.write(&result.frame)?;
      }

      // 退出键对应的帧已写出，但不计入进度
      if let Some(preview) = outputs.preview.as_mut() {
        let event = preview.show(&result.frame)?;
        if event.is_quit() {
          info!("预览窗口请求退出");
          stopped_early = true;
          break;
        }
      }

      if let Some(progress) = progress.as_mut() {
        progress(frames_processed, properties.frame_count);
      }
      frames_processed += 1;
    }

    outputs.finish()?;
    let properties = source.0.properties();
    drop(source);

    let trajectories = self.tracker.trajectories();
    info!(
      "视频处理完成: {} 帧, {} 个目标",
      frames_processed,
      trajectories.len()
    );

    Ok(VideoSummary {
      frames_processed,
      total_objects_tracked: trajectories.len(),
      trajectories: trajectories.to_map(),
      source_properties: properties,
      stopped_early,
    })
  }

  /// 按当前全部轨迹生成静态热力图，`shape` 为 (宽, 高)
  pub fn generate_heatmap(&self, shape: (u32, u32)) -> RgbImage {
    self
      .renderer
      .heatmap()
      .create_static_heatmap(shape, self.tracker.trajectories())
  }

  /// 替换跟踪器以重置跟踪，返回旧跟踪器
  pub fn replace_tracker(&mut self, tracker: T) -> T {
    info!("跟踪器已重置");
    std::mem::replace(&mut self.tracker, tracker)
  }
}

#[cfg(test)]
mod tests {
  use std::cell::{Cell, RefCell};
  use std::rc::Rc;

  use image::Rgb;

  use super::*;
  use crate::heatmap::HeatmapConfig;
  use crate::input::SourceKind;
  use crate::output::PreviewEvent;
  use crate::output::draw::RendererConfig;
  use crate::tracker::{TrackerError, TrajectoryStore};

  /// 每帧返回固定检测结果
  struct MockDetector {
    detections: Vec<Detection>,
    fail_at: Option<u64>,
    calls: u64,
  }

  impl MockDetector {
    fn empty() -> Self {
      Self {
        detections: Vec::new(),
        fail_at: None,
        calls: 0,
      }
    }
  }

  impl Detector for MockDetector {
    type Error = std::io::Error;

    fn detect(
      &mut self,
      _frame: &RgbImage,
      filter: &DetectionFilter,
    ) -> Result<Vec<Detection>, Self::Error> {
      let call = self.calls;
      self.calls += 1;
      if self.fail_at == Some(call) {
        return Err(std::io::Error::other("detector failure"));
      }
      Ok(
        self
          .detections
          .iter()
          .filter(|d| filter.accepts(d))
          .cloned()
          .collect(),
      )
    }

    fn class_names(&self) -> BTreeMap<u32, String> {
      BTreeMap::from([(0, "person".to_string())])
    }
  }

  /// 按检测顺序分配身份
  #[derive(Default)]
  struct MockTracker {
    store: TrajectoryStore,
  }

  impl Tracker for MockTracker {
    type Error = TrackerError;

    fn update(
      &mut self,
      detections: &[Detection],
      _frame_shape: (u32, u32),
    ) -> Result<Vec<TrackedObject>, Self::Error> {
      Ok(
        detections
          .iter()
          .enumerate()
          .map(|(i, d)| {
            let id = i as u64 + 1;
            self.store.push(id, d.center());
            TrackedObject {
              id,
              bbox: d.bbox,
              center: d.center(),
              confidence: d.confidence,
              class_id: d.class_id,
              class_name: d.class_name.clone(),
              trajectory: self.store.get(id).map(|t| t.iter().copied().collect()).unwrap_or_default(),
            }
          })
          .collect(),
      )
    }

    fn trajectories(&self) -> &TrajectoryStore {
      &self.store
    }
  }

  struct SyntheticSource {
    total: u64,
    read: u64,
    open: bool,
    releases: Rc<Cell<u32>>,
  }

  impl SyntheticSource {
    fn new(total: u64) -> Self {
      Self {
        total,
        read: 0,
        open: true,
        releases: Rc::new(Cell::new(0)),
      }
    }
  }

  impl VideoSource for SyntheticSource {
    fn read(&mut self) -> Option<RgbImage> {
      if !self.open || self.read >= self.total {
        return None;
      }
      self.read += 1;
      Some(RgbImage::from_pixel(16, 12, Rgb([10, 20, 30])))
    }

    fn properties(&self) -> SourceProperties {
      SourceProperties {
        width: 16,
        height: 12,
        fps: 25.0,
        frame_count: self.total as i64,
        current_frame: self.read,
        kind: SourceKind::File {
          path: PathBuf::from("synthetic"),
        },
      }
    }

    fn release(&mut self) {
      if self.open {
        self.open = false;
        self.releases.set(self.releases.get() + 1);
      }
    }

    fn is_open(&self) -> bool {
      self.open
    }
  }

  #[derive(Clone, Default)]
  struct CountingWriter {
    frames: Rc<Cell<u32>>,
    finishes: Rc<Cell<u32>>,
  }

  impl VideoWriter for CountingWriter {
    fn write(&mut self, _frame: &RgbImage) -> Result<(), OutputError> {
      self.frames.set(self.frames.get() + 1);
      Ok(())
    }

    fn finish(&mut self) -> Result<(), OutputError> {
      self.finishes.set(self.finishes.get() + 1);
      Ok(())
    }
  }

  struct ScriptedPreview {
    events: Vec<PreviewEvent>,
    shown: usize,
    closes: Rc<Cell<u32>>,
  }

  impl Preview for ScriptedPreview {
    fn show(&mut self, _frame: &RgbImage) -> Result<PreviewEvent, OutputError> {
      let event = self.events.get(self.shown).copied().unwrap_or(PreviewEvent::Continue);
      self.shown += 1;
      Ok(event)
    }

    fn close(&mut self) {
      self.closes.set(self.closes.get() + 1);
    }
  }

  fn renderer() -> TrajectoryRenderer {
    TrajectoryRenderer::new(RendererConfig::default(), HeatmapConfig::default()).with_font(None)
  }

  fn pipeline(detector: MockDetector) -> TrackingPipeline<MockDetector, MockTracker> {
    TrackingPipeline::new(detector, MockTracker::default(), renderer())
  }

  fn person(bbox: [f32; 4]) -> Detection {
    Detection::new(bbox, 0.9, 0, "person")
  }

  #[test]
  fn test_empty_detections() {
    let mut pipeline = pipeline(MockDetector::empty());
    let frame = RgbImage::new(32, 24);
    let result = pipeline.process_frame(&frame, FrameMetadata::default()).unwrap();
    assert!(result.detections.is_empty());
    assert!(result.tracked_objects.is_empty());
    assert_eq!(result.frame.dimensions(), (32, 24));
  }

  #[test]
  fn test_filter_applies_to_detections() {
    let mut detector = MockDetector::empty();
    detector.detections = vec![
      person([0.0, 0.0, 4.0, 4.0]),
      Detection::new([4.0, 4.0, 8.0, 8.0], 0.2, 0, "person"),
    ];
    let mut pipeline = pipeline(detector);
    let result = pipeline
      .process_frame(&RgbImage::new(16, 16), FrameMetadata::default())
      .unwrap();
    assert_eq!(result.detections.len(), 1);
    assert_eq!(result.tracked_objects.len(), 1);
    assert_eq!(result.tracked_objects[0].center, (2, 2));
  }

  #[test]
  fn test_processors_run_in_order() {
    let mut pipeline = pipeline(MockDetector::empty());
    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in 0..3u8 {
      let order = order.clone();
      pipeline.add_frame_processor(processor_fn(move |mut frame, _ctx| {
        order.borrow_mut().push(tag);
        frame.put_pixel(0, 0, Rgb([tag, tag, tag]));
        frame
      }));
    }
    let metadata = FrameMetadata::default().with_frame_number(4);
    let result = pipeline.process_frame(&RgbImage::new(8, 8), metadata).unwrap();
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
    assert_eq!(*result.frame.get_pixel(0, 0), Rgb([2, 2, 2]));
    assert_eq!(result.metadata.frame_number, Some(4));
  }

  #[test]
  fn test_processor_sees_context() {
    let mut detector = MockDetector::empty();
    detector.detections = vec![person([0.0, 0.0, 4.0, 4.0])];
    let mut pipeline = pipeline(detector);
    let seen = Rc::new(Cell::new((0usize, 0usize)));
    let sink = seen.clone();
    pipeline.add_frame_processor(processor_fn(move |frame, ctx| {
      sink.set((ctx.detections.len(), ctx.tracked_objects.len()));
      frame
    }));
    pipeline
      .process_frame(&RgbImage::new(8, 8), FrameMetadata::default())
      .unwrap();
    assert_eq!(seen.get(), (1, 1));
  }

  #[test]
  fn test_process_video_summary() {
    let mut pipeline = pipeline(MockDetector::empty());
    let mut source = SyntheticSource::new(3);
    let releases = source.releases.clone();
    let summary = pipeline
      .process_video(&mut source, VideoRunOptions::default())
      .unwrap();
    assert_eq!(summary.frames_processed, 3);
    assert_eq!(summary.total_objects_tracked, 0);
    assert!(summary.trajectories.is_empty());
    assert!(!summary.stopped_early);
    assert_eq!(releases.get(), 1);
    assert!(!source.is_open());
  }

  #[test]
  fn test_progress_called_per_frame() {
    let mut pipeline = pipeline(MockDetector::empty());
    let mut source = SyntheticSource::new(5);
    let calls = Rc::new(RefCell::new(Vec::new()));
    let sink = calls.clone();
    let options =
      VideoRunOptions::default().with_progress(move |index, total| sink.borrow_mut().push((index, total)));
    pipeline.process_video(&mut source, options).unwrap();
    let expected: Vec<(u64, i64)> = (0..5).map(|i| (i, 5)).collect();
    assert_eq!(*calls.borrow(), expected);
  }

  #[test]
  fn test_writer_and_preview_released_once() {
    let mut pipeline = pipeline(MockDetector::empty());
    let mut source = SyntheticSource::new(4);
    let writer = CountingWriter::default();
    let closes = Rc::new(Cell::new(0));
    let preview = ScriptedPreview {
      events: vec![PreviewEvent::Continue, PreviewEvent::Key('q')],
      shown: 0,
      closes: closes.clone(),
    };
    let calls = Rc::new(Cell::new(0u64));
    let counter = calls.clone();
    let options = VideoRunOptions::default()
      .with_writer(writer.clone())
      .with_preview(preview)
      .with_progress(move |_, _| counter.set(counter.get() + 1));
    let summary = pipeline.process_video(&mut source, options).unwrap();
    // 按下退出键的帧已写出，但不计数也不回报进度
    assert_eq!(summary.frames_processed, 1);
    assert_eq!(calls.get(), 1);
    assert!(summary.stopped_early);
    assert_eq!(writer.frames.get(), 2);
    assert_eq!(writer.finishes.get(), 1);
    assert_eq!(closes.get(), 1);
  }

  #[test]
  fn test_release_on_error_path() {
    let mut detector = MockDetector::empty();
    detector.fail_at = Some(1);
    let mut pipeline = pipeline(detector);
    let mut source = SyntheticSource::new(4);
    let releases = source.releases.clone();
    let writer = CountingWriter::default();
    let options = VideoRunOptions::default().with_writer(writer.clone());
    let result = pipeline.process_video(&mut source, options);
    assert!(matches!(result, Err(PipelineError::Detector(_))));
    assert_eq!(writer.frames.get(), 1);
    assert_eq!(writer.finishes.get(), 1);
    assert_eq!(releases.get(), 1);
  }

  #[test]
  fn test_stop_flag() {
    let mut pipeline = pipeline(MockDetector::empty());
    let mut source = SyntheticSource::new(10);
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let options = VideoRunOptions::default()
      .with_stop_flag(stop)
      .with_progress(move |index, _| {
        if index == 2 {
          flag.store(true, Ordering::SeqCst);
        }
      });
    let summary = pipeline.process_video(&mut source, options).unwrap();
    assert_eq!(summary.frames_processed, 3);
    assert!(summary.stopped_early);
  }

  #[test]
  fn test_replace_tracker_resets_history() {
    let mut detector = MockDetector::empty();
    detector.detections = vec![person([0.0, 0.0, 10.0, 10.0])];
    let mut pipeline = pipeline(detector);
    pipeline
      .process_frame(&RgbImage::new(16, 16), FrameMetadata::default())
      .unwrap();
    assert_eq!(pipeline.tracker().trajectories().len(), 1);

    let old = pipeline.replace_tracker(MockTracker::default());
    assert_eq!(old.trajectories().len(), 1);
    assert!(pipeline.tracker().trajectories().is_empty());
  }

  #[test]
  fn test_generate_heatmap_shape() {
    let mut detector = MockDetector::empty();
    detector.detections = vec![person([0.0, 0.0, 10.0, 10.0])];
    let mut pipeline = pipeline(detector);
    pipeline
      .process_frame(&RgbImage::new(40, 30), FrameMetadata::default())
      .unwrap();
    let heatmap = pipeline.generate_heatmap((40, 30));
    assert_eq!(heatmap.dimensions(), (40, 30));
  }
}
