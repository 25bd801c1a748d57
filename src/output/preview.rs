// 该文件是 Trajector （轨迹绘卷） 项目的一部分。
// src/output/preview.rs - GStreamer 预览窗口
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

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{OutputError, Preview, PreviewEvent};

#[derive(Error, Debug)]
pub enum PreviewError {
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("Pipeline error: {0}")]
  PipelineError(String),
}

/// autovideosink 窗口，按键通过 navigation 事件回传
pub struct GStreamerPreview {
  title: String,
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  size: Option<(u32, u32)>,
  open: bool,
}

impl GStreamerPreview {
  pub fn new(title: &str) -> Result<Self, PreviewError> {
    gst::init()?;

    let description =
      "appsrc name=src is-live=true format=time ! videoconvert ! autovideosink sync=false";
    let pipeline = gst::parse::launch(description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| PreviewError::PipelineError("Failed to create pipeline".to_string()))?;
    let appsrc = pipeline
      .by_name("src")
      .ok_or(PreviewError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| PreviewError::AppSrcNotFound)?;

    pipeline.set_state(gst::State::Playing)?;
    info!("预览窗口已打开: {}", title);

    Ok(Self {
      title: title.to_string(),
      pipeline,
      appsrc,
      size: None,
      open: true,
    })
  }

  fn push(&mut self, frame: &RgbImage) -> Result<(), PreviewError> {
    if self.size != Some(frame.dimensions()) {
      let caps = gst::Caps::builder("video/x-raw")
        .field("format", "RGB")
        .field("width", frame.width() as i32)
        .field("height", frame.height() as i32)
        .field("framerate", gst::Fraction::new(0, 1))
        .build();
      self.appsrc.set_caps(Some(&caps));
      self.size = Some(frame.dimensions());
    }

    let buffer = gst::Buffer::from_slice(frame.as_raw().clone());
    self
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| PreviewError::PipelineError(format!("Failed to push buffer: {:?}", e)))?;
    Ok(())
  }

  /// 处理总线上积压的消息，取最后一次按键
  fn poll_events(&self) -> PreviewEvent {
    let Some(bus) = self.pipeline.bus() else {
      return PreviewEvent::Continue;
    };

    let mut event = PreviewEvent::Continue;
    while let Some(message) = bus.pop() {
      match message.view() {
        gst::MessageView::Eos(..) => return PreviewEvent::Closed,
        gst::MessageView::Error(err) => {
          // 关闭窗口时 sink 会报错
          debug!("预览窗口错误: {}", err.error());
          return PreviewEvent::Closed;
        }
        gst::MessageView::Element(..) => {
          if let Ok(gst_video::NavigationMessage::Event { event: nav, .. }) =
            gst_video::NavigationMessage::parse(&message)
          {
            if let Ok(gst_video::NavigationEvent::KeyPress { key, .. }) =
              gst_video::NavigationEvent::parse(&nav)
            {
              let mut chars = key.chars();
              if let (Some(c), None) = (chars.next(), chars.next()) {
                event = PreviewEvent::Key(c.to_ascii_lowercase());
              }
            }
          }
        }
        _ => {}
      }
    }
    event
  }
}

impl Preview for GStreamerPreview {
  fn show(&mut self, frame: &RgbImage) -> Result<PreviewEvent, OutputError> {
    if !self.open {
      return Ok(PreviewEvent::Closed);
    }
    self.push(frame)?;
    Ok(self.poll_events())
  }

  fn close(&mut self) {
    if self.open {
      self.open = false;
      let _ = self.appsrc.end_of_stream();
      if let Err(e) = self.pipeline.set_state(gst::State::Null) {
        warn!("Failed to stop preview pipeline: {}", e);
      }
      debug!("预览窗口已关闭: {}", self.title);
    }
  }
}

impl Drop for GStreamerPreview {
  fn drop(&mut self) {
    self.close();
  }
}
