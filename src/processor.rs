// 该文件是 Guanzhao （观照） 项目的一部分。
// src/processor.rs - 媒体处理
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

//! # 媒体处理
//!
//! 根据任务类型选择模型，根据扩展名选择图像或视频流程，
//! 把标注结果写到输入文件旁边的 `<stem>_result.<ext>`。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::{
  input::{InputError, read_image},
  job::{ClassCounts, Job, JobResult, TaskKind},
  model::Model,
  output::{Draw, OutputError, save_image},
  track::TrackingSession,
  video::{Codec, VideoBackend, VideoError},
};

pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
pub const VIDEO_EXTENSIONS: [&str; 1] = ["mp4"];

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("Unsupported file extension: {0}")]
  UnsupportedExtension(String),
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("视频错误: {0}")]
  Video(#[from] VideoError),
  #[error("模型推理错误: {0}")]
  Model(Box<dyn std::error::Error + Send + Sync>),
}

fn model_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> ProcessError {
  ProcessError::Model(Box::new(err))
}

/// 输入媒体类型，由扩展名（不区分大小写）决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
  Image,
  Video,
}

impl MediaKind {
  pub fn from_path(path: &Path) -> Result<Self, ProcessError> {
    let ext = path
      .extension()
      .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
      .unwrap_or_default();

    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
      Ok(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
      Ok(MediaKind::Video)
    } else {
      let shown = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
      Err(ProcessError::UnsupportedExtension(shown))
    }
  }
}

/// `<dir>/<stem>_result<.ext>`
pub fn output_path(input: &Path) -> PathBuf {
  let stem = input
    .file_stem()
    .map(|stem| stem.to_string_lossy().into_owned())
    .unwrap_or_default();
  let name = match input.extension() {
    Some(ext) => format!("{}_result.{}", stem, ext.to_string_lossy()),
    None => format!("{}_result", stem),
  };
  input.with_file_name(name)
}

/// 处理一个任务，由任务执行器在工作线程上调用
pub trait Process: Send + Sync {
  fn process(&self, job: &Job) -> Result<JobResult, ProcessError>;
}

pub struct MediaProcessor<D: Model, S: Model, V: VideoBackend> {
  detect: Arc<D>,
  segment: Arc<S>,
  video: V,
  draw: Draw,
  codec: Codec,
}

impl<D: Model, S: Model, V: VideoBackend> MediaProcessor<D, S, V> {
  pub fn new(detect: Arc<D>, segment: Arc<S>, video: V) -> Self {
    Self {
      detect,
      segment,
      video,
      draw: Draw::default(),
      codec: Codec::default(),
    }
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn with_codec(mut self, codec: Codec) -> Self {
    self.codec = codec;
    self
  }

  fn run<M: Model>(
    &self,
    model: &M,
    job: &Job,
    kind: MediaKind,
    output: &Path,
  ) -> Result<ClassCounts, ProcessError> {
    match kind {
      MediaKind::Image => self.process_image(model, job, output),
      MediaKind::Video => self.process_video(model, job, output),
    }
  }

  fn process_image<M: Model>(
    &self,
    model: &M,
    job: &Job,
    output: &Path,
  ) -> Result<ClassCounts, ProcessError> {
    let frame = read_image(&job.input)?;
    let result = model.infer(&frame).map_err(model_error)?;

    let labels = model.labels();
    let mut counts = ClassCounts::new();
    for item in result.items.iter() {
      *counts.entry(labels.name(item.class_id)).or_insert(0) += 1;
    }
    debug!("检测到 {} 个目标: {:?}", result.len(), counts);

    let rendered = self.draw.render(&frame, &result, &job.display, labels);
    save_image(&rendered, output)?;

    Ok(counts)
  }

  fn process_video<M: Model>(
    &self,
    model: &M,
    job: &Job,
    output: &Path,
  ) -> Result<ClassCounts, ProcessError> {
    let source = self.video.open_source(&job.input)?;
    let info = source.info();
    let mut sink = self.video.open_sink(output, info, self.codec)?;

    // 跟踪状态只在本任务内有效
    let mut session = TrackingSession::new(model);
    let mut frames = 0usize;

    for frame in source {
      let frame = frame?;
      let result = session.track(&frame).map_err(model_error)?;

      let annotated = match job.task {
        TaskKind::Track => {
          let mut annotated = frame;
          self.draw.draw_instance_overlays(&mut annotated, &result);
          annotated
        }
        TaskKind::Detect | TaskKind::Segment => {
          let mut annotated = self.draw.render(&frame, &result, &job.display, model.labels());
          self.draw.draw_instance_overlays(&mut annotated, &result);
          annotated
        }
      };

      sink.write_frame(&annotated)?;
      frames += 1;
    }

    sink.finish()?;
    info!("视频处理完成: {} 帧 -> {}", frames, output.display());

    Ok(ClassCounts::new())
  }
}

impl<D: Model, S: Model, V: VideoBackend> Process for MediaProcessor<D, S, V> {
  fn process(&self, job: &Job) -> Result<JobResult, ProcessError> {
    let kind = MediaKind::from_path(&job.input)?;
    let output = output_path(&job.input);
    info!(
      "开始处理: {} ({}, {:?})",
      job.input.display(),
      job.task,
      kind
    );

    let class_counts = match job.task {
      TaskKind::Detect => self.run(self.detect.as_ref(), job, kind, &output)?,
      TaskKind::Segment | TaskKind::Track => self.run(self.segment.as_ref(), job, kind, &output)?,
    };

    Ok(JobResult {
      output,
      class_counts,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn output_sits_next_to_input() {
    assert_eq!(
      output_path(Path::new("/data/cat.jpg")),
      PathBuf::from("/data/cat_result.jpg")
    );
    assert_eq!(
      output_path(Path::new("clips/road.MP4")),
      PathBuf::from("clips/road_result.MP4")
    );
    assert_eq!(
      output_path(Path::new("archive.tar.png")),
      PathBuf::from("archive.tar_result.png")
    );
  }

  #[test]
  fn media_kind_ignores_case() {
    assert_eq!(MediaKind::from_path(Path::new("a.JPG")).unwrap(), MediaKind::Image);
    assert_eq!(MediaKind::from_path(Path::new("a.jpeg")).unwrap(), MediaKind::Image);
    assert_eq!(MediaKind::from_path(Path::new("a.Png")).unwrap(), MediaKind::Image);
    assert_eq!(MediaKind::from_path(Path::new("a.mp4")).unwrap(), MediaKind::Video);
  }

  #[test]
  fn unsupported_extension_message() {
    let err = MediaKind::from_path(Path::new("/tmp/anim.gif")).unwrap_err();
    assert_eq!(err.to_string(), "Unsupported file extension: .gif");

    let err = MediaKind::from_path(Path::new("/tmp/noext")).unwrap_err();
    assert!(matches!(err, ProcessError::UnsupportedExtension(ext) if ext.is_empty()));
  }
}
