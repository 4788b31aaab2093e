// 该文件是 Guanzhao （观照） 项目的一部分。
// src/video.rs - 视频读写
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

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use image::RgbImage;
use thiserror::Error;

#[cfg(feature = "ffmpeg_video")]
mod ffmpeg;
#[cfg(feature = "ffmpeg_video")]
pub use self::ffmpeg::{FfmpegBackend, FfmpegSink, FfmpegSource};

#[derive(Error, Debug)]
pub enum VideoError {
  #[error("无法打开视频 {path}: {reason}")]
  Open { path: String, reason: String },
  #[error("找不到视频流: {0}")]
  NoVideoStream(String),
  #[error("找不到编码器: {0}")]
  EncoderNotFound(Codec),
  #[error("帧尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  FrameSize {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("帧率无效: {0}")]
  InvalidFps(f64),
  #[error("视频解码错误: {0}")]
  Decode(String),
  #[error("视频编码错误: {0}")]
  Encode(String),
  #[cfg(feature = "ffmpeg_video")]
  #[error("FFmpeg 错误: {0}")]
  Ffmpeg(#[from] ffmpeg_next::Error),
}

/// 视频流参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
  pub fps: f64,
  pub width: u32,
  pub height: u32,
}

/// 输出视频的编码标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
  /// MPEG-4 Part 2
  #[default]
  Mpeg4,
  H264,
}

impl Codec {
  pub fn fourcc(&self) -> &'static str {
    match self {
      Codec::Mpeg4 => "mp4v",
      Codec::H264 => "avc1",
    }
  }
}

impl fmt::Display for Codec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.fourcc())
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("未知的编码标签: {0}")]
pub struct UnknownCodec(pub String);

impl FromStr for Codec {
  type Err = UnknownCodec;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "mp4v" | "mpeg4" => Ok(Codec::Mpeg4),
      "avc1" | "h264" => Ok(Codec::H264),
      _ => Err(UnknownCodec(s.to_string())),
    }
  }
}

/// 视频输入，逐帧产出 RGB 图像
pub trait VideoSource: Iterator<Item = Result<RgbImage, VideoError>> {
  fn info(&self) -> VideoInfo;
}

/// 视频输出
pub trait VideoSink {
  /// 写入一帧
  fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError>;

  /// 刷新编码器并写入文件尾
  fn finish(&mut self) -> Result<(), VideoError>;
}

pub trait VideoBackend: Send + Sync {
  fn open_source(&self, path: &Path) -> Result<Box<dyn VideoSource>, VideoError>;

  fn open_sink(
    &self,
    path: &Path,
    info: VideoInfo,
    codec: Codec,
  ) -> Result<Box<dyn VideoSink>, VideoError>;
}
