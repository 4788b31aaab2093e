// 该文件是 Guanzhao （观照） 项目的一部分。
// src/video/ffmpeg.rs - FFmpeg 视频读写
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

//! # FFmpeg 视频后端
//!
//! ## 系统依赖
//!
//! 需要安装 FFmpeg 开发库：
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libavcodec-dev libavformat-dev libavutil-dev libswscale-dev
//! ```
//!
//! **macOS:**
//! ```bash
//! brew install ffmpeg
//! ```

use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::{Pixel, input, output};
use ffmpeg_next::media::Type;
use ffmpeg_next::software::scaling::{context::Context as ScalingContext, flag::Flags};
use ffmpeg_next::util::frame::video::Video;
use ffmpeg_next::{Rational, codec};
use image::RgbImage;
use tracing::{debug, error, info, warn};

use crate::video::{Codec, VideoBackend, VideoError, VideoInfo, VideoSink, VideoSource};

/// MPEG-4 Part 2 要求时间基准的分母不超过 16 位
const MAX_RATE_TERM: i32 = 65535;

/// 把帧率近似为分子分母都不超过 `MAX_RATE_TERM` 的有理数
fn bounded_frame_rate(fps: f64) -> Rational {
  Rational::from(fps)
    .reduce_with_limit(MAX_RATE_TERM)
    .unwrap_or_else(|approx| approx)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackend;

impl VideoBackend for FfmpegBackend {
  fn open_source(&self, path: &Path) -> Result<Box<dyn VideoSource>, VideoError> {
    Ok(Box::new(FfmpegSource::open(path)?))
  }

  fn open_sink(
    &self,
    path: &Path,
    info: VideoInfo,
    codec: Codec,
  ) -> Result<Box<dyn VideoSink>, VideoError> {
    Ok(Box::new(FfmpegSink::create(path, info, codec)?))
  }
}

/// 视频文件输入
pub struct FfmpegSource {
  /// FFmpeg 输入上下文
  input_context: ffmpeg::format::context::Input,
  /// 视频流索引
  video_stream_index: usize,
  /// 视频解码器
  decoder: ffmpeg::decoder::Video,
  /// 缩放上下文（原始格式 -> RGB24）
  scaler: ScalingContext,
  info: VideoInfo,
  /// 是否已向解码器发送 EOF
  eof_sent: bool,
  /// 是否结束
  finished: bool,
}

impl FfmpegSource {
  pub fn open(path: &Path) -> Result<Self, VideoError> {
    ffmpeg::init()?;

    let input_context = input(&path).map_err(|e| VideoError::Open {
      path: path.display().to_string(),
      reason: e.to_string(),
    })?;

    let video_stream = input_context
      .streams()
      .best(Type::Video)
      .ok_or_else(|| VideoError::NoVideoStream(path.display().to_string()))?;

    let video_stream_index = video_stream.index();
    let context_decoder =
      ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())?;
    let decoder = context_decoder.decoder().video()?;

    let width = decoder.width();
    let height = decoder.height();

    let mut rate = video_stream.avg_frame_rate();
    if rate.numerator() == 0 || rate.denominator() == 0 {
      rate = video_stream.rate();
    }
    if rate.denominator() == 0 {
      return Err(VideoError::InvalidFps(0.0));
    }
    let fps = rate.numerator() as f64 / rate.denominator() as f64;

    let scaler = ScalingContext::get(
      decoder.format(),
      width,
      height,
      Pixel::RGB24,
      width,
      height,
      Flags::BILINEAR,
    )?;

    info!(
      "视频已打开: {} ({}x{} @ {:.2} fps)",
      path.display(),
      width,
      height,
      fps
    );

    Ok(Self {
      input_context,
      video_stream_index,
      decoder,
      scaler,
      info: VideoInfo { fps, width, height },
      eof_sent: false,
      finished: false,
    })
  }

  /// 解码下一帧
  fn decode_next_frame(&mut self) -> Result<Option<Video>, VideoError> {
    let mut decoded = Video::empty();
    loop {
      // 首先尝试从解码器获取已解码的帧
      if self.decoder.receive_frame(&mut decoded).is_ok() {
        return Ok(Some(decoded));
      }
      if self.eof_sent {
        return Ok(None);
      }

      // 读取下一个视频数据包，读完后发送 EOF 以取出剩余帧
      let mut sent = false;
      for (stream, packet) in self.input_context.packets() {
        if stream.index() == self.video_stream_index {
          self.decoder.send_packet(&packet)?;
          sent = true;
          break;
        }
      }
      if !sent {
        self.decoder.send_eof()?;
        self.eof_sent = true;
      }
    }
  }

  fn to_rgb_image(&mut self, decoded: &Video) -> Result<RgbImage, VideoError> {
    let mut rgb_frame = Video::empty();
    self.scaler.run(decoded, &mut rgb_frame)?;

    let data = rgb_frame.data(0);
    let stride = rgb_frame.stride(0);
    let width = self.info.width as usize;
    let height = self.info.height as usize;

    // 处理步长对齐的数据
    let mut image_data = Vec::with_capacity(width * height * 3);
    for y in 0..height {
      let row_start = y * stride;
      image_data.extend_from_slice(&data[row_start..row_start + width * 3]);
    }

    RgbImage::from_raw(self.info.width, self.info.height, image_data)
      .ok_or_else(|| VideoError::Decode("无法创建 RGB 图像".to_string()))
  }
}

impl Iterator for FfmpegSource {
  type Item = Result<RgbImage, VideoError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }

    let result = match self.decode_next_frame() {
      Ok(Some(decoded)) => self.to_rgb_image(&decoded).map(Some),
      Ok(None) => Ok(None),
      Err(e) => Err(e),
    };

    match result {
      Ok(Some(image)) => Some(Ok(image)),
      Ok(None) => {
        self.finished = true;
        None
      }
      Err(e) => {
        self.finished = true;
        Some(Err(e))
      }
    }
  }
}

impl VideoSource for FfmpegSource {
  fn info(&self) -> VideoInfo {
    self.info
  }
}

/// 视频文件输出
pub struct FfmpegSink {
  /// FFmpeg 输出上下文
  output_context: ffmpeg::format::context::Output,
  /// 视频编码器
  encoder: ffmpeg::encoder::Video,
  /// 缩放上下文（RGB -> YUV）
  scaler: ScalingContext,
  width: u32,
  height: u32,
  /// 编码器时间基准
  encoder_time_base: Rational,
  /// 视频流时间基准，写入文件头后由封装格式决定
  stream_time_base: Rational,
  /// 视频流索引
  stream_index: usize,
  /// 帧索引
  frame_index: i64,
  path: String,
  finished: bool,
}

impl FfmpegSink {
  pub fn create(path: &Path, info: VideoInfo, codec: Codec) -> Result<Self, VideoError> {
    if !info.fps.is_finite() || info.fps <= 0.0 {
      return Err(VideoError::InvalidFps(info.fps));
    }

    ffmpeg::init()?;

    let mut output_context = output(&path).map_err(|e| VideoError::Open {
      path: path.display().to_string(),
      reason: e.to_string(),
    })?;

    // 查找编码器
    let codec_id = match codec {
      Codec::Mpeg4 => codec::Id::MPEG4,
      Codec::H264 => codec::Id::H264,
    };
    let encoder_codec =
      ffmpeg::encoder::find(codec_id).ok_or(VideoError::EncoderNotFound(codec))?;

    let global_header = output_context
      .format()
      .flags()
      .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

    let frame_rate = bounded_frame_rate(info.fps);
    let encoder_time_base = frame_rate.invert();
    debug!("输出帧率: {}/{}", frame_rate.numerator(), frame_rate.denominator());

    let (encoder, stream_index) = {
      let mut stream = output_context.add_stream(encoder_codec)?;
      let stream_index = stream.index();

      let context_encoder = ffmpeg::codec::context::Context::new_with_codec(encoder_codec);
      let mut encoder = context_encoder.encoder().video()?;

      encoder.set_width(info.width);
      encoder.set_height(info.height);
      encoder.set_format(Pixel::YUV420P);
      encoder.set_frame_rate(Some(frame_rate));
      encoder.set_time_base(encoder_time_base);
      if global_header {
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);
      }

      let encoder = encoder.open()?;
      stream.set_parameters(&encoder);
      stream.set_time_base(encoder_time_base);
      (encoder, stream_index)
    };

    // 写入文件头
    output_context.write_header()?;

    let stream_time_base = output_context
      .stream(stream_index)
      .map(|stream| stream.time_base())
      .ok_or_else(|| VideoError::Encode("输出视频流丢失".to_string()))?;

    // 创建缩放上下文（RGB24 -> YUV420P）
    let scaler = ScalingContext::get(
      Pixel::RGB24,
      info.width,
      info.height,
      Pixel::YUV420P,
      info.width,
      info.height,
      Flags::BILINEAR,
    )?;

    info!(
      "视频输出已创建: {} ({}x{} @ {:.2} fps, {})",
      path.display(),
      info.width,
      info.height,
      info.fps,
      codec
    );

    Ok(Self {
      output_context,
      encoder,
      scaler,
      width: info.width,
      height: info.height,
      encoder_time_base,
      stream_time_base,
      stream_index,
      frame_index: 0,
      path: path.display().to_string(),
      finished: false,
    })
  }

  /// 编码并写入帧，`None` 表示刷新编码器
  fn encode_frame(&mut self, frame: Option<&Video>) -> Result<(), VideoError> {
    match frame {
      Some(f) => self.encoder.send_frame(f)?,
      None => self.encoder.send_eof()?,
    }

    let mut packet = ffmpeg::Packet::empty();
    while self.encoder.receive_packet(&mut packet).is_ok() {
      packet.set_stream(self.stream_index);
      packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
      packet.write_interleaved(&mut self.output_context)?;
    }

    Ok(())
  }
}

impl VideoSink for FfmpegSink {
  fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
    if frame.dimensions() != (self.width, self.height) {
      return Err(VideoError::FrameSize {
        expected: (self.width, self.height),
        actual: frame.dimensions(),
      });
    }

    // 创建 RGB 帧
    let mut rgb_frame = Video::new(Pixel::RGB24, self.width, self.height);
    let data = frame.as_raw();
    let stride = rgb_frame.stride(0);
    let row_bytes = self.width as usize * 3;

    // 复制数据，处理步长对齐
    let frame_data = rgb_frame.data_mut(0);
    for y in 0..self.height as usize {
      let src_start = y * row_bytes;
      let dst_start = y * stride;
      frame_data[dst_start..dst_start + row_bytes]
        .copy_from_slice(&data[src_start..src_start + row_bytes]);
    }

    // 转换为 YUV
    let mut yuv_frame = Video::empty();
    self.scaler.run(&rgb_frame, &mut yuv_frame)?;

    yuv_frame.set_pts(Some(self.frame_index));
    self.frame_index += 1;

    self.encode_frame(Some(&yuv_frame))
  }

  fn finish(&mut self) -> Result<(), VideoError> {
    if self.finished {
      return Ok(());
    }
    self.finished = true;

    // 刷新编码器
    self.encode_frame(None)?;

    // 写入文件尾
    self.output_context.write_trailer()?;
    debug!("视频写入完成: {} 帧 -> {}", self.frame_index, self.path);

    Ok(())
  }
}

impl Drop for FfmpegSink {
  fn drop(&mut self) {
    if self.finished {
      return;
    }
    warn!("视频输出未正常结束，尝试写入文件尾: {}", self.path);
    if let Err(e) = self.finish() {
      error!("结束视频输出时出错: {}", e);
    }
  }
}
