// 该文件是 Guanzhao （观照） 项目的一部分。
// src/model/yolo.rs - ONNX Runtime 上的 YOLO 模型
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

//! # YOLO 模型
//!
//! 加载 Ultralytics 导出的 YOLOv8 ONNX 模型（检测或分割）。
//!
//! ## URL 格式
//!
//! - `onnx:yolov8n.onnx` - 相对路径
//! - `onnx:///models/yolov8n-seg.onnx?conf=0.3&iou=0.5` - 绝对路径与阈值
//!
//! ## 参数说明
//!
//! - `conf`: 置信度阈值，默认 0.25
//! - `iou`: NMS IoU 阈值，默认 0.45
//! - `size`: 模型输入边长，默认 640
//! - `labels`: 类别名称文件，每行一个，默认 COCO 80 类
//! - `threads`: ONNX Runtime 线程数，默认 4

use std::collections::HashMap;
use std::sync::Mutex;

use image::{RgbImage, imageops::FilterType};
use ndarray::Array4;
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::Value,
};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{
    DetectResult, Labels, LabelsError, Model,
    postprocess::{self, DecodeError, DecodeOptions, RawTensor},
  },
};

const DEFAULT_THREADS: usize = 4;

#[derive(Error, Debug)]
pub enum YoloError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("参数错误: {0}")]
  InvalidParameter(String),
  #[error("ONNX Runtime 错误: {0}")]
  Runtime(String),
  #[error("标签错误: {0}")]
  Labels(#[from] LabelsError),
  #[error("张量错误: {0}")]
  Shape(#[from] ndarray::ShapeError),
  #[error("后处理错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("模型输出数量无效: {0}")]
  OutputCount(usize),
  #[error("推理会话锁已损坏")]
  Poisoned,
}

fn runtime<E: std::fmt::Display>(err: E) -> YoloError {
  YoloError::Runtime(err.to_string())
}

pub struct YoloOnnxBuilder {
  model_path: String,
  labels_path: Option<String>,
  options: DecodeOptions,
  threads: usize,
}

impl FromUrlWithScheme for YoloOnnxBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for YoloOnnxBuilder {
  type Error = YoloError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(YoloError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut builder = YoloOnnxBuilder::new(url.path());
    if let Some(v) = query.get("conf") {
      builder.options.confidence = parse_param("conf", v)?;
    }
    if let Some(v) = query.get("iou") {
      builder.options.nms_threshold = parse_param("iou", v)?;
    }
    if let Some(v) = query.get("size") {
      builder.options.input_size = parse_param("size", v)?;
    }
    if let Some(v) = query.get("threads") {
      builder.threads = parse_param("threads", v)?;
    }
    builder.labels_path = query.get("labels").cloned();

    Ok(builder)
  }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, YoloError> {
  value
    .parse()
    .map_err(|_| YoloError::InvalidParameter(format!("{}={}", key, value)))
}

impl YoloOnnxBuilder {
  pub fn new(model_path: impl Into<String>) -> Self {
    Self {
      model_path: model_path.into(),
      labels_path: None,
      options: DecodeOptions::default(),
      threads: DEFAULT_THREADS,
    }
  }

  pub fn build(self) -> Result<YoloOnnx, YoloError> {
    if !(0.0..=1.0).contains(&self.options.confidence)
      || !(0.0..=1.0).contains(&self.options.nms_threshold)
    {
      return Err(YoloError::InvalidParameter(format!(
        "阈值必须在 [0, 1] 之间: conf={}, iou={}",
        self.options.confidence, self.options.nms_threshold
      )));
    }
    if self.options.input_size == 0 || self.threads == 0 {
      return Err(YoloError::InvalidParameter(
        "size 与 threads 必须大于 0".to_string(),
      ));
    }

    let labels = match &self.labels_path {
      Some(path) => Labels::from_file(path)?,
      None => Labels::coco(),
    };

    info!("加载模型文件: {}", self.model_path);
    let session = Session::builder()
      .map_err(runtime)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(runtime)?
      .with_intra_threads(self.threads)
      .map_err(runtime)?
      .commit_from_file(&self.model_path)
      .map_err(runtime)?;

    let input_name = session
      .inputs()
      .first()
      .map(|input| input.name().to_string())
      .ok_or(YoloError::OutputCount(0))?;
    let num_outputs = session.outputs().len();
    if num_outputs == 0 || num_outputs > 2 {
      return Err(YoloError::OutputCount(num_outputs));
    }

    debug!("模型输入: {}", input_name);
    debug!("模型输出数量: {}", num_outputs);
    info!(
      "模型加载完成: {} ({} 类别, {})",
      self.model_path,
      labels.len(),
      if num_outputs == 2 { "分割" } else { "检测" }
    );

    Ok(YoloOnnx {
      session: Mutex::new(session),
      input_name,
      labels,
      options: self.options,
    })
  }
}

pub struct YoloOnnx {
  session: Mutex<Session>,
  input_name: String,
  labels: Labels,
  options: DecodeOptions,
}

impl YoloOnnx {
  /// 拉伸缩放到模型输入尺寸，转换为 NCHW 并归一化到 [0, 1]
  fn preprocess(&self, frame: &RgbImage) -> Result<Array4<f32>, YoloError> {
    let size = self.options.input_size;
    let resized = image::imageops::resize(frame, size, size, FilterType::Triangle);

    let plane = (size * size) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, pixel) in resized.pixels().enumerate() {
      data[i] = pixel[0] as f32 / 255.0;
      data[plane + i] = pixel[1] as f32 / 255.0;
      data[2 * plane + i] = pixel[2] as f32 / 255.0;
    }

    Ok(Array4::from_shape_vec(
      (1, 3, size as usize, size as usize),
      data,
    )?)
  }
}

impl Model for YoloOnnx {
  type Error = YoloError;

  fn infer(&self, frame: &RgbImage) -> Result<DetectResult, Self::Error> {
    let input = Value::from_array(self.preprocess(frame)?).map_err(runtime)?;

    let tensors = {
      let mut session = self.session.lock().map_err(|_| YoloError::Poisoned)?;
      debug!("执行模型推理");
      let outputs = session
        .run(ort::inputs![self.input_name.as_str() => input])
        .map_err(runtime)?;

      let mut tensors = Vec::with_capacity(2);
      for value in outputs.values() {
        let (shape, data) = value.try_extract_tensor::<f32>().map_err(runtime)?;
        let shape = shape.iter().map(|&d| d.max(0) as usize).collect();
        tensors.push(RawTensor::new(shape, data.to_vec())?);
      }
      tensors
    };

    match tensors.as_slice() {
      [preds] => Ok(postprocess::decode(
        preds,
        None,
        &self.options,
        frame.dimensions(),
      )?),
      [preds, protos] => Ok(postprocess::decode(
        preds,
        Some(protos),
        &self.options,
        frame.dimensions(),
      )?),
      other => Err(YoloError::OutputCount(other.len())),
    }
  }

  fn labels(&self) -> &Labels {
    &self.labels
  }
}
