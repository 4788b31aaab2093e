// 该文件是 Guanzhao （观照） 项目的一部分。
// src/model.rs - 模型
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

use image::{GrayImage, RgbImage};

mod labels;
pub use self::labels::{COCO_CLASSES, Labels, LabelsError};

pub mod postprocess;

#[cfg(feature = "onnx_model")]
mod yolo;
#[cfg(feature = "onnx_model")]
pub use self::yolo::{YoloError, YoloOnnx, YoloOnnxBuilder};

/// 模型句柄
///
/// 句柄在程序启动时创建一次，之后在各个任务之间只读共享。
pub trait Model: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn infer(&self, frame: &RgbImage) -> Result<DetectResult, Self::Error>;
  fn labels(&self) -> &Labels;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，归一化坐标
  /// 与帧同尺寸的实例掩码，非零像素属于该实例
  pub mask: Option<GrayImage>,
  /// 跟踪模式下的持久 ID
  pub track_id: Option<u64>,
}

impl DetectItem {
  pub fn new(class_id: u32, score: f32, bbox: [f32; 4]) -> Self {
    Self {
      class_id,
      score,
      bbox,
      mask: None,
      track_id: None,
    }
  }

  pub fn with_mask(mut self, mask: GrayImage) -> Self {
    self.mask = Some(mask);
    self
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Vec<DetectItem>,
}

impl DetectResult {
  pub fn new(items: Vec<DetectItem>) -> Self {
    Self { items }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

/// 计算两个归一化边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn iou_of_identical_boxes_is_one() {
    let b = [0.1, 0.1, 0.5, 0.5];
    assert!((iou(&b, &b) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn iou_of_disjoint_boxes_is_zero() {
    assert_eq!(iou(&[0.0, 0.0, 0.2, 0.2], &[0.5, 0.5, 0.8, 0.8]), 0.0);
  }

  #[test]
  fn iou_of_half_overlap() {
    // 两个 0.2x0.2 的框重叠一半: 0.02 / (0.04 + 0.04 - 0.02)
    let v = iou(&[0.0, 0.0, 0.2, 0.2], &[0.1, 0.0, 0.3, 0.2]);
    assert!((v - 1.0 / 3.0).abs() < 1e-5);
  }
}
