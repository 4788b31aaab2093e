// 该文件是 Guanzhao （观照） 项目的一部分。
// src/model/postprocess.rs - YOLO 输出解码
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

//! Ultralytics YOLOv8 导出格式的后处理。
//!
//! 检测输出形状为 `[1, 4 + nc + nm, N]`，前 4 行是输入像素坐标下的
//! `cx, cy, w, h`，随后 `nc` 行是已经过 sigmoid 的类别分数，
//! 分割模型最后还有 `nm` 行掩码系数。分割模型的第二个输出是
//! `[1, nm, mh, mw]` 的掩码原型。

use image::{GrayImage, Luma};
use thiserror::Error;
use tracing::debug;

use crate::model::{DetectItem, DetectResult, iou};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
  #[error("输出形状无效: {0}")]
  InvalidShape(String),
}

/// 从推理引擎拷贝出来的张量
#[derive(Debug, Clone)]
pub struct RawTensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl RawTensor {
  pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, DecodeError> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
      return Err(DecodeError::InvalidShape(format!(
        "形状 {:?} 需要 {} 个元素, 实际 {} 个",
        shape,
        expected,
        data.len()
      )));
    }
    Ok(Self { shape, data })
  }
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
  pub confidence: f32,
  pub nms_threshold: f32,
  pub input_size: u32,
}

impl Default for DecodeOptions {
  fn default() -> Self {
    Self {
      confidence: 0.25,
      nms_threshold: 0.45,
      input_size: 640,
    }
  }
}

#[derive(Debug, Clone)]
struct Candidate {
  class_id: u32,
  score: f32,
  bbox: [f32; 4],
  coeffs: Vec<f32>,
}

struct Protos<'a> {
  channels: usize,
  height: usize,
  width: usize,
  data: &'a [f32],
}

pub fn decode(
  preds: &RawTensor,
  protos: Option<&RawTensor>,
  options: &DecodeOptions,
  frame_size: (u32, u32),
) -> Result<DetectResult, DecodeError> {
  let (rows, anchors) = match preds.shape.as_slice() {
    [1, rows, anchors] => (*rows, *anchors),
    other => {
      return Err(DecodeError::InvalidShape(format!(
        "检测输出应为 [1, C, N], 实际 {:?}",
        other
      )));
    }
  };

  let protos = match protos {
    Some(t) => match t.shape.as_slice() {
      [1, c, h, w] => Some(Protos {
        channels: *c,
        height: *h,
        width: *w,
        data: &t.data,
      }),
      other => {
        return Err(DecodeError::InvalidShape(format!(
          "掩码原型应为 [1, nm, mh, mw], 实际 {:?}",
          other
        )));
      }
    },
    None => None,
  };

  let num_masks = protos.as_ref().map(|p| p.channels).unwrap_or(0);
  if rows <= 4 + num_masks {
    return Err(DecodeError::InvalidShape(format!(
      "检测输出行数 {} 不足以容纳 4 + nc + {}",
      rows, num_masks
    )));
  }
  let num_classes = rows - 4 - num_masks;
  let size = options.input_size as f32;
  let at = |row: usize, anchor: usize| preds.data[row * anchors + anchor];

  let mut candidates = Vec::new();
  for i in 0..anchors {
    let (class_id, score) = (0..num_classes)
      .map(|c| (c, at(4 + c, i)))
      .fold((0usize, f32::MIN), |best, cur| {
        if cur.1 > best.1 { cur } else { best }
      });

    if score < options.confidence {
      continue;
    }

    let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
    let bbox = [
      ((cx - w / 2.0) / size).clamp(0.0, 1.0),
      ((cy - h / 2.0) / size).clamp(0.0, 1.0),
      ((cx + w / 2.0) / size).clamp(0.0, 1.0),
      ((cy + h / 2.0) / size).clamp(0.0, 1.0),
    ];
    if bbox[0] >= bbox[2] || bbox[1] >= bbox[3] {
      continue;
    }

    let coeffs = (0..num_masks)
      .map(|k| at(4 + num_classes + k, i))
      .collect();

    candidates.push(Candidate {
      class_id: class_id as u32,
      score,
      bbox,
      coeffs,
    });
  }

  debug!("候选框 {} 个, 开始 NMS", candidates.len());
  let kept = nms(candidates, options.nms_threshold);

  let items = kept
    .into_iter()
    .map(|c| {
      let mut item = DetectItem::new(c.class_id, c.score, c.bbox);
      if let Some(protos) = protos.as_ref() {
        item.mask = Some(build_mask(&c.coeffs, protos, &c.bbox, frame_size));
      }
      item
    })
    .collect::<Vec<_>>();

  debug!("检测到 {} 个物体", items.len());
  Ok(DetectResult::new(items))
}

/// 按类别的非极大值抑制
fn nms(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut result: Vec<Candidate> = Vec::new();
  for candidate in candidates {
    let suppressed = result.iter().any(|kept| {
      kept.class_id == candidate.class_id && iou(&kept.bbox, &candidate.bbox) >= threshold
    });
    if !suppressed {
      result.push(candidate);
    }
  }
  result
}

/// 系数与原型做线性组合，sigmoid > 0.5（即 logit > 0）的像素属于实例，裁剪到边界框内
fn build_mask(
  coeffs: &[f32],
  protos: &Protos,
  bbox: &[f32; 4],
  frame_size: (u32, u32),
) -> GrayImage {
  let (fw, fh) = frame_size;
  let mut mask = GrayImage::new(fw, fh);
  if fw == 0 || fh == 0 || protos.width == 0 || protos.height == 0 {
    return mask;
  }

  let plane = protos.width * protos.height;
  let x_min = ((bbox[0] * fw as f32).floor() as u32).min(fw);
  let y_min = ((bbox[1] * fh as f32).floor() as u32).min(fh);
  let x_max = ((bbox[2] * fw as f32).ceil() as u32).min(fw);
  let y_max = ((bbox[3] * fh as f32).ceil() as u32).min(fh);

  for y in y_min..y_max {
    let py = (((y as f32 + 0.5) / fh as f32) * protos.height as f32) as usize;
    let py = py.min(protos.height - 1);
    for x in x_min..x_max {
      let px = (((x as f32 + 0.5) / fw as f32) * protos.width as f32) as usize;
      let px = px.min(protos.width - 1);
      let offset = py * protos.width + px;
      let logit: f32 = coeffs
        .iter()
        .enumerate()
        .map(|(k, c)| c * protos.data[k * plane + offset])
        .sum();
      if logit > 0.0 {
        mask.put_pixel(x, y, Luma([255]));
      }
    }
  }
  mask
}

#[cfg(test)]
mod tests {
  use super::*;

  // 构造 [1, 4 + nc + nm, N] 的预测张量，每个 anchor 一列
  fn preds(columns: &[Vec<f32>]) -> RawTensor {
    let rows = columns[0].len();
    let n = columns.len();
    let mut data = vec![0.0; rows * n];
    for (i, col) in columns.iter().enumerate() {
      for (r, v) in col.iter().enumerate() {
        data[r * n + i] = *v;
      }
    }
    RawTensor::new(vec![1, rows, n], data).unwrap()
  }

  #[test]
  fn raw_tensor_checks_element_count() {
    assert!(RawTensor::new(vec![1, 2, 3], vec![0.0; 5]).is_err());
    assert!(RawTensor::new(vec![1, 2, 3], vec![0.0; 6]).is_ok());
  }

  #[test]
  fn decodes_boxes_above_threshold() {
    // 两个类别, 两个 anchor: 第一个是类别 1 分数 0.9, 第二个分数太低
    let t = preds(&[
      vec![320.0, 320.0, 64.0, 128.0, 0.1, 0.9],
      vec![100.0, 100.0, 10.0, 10.0, 0.1, 0.2],
    ]);
    let result = decode(&t, None, &DecodeOptions::default(), (640, 640)).unwrap();
    assert_eq!(result.len(), 1);
    let item = &result.items[0];
    assert_eq!(item.class_id, 1);
    assert!((item.score - 0.9).abs() < 1e-6);
    assert!((item.bbox[0] - 0.45).abs() < 1e-6);
    assert!((item.bbox[1] - 0.4).abs() < 1e-6);
    assert!((item.bbox[2] - 0.55).abs() < 1e-6);
    assert!((item.bbox[3] - 0.6).abs() < 1e-6);
    assert!(item.mask.is_none());
  }

  #[test]
  fn nms_suppresses_same_class_overlaps_only() {
    let t = preds(&[
      vec![320.0, 320.0, 100.0, 100.0, 0.9, 0.0],
      vec![322.0, 320.0, 100.0, 100.0, 0.8, 0.0],
      vec![322.0, 320.0, 100.0, 100.0, 0.0, 0.7],
    ]);
    let result = decode(&t, None, &DecodeOptions::default(), (640, 640)).unwrap();
    let mut classes: Vec<u32> = result.items.iter().map(|i| i.class_id).collect();
    classes.sort();
    assert_eq!(classes, vec![0, 1]);
  }

  #[test]
  fn masks_are_cropped_to_box() {
    // 一个类别, 一个掩码通道, 2x2 原型全部为正
    let t = preds(&[vec![320.0, 320.0, 320.0, 320.0, 0.9, 1.0]]);
    let protos = RawTensor::new(vec![1, 1, 2, 2], vec![1.0; 4]).unwrap();
    let result = decode(&t, Some(&protos), &DecodeOptions::default(), (8, 8)).unwrap();
    let mask = result.items[0].mask.as_ref().unwrap();
    assert_eq!(mask.dimensions(), (8, 8));
    // 框为 [0.25, 0.25, 0.75, 0.75] -> 像素 2..6
    assert_eq!(mask.get_pixel(3, 3)[0], 255);
    assert_eq!(mask.get_pixel(0, 0)[0], 0);
    assert_eq!(mask.get_pixel(7, 7)[0], 0);
  }

  #[test]
  fn rejects_unexpected_shapes() {
    let t = RawTensor::new(vec![2, 3], vec![0.0; 6]).unwrap();
    assert!(decode(&t, None, &DecodeOptions::default(), (1, 1)).is_err());

    let too_few_rows = RawTensor::new(vec![1, 4, 1], vec![0.0; 4]).unwrap();
    assert!(decode(&too_few_rows, None, &DecodeOptions::default(), (1, 1)).is_err());
  }
}
