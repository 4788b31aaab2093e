// 该文件是 Guanzhao （观照） 项目的一部分。
// src/track.rs - 多目标跟踪
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

use image::RgbImage;
use tracing::debug;

use crate::model::{DetectResult, Model, iou};

const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_MAX_MISSED: u32 = 30;

#[derive(Debug, Clone)]
struct Track {
  id: u64,
  class_id: u32,
  bbox: [f32; 4],
  missed: u32,
}

/// 基于 IoU 贪心匹配的跟踪器，状态只在一个任务内有效
#[derive(Debug, Clone)]
pub struct Tracker {
  tracks: Vec<Track>,
  next_id: u64,
  iou_threshold: f32,
  max_missed: u32,
}

impl Default for Tracker {
  fn default() -> Self {
    Self::new(DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_MISSED)
  }
}

impl Tracker {
  pub fn new(iou_threshold: f32, max_missed: u32) -> Self {
    Self {
      tracks: Vec::new(),
      next_id: 1,
      iou_threshold,
      max_missed,
    }
  }

  pub fn active_tracks(&self) -> usize {
    self.tracks.len()
  }

  /// 为本帧的每个检测写入 `track_id`
  pub fn update(&mut self, result: &mut DetectResult) {
    let mut pairs = Vec::new();
    for (d, item) in result.items.iter().enumerate() {
      for (t, track) in self.tracks.iter().enumerate() {
        if track.class_id != item.class_id {
          continue;
        }
        let overlap = iou(&track.bbox, &item.bbox);
        if overlap >= self.iou_threshold {
          pairs.push((overlap, d, t));
        }
      }
    }
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut det_matched = vec![false; result.items.len()];
    let mut track_matched = vec![false; self.tracks.len()];
    for (_, d, t) in pairs {
      if det_matched[d] || track_matched[t] {
        continue;
      }
      det_matched[d] = true;
      track_matched[t] = true;

      let track = &mut self.tracks[t];
      track.bbox = result.items[d].bbox;
      track.missed = 0;
      result.items[d].track_id = Some(track.id);
    }

    for (track, matched) in self.tracks.iter_mut().zip(&track_matched) {
      if !matched {
        track.missed += 1;
      }
    }
    let max_missed = self.max_missed;
    self.tracks.retain(|track| track.missed <= max_missed);

    for (item, matched) in result.items.iter_mut().zip(det_matched) {
      if matched {
        continue;
      }
      let id = self.next_id;
      self.next_id += 1;
      item.track_id = Some(id);
      self.tracks.push(Track {
        id,
        class_id: item.class_id,
        bbox: item.bbox,
        missed: 0,
      });
    }

    debug!("活跃轨迹 {} 条", self.tracks.len());
  }
}

/// 模型与跟踪器的组合，逐帧推理并分配持久 ID
pub struct TrackingSession<'m, M: Model> {
  model: &'m M,
  tracker: Tracker,
}

impl<'m, M: Model> TrackingSession<'m, M> {
  pub fn new(model: &'m M) -> Self {
    Self::with_tracker(model, Tracker::default())
  }

  pub fn with_tracker(model: &'m M, tracker: Tracker) -> Self {
    Self { model, tracker }
  }

  pub fn track(&mut self, frame: &RgbImage) -> Result<DetectResult, M::Error> {
    let mut result = self.model.infer(frame)?;
    self.tracker.update(&mut result);
    Ok(result)
  }
}
