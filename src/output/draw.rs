// 该文件是 Guanzhao （观照） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use ab_glyph::{FontArc, PxScale};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{debug, info, warn};

use crate::{
  job::DisplayOptions,
  model::{DetectItem, DetectResult, Labels},
  output::OutputError,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const MASK_ALPHA: f32 = 0.5;
const PALETTE_SIZE: usize = 80;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// 内置字体，`with_font_file` 可以替换
const DEFAULT_FONT: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

/// 在帧上绘制检测框、标签、掩码与跟踪叠加层
///
/// 默认使用内置字体。字体不可用时跳过所有文字并给出一次警告，其余内容照常绘制。
pub struct Draw {
  font: Option<FontArc>,
  font_scale: PxScale,
  /// 颜色表，按类别或轨迹 ID 取色
  colors: Vec<Rgb<u8>>,
  text_skipped: AtomicBool,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new()
  }
}

impl Draw {
  pub fn new() -> Self {
    // 生成 80 种不同的颜色（对应 COCO 数据集的 80 个类别）
    let colors = (0..PALETTE_SIZE)
      .map(|i| {
        let hue = (i as f32 / PALETTE_SIZE as f32) * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();

    let font = match FontArc::try_from_slice(DEFAULT_FONT) {
      Ok(font) => Some(font),
      Err(e) => {
        warn!("无法加载内置字体，标签文字将不会绘制: {}", e);
        None
      }
    };

    Self {
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      colors,
      text_skipped: AtomicBool::new(false),
    }
  }

  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  /// 从 TTF/OTF 文件加载字体
  pub fn with_font_file(self, path: &Path) -> Result<Self, OutputError> {
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data)
      .map_err(|e| OutputError::FontError(format!("{}: {}", path.display(), e)))?;
    info!("加载字体: {}", path.display());
    Ok(self.with_font(font))
  }

  fn class_color(&self, class_id: u32) -> Rgb<u8> {
    self.colors[class_id as usize % self.colors.len()]
  }

  fn track_color(&self, track_id: u64) -> Rgb<u8> {
    // 相邻 ID 在色环上错开
    self.colors[(track_id as usize).wrapping_mul(17) % self.colors.len()]
  }

  /// 按显示选项渲染检测结果，返回新图像
  pub fn render(
    &self,
    image: &RgbImage,
    result: &DetectResult,
    options: &DisplayOptions,
    labels: &Labels,
  ) -> RgbImage {
    let mut canvas = image.clone();

    for item in result.items.iter() {
      if let Some(mask) = &item.mask {
        blend_mask(&mut canvas, mask, self.class_color(item.class_id));
      }
    }

    for item in result.items.iter() {
      let color = self.class_color(item.class_id);
      let Some((x_min, y_min, x_max, y_max)) = pixel_box(&canvas, &item.bbox) else {
        continue;
      };

      if options.boxes {
        draw_box(&mut canvas, (x_min, y_min, x_max, y_max), color);
      }

      let text = label_text(item, options, labels);
      if !text.is_empty() {
        self.draw_tag(&mut canvas, x_min, y_min, &text, color);
      }
    }

    canvas
  }

  /// 为带有掩码和跟踪 ID 的实例绘制叠加层，返回绘制的实例数
  pub fn draw_instance_overlays(&self, image: &mut RgbImage, result: &DetectResult) -> usize {
    let mut drawn = 0;
    for item in result.items.iter() {
      let (Some(mask), Some(track_id)) = (&item.mask, item.track_id) else {
        continue;
      };
      if mask.dimensions() != image.dimensions() {
        debug!(
          "掩码尺寸 {:?} 与帧尺寸 {:?} 不一致，跳过",
          mask.dimensions(),
          image.dimensions()
        );
        continue;
      }

      let color = self.track_color(track_id);
      blend_mask(image, mask, color);
      draw_contour(image, mask, color);
      if let Some((x, y)) = mask_top_left(mask) {
        self.draw_tag(image, x as i32, y as i32, &track_id.to_string(), color);
      }
      drawn += 1;
    }
    drawn
  }

  /// 在 (x, y) 上方绘制带背景的文字，空间不足时画在下方
  fn draw_tag(&self, image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let Some(font) = &self.font else {
      if !self.text_skipped.swap(true, Ordering::Relaxed) {
        warn!("没有可用字体，跳过标签文字: {}", text);
      }
      return;
    };

    let (text_width, text_height) = text_size(self.font_scale, font, text);
    let tag_height = text_height as i32 + 2 * LABEL_PADDING;
    let tag_y = if y - tag_height >= 0 { y - tag_height } else { y };

    let max_width = (image.width() as i32 - x).max(0);
    let tag_width = (text_width as i32 + 2 * LABEL_PADDING).min(max_width);
    if tag_width <= 0 {
      return;
    }

    let rect = Rect::at(x, tag_y).of_size(tag_width as u32, tag_height as u32);
    draw_filled_rect_mut(image, rect, color);
    draw_text_mut(
      image,
      TEXT_COLOR,
      x + LABEL_PADDING,
      tag_y + LABEL_PADDING,
      self.font_scale,
      font,
      text,
    );
  }
}

/// 标签文字：类别名与置信度按选项组合
pub fn label_text(item: &DetectItem, options: &DisplayOptions, labels: &Labels) -> String {
  match (options.labels, options.conf) {
    (true, true) => format!("{} {:.2}", labels.name(item.class_id), item.score),
    (true, false) => labels.name(item.class_id),
    (false, true) => format!("{:.2}", item.score),
    (false, false) => String::new(),
  }
}

/// 归一化坐标转换为像素坐标，裁剪到图像内；退化的框返回 `None`
fn pixel_box(image: &RgbImage, bbox: &[f32; 4]) -> Option<(i32, i32, i32, i32)> {
  let (w, h) = (image.width() as f32, image.height() as f32);
  if w < 1.0 || h < 1.0 {
    return None;
  }

  let x_min = ((bbox[0] * w).floor() as i32).clamp(0, w as i32 - 1);
  let y_min = ((bbox[1] * h).floor() as i32).clamp(0, h as i32 - 1);
  let x_max = ((bbox[2] * w).ceil() as i32).clamp(0, w as i32 - 1);
  let y_max = ((bbox[3] * h).ceil() as i32).clamp(0, h as i32 - 1);

  if x_min >= x_max || y_min >= y_max {
    return None;
  }
  Some((x_min, y_min, x_max, y_max))
}

// 边框加粗为 2 像素，向内收缩
fn draw_box(
  image: &mut RgbImage,
  (x_min, y_min, x_max, y_max): (i32, i32, i32, i32),
  color: Rgb<u8>,
) {
  for t in 0..BOX_THICKNESS {
    let width = x_max - x_min - 2 * t + 1;
    let height = y_max - y_min - 2 * t + 1;
    if width <= 0 || height <= 0 {
      break;
    }
    let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
    draw_hollow_rect_mut(image, rect, color);
  }
}

fn blend_mask(image: &mut RgbImage, mask: &GrayImage, color: Rgb<u8>) {
  if mask.dimensions() != image.dimensions() {
    return;
  }
  for (pixel, m) in image.pixels_mut().zip(mask.pixels()) {
    if m[0] == 0 {
      continue;
    }
    for c in 0..3 {
      let blended = pixel[c] as f32 * (1.0 - MASK_ALPHA) + color[c] as f32 * MASK_ALPHA;
      pixel[c] = blended.round() as u8;
    }
  }
}

// 掩码内、且四邻域中有背景或越界的像素构成轮廓
fn draw_contour(image: &mut RgbImage, mask: &GrayImage, color: Rgb<u8>) {
  let (w, h) = mask.dimensions();
  let inside = |x: i64, y: i64| {
    x >= 0 && y >= 0 && x < w as i64 && y < h as i64 && mask.get_pixel(x as u32, y as u32)[0] != 0
  };

  for y in 0..h {
    for x in 0..w {
      let (xi, yi) = (x as i64, y as i64);
      if !inside(xi, yi) {
        continue;
      }
      let edge = !inside(xi - 1, yi)
        || !inside(xi + 1, yi)
        || !inside(xi, yi - 1)
        || !inside(xi, yi + 1);
      if edge {
        image.put_pixel(x, y, color);
      }
    }
  }
}

fn mask_top_left(mask: &GrayImage) -> Option<(u32, u32)> {
  let mut corner: Option<(u32, u32)> = None;
  for (x, y, m) in mask.enumerate_pixels() {
    if m[0] == 0 {
      continue;
    }
    corner = Some(match corner {
      Some((cx, cy)) => (cx.min(x), cy.min(y)),
      None => (x, y),
    });
  }
  corner
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn square_mask(w: u32, h: u32, x0: u32, y0: u32, size: u32) -> GrayImage {
    GrayImage::from_fn(w, h, |x, y| {
      let hit = x >= x0 && x < x0 + size && y >= y0 && y < y0 + size;
      image::Luma([if hit { 255 } else { 0 }])
    })
  }

  fn options(boxes: bool, labels: bool, conf: bool) -> DisplayOptions {
    DisplayOptions {
      boxes,
      labels,
      conf,
    }
  }

  fn hidden() -> DisplayOptions {
    options(false, false, false)
  }

  fn changed_pixels(a: &RgbImage, b: &RgbImage) -> usize {
    a.pixels().zip(b.pixels()).filter(|(p, q)| p != q).count()
  }

  #[test]
  fn label_text_follows_options() {
    let labels = Labels::coco();
    let item = DetectItem::new(0, 0.876, [0.0, 0.0, 1.0, 1.0]);

    assert_eq!(label_text(&item, &options(true, true, true), &labels), "person 0.88");
    assert_eq!(label_text(&item, &options(true, true, false), &labels), "person");
    assert_eq!(label_text(&item, &options(true, false, true), &labels), "0.88");
    assert_eq!(label_text(&item, &hidden(), &labels), "");
  }

  #[test]
  fn embedded_font_is_available() {
    assert!(Draw::new().font.is_some());
  }

  #[test]
  fn boxes_are_drawn_in_class_color() {
    let draw = Draw::new();
    let image = RgbImage::new(40, 40);
    let result = DetectResult::new(vec![DetectItem::new(3, 0.9, [0.25, 0.25, 0.75, 0.75])]);

    let out = draw.render(&image, &result, &options(true, false, false), &Labels::coco());
    assert_eq!(*out.get_pixel(10, 20), draw.class_color(3));
    assert_eq!(*out.get_pixel(11, 20), draw.class_color(3));
    // 框内部不变
    assert_eq!(*out.get_pixel(20, 20), Rgb([0, 0, 0]));
  }

  #[test]
  fn tags_follow_label_and_conf_switches() {
    let draw = Draw::new();
    let image = RgbImage::new(120, 80);
    // 框顶部在 y = 40，标签画在框的上方
    let result = DetectResult::new(vec![DetectItem::new(0, 0.9, [0.1, 0.5, 0.9, 0.9])]);
    let labels = Labels::coco();

    let full = draw.render(&image, &result, &options(false, true, true), &labels);
    let names = draw.render(&image, &result, &options(false, true, false), &labels);
    let conf = draw.render(&image, &result, &options(false, false, true), &labels);
    let none = draw.render(&image, &result, &hidden(), &labels);

    assert_eq!(none, image);
    for tagged in [&full, &names, &conf] {
      assert_ne!(*tagged, image);
      // 标签背景使用类别颜色，位于框的左上角之上
      assert_eq!(*tagged.get_pixel(12, 39), draw.class_color(0));
      // 框内不受影响
      assert_eq!(*tagged.get_pixel(60, 60), Rgb([0, 0, 0]));
    }

    // "0.90" 比 "person 0.90" 窄
    assert!(changed_pixels(&image, &conf) < changed_pixels(&image, &full));
    assert!(changed_pixels(&image, &names) < changed_pixels(&image, &full));
  }

  #[test]
  fn text_is_skipped_without_a_font() {
    let draw = Draw {
      font: None,
      ..Draw::new()
    };
    let image = RgbImage::new(60, 40);
    let result = DetectResult::new(vec![DetectItem::new(0, 0.9, [0.2, 0.5, 0.8, 0.9])]);

    let tags_only = draw.render(&image, &result, &options(false, true, true), &Labels::coco());
    assert_eq!(tags_only, image);
    assert!(draw.text_skipped.load(Ordering::Relaxed));

    let boxed = draw.render(&image, &result, &options(true, true, true), &Labels::coco());
    assert_eq!(*boxed.get_pixel(12, 30), draw.class_color(0));
  }

  #[test]
  fn font_files_are_loaded_or_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bogus = dir.path().join("bogus.ttf");
    std::fs::write(&bogus, b"not a font").unwrap();
    assert!(matches!(
      Draw::new().with_font_file(&bogus),
      Err(OutputError::FontError(_))
    ));

    let bundled = Path::new(env!("CARGO_MANIFEST_DIR")).join("assets/DejaVuSans.ttf");
    assert!(Draw::new().with_font_file(&bundled).is_ok());
  }

  #[test]
  fn everything_hidden_leaves_frame_untouched() {
    let draw = Draw::new();
    let image = RgbImage::from_pixel(16, 16, Rgb([40, 80, 120]));
    let result = DetectResult::new(vec![DetectItem::new(0, 0.9, [0.1, 0.1, 0.9, 0.9])]);

    let out = draw.render(&image, &result, &hidden(), &Labels::coco());
    assert_eq!(out, image);
  }

  #[test]
  fn masks_are_blended_inside_only() {
    let draw = Draw::new();
    let image = RgbImage::new(20, 20);
    let item =
      DetectItem::new(0, 0.9, [0.2, 0.2, 0.6, 0.6]).with_mask(square_mask(20, 20, 5, 5, 6));
    let result = DetectResult::new(vec![item]);

    let out = draw.render(&image, &result, &hidden(), &Labels::coco());
    assert_ne!(*out.get_pixel(7, 7), Rgb([0, 0, 0]));
    assert_eq!(*out.get_pixel(15, 15), Rgb([0, 0, 0]));
  }

  #[test]
  fn overlays_need_mask_and_track_id() {
    let draw = Draw::new();
    let mut image = RgbImage::new(60, 60);

    let mut tracked =
      DetectItem::new(0, 0.9, [0.0, 0.3, 0.2, 0.5]).with_mask(square_mask(60, 60, 2, 30, 10));
    tracked.track_id = Some(4);
    let untracked =
      DetectItem::new(0, 0.9, [0.7, 0.7, 0.9, 0.9]).with_mask(square_mask(60, 60, 44, 44, 10));
    let mut maskless = DetectItem::new(0, 0.9, [0.7, 0.0, 0.9, 0.2]);
    maskless.track_id = Some(5);

    let result = DetectResult::new(vec![tracked, untracked, maskless]);
    assert_eq!(draw.draw_instance_overlays(&mut image, &result), 1);

    // 轮廓使用轨迹颜色，未跟踪实例不绘制
    assert_eq!(*image.get_pixel(2, 38), draw.track_color(4));
    assert_eq!(*image.get_pixel(48, 48), Rgb([0, 0, 0]));
    assert_eq!(*image.get_pixel(50, 5), Rgb([0, 0, 0]));
    // 轨迹 ID 标签画在掩码左上角之上
    assert_eq!(*image.get_pixel(2, 29), draw.track_color(4));
  }

  #[test]
  fn mask_top_left_of_empty_mask_is_none() {
    assert_eq!(mask_top_left(&GrayImage::new(4, 4)), None);
    assert_eq!(mask_top_left(&square_mask(8, 8, 3, 2, 2)), Some((3, 2)));
  }

  #[test]
  fn palette_has_distinct_neighbours() {
    let draw = Draw::new();
    assert_eq!(draw.colors.len(), PALETTE_SIZE);
    assert_ne!(draw.class_color(0), draw.class_color(1));
    assert_ne!(draw.track_color(1), draw.track_color(2));
    assert_eq!(draw.class_color(80), draw.class_color(0));
  }
}
