// 该文件是 Guanzhao （观照） 项目的一部分。
// src/bin/guanzhao.rs - 交互式命令行
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

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use guanzhao::{
  FromUrl,
  job::{ClassCounts, DisplayOptions, Job, JobResult, TaskKind},
  model::YoloOnnxBuilder,
  output::Draw,
  processor::{MediaProcessor, Process},
  task::{TaskListener, TaskRunner},
  video::{Codec, FfmpegBackend},
};

/// Guanzhao 参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型
  #[arg(long, value_name = "MODEL", default_value = "onnx:yolov8n.onnx")]
  pub detect_model: Url,
  /// 分割模型，分割与跟踪任务共用
  #[arg(long, value_name = "MODEL", default_value = "onnx:yolov8n-seg.onnx")]
  pub segment_model: Url,
  /// 任务类型: detect, segment, track
  #[arg(long, default_value = "detect")]
  pub task: TaskKind,
  #[arg(long)]
  pub hide_boxes: bool,
  #[arg(long)]
  pub hide_labels: bool,
  #[arg(long)]
  pub hide_conf: bool,
  /// 标签字体（TTF/OTF），不指定时不绘制文字
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
  /// 输出视频编码: mp4v, avc1
  #[arg(long, default_value = "mp4v")]
  pub codec: Codec,
  /// 以 JSON 输出统计结果
  #[arg(long)]
  pub json: bool,
  /// 输入文件，不指定时从标准输入逐行读取
  #[arg(long, value_name = "PATH")]
  pub input: Option<PathBuf>,
}

struct Printer {
  json: bool,
  failures: usize,
}

impl Printer {
  fn print_table(counts: &ClassCounts) {
    if counts.is_empty() {
      println!("(no detections counted)");
      return;
    }
    let widths: Vec<usize> = counts
      .iter()
      .map(|(name, count)| name.len().max(count.to_string().len()))
      .collect();
    let header: Vec<String> = counts
      .keys()
      .zip(&widths)
      .map(|(name, w)| format!("{:>w$}", name, w = w))
      .collect();
    let row: Vec<String> = counts
      .values()
      .zip(&widths)
      .map(|(count, w)| format!("{:>w$}", count, w = w))
      .collect();
    println!("| {} |", header.join(" | "));
    println!("| {} |", row.join(" | "));
  }
}

impl TaskListener for Printer {
  fn on_finished(&mut self, result: JobResult) {
    if self.json {
      let value = serde_json::json!({
        "output": result.output.display().to_string(),
        "class_counts": result.class_counts,
      });
      println!("{}", value);
    } else {
      println!("{}", result.output.display());
      Self::print_table(&result.class_counts);
    }
  }

  fn on_failed(&mut self, message: String) {
    self.failures += 1;
    println!("Error: {}", message);
  }
}

fn run_one<P: Process + 'static>(
  runner: &mut TaskRunner<P>,
  job: Job,
  printer: &mut Printer,
) -> Result<()> {
  runner.submit(job)?;
  runner.wait(printer);
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测模型: {}", args.detect_model);
  info!("分割模型: {}", args.segment_model);

  let detect = Arc::new(YoloOnnxBuilder::from_url(&args.detect_model)?.build()?);
  let segment = Arc::new(YoloOnnxBuilder::from_url(&args.segment_model)?.build()?);

  let draw = match &args.font {
    Some(path) => Draw::new().with_font_file(path)?,
    None => Draw::new(),
  };
  let processor = MediaProcessor::new(detect, segment, FfmpegBackend)
    .with_draw(draw)
    .with_codec(args.codec);
  let mut runner = TaskRunner::new(Arc::new(processor));

  let display = DisplayOptions {
    boxes: !args.hide_boxes,
    labels: !args.hide_labels,
    conf: !args.hide_conf,
  };
  let mut printer = Printer {
    json: args.json,
    failures: 0,
  };

  match &args.input {
    Some(path) => {
      run_one(
        &mut runner,
        Job::new(args.task, path).with_display(display),
        &mut printer,
      )?;
      if printer.failures > 0 {
        std::process::exit(1);
      }
    }
    None => {
      for line in std::io::stdin().lock().lines() {
        let line = line?;
        let path = line.trim();
        if path.is_empty() {
          continue;
        }
        run_one(
          &mut runner,
          Job::new(args.task, path).with_display(display),
          &mut printer,
        )?;
      }
    }
  }

  Ok(())
}
