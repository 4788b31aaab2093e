// 该文件是 Guanzhao （观照） 项目的一部分。
// src/job.rs - 任务定义
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

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// 推理任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskKind {
  /// 目标检测
  #[default]
  Detect,
  /// 实例分割
  Segment,
  /// 分割 + 目标跟踪
  Track,
}

impl TaskKind {
  pub const ALL: [TaskKind; 3] = [TaskKind::Detect, TaskKind::Segment, TaskKind::Track];

  pub fn as_str(&self) -> &'static str {
    match self {
      TaskKind::Detect => "detect",
      TaskKind::Segment => "segment",
      TaskKind::Track => "track",
    }
  }
}

impl fmt::Display for TaskKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("未知的任务类型: {0}")]
pub struct UnknownTaskKind(pub String);

impl FromStr for TaskKind {
  type Err = UnknownTaskKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    TaskKind::ALL
      .into_iter()
      .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| UnknownTaskKind(s.to_string()))
  }
}

/// 渲染选项，三个开关互相独立
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayOptions {
  pub boxes: bool,
  pub labels: bool,
  pub conf: bool,
}

impl Default for DisplayOptions {
  fn default() -> Self {
    Self {
      boxes: true,
      labels: true,
      conf: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
  pub task: TaskKind,
  pub input: PathBuf,
  pub display: DisplayOptions,
}

impl Job {
  pub fn new(task: TaskKind, input: impl Into<PathBuf>) -> Self {
    Self {
      task,
      input: input.into(),
      display: DisplayOptions::default(),
    }
  }

  pub fn with_display(mut self, display: DisplayOptions) -> Self {
    self.display = display;
    self
  }
}

/// 类别名称 -> 出现次数
pub type ClassCounts = BTreeMap<String, usize>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
  pub output: PathBuf,
  pub class_counts: ClassCounts,
}

impl JobResult {
  pub fn total(&self) -> usize {
    self.class_counts.values().sum()
  }
}
