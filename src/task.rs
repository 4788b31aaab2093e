// 该文件是 Guanzhao （观照） 项目的一部分。
// src/task.rs - 后台任务执行
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

//! # 任务执行器
//!
//! 每个任务在独立的工作线程上运行，交互线程通过事件通道获知进展。
//! 事件顺序固定为 `Started`、`Finished` 或 `Failed`、`Done`。
//! 同一时间最多只有一个任务在执行。

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  job::{Job, JobResult},
  processor::Process,
};

const WORKER_THREAD_NAME: &str = "guanzhao-job";

#[derive(Debug)]
pub enum TaskEvent {
  Started,
  Finished(JobResult),
  Failed(String),
  Done,
}

#[derive(Error, Debug)]
pub enum RunnerError {
  #[error("已有任务正在执行")]
  Busy,
  #[error("无法启动工作线程: {0}")]
  Spawn(#[from] std::io::Error),
}

/// 事件回调，在交互线程上调用
pub trait TaskListener {
  fn on_started(&mut self) {}
  fn on_finished(&mut self, result: JobResult);
  fn on_failed(&mut self, message: String);
  fn on_done(&mut self) {}
}

pub struct TaskRunner<P: Process + 'static> {
  processor: Arc<P>,
  tx: Sender<TaskEvent>,
  rx: Receiver<TaskEvent>,
  worker: Option<JoinHandle<()>>,
}

impl<P: Process + 'static> TaskRunner<P> {
  pub fn new(processor: Arc<P>) -> Self {
    let (tx, rx) = mpsc::channel();
    Self {
      processor,
      tx,
      rx,
      worker: None,
    }
  }

  /// 从提交到收到 `Done` 之前为忙碌状态
  pub fn is_busy(&self) -> bool {
    self.worker.is_some()
  }

  pub fn submit(&mut self, job: Job) -> Result<(), RunnerError> {
    if self.is_busy() {
      warn!("任务执行中，拒绝新任务: {}", job.input.display());
      return Err(RunnerError::Busy);
    }

    let processor = Arc::clone(&self.processor);
    let tx = self.tx.clone();
    let handle = thread::Builder::new()
      .name(WORKER_THREAD_NAME.to_string())
      .spawn(move || run_job(processor.as_ref(), &job, &tx))?;

    self.worker = Some(handle);
    Ok(())
  }

  pub fn try_next_event(&mut self) -> Option<TaskEvent> {
    let event = self.rx.try_recv().ok()?;
    self.observe(&event);
    Some(event)
  }

  /// 阻塞等待下一个事件，空闲时返回 `None`
  pub fn next_event(&mut self) -> Option<TaskEvent> {
    if !self.is_busy() {
      return None;
    }
    let event = self.rx.recv().ok()?;
    self.observe(&event);
    Some(event)
  }

  /// 把已到达的事件交给监听器，返回处理的事件数
  pub fn dispatch<L: TaskListener>(&mut self, listener: &mut L) -> usize {
    let mut count = 0;
    while let Some(event) = self.try_next_event() {
      deliver(listener, event);
      count += 1;
    }
    count
  }

  /// 分发事件直到当前任务结束
  pub fn wait<L: TaskListener>(&mut self, listener: &mut L) -> usize {
    let mut count = 0;
    while let Some(event) = self.next_event() {
      let done = matches!(event, TaskEvent::Done);
      deliver(listener, event);
      count += 1;
      if done {
        break;
      }
    }
    count
  }

  fn observe(&mut self, event: &TaskEvent) {
    if !matches!(event, TaskEvent::Done) {
      return;
    }
    if let Some(handle) = self.worker.take()
      && handle.join().is_err()
    {
      error!("工作线程异常退出");
    }
  }
}

fn deliver<L: TaskListener>(listener: &mut L, event: TaskEvent) {
  match event {
    TaskEvent::Started => listener.on_started(),
    TaskEvent::Finished(result) => listener.on_finished(result),
    TaskEvent::Failed(message) => listener.on_failed(message),
    TaskEvent::Done => listener.on_done(),
  }
}

// 接收端随执行器一起释放后，发送失败可以忽略
fn run_job<P: Process + ?Sized>(processor: &P, job: &Job, tx: &Sender<TaskEvent>) {
  let _ = tx.send(TaskEvent::Started);
  info!("开始任务: {} ({})", job.input.display(), job.task);
  let now = Instant::now();

  let event = if !job.input.exists() {
    TaskEvent::Failed(format!("The file {} doesn't exists", job.input.display()))
  } else {
    match catch_unwind(AssertUnwindSafe(|| processor.process(job))) {
      Ok(Ok(result)) => TaskEvent::Finished(result),
      Ok(Err(e)) => TaskEvent::Failed(e.to_string()),
      Err(payload) => TaskEvent::Failed(panic_message(payload.as_ref())),
    }
  };

  match &event {
    TaskEvent::Finished(result) => info!(
      "任务完成，耗时: {:.2?}，输出: {}",
      now.elapsed(),
      result.output.display()
    ),
    TaskEvent::Failed(message) => warn!("任务失败: {}", message),
    _ => {}
  }

  let _ = tx.send(event);
  let _ = tx.send(TaskEvent::Done);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "任务异常终止".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::{ClassCounts, TaskKind};
  use crate::processor::ProcessError;
  use std::path::PathBuf;
  use std::sync::Mutex;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct FnProcessor<F> {
    calls: AtomicUsize,
    f: F,
  }

  impl<F> FnProcessor<F>
  where
    F: Fn(&Job) -> Result<JobResult, ProcessError> + Send + Sync,
  {
    fn new(f: F) -> Arc<Self> {
      Arc::new(Self {
        calls: AtomicUsize::new(0),
        f,
      })
    }
  }

  impl<F> Process for FnProcessor<F>
  where
    F: Fn(&Job) -> Result<JobResult, ProcessError> + Send + Sync,
  {
    fn process(&self, job: &Job) -> Result<JobResult, ProcessError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      (self.f)(job)
    }
  }

  fn ok_result(job: &Job) -> Result<JobResult, ProcessError> {
    Ok(JobResult {
      output: job.input.with_file_name("out.png"),
      class_counts: ClassCounts::from([("dog".to_string(), 2)]),
    })
  }

  #[derive(Default)]
  struct Recorder {
    events: Vec<String>,
  }

  impl TaskListener for Recorder {
    fn on_started(&mut self) {
      self.events.push("started".to_string());
    }
    fn on_finished(&mut self, result: JobResult) {
      self.events.push(format!("finished:{}", result.total()));
    }
    fn on_failed(&mut self, message: String) {
      self.events.push(format!("failed:{}", message));
    }
    fn on_done(&mut self) {
      self.events.push("done".to_string());
    }
  }

  fn existing_input(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("in.png");
    std::fs::write(&path, b"").unwrap();
    path
  }

  #[test]
  fn events_arrive_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let processor = FnProcessor::new(ok_result);
    let mut runner = TaskRunner::new(Arc::clone(&processor));

    runner
      .submit(Job::new(TaskKind::Detect, existing_input(&dir)))
      .unwrap();
    let mut recorder = Recorder::default();
    assert_eq!(runner.wait(&mut recorder), 3);

    assert_eq!(recorder.events, vec!["started", "finished:2", "done"]);
    assert!(!runner.is_busy());
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn missing_file_never_reaches_processor() {
    let processor = FnProcessor::new(ok_result);
    let mut runner = TaskRunner::new(Arc::clone(&processor));

    let missing = PathBuf::from("/definitely/not/here.jpg");
    runner
      .submit(Job::new(TaskKind::Segment, missing.clone()))
      .unwrap();
    let mut recorder = Recorder::default();
    runner.wait(&mut recorder);

    assert_eq!(
      recorder.events,
      vec![
        "started".to_string(),
        format!("failed:The file {} doesn't exists", missing.display()),
        "done".to_string(),
      ]
    );
    assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn processor_errors_become_failed_events() {
    let dir = tempfile::tempdir().unwrap();
    let processor = FnProcessor::new(|_: &Job| {
      Err(ProcessError::UnsupportedExtension(".gif".to_string()))
    });
    let mut runner = TaskRunner::new(processor);

    runner
      .submit(Job::new(TaskKind::Detect, existing_input(&dir)))
      .unwrap();
    let mut recorder = Recorder::default();
    runner.wait(&mut recorder);
    assert_eq!(
      recorder.events,
      vec!["started", "failed:Unsupported file extension: .gif", "done"]
    );
  }

  #[test]
  fn panics_are_reported_and_runner_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let processor = FnProcessor::new(|_: &Job| -> Result<JobResult, ProcessError> {
      panic!("模型崩溃")
    });
    let mut runner = TaskRunner::new(processor);
    let input = existing_input(&dir);

    runner.submit(Job::new(TaskKind::Track, input.clone())).unwrap();
    let mut recorder = Recorder::default();
    runner.wait(&mut recorder);
    assert_eq!(recorder.events, vec!["started", "failed:模型崩溃", "done"]);

    assert!(!runner.is_busy());
    runner.submit(Job::new(TaskKind::Track, input)).unwrap();
    runner.wait(&mut recorder);
  }

  #[test]
  fn second_submit_while_busy_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate = Mutex::new(gate_rx);
    let processor = FnProcessor::new(move |job: &Job| {
      let _ = gate.lock().unwrap().recv();
      ok_result(job)
    });
    let mut runner = TaskRunner::new(Arc::clone(&processor));
    let input = existing_input(&dir);

    runner.submit(Job::new(TaskKind::Detect, input.clone())).unwrap();
    assert!(matches!(
      runner.submit(Job::new(TaskKind::Detect, input)),
      Err(RunnerError::Busy)
    ));

    gate_tx.send(()).unwrap();
    let mut recorder = Recorder::default();
    runner.wait(&mut recorder);
    assert_eq!(recorder.events, vec!["started", "finished:2", "done"]);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn idle_runner_has_no_events() {
    let processor = FnProcessor::new(ok_result);
    let mut runner = TaskRunner::new(processor);
    assert!(runner.next_event().is_none());
    assert!(runner.try_next_event().is_none());
    assert_eq!(runner.dispatch(&mut Recorder::default()), 0);
  }
}
