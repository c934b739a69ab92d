// 该文件是 Liushui （流水） 项目的一部分。
// src/pipeline.rs - 流水线调度
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

use std::{
  sync::Arc,
  thread::{self, JoinHandle},
};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  queue::QueueConfig,
  stage::{Emitter, Stage, StageError, StageHandle, StageShared},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("阶段 {stage} 初始化失败: {source}")]
  Init {
    stage: String,
    #[source]
    source: StageError,
  },
  #[error("无法启动阶段 {stage} 的工作线程: {source}")]
  Spawn {
    stage: String,
    #[source]
    source: std::io::Error,
  },
  #[error("流水线已在运行")]
  AlreadyRunning,
}

struct StageEntry {
  handle: StageHandle,
  stage: Option<Box<dyn Stage>>,
}

/// 有序的阶段集合，每个阶段一个工作线程
#[derive(Default)]
pub struct Pipeline {
  stages: Vec<StageEntry>,
  workers: Vec<(StageHandle, JoinHandle<()>)>,
  running: bool,
}

impl Pipeline {
  pub fn new() -> Self {
    Self::default()
  }

  /// 加入一个阶段，返回用于连接拓扑的句柄
  pub fn add_stage<S: Stage>(&mut self, name: &str, queue: QueueConfig, stage: S) -> StageHandle {
    let handle = StageHandle::new(name, queue);
    self.stages.push(StageEntry {
      handle: handle.clone(),
      stage: Some(Box::new(stage)),
    });
    handle
  }

  pub fn stage(&self, name: &str) -> Option<StageHandle> {
    self
      .stages
      .iter()
      .find(|entry| entry.handle.name() == name)
      .map(|entry| entry.handle.clone())
  }

  pub fn is_running(&self) -> bool {
    self.running
  }

  /// 所有阶段队列中尚未处理的缓冲区总数
  pub fn queued(&self) -> usize {
    self.stages.iter().map(|entry| entry.handle.queued()).sum()
  }

  /// 按顺序初始化所有阶段，然后启动工作线程
  ///
  /// 任一阶段初始化失败都会中止启动，此时没有任何工作线程被创建。
  pub fn run(&mut self) -> Result<(), PipelineError> {
    if self.running {
      return Err(PipelineError::AlreadyRunning);
    }

    for entry in self.stages.iter_mut() {
      if let Some(stage) = entry.stage.as_mut() {
        debug!("初始化阶段 {}", entry.handle.name());
        stage.init().map_err(|source| PipelineError::Init {
          stage: entry.handle.name().to_string(),
          source,
        })?;
      }
    }

    self.running = true;
    let mut failure = None;
    for entry in self.stages.iter_mut() {
      let Some(stage) = entry.stage.take() else {
        continue;
      };
      let name = entry.handle.name().to_string();
      let shared = entry.handle.shared();
      let handle = entry.handle.clone();
      let worker = thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker_loop(stage, shared))
        .map_err(|source| PipelineError::Spawn {
          stage: name.clone(),
          source,
        });
      match worker {
        Ok(worker) => self.workers.push((handle, worker)),
        Err(e) => {
          failure = Some(e);
          break;
        }
      }
    }
    if let Some(e) = failure {
      self.stop();
      return Err(e);
    }

    info!("流水线启动，共 {} 个阶段", self.workers.len());
    Ok(())
  }

  /// 按加入顺序逐个收尾阶段并等待其工作线程退出
  ///
  /// 每个阶段先取完队列中的残留缓冲区并执行 `shutdown`，之后才收尾下一个阶段，
  /// 因此上游在收尾时发出的缓冲区仍能被下游处理。阶段需按上游在前的顺序加入。
  pub fn stop(&mut self) {
    if !self.running {
      return;
    }
    info!("停止流水线...");
    for (handle, worker) in self.workers.drain(..) {
      handle.shared().queue().finish();
      if worker.join().is_err() {
        error!("阶段 {} 的工作线程异常退出", handle.name());
      }
      debug!("阶段 {} 收尾完成", handle.name());
    }
    for entry in self.stages.iter() {
      entry.handle.shared().queue().close();
    }
    self.running = false;
    info!("流水线已停止");
  }
}

impl Drop for Pipeline {
  fn drop(&mut self) {
    self.stop();
  }
}

fn worker_loop(mut stage: Box<dyn Stage>, shared: Arc<StageShared>) {
  let emitter = Emitter::from_shared(shared.clone());
  info!("阶段 {} 开始运行", emitter.stage_name());
  while let Some(buffer) = shared.queue().pop() {
    if let Err(e) = stage.process(buffer, &emitter) {
      error!("阶段 {} 处理失败: {}", emitter.stage_name(), e);
    }
  }
  stage.shutdown(&emitter);
  info!("阶段 {} 已退出", emitter.stage_name());
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::{Buffer, BufferPtr};
  use std::{
    sync::{
      Mutex,
      atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
  };

  struct Forward;

  impl Stage for Forward {
    fn process(&mut self, input: BufferPtr, emitter: &Emitter) -> Result<(), StageError> {
      emitter.send_to_subscribers(input);
      Ok(())
    }
  }

  struct Slow;

  impl Stage for Slow {
    fn process(&mut self, input: BufferPtr, emitter: &Emitter) -> Result<(), StageError> {
      thread::sleep(Duration::from_millis(100));
      emitter.send_to_subscribers(input);
      Ok(())
    }
  }

  struct FailEveryOther {
    seen: usize,
  }

  impl Stage for FailEveryOther {
    fn process(&mut self, input: BufferPtr, emitter: &Emitter) -> Result<(), StageError> {
      self.seen += 1;
      if self.seen % 2 == 0 {
        return Err(StageError::Topology("偶数帧".to_string()));
      }
      emitter.send_to_subscribers(input);
      Ok(())
    }
  }

  struct FailingInit;

  impl Stage for FailingInit {
    fn init(&mut self) -> Result<(), StageError> {
      Err(StageError::Config("缺少模型".to_string()))
    }

    fn process(&mut self, _input: BufferPtr, _emitter: &Emitter) -> Result<(), StageError> {
      Ok(())
    }
  }

  struct Count(Arc<AtomicUsize>, Arc<Mutex<bool>>);

  impl Stage for Count {
    fn process(&mut self, _input: BufferPtr, _emitter: &Emitter) -> Result<(), StageError> {
      self.0.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }

    fn shutdown(&mut self, _emitter: &Emitter) {
      if let Ok(mut flag) = self.1.lock() {
        *flag = true;
      }
    }
  }

  fn wait_for(count: &AtomicUsize, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while count.load(Ordering::SeqCst) < expected && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(5));
    }
  }

  #[test]
  fn test_buffers_flow_and_failures_do_not_stop_loop() {
    let count = Arc::new(AtomicUsize::new(0));
    let shut = Arc::new(Mutex::new(false));
    let mut pipeline = Pipeline::new();
    let entry = pipeline.add_stage("entry", QueueConfig::leaky(8), Forward);
    let filter = pipeline.add_stage("filter", QueueConfig::leaky(8), FailEveryOther { seen: 0 });
    let sink = pipeline.add_stage("sink", QueueConfig::leaky(8), Count(count.clone(), shut.clone()));
    entry.add_subscriber(&filter);
    filter.add_subscriber(&sink);

    pipeline.run().unwrap();
    for _ in 0..4 {
      entry.push(Buffer::new().into_ptr());
    }
    wait_for(&count, 2);
    pipeline.stop();

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert!(*shut.lock().unwrap());
    assert!(!pipeline.is_running());
  }

  #[test]
  fn test_stop_drains_work_still_in_upstream_stages() {
    let count = Arc::new(AtomicUsize::new(0));
    let shut = Arc::new(Mutex::new(false));
    let mut pipeline = Pipeline::new();
    let slow = pipeline.add_stage("slow", QueueConfig::leaky(8), Slow);
    let sink = pipeline.add_stage("sink", QueueConfig::leaky(8), Count(count.clone(), shut.clone()));
    slow.add_subscriber(&sink);

    pipeline.run().unwrap();
    for _ in 0..3 {
      slow.push(Buffer::new().into_ptr());
    }
    pipeline.stop();

    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert!(*shut.lock().unwrap());
    assert_eq!(slow.push(Buffer::new().into_ptr()), crate::queue::PushOutcome::Closed);
  }

  #[test]
  fn test_init_failure_aborts_run() {
    let mut pipeline = Pipeline::new();
    pipeline.add_stage("ok", QueueConfig::default(), Forward);
    pipeline.add_stage("bad", QueueConfig::default(), FailingInit);
    let err = pipeline.run().unwrap_err();
    assert!(matches!(err, PipelineError::Init { ref stage, .. } if stage == "bad"));
    assert!(!pipeline.is_running());
  }

  #[test]
  fn test_run_twice_is_rejected() {
    let mut pipeline = Pipeline::new();
    pipeline.add_stage("a", QueueConfig::default(), Forward);
    pipeline.run().unwrap();
    assert!(matches!(pipeline.run(), Err(PipelineError::AlreadyRunning)));
    pipeline.stop();
  }

  #[test]
  fn test_stop_with_idle_stages_returns() {
    let mut pipeline = Pipeline::new();
    let a = pipeline.add_stage("a", QueueConfig::default(), Forward);
    let b = pipeline.add_stage("b", QueueConfig::default(), Forward);
    a.add_subscriber(&b);
    pipeline.run().unwrap();
    pipeline.stop();
    assert!(pipeline.stage("a").is_some());
    assert!(pipeline.stage("missing").is_none());
  }
}
