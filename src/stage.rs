// 该文件是 Liushui （流水） 项目的一部分。
// src/stage.rs - 阶段定义
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

use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
  accel::AcceleratorError,
  buffer::{BufferPtr, PoolError},
  decoder::DecodeError,
  output::SinkError,
  queue::{BoundedQueue, PushOutcome, QueueConfig},
};

#[derive(Error, Debug)]
pub enum StageError {
  #[error("拓扑错误: {0}")]
  Topology(String),
  #[error("配置错误: {0}")]
  Config(String),
  #[error("缓冲池错误: {0}")]
  Pool(#[from] PoolError),
  #[error("加速器错误: {0}")]
  Accelerator(#[from] AcceleratorError),
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("输出错误: {0}")]
  Sink(#[from] SinkError),
}

/// 流水线阶段
///
/// 每个阶段独占一个工作线程：从自己的队列取出缓冲区，交给 `process`，
/// 产出通过 [`Emitter`] 推送给所有下游。`process` 出错只记录日志，循环继续。
pub trait Stage: Send + 'static {
  /// 启动前初始化（分配缓冲池、配置加速器等），失败会中止整个流水线的启动
  fn init(&mut self) -> Result<(), StageError> {
    Ok(())
  }

  fn process(&mut self, input: BufferPtr, emitter: &Emitter) -> Result<(), StageError>;

  /// 工作线程退出前调用
  fn shutdown(&mut self, _emitter: &Emitter) {}
}

pub(crate) struct StageShared {
  name: String,
  queue: BoundedQueue<BufferPtr>,
  subscribers: RwLock<Vec<Arc<StageShared>>>,
}

impl StageShared {
  pub(crate) fn queue(&self) -> &BoundedQueue<BufferPtr> {
    &self.queue
  }

  fn subscribers(&self) -> Vec<Arc<StageShared>> {
    match self.subscribers.read() {
      Ok(guard) => guard.clone(),
      Err(poisoned) => {
        error!("阶段 {} 下游列表锁中毒", self.name);
        poisoned.into_inner().clone()
      }
    }
  }
}

/// 阶段句柄，用于连接拓扑和向入口阶段推送数据
#[derive(Clone)]
pub struct StageHandle {
  shared: Arc<StageShared>,
}

impl std::fmt::Debug for StageHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StageHandle")
      .field("name", &self.shared.name)
      .field("queued", &self.shared.queue.len())
      .finish()
  }
}

impl StageHandle {
  /// 创建尚未挂上工作线程的阶段句柄
  pub fn new(name: &str, config: QueueConfig) -> Self {
    Self {
      shared: Arc::new(StageShared {
        name: name.to_string(),
        queue: BoundedQueue::from_config(&config),
        subscribers: RwLock::new(Vec::new()),
      }),
    }
  }

  pub(crate) fn shared(&self) -> Arc<StageShared> {
    self.shared.clone()
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  /// 推入本阶段的队列
  pub fn push(&self, buffer: BufferPtr) -> PushOutcome {
    self.shared.queue.push(buffer)
  }

  /// 直接从本阶段队列取出一个缓冲区，不阻塞
  ///
  /// 只用于没有工作线程的末端句柄。
  pub fn try_pop(&self) -> Option<BufferPtr> {
    self.shared.queue.try_pop()
  }

  pub fn queued(&self) -> usize {
    self.shared.queue.len()
  }

  pub fn add_subscriber(&self, downstream: &StageHandle) {
    let mut subscribers = match self.shared.subscribers.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    debug!("连接 {} -> {}", self.shared.name, downstream.shared.name);
    subscribers.push(downstream.shared.clone());
  }

  pub fn subscriber_count(&self) -> usize {
    self.shared.subscribers().len()
  }

  /// 以本阶段身份向下游发送的发射器
  pub fn emitter(&self) -> Emitter {
    Emitter {
      shared: self.shared.clone(),
    }
  }
}

/// 向下游发送缓冲区，可在多个线程上同时使用
#[derive(Clone)]
pub struct Emitter {
  shared: Arc<StageShared>,
}

impl Emitter {
  pub(crate) fn from_shared(shared: Arc<StageShared>) -> Self {
    Self { shared }
  }

  pub fn stage_name(&self) -> &str {
    &self.shared.name
  }

  /// 把同一个缓冲区句柄推入每个下游队列
  pub fn send_to_subscribers(&self, buffer: BufferPtr) {
    for subscriber in self.shared.subscribers() {
      match subscriber.queue.push(buffer.clone()) {
        PushOutcome::Queued => {}
        PushOutcome::DroppedOldest => {
          debug!("{} -> {}: 下游队列已满，丢弃最旧的缓冲区", self.shared.name, subscriber.name);
        }
        PushOutcome::DroppedNewest => {
          warn!("{} -> {}: 推送超时，丢弃缓冲区", self.shared.name, subscriber.name);
        }
        PushOutcome::Closed => {
          debug!("{} -> {}: 下游已关闭", self.shared.name, subscriber.name);
        }
      }
    }
  }
}
