// 该文件是 Liushui （流水） 项目的一部分。
// src/stages/dispatch.rs - 批量异步推理分发阶段
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

//! 批量异步推理分发。
//!
//! 输入先进入批队列，攒满 `batch_size` 个后整批提交给推理加速器，每批只调用一次
//! `submit`。每个输入按模型的每个输出各准备一个输出缓冲区（复制输入载荷与元数据，
//! 以输出名标记推理载荷，并附带量化信息）。
//!
//! 加速器在自己的线程上完成作业，完成消息经通道送到本阶段持有的转发线程，
//! 由转发线程把成功作业的全部输出发往下游，失败作业只记录日志后丢弃。

use std::{
  collections::{HashMap, VecDeque},
  sync::{Arc, Condvar, Mutex, MutexGuard},
  thread::{self, JoinHandle},
  time::Duration,
};

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, error, info, warn};

use crate::{
  accel::{Completion, CompletionHandle, InferenceAccelerator, InferenceJob, OutputSpec},
  buffer::{Buffer, BufferPool, BufferPtr, BufferRole, HeapBufferPool, ImageLayout},
  stage::{Emitter, Stage, StageError},
};

/// 分发阶段参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
  pub batch_size: usize,
  /// 每个模型输出的缓冲池块数
  pub output_pool_size: usize,
  /// 关闭时等待在途作业的最长时间
  pub drain_timeout: Duration,
  /// 作为推理输入的载荷角色
  pub input_role: BufferRole,
}

impl Default for DispatchConfig {
  fn default() -> Self {
    Self {
      batch_size: 1,
      output_pool_size: 20,
      drain_timeout: Duration::from_secs(1),
      input_role: BufferRole::Cropped,
    }
  }
}

/// 在途作业表：作业号到已准备好的输出缓冲区
#[derive(Default)]
struct InFlight {
  pending: Mutex<HashMap<u64, Vec<BufferPtr>>>,
  idle: Condvar,
}

impl InFlight {
  fn lock(&self) -> MutexGuard<'_, HashMap<u64, Vec<BufferPtr>>> {
    match self.pending.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        error!("在途作业表锁中毒");
        poisoned.into_inner()
      }
    }
  }

  fn register(&self, job_id: u64, outputs: Vec<BufferPtr>) {
    self.lock().insert(job_id, outputs);
  }

  fn take(&self, job_id: u64) -> Option<Vec<BufferPtr>> {
    let mut pending = self.lock();
    let outputs = pending.remove(&job_id);
    if pending.is_empty() {
      self.idle.notify_all();
    }
    outputs
  }

  fn len(&self) -> usize {
    self.lock().len()
  }

  /// 等待在途作业清空，返回超时后仍未完成的数量
  fn wait_idle(&self, timeout: Duration) -> usize {
    let guard = self.lock();
    let guard = match self
      .idle
      .wait_timeout_while(guard, timeout, |pending| !pending.is_empty())
    {
      Ok((guard, _)) => guard,
      Err(poisoned) => {
        error!("在途作业表锁中毒");
        poisoned.into_inner().0
      }
    };
    guard.len()
  }

  fn clear(&self) -> usize {
    let mut pending = self.lock();
    let dropped = pending.len();
    pending.clear();
    dropped
  }
}

fn deliver(completion: Completion, in_flight: &InFlight, emitter: &Emitter) {
  let Some(outputs) = in_flight.take(completion.job_id) else {
    debug!("作业 {} 已不在在途表中，完成结果被丢弃", completion.job_id);
    return;
  };
  match completion.result {
    Ok(()) => {
      for output in outputs {
        emitter.send_to_subscribers(output);
      }
    }
    Err(e) => {
      error!("{}: 作业 {} 推理失败: {}", emitter.stage_name(), completion.job_id, e);
    }
  }
}

fn forward_completions(
  completions: Receiver<Completion>,
  stop: Receiver<()>,
  in_flight: Arc<InFlight>,
  emitter: Emitter,
) {
  debug!("{}: 完成转发线程启动", emitter.stage_name());
  loop {
    select! {
      recv(completions) -> message => match message {
        Ok(completion) => deliver(completion, &in_flight, &emitter),
        Err(_) => break,
      },
      recv(stop) -> _ => break,
    }
  }
  debug!("{}: 完成转发线程退出", emitter.stage_name());
}

struct Forwarder {
  stop: Sender<()>,
  handle: JoinHandle<()>,
}

/// 批量异步推理分发阶段
pub struct DispatchStage<I> {
  accelerator: I,
  config: DispatchConfig,
  batch: VecDeque<BufferPtr>,
  outputs: Vec<(OutputSpec, HeapBufferPool)>,
  next_job: u64,
  in_flight: Arc<InFlight>,
  completion_tx: Sender<Completion>,
  completion_rx: Receiver<Completion>,
  forwarder: Option<Forwarder>,
}

impl<I: InferenceAccelerator + 'static> DispatchStage<I> {
  pub fn new(accelerator: I, config: DispatchConfig) -> Self {
    let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
    Self {
      accelerator,
      config,
      batch: VecDeque::with_capacity(config.batch_size),
      outputs: Vec::new(),
      next_job: 0,
      in_flight: Arc::new(InFlight::default()),
      completion_tx,
      completion_rx,
      forwarder: None,
    }
  }

  /// 当前批队列中的输入数量
  pub fn batched(&self) -> usize {
    self.batch.len()
  }

  /// 已提交但尚未完成的作业数量
  pub fn in_flight(&self) -> usize {
    self.in_flight.len()
  }

  fn ensure_forwarder(&mut self, emitter: &Emitter) -> Result<(), StageError> {
    if self.forwarder.is_some() {
      return Ok(());
    }
    let (stop, stop_rx) = crossbeam_channel::bounded(1);
    let completions = self.completion_rx.clone();
    let in_flight = self.in_flight.clone();
    let forward_emitter = emitter.clone();
    let handle = thread::Builder::new()
      .name(format!("{}-completions", emitter.stage_name()))
      .spawn(move || forward_completions(completions, stop_rx, in_flight, forward_emitter))
      .map_err(|e| StageError::Config(format!("无法启动完成转发线程: {}", e)))?;
    self.forwarder = Some(Forwarder { stop, handle });
    Ok(())
  }

  /// 为一个输入准备作业；缺少输入载荷或输出池耗尽时返回 `None`
  fn prepare_job(&mut self, input: &Buffer) -> Option<InferenceJob> {
    let Some(tensor_input) = input.payload(self.config.input_role) else {
      warn!("输入缺少 {} 载荷，跳过", self.config.input_role);
      return None;
    };

    let mut named = Vec::with_capacity(self.outputs.len());
    let mut prepared = Vec::with_capacity(self.outputs.len());
    for (spec, pool) in self.outputs.iter() {
      let payload = match pool.acquire() {
        Ok(payload) => payload,
        Err(e) => {
          error!("获取输出 {} 的缓冲失败: {}", spec.name, e);
          return None;
        }
      };
      let mut output = Buffer::derive(&[input]);
      output.add_payload(BufferRole::Inference, payload.clone());
      output.set_payload_id(BufferRole::Inference, &spec.name);
      output.copy_metadata_from(input);
      output.attach(spec.quant.clone());
      named.push((spec.name.clone(), payload));
      prepared.push(output.into_ptr());
    }

    let job_id = self.next_job;
    self.next_job = self.next_job.wrapping_add(1);
    self.in_flight.register(job_id, prepared);
    Some(InferenceJob {
      input: tensor_input.clone(),
      completion: CompletionHandle::new(job_id, named, self.completion_tx.clone()),
    })
  }
}

impl<I: InferenceAccelerator + 'static> Stage for DispatchStage<I> {
  fn init(&mut self) -> Result<(), StageError> {
    if self.config.batch_size == 0 {
      return Err(StageError::Config("批大小不能为零".to_string()));
    }
    let specs = self.accelerator.configure(self.config.batch_size)?;
    if specs.is_empty() {
      return Err(StageError::Config("推理模型没有输出".to_string()));
    }

    self.outputs.clear();
    for spec in specs {
      let mut pool = HeapBufferPool::new(
        &spec.name,
        ImageLayout::tensor(spec.frame_size),
        self.config.output_pool_size,
      );
      pool.init()?;
      self.outputs.push((spec, pool));
    }
    info!(
      "分发阶段初始化完成: 批大小 {}, {} 个输出",
      self.config.batch_size,
      self.outputs.len()
    );
    Ok(())
  }

  fn process(&mut self, input: BufferPtr, emitter: &Emitter) -> Result<(), StageError> {
    self.ensure_forwarder(emitter)?;

    self.batch.push_back(input);
    if self.batch.len() < self.config.batch_size {
      return Ok(());
    }

    let items: Vec<BufferPtr> = self.batch.drain(..self.config.batch_size).collect();
    let jobs: Vec<InferenceJob> = items
      .iter()
      .filter_map(|item| self.prepare_job(item))
      .collect();
    if jobs.is_empty() {
      return Ok(());
    }

    debug!("{}: 提交 {} 个作业", emitter.stage_name(), jobs.len());
    // 提交失败时作业随之析构，完成句柄会报告取消并清理在途表
    self.accelerator.submit(jobs)?;
    Ok(())
  }

  fn shutdown(&mut self, emitter: &Emitter) {
    if !self.batch.is_empty() {
      debug!("{}: 丢弃未凑满的 {} 个输入", emitter.stage_name(), self.batch.len());
      self.batch.clear();
    }

    let remaining = self.in_flight.wait_idle(self.config.drain_timeout);
    if remaining > 0 {
      warn!(
        "{}: 等待 {:?} 后仍有 {} 个作业未完成，结果将被丢弃",
        emitter.stage_name(),
        self.config.drain_timeout,
        remaining
      );
    }

    if let Some(forwarder) = self.forwarder.take() {
      let _ = forwarder.stop.send(());
      if forwarder.handle.join().is_err() {
        error!("{}: 完成转发线程异常退出", emitter.stage_name());
      }
    }
    self.in_flight.clear();
  }
}
