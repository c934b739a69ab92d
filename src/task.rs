// 该文件是 Liushui （流水） 项目的一部分。
// src/task.rs - 把帧源驱动进流水线的任务
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
  sync::mpsc::{self, Receiver},
  thread,
  time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
  buffer::Payload,
  ingest::{FrameIngress, IngestError},
  pipeline::Pipeline,
};

/// 任务结束时的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskSummary {
  /// 从帧源取出的帧数
  pub frames: usize,
  pub accepted: u64,
  pub rejected: u64,
}

/// 连续运行的流任务
///
/// 启动流水线，逐帧送入入口，直到帧源耗尽、达到帧数上限或收到中断信号，
/// 然后等待队列排空（最长 `settle`）并停止流水线。停止时各阶段仍会处理完
/// 已入队的缓冲区，已接收的帧都会走完整条流水线。
#[derive(Debug)]
pub struct StreamTask {
  frame_number: Option<usize>,
  settle: Duration,
}

impl Default for StreamTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      settle: Duration::from_secs(2),
    }
  }
}

impl StreamTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 帧源结束后等待各阶段队列排空的最长时间
  pub fn with_settle(mut self, settle: Duration) -> Self {
    self.settle = settle;
    self
  }

  /// 安装 Ctrl-C 处理后运行
  ///
  /// 收到中断信号后 30 秒仍未退出则强制结束进程。
  pub fn run<I: Iterator<Item = Payload>>(
    self,
    input: I,
    ingress: &FrameIngress,
    pipeline: &mut Pipeline,
  ) -> anyhow::Result<TaskSummary> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
    .map_err(|e| anyhow::anyhow!("无法设置 Ctrl-C 处理: {}", e))?;

    self.run_until(input, ingress, pipeline, &rx)
  }

  /// 以 `stop` 通道代替信号处理运行
  pub fn run_until<I: Iterator<Item = Payload>>(
    self,
    input: I,
    ingress: &FrameIngress,
    pipeline: &mut Pipeline,
    stop: &Receiver<()>,
  ) -> anyhow::Result<TaskSummary> {
    info!("开始任务...");
    if !pipeline.is_running() {
      pipeline.run()?;
    }

    let mut summary = TaskSummary::default();
    let started = Instant::now();
    for frame in input {
      summary.frames += 1;
      match ingress.push_frame(frame) {
        Ok(outcome) => debug!("第 {} 帧: {:?}", summary.frames, outcome),
        Err(IngestError::Closed(stage)) => {
          warn!("入口阶段 {} 已关闭，退出任务循环", stage);
          break;
        }
        Err(e) => debug!("第 {} 帧被丢弃: {}", summary.frames, e),
      }
      if self.frame_number.is_some_and(|n| summary.frames >= n) {
        info!("达到指定帧数 {}, 退出任务循环", summary.frames);
        break;
      }
      if stop.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    let deadline = Instant::now() + self.settle;
    while pipeline.queued() > 0 && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(5));
    }
    if pipeline.queued() > 0 {
      warn!("等待超时，仍有 {} 个缓冲区未处理", pipeline.queued());
    }
    pipeline.stop();

    (summary.accepted, summary.rejected) = ingress.counters();
    info!(
      "任务完成，共 {} 帧（接收 {}，拒绝 {}），耗时 {:.2?}",
      summary.frames,
      summary.accepted,
      summary.rejected,
      started.elapsed()
    );
    Ok(summary)
  }
}
