// 该文件是 Liushui （流水） 项目的一部分。
// src/stages/aggregator.rs - 双分辨率配对阶段
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

use tracing::{debug, warn};

use crate::{
  buffer::{Buffer, BufferPtr, BufferRole},
  queue::{BoundedQueue, OverflowPolicy},
  stage::{Emitter, Stage, StageError},
};

/// 每路分辨率内部等待队列的深度
const PAIR_QUEUE_SIZE: usize = 5;

/// 把高分辨率帧与低分辨率帧两两配对
///
/// 两路各有一个会丢弃最旧帧的内部队列；两路都有帧时各取一帧，
/// 合并载荷表后发送给下游。
pub struct AggregatorStage {
  high: BoundedQueue<BufferPtr>,
  low: BoundedQueue<BufferPtr>,
}

impl Default for AggregatorStage {
  fn default() -> Self {
    Self::new()
  }
}

impl AggregatorStage {
  pub fn new() -> Self {
    Self {
      high: BoundedQueue::new(PAIR_QUEUE_SIZE, OverflowPolicy::Leaky),
      low: BoundedQueue::new(PAIR_QUEUE_SIZE, OverflowPolicy::Leaky),
    }
  }

  /// 尚未配对的 (高分辨率, 低分辨率) 帧数
  pub fn pending(&self) -> (usize, usize) {
    (self.high.len(), self.low.len())
  }
}

impl Stage for AggregatorStage {
  fn process(&mut self, input: BufferPtr, emitter: &Emitter) -> Result<(), StageError> {
    if input.has_payload(BufferRole::HighRes) {
      self.high.push(input);
    } else if input.has_payload(BufferRole::LowRes) {
      self.low.push(input);
    } else {
      warn!("{}: 缓冲区缺少高/低分辨率载荷", emitter.stage_name());
      return Err(StageError::Topology(format!(
        "缺少 {} 或 {} 载荷",
        BufferRole::HighRes,
        BufferRole::LowRes
      )));
    }

    if self.high.is_empty() || self.low.is_empty() {
      return Ok(());
    }

    let (Some(high), Some(low)) = (self.high.try_pop(), self.low.try_pop()) else {
      return Ok(());
    };
    let paired = Buffer::derive(&[high.as_ref(), low.as_ref()]);
    debug!("{}: 配对完成，载荷 {:?}", emitter.stage_name(), paired.roles());
    emitter.send_to_subscribers(paired.into_ptr());
    Ok(())
  }

  fn shutdown(&mut self, _emitter: &Emitter) {
    self.high.close();
    self.low.close();
  }
}
