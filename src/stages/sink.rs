// 该文件是 Liushui （流水） 项目的一部分。
// src/stages/sink.rs - 末端输出阶段
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

use tracing::error;

use crate::{
  buffer::BufferPtr,
  output::FrameSink,
  stage::{Emitter, Stage, StageError},
};

/// 把缓冲区交给外部输出（编码、推流、记录等），之后照常转发给下游
pub struct SinkStage<S> {
  sink: S,
}

impl<S: FrameSink> SinkStage<S> {
  pub fn new(sink: S) -> Self {
    Self { sink }
  }
}

impl<S: FrameSink> Stage for SinkStage<S> {
  fn init(&mut self) -> Result<(), StageError> {
    self.sink.open()?;
    Ok(())
  }

  fn process(&mut self, input: BufferPtr, emitter: &Emitter) -> Result<(), StageError> {
    self.sink.consume(&input)?;
    emitter.send_to_subscribers(input);
    Ok(())
  }

  fn shutdown(&mut self, emitter: &Emitter) {
    if let Err(e) = self.sink.close() {
      error!("{}: 关闭输出失败: {}", emitter.stage_name(), e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    buffer::Buffer,
    output::SinkError,
    queue::QueueConfig,
    stage::StageHandle,
  };
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  #[derive(Clone, Default)]
  struct Counting {
    consumed: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
  }

  impl FrameSink for Counting {
    fn consume(&mut self, _buffer: &Buffer) -> Result<(), SinkError> {
      if self.consumed.fetch_add(1, Ordering::SeqCst) == 1 {
        return Err(SinkError::Render("第二帧失败".to_string()));
      }
      Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
      self.closed.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  #[test]
  fn test_consumes_and_closes() {
    let sink = Counting::default();
    let mut stage = SinkStage::new(sink.clone());
    let handle = StageHandle::new("sink", QueueConfig::leaky(4));
    stage.init().unwrap();

    assert!(stage.process(Buffer::new().into_ptr(), &handle.emitter()).is_ok());
    assert!(matches!(
      stage.process(Buffer::new().into_ptr(), &handle.emitter()),
      Err(StageError::Sink(_))
    ));
    stage.shutdown(&handle.emitter());
    assert_eq!(sink.consumed.load(Ordering::SeqCst), 2);
    assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
  }
}
