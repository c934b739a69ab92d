// 该文件是 Liushui （流水） 项目的一部分。
// src/buffer/pool.rs - 固定大小缓冲池
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

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, info};

use super::payload::{ImageLayout, Payload};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("缓冲池 {0} 尚未初始化")]
  NotInitialized(String),
  #[error("缓冲池 {0} 已耗尽")]
  Exhausted(String),
  #[error("缓冲池 {name} 配置无效: {reason}")]
  InvalidConfig { name: String, reason: String },
  #[error("缓冲池 {name} 的块大小 {block} 字节不足以容纳 {requested} 字节")]
  TooLarge {
    name: String,
    requested: usize,
    block: usize,
  },
}

/// 缓冲池协作者接口
pub trait BufferPool: Send {
  /// 分配池内存，可能失败
  fn init(&mut self) -> Result<(), PoolError> {
    Ok(())
  }

  /// 以池的默认布局取出一块载荷内存
  fn acquire(&self) -> Result<Payload, PoolError> {
    self.acquire_with_layout(self.layout())
  }

  /// 以指定布局取出一块载荷内存，布局所需字节数不能超过块大小
  fn acquire_with_layout(&self, layout: ImageLayout) -> Result<Payload, PoolError>;

  /// 池中每块载荷的布局
  fn layout(&self) -> ImageLayout;
}

/// 基于堆内存的固定数量缓冲池
///
/// `init()` 一次性分配 `capacity` 块内存；载荷的最后一个句柄析构时内存自动归还。
pub struct HeapBufferPool {
  name: String,
  layout: ImageLayout,
  block_size: usize,
  capacity: usize,
  free: Option<(Sender<Box<[u8]>>, Receiver<Box<[u8]>>)>,
}

impl HeapBufferPool {
  pub fn new(name: &str, layout: ImageLayout, capacity: usize) -> Self {
    Self {
      name: name.to_string(),
      layout,
      block_size: layout.frame_size(),
      capacity,
      free: None,
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// 当前空闲块数量
  pub fn available(&self) -> usize {
    self.free.as_ref().map(|(_, rx)| rx.len()).unwrap_or(0)
  }
}

impl BufferPool for HeapBufferPool {
  fn init(&mut self) -> Result<(), PoolError> {
    if self.capacity == 0 || self.block_size == 0 {
      return Err(PoolError::InvalidConfig {
        name: self.name.clone(),
        reason: format!("容量 {} 块大小 {}", self.capacity, self.block_size),
      });
    }

    let (tx, rx) = crossbeam_channel::bounded(self.capacity);
    for _ in 0..self.capacity {
      // 容量与通道大小一致，发送不会失败
      let _ = tx.send(vec![0u8; self.block_size].into_boxed_slice());
    }
    info!(
      "缓冲池 {} 初始化完成: {} 块 x {} 字节",
      self.name, self.capacity, self.block_size
    );
    self.free = Some((tx, rx));
    Ok(())
  }

  fn acquire_with_layout(&self, layout: ImageLayout) -> Result<Payload, PoolError> {
    if layout.frame_size() > self.block_size {
      return Err(PoolError::TooLarge {
        name: self.name.clone(),
        requested: layout.frame_size(),
        block: self.block_size,
      });
    }
    let (tx, rx) = self
      .free
      .as_ref()
      .ok_or_else(|| PoolError::NotInitialized(self.name.clone()))?;
    let mut block = rx
      .try_recv()
      .map_err(|_| PoolError::Exhausted(self.name.clone()))?;
    // 回收的内存块可能残留上一个使用者的数据
    block[..layout.frame_size()].fill(0);
    debug!("缓冲池 {} 分配一块内存，剩余 {}", self.name, rx.len());
    Ok(Payload::pooled(layout, block, tx.clone()))
  }

  fn layout(&self) -> ImageLayout {
    self.layout
  }
}
