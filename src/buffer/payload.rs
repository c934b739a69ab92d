// 该文件是 Liushui （流水） 项目的一部分。
// src/buffer/payload.rs - 硬件内存载荷句柄
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
  ops::{Deref, DerefMut},
  sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crossbeam_channel::Sender;
use tracing::{debug, error};

/// 像素/数据格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
  /// YUV 4:2:0 半平面
  Nv12,
  /// 交错 RGB，每像素 3 字节
  Rgb888,
  /// 单通道 8 位，也用于承载推理输出张量
  Gray8,
}

impl PixelFormat {
  /// 给定宽高时所需的字节数
  pub fn frame_size(&self, width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    match self {
      PixelFormat::Nv12 => w * h + w * h.div_ceil(2),
      PixelFormat::Rgb888 => w * h * 3,
      PixelFormat::Gray8 => w * h,
    }
  }
}

/// 载荷的图像布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageLayout {
  pub width: u32,
  pub height: u32,
  pub format: PixelFormat,
}

impl ImageLayout {
  pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
    Self {
      width,
      height,
      format,
    }
  }

  /// 以一维字节块描述的张量布局
  pub fn tensor(size: usize) -> Self {
    Self {
      width: size as u32,
      height: 1,
      format: PixelFormat::Gray8,
    }
  }

  pub fn frame_size(&self) -> usize {
    self.format.frame_size(self.width, self.height)
  }
}

struct PayloadCore {
  layout: ImageLayout,
  data: RwLock<Box<[u8]>>,
  recycle: Option<Sender<Box<[u8]>>>,
}

impl Drop for PayloadCore {
  fn drop(&mut self) {
    let Some(recycle) = self.recycle.take() else {
      return;
    };
    let data = match self.data.get_mut() {
      Ok(data) => std::mem::take(data),
      Err(poisoned) => std::mem::take(poisoned.into_inner()),
    };
    // 池已销毁时直接释放内存
    if recycle.send(data).is_err() {
      debug!("缓冲池已关闭，载荷内存直接释放");
    }
  }
}

/// 引用计数的载荷句柄
///
/// 克隆句柄即增加引用计数，句柄析构即减少引用计数；
/// 最后一个句柄析构时，若载荷来自缓冲池，内存会归还到池中。
#[derive(Clone)]
pub struct Payload {
  core: Arc<PayloadCore>,
}

impl std::fmt::Debug for Payload {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Payload")
      .field("layout", &self.core.layout)
      .field("ref_count", &self.ref_count())
      .finish()
  }
}

impl Payload {
  /// 创建不属于任何缓冲池的载荷
  pub fn from_vec(layout: ImageLayout, data: Vec<u8>) -> Self {
    Self {
      core: Arc::new(PayloadCore {
        layout,
        data: RwLock::new(data.into_boxed_slice()),
        recycle: None,
      }),
    }
  }

  /// 创建全零载荷
  pub fn zeroed(layout: ImageLayout) -> Self {
    Self::from_vec(layout, vec![0u8; layout.frame_size()])
  }

  pub(crate) fn pooled(layout: ImageLayout, data: Box<[u8]>, recycle: Sender<Box<[u8]>>) -> Self {
    Self {
      core: Arc::new(PayloadCore {
        layout,
        data: RwLock::new(data),
        recycle: Some(recycle),
      }),
    }
  }

  pub fn layout(&self) -> ImageLayout {
    self.core.layout
  }

  pub fn width(&self) -> u32 {
    self.core.layout.width
  }

  pub fn height(&self) -> u32 {
    self.core.layout.height
  }

  pub fn format(&self) -> PixelFormat {
    self.core.layout.format
  }

  /// 可见字节数：布局所需大小，内存块更小时以内存块为准
  pub fn len(&self) -> usize {
    self.visible(self.read_block().len())
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 当前存活的句柄数量
  pub fn ref_count(&self) -> usize {
    Arc::strong_count(&self.core)
  }

  /// 两个句柄是否指向同一块内存
  pub fn same_memory(&self, other: &Payload) -> bool {
    Arc::ptr_eq(&self.core, &other.core)
  }

  /// 只读访问，池内存块超出布局的部分不可见
  pub fn read(&self) -> PayloadRead<'_> {
    let guard = self.read_block();
    let len = self.visible(guard.len());
    PayloadRead { guard, len }
  }

  pub fn write(&self) -> PayloadWrite<'_> {
    let guard = match self.core.data.write() {
      Ok(guard) => guard,
      Err(poisoned) => {
        error!("载荷写锁中毒，继续使用内部数据");
        poisoned.into_inner()
      }
    };
    let len = self.visible(guard.len());
    PayloadWrite { guard, len }
  }

  fn visible(&self, block: usize) -> usize {
    self.core.layout.frame_size().min(block)
  }

  fn read_block(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
    match self.core.data.read() {
      Ok(guard) => guard,
      Err(poisoned) => {
        error!("载荷读锁中毒，继续使用内部数据");
        poisoned.into_inner()
      }
    }
  }
}

/// [`Payload::read`] 返回的读锁
pub struct PayloadRead<'a> {
  guard: RwLockReadGuard<'a, Box<[u8]>>,
  len: usize,
}

impl Deref for PayloadRead<'_> {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    &self.guard[..self.len]
  }
}

/// [`Payload::write`] 返回的写锁
pub struct PayloadWrite<'a> {
  guard: RwLockWriteGuard<'a, Box<[u8]>>,
  len: usize,
}

impl Deref for PayloadWrite<'_> {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    &self.guard[..self.len]
  }
}

impl DerefMut for PayloadWrite<'_> {
  fn deref_mut(&mut self) -> &mut [u8] {
    &mut self.guard[..self.len]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_frame_size_by_format() {
    assert_eq!(PixelFormat::Rgb888.frame_size(4, 2), 24);
    assert_eq!(PixelFormat::Gray8.frame_size(4, 2), 8);
    assert_eq!(PixelFormat::Nv12.frame_size(4, 2), 12);
    assert_eq!(PixelFormat::Nv12.frame_size(4, 3), 20);
  }

  #[test]
  fn test_clone_shares_memory_and_counts() {
    let payload = Payload::zeroed(ImageLayout::new(2, 2, PixelFormat::Gray8));
    assert_eq!(payload.ref_count(), 1);
    let copy = payload.clone();
    assert_eq!(payload.ref_count(), 2);
    assert!(payload.same_memory(&copy));
    copy.write()[0] = 7;
    assert_eq!(payload.read()[0], 7);
    drop(copy);
    assert_eq!(payload.ref_count(), 1);
  }

  #[test]
  fn test_pooled_memory_returns_on_last_drop() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let payload = Payload::pooled(ImageLayout::tensor(4), vec![1u8; 4].into_boxed_slice(), tx);
    let copy = payload.clone();
    drop(payload);
    assert!(rx.try_recv().is_err());
    drop(copy);
    let block = rx.try_recv().expect("内存应归还到池");
    assert_eq!(block.len(), 4);
  }

  #[test]
  fn test_large_block_is_sliced_to_layout() {
    let (tx, _rx) = crossbeam_channel::unbounded();
    let layout = ImageLayout::new(2, 2, PixelFormat::Gray8);
    let payload = Payload::pooled(layout, vec![9u8; 64].into_boxed_slice(), tx);
    assert_eq!(payload.len(), 4);
    assert_eq!(payload.read().len(), 4);
    payload.write().fill(1);
    assert_eq!(&payload.read()[..], &[1, 1, 1, 1]);
  }
}
