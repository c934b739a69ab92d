// 该文件是 Liushui （流水） 项目的一部分。
// src/buffer.rs - 多载荷缓冲区与元数据
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

//! 缓冲区是流水线中流动的数据载体。
//!
//! 每个缓冲区按角色持有若干载荷句柄（每个角色恰好一个），并按种类持有至多一条元数据。
//! 载荷的引用计数只在两处变化：[`Buffer::derive`] 复制载荷表时增加，缓冲区析构时减少。
//! 以 [`Buffer::with_deleter`] 构造的缓冲区把载荷整体交给外部删除器处理。

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard},
};

use tracing::error;

mod metadata;
mod payload;
mod pool;

pub use self::metadata::{
  BBoxMetadata, CroppedMetadata, Metadata, MetadataKind, QuantParams, QuantizationInfo,
};
pub use self::payload::{ImageLayout, Payload, PayloadRead, PayloadWrite, PixelFormat};
pub use self::pool::{BufferPool, HeapBufferPool, PoolError};

/// 缓冲区载荷角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferRole {
  /// 高分辨率源流（如 4K）
  HighRes,
  /// 低分辨率源流（如 720p）
  LowRes,
  /// 裁剪/缩放后的网络输入
  Cropped,
  /// 推理输出张量
  Inference,
}

impl std::fmt::Display for BufferRole {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      BufferRole::HighRes => "high-res",
      BufferRole::LowRes => "low-res",
      BufferRole::Cropped => "cropped",
      BufferRole::Inference => "inference",
    };
    f.write_str(name)
  }
}

pub type PayloadMap = HashMap<BufferRole, Payload>;

type Deleter = Box<dyn FnOnce(PayloadMap) + Send>;

/// 在阶段之间共享的缓冲区句柄
pub type BufferPtr = Arc<Buffer>;

pub struct Buffer {
  payloads: PayloadMap,
  payload_ids: HashMap<BufferRole, String>,
  metadata: Mutex<HashMap<MetadataKind, Metadata>>,
  deleter: Mutex<Option<Deleter>>,
}

impl std::fmt::Debug for Buffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let kinds: Vec<MetadataKind> = self.lock_metadata().keys().copied().collect();
    f.debug_struct("Buffer")
      .field("roles", &self.roles())
      .field("payload_ids", &self.payload_ids)
      .field("metadata", &kinds)
      .finish()
  }
}

impl Default for Buffer {
  fn default() -> Self {
    Self::new()
  }
}

impl Buffer {
  /// 共享所有权的空缓冲区
  pub fn new() -> Self {
    Self {
      payloads: HashMap::new(),
      payload_ids: HashMap::new(),
      metadata: Mutex::new(HashMap::new()),
      deleter: Mutex::new(None),
    }
  }

  /// 所有权委托给外部删除器的缓冲区，析构时载荷整体交给 `deleter`
  pub fn with_deleter<F>(deleter: F) -> Self
  where
    F: FnOnce(PayloadMap) + Send + 'static,
  {
    Self {
      payloads: HashMap::new(),
      payload_ids: HashMap::new(),
      metadata: Mutex::new(HashMap::new()),
      deleter: Mutex::new(Some(Box::new(deleter))),
    }
  }

  /// 从一个或多个缓冲区复制载荷表（含载荷标识），每个载荷引用计数加一
  ///
  /// 同一角色出现多次时以靠后的来源为准。
  pub fn derive(sources: &[&Buffer]) -> Self {
    let mut buffer = Self::new();
    for source in sources {
      for (role, payload) in source.payloads.iter() {
        buffer.payloads.insert(*role, payload.clone());
      }
      for (role, id) in source.payload_ids.iter() {
        buffer.payload_ids.insert(*role, id.clone());
      }
    }
    buffer
  }

  /// 构造仅含一个载荷的缓冲区
  pub fn from_payload(role: BufferRole, payload: Payload) -> Self {
    let mut buffer = Self::new();
    buffer.add_payload(role, payload);
    buffer
  }

  pub fn into_ptr(self) -> BufferPtr {
    Arc::new(self)
  }

  pub fn is_delegated(&self) -> bool {
    self.lock_deleter().is_some()
  }

  /// 设置角色对应的载荷，替换原有载荷
  pub fn add_payload(&mut self, role: BufferRole, payload: Payload) {
    self.payloads.insert(role, payload);
  }

  pub fn remove_payload(&mut self, role: BufferRole) -> Option<Payload> {
    self.payload_ids.remove(&role);
    self.payloads.remove(&role)
  }

  pub fn payload(&self, role: BufferRole) -> Option<&Payload> {
    self.payloads.get(&role)
  }

  pub fn has_payload(&self, role: BufferRole) -> bool {
    self.payloads.contains_key(&role)
  }

  pub fn roles(&self) -> Vec<BufferRole> {
    let mut roles: Vec<BufferRole> = self.payloads.keys().copied().collect();
    roles.sort();
    roles
  }

  pub fn set_payload_id(&mut self, role: BufferRole, id: &str) {
    self.payload_ids.insert(role, id.to_string());
  }

  pub fn payload_id(&self, role: BufferRole) -> Option<&str> {
    self.payload_ids.get(&role).map(String::as_str)
  }

  /// 附加元数据，替换同种类的旧记录
  pub fn attach(&self, metadata: impl Into<Metadata>) {
    let metadata = metadata.into();
    self.lock_metadata().insert(metadata.kind(), metadata);
  }

  pub fn remove_metadata(&self, kind: MetadataKind) -> Option<Metadata> {
    self.lock_metadata().remove(&kind)
  }

  pub fn has_metadata(&self, kind: MetadataKind) -> bool {
    self.lock_metadata().contains_key(&kind)
  }

  pub fn metadata(&self, kind: MetadataKind) -> Option<Metadata> {
    self.lock_metadata().get(&kind).cloned()
  }

  /// 复制另一个缓冲区的全部元数据，同种类记录被覆盖
  pub fn copy_metadata_from(&self, other: &Buffer) {
    if std::ptr::eq(self, other) {
      return;
    }
    let source: Vec<Metadata> = other.lock_metadata().values().cloned().collect();
    let mut target = self.lock_metadata();
    for metadata in source {
      target.insert(metadata.kind(), metadata);
    }
  }

  pub fn cropped(&self) -> Option<Arc<CroppedMetadata>> {
    match self.metadata(MetadataKind::Cropped) {
      Some(Metadata::Cropped(m)) => Some(m),
      _ => None,
    }
  }

  pub fn bbox(&self) -> Option<Arc<BBoxMetadata>> {
    match self.metadata(MetadataKind::BBox) {
      Some(Metadata::BBox(m)) => Some(m),
      _ => None,
    }
  }

  pub fn quantization(&self) -> Option<Arc<QuantizationInfo>> {
    match self.metadata(MetadataKind::QuantizationInfo) {
      Some(Metadata::QuantizationInfo(m)) => Some(m),
      _ => None,
    }
  }

  fn lock_metadata(&self) -> MutexGuard<'_, HashMap<MetadataKind, Metadata>> {
    match self.metadata.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        error!("缓冲区元数据锁中毒，继续使用内部数据");
        poisoned.into_inner()
      }
    }
  }

  fn lock_deleter(&self) -> MutexGuard<'_, Option<Deleter>> {
    match self.deleter.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

impl Drop for Buffer {
  fn drop(&mut self) {
    let deleter = match self.deleter.get_mut() {
      Ok(deleter) => deleter.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(deleter) = deleter {
      deleter(std::mem::take(&mut self.payloads));
    }
  }
}
