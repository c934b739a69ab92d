// 该文件是 Liushui （流水） 项目的一部分。
// src/ingest.rs - 帧入口：按分辨率分类后送入流水线
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

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  buffer::{Buffer, BufferRole, Payload},
  queue::PushOutcome,
  stage::StageHandle,
};

mod synthetic_source;
pub use self::synthetic_source::{SyntheticSource, SyntheticSourceError};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngestError {
  #[error("未知分辨率 {width}x{height}，丢弃该帧")]
  UnknownResolution { width: u32, height: u32 },
  #[error("入口阶段 {0} 已关闭")]
  Closed(String),
}

/// 一条分辨率到角色的映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
  width: u32,
  height: u32,
  role: BufferRole,
}

/// 流水线入口
///
/// 摄像头同时输出多路分辨率，入口按宽高决定每帧的角色，
/// 然后包装成单载荷缓冲区推给入口阶段。未登记的分辨率直接丢弃。
pub struct FrameIngress {
  entry: StageHandle,
  routes: Vec<Route>,
  accepted: AtomicU64,
  rejected: AtomicU64,
}

impl FrameIngress {
  pub fn new(entry: StageHandle) -> Self {
    Self {
      entry,
      routes: Vec::new(),
      accepted: AtomicU64::new(0),
      rejected: AtomicU64::new(0),
    }
  }

  /// 4K 为高分辨率，720p 为低分辨率
  pub fn standard(entry: StageHandle) -> Self {
    Self::new(entry)
      .with_route(3840, 2160, BufferRole::HighRes)
      .with_route(1280, 720, BufferRole::LowRes)
  }

  /// 登记一条分辨率映射，同一分辨率重复登记时后者生效
  pub fn with_route(mut self, width: u32, height: u32, role: BufferRole) -> Self {
    self.routes.retain(|r| !(r.width == width && r.height == height));
    self.routes.push(Route { width, height, role });
    self
  }

  pub fn role_of(&self, width: u32, height: u32) -> Option<BufferRole> {
    self
      .routes
      .iter()
      .find(|r| r.width == width && r.height == height)
      .map(|r| r.role)
  }

  pub fn entry(&self) -> &StageHandle {
    &self.entry
  }

  /// (已接收, 已拒绝) 帧数
  pub fn counters(&self) -> (u64, u64) {
    (
      self.accepted.load(Ordering::Relaxed),
      self.rejected.load(Ordering::Relaxed),
    )
  }

  /// 分类并推送一帧
  ///
  /// 队列溢出按入口阶段自己的策略处理，返回值如实反映推送结果。
  pub fn push_frame(&self, payload: Payload) -> Result<PushOutcome, IngestError> {
    let (width, height) = (payload.width(), payload.height());
    let Some(role) = self.role_of(width, height) else {
      self.rejected.fetch_add(1, Ordering::Relaxed);
      warn!("未知分辨率 {}x{}，丢弃该帧", width, height);
      return Err(IngestError::UnknownResolution { width, height });
    };

    let buffer = Buffer::from_payload(role, payload).into_ptr();
    let outcome = self.entry.push(buffer);
    match outcome {
      PushOutcome::Closed => {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        Err(IngestError::Closed(self.entry.name().to_string()))
      }
      PushOutcome::DroppedNewest => {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!("{} 队列已满，丢弃 {} 帧", self.entry.name(), role);
        Ok(outcome)
      }
      _ => {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        debug!("{} 帧 {}x{} 进入 {}", role, width, height, self.entry.name());
        Ok(outcome)
      }
    }
  }
}
