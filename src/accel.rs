// 该文件是 Liushui （流水） 项目的一部分。
// src/accel.rs - 加速器协作者接口
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

use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::debug;

use crate::{
  buffer::{Payload, PixelFormat, QuantizationInfo},
  geometry::{CropRect, FillColor, Letterbox},
};

#[cfg(feature = "cpu_backend")]
mod cpu_resize;
#[cfg(feature = "cpu_backend")]
pub use self::cpu_resize::CpuCropResize;

mod synthetic;
pub use self::synthetic::{SyntheticAccelerator, SyntheticOutput};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcceleratorError {
  #[error("不支持的像素格式: {0:?}")]
  UnsupportedFormat(PixelFormat),
  #[error("源与目标像素格式不一致: {src:?} -> {dst:?}")]
  FormatMismatch { src: PixelFormat, dst: PixelFormat },
  #[error("裁剪区域 {crop:?} 超出源图像 {width}x{height}")]
  CropOutOfBounds {
    crop: CropRect,
    width: u32,
    height: u32,
  },
  #[error("缓冲区大小不符: 需要 {expected} 字节，实际 {actual} 字节")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("推理加速器未配置")]
  NotConfigured,
  #[error("推理失败: {0}")]
  Inference(String),
  #[error("加速器已关闭")]
  Closed,
  #[error("作业在完成前被取消")]
  Cancelled,
}

/// 缩放插值方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
  #[default]
  Bilinear,
  Nearest,
}

/// 裁剪/缩放加速器
///
/// 把 `src` 中的 `crop` 区域缩放写入 `dst`。给定信箱时，内容写入信箱区域，
/// 其余部分用填充色覆盖。
pub trait CropResizeAccelerator: Send {
  fn transform(
    &self,
    src: &Payload,
    dst: &Payload,
    crop: &CropRect,
    interpolation: Interpolation,
    letterbox: Option<(&Letterbox, FillColor)>,
  ) -> Result<(), AcceleratorError>;
}

/// 推理加速器报告的输出张量
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
  pub name: String,
  pub frame_size: usize,
  pub quant: QuantizationInfo,
}

/// 一次异步推理作业
pub struct InferenceJob {
  pub input: Payload,
  pub completion: CompletionHandle,
}

/// 异步推理加速器
///
/// `submit` 一次提交整批作业并立即返回；每个作业完成后（通常在加速器自己的线程上）
/// 通过其 [`CompletionHandle`] 报告结果。
pub trait InferenceAccelerator: Send {
  /// 按批大小配置模型，返回各输出张量的描述
  fn configure(&mut self, batch_size: usize) -> Result<Vec<OutputSpec>, AcceleratorError>;

  fn submit(&self, jobs: Vec<InferenceJob>) -> Result<(), AcceleratorError>;
}

/// 作业完成消息
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
  pub job_id: u64,
  pub result: Result<(), AcceleratorError>,
}

/// 作业的完成句柄
///
/// 持有加速器应写入的输出载荷。`complete` 把结果作为消息发到通道上；
/// 未调用 `complete` 就被丢弃的句柄会报告 [`AcceleratorError::Cancelled`]。
pub struct CompletionHandle {
  job_id: u64,
  outputs: Vec<(String, Payload)>,
  sender: Option<Sender<Completion>>,
}

impl std::fmt::Debug for CompletionHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CompletionHandle")
      .field("job_id", &self.job_id)
      .field("outputs", &self.outputs.len())
      .finish()
  }
}

impl CompletionHandle {
  pub fn new(job_id: u64, outputs: Vec<(String, Payload)>, sender: Sender<Completion>) -> Self {
    Self {
      job_id,
      outputs,
      sender: Some(sender),
    }
  }

  pub fn job_id(&self) -> u64 {
    self.job_id
  }

  pub fn outputs(&self) -> &[(String, Payload)] {
    &self.outputs
  }

  pub fn output(&self, name: &str) -> Option<&Payload> {
    self
      .outputs
      .iter()
      .find(|(output, _)| output == name)
      .map(|(_, payload)| payload)
  }

  pub fn complete(mut self, result: Result<(), AcceleratorError>) {
    self.send(result);
  }

  fn send(&mut self, result: Result<(), AcceleratorError>) {
    let Some(sender) = self.sender.take() else {
      return;
    };
    let completion = Completion {
      job_id: self.job_id,
      result,
    };
    if sender.send(completion).is_err() {
      debug!("作业 {} 完成时转发线程已退出，结果被丢弃", self.job_id);
    }
  }
}

impl Drop for CompletionHandle {
  fn drop(&mut self) {
    if self.sender.is_some() {
      self.send(Err(AcceleratorError::Cancelled));
    }
  }
}
