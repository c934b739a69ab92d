// 该文件是 Liushui （流水） 项目的一部分。
// src/output.rs - 输出定义
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

use thiserror::Error;

use crate::buffer::{Buffer, BufferRole, PixelFormat};

#[cfg(feature = "detection_record")]
mod record;
#[cfg(feature = "detection_record")]
pub use self::record::DetectionRecordSink;

#[cfg(feature = "cpu_backend")]
mod overlay_rgb;
#[cfg(feature = "cpu_backend")]
pub use self::overlay_rgb::RgbOverlayRenderer;

#[derive(Error, Debug)]
pub enum SinkError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  Json(#[from] serde_json::Error),
  #[cfg(feature = "cpu_backend")]
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("缺少 {0} 载荷")]
  MissingPayload(BufferRole),
  #[error("不支持的像素格式: {0:?}")]
  UnsupportedFormat(PixelFormat),
  #[error("绘制失败: {0}")]
  Render(String),
}

/// 流水线末端的外部输出
pub trait FrameSink: Send + 'static {
  /// 在流水线启动前打开输出
  fn open(&mut self) -> Result<(), SinkError> {
    Ok(())
  }

  fn consume(&mut self, buffer: &Buffer) -> Result<(), SinkError>;

  fn close(&mut self) -> Result<(), SinkError> {
    Ok(())
  }
}
