// 该文件是 Liushui （流水） 项目的一部分。
// src/buffer/metadata.rs - 缓冲区元数据
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

use std::sync::Arc;

use crate::{
  geometry::{CropRect, Letterbox, SourceRegion},
  model::Detection,
};

/// 元数据种类，每种在一个缓冲区上最多一条
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
  BBox,
  Cropped,
  QuantizationInfo,
}

/// 裁剪/缩放阶段附加的几何信息
#[derive(Debug, Clone, PartialEq)]
pub struct CroppedMetadata {
  pub destination_width: u32,
  pub destination_height: u32,
  pub crop: CropRect,
  /// 裁剪所在源帧的尺寸
  pub source_width: u32,
  pub source_height: u32,
  pub letterbox: Letterbox,
}

/// 解码阶段附加的检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct BBoxMetadata {
  pub network_input_width: u32,
  pub network_input_height: u32,
  pub detections: Vec<Detection>,
  pub letterbox: Letterbox,
  /// 网络输入取自源帧的哪个区域
  pub source: SourceRegion,
}

/// 单个输出张量的反量化参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
  pub zero_point: f32,
  pub scale: f32,
}

impl Default for QuantParams {
  fn default() -> Self {
    Self {
      zero_point: 0.0,
      scale: 1.0,
    }
  }
}

impl QuantParams {
  pub fn new(zero_point: f32, scale: f32) -> Self {
    Self { zero_point, scale }
  }

  /// `(value - zero_point) * scale`
  pub fn dequantize(&self, value: f32) -> f32 {
    (value - self.zero_point) * self.scale
  }
}

/// 推理输出附带的量化信息
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuantizationInfo {
  pub params: Vec<QuantParams>,
}

impl QuantizationInfo {
  pub fn single(params: QuantParams) -> Self {
    Self {
      params: vec![params],
    }
  }

  /// 第一组参数；缺失时为恒等变换
  pub fn primary(&self) -> QuantParams {
    self.params.first().copied().unwrap_or_default()
  }
}

/// 封闭的元数据集合
#[derive(Debug, Clone)]
pub enum Metadata {
  BBox(Arc<BBoxMetadata>),
  Cropped(Arc<CroppedMetadata>),
  QuantizationInfo(Arc<QuantizationInfo>),
}

impl Metadata {
  pub fn kind(&self) -> MetadataKind {
    match self {
      Metadata::BBox(_) => MetadataKind::BBox,
      Metadata::Cropped(_) => MetadataKind::Cropped,
      Metadata::QuantizationInfo(_) => MetadataKind::QuantizationInfo,
    }
  }
}

impl From<BBoxMetadata> for Metadata {
  fn from(value: BBoxMetadata) -> Self {
    Metadata::BBox(Arc::new(value))
  }
}

impl From<CroppedMetadata> for Metadata {
  fn from(value: CroppedMetadata) -> Self {
    Metadata::Cropped(Arc::new(value))
  }
}

impl From<QuantizationInfo> for Metadata {
  fn from(value: QuantizationInfo) -> Self {
    Metadata::QuantizationInfo(Arc::new(value))
  }
}
