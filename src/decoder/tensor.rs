// 该文件是 Liushui （流水） 项目的一部分。
// src/decoder/tensor.rs - 推理输出张量视图
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

use crate::buffer::QuantParams;

/// 借用的输出张量，8 位量化或已是浮点
#[derive(Debug, Clone, Copy)]
pub enum TensorView<'a> {
  U8(&'a [u8]),
  F32(&'a [f32]),
}

impl<'a> TensorView<'a> {
  pub fn len(&self) -> usize {
    match self {
      TensorView::U8(data) => data.len(),
      TensorView::F32(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_quantized(&self) -> bool {
    matches!(self, TensorView::U8(_))
  }

  /// 读取一个元素：量化张量先反量化，浮点张量原样返回
  #[inline]
  pub fn value(&self, index: usize, quant: &QuantParams) -> f32 {
    match self {
      TensorView::U8(data) => quant.dequantize(data[index] as f32),
      TensorView::F32(data) => data[index],
    }
  }
}

impl<'a> From<&'a [u8]> for TensorView<'a> {
  fn from(value: &'a [u8]) -> Self {
    TensorView::U8(value)
  }
}

impl<'a> From<&'a [f32]> for TensorView<'a> {
  fn from(value: &'a [f32]) -> Self {
    TensorView::F32(value)
  }
}
