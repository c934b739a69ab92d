// 该文件是 Liushui （流水） 项目的一部分。
// src/model.rs - 检测结果定义
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

/// 归一化边界框，坐标相对网络输入尺寸
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
  pub xmin: f32,
  pub ymin: f32,
  pub xmax: f32,
  pub ymax: f32,
}

impl BoundingBox {
  pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
    Self {
      xmin,
      ymin,
      xmax,
      ymax,
    }
  }

  /// 由中心点与宽高构造
  pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
    Self {
      xmin: cx - w / 2.0,
      ymin: cy - h / 2.0,
      xmax: cx + w / 2.0,
      ymax: cy + h / 2.0,
    }
  }

  pub fn width(&self) -> f32 {
    self.xmax - self.xmin
  }

  pub fn height(&self) -> f32 {
    self.ymax - self.ymin
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  /// 交并比，并集为零时返回 0
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let overlap_w = (self.xmax.min(other.xmax) - self.xmin.max(other.xmin)).max(0.0);
    let overlap_h = (self.ymax.min(other.ymax) - self.ymin.max(other.ymin)).max(0.0);
    let overlap = overlap_w * overlap_h;
    let union = self.area() + other.area() - overlap;
    if union > 0.0 { overlap / union } else { 0.0 }
  }
}

/// 解码器产出的单个检测结果，生成后不可修改
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  bbox: BoundingBox,
  confidence: f32,
  class_id: u32,
  mask: Option<Box<[f32]>>,
}

impl Detection {
  pub fn new(bbox: BoundingBox, confidence: f32, class_id: u32) -> Self {
    Self {
      bbox,
      confidence,
      class_id,
      mask: None,
    }
  }

  pub fn with_mask(mut self, mask: Vec<f32>) -> Self {
    self.mask = Some(mask.into_boxed_slice());
    self
  }

  pub fn bbox(&self) -> &BoundingBox {
    &self.bbox
  }

  pub fn confidence(&self) -> f32 {
    self.confidence
  }

  /// 类别编号，从 1 开始，0 保留给背景
  pub fn class_id(&self) -> u32 {
    self.class_id
  }

  pub fn mask(&self) -> Option<&[f32]> {
    self.mask.as_deref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_iou_partial_overlap() {
    let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BoundingBox::new(5.0, 5.0, 15.0, 15.0);
    // 25 / (100 + 100 - 25)
    assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);
    assert!((a.iou(&a) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn test_iou_degenerate_boxes() {
    let a = BoundingBox::new(1.0, 1.0, 1.0, 1.0);
    assert_eq!(a.iou(&a), 0.0);
    let far = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
    assert_eq!(BoundingBox::new(0.0, 0.0, 10.0, 10.0).iou(&far), 0.0);
  }

  #[test]
  fn test_from_center() {
    let b = BoundingBox::from_center(0.5, 0.5, 0.2, 0.4);
    assert!((b.xmin - 0.4).abs() < 1e-6);
    assert!((b.ymax - 0.7).abs() < 1e-6);
  }
}
