// 该文件是 Liushui （流水） 项目的一部分。
// src/geometry.rs - 裁剪、缩放与信箱几何计算
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

//! 几何计算都是纯函数：信箱放置、缺省裁剪区域以及检测框回投到显示分辨率。
//! 像素级的重采样交给裁剪/缩放加速器完成。

use crate::model::BoundingBox;

/// 向下取偶
pub fn round_down_to_even(n: u32) -> u32 {
  n - (n % 2)
}

/// 源图像上的裁剪区域，`end` 不含
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRect {
  pub start_x: u32,
  pub start_y: u32,
  pub end_x: u32,
  pub end_y: u32,
}

impl CropRect {
  pub fn new(start_x: u32, start_y: u32, end_x: u32, end_y: u32) -> Self {
    Self {
      start_x,
      start_y,
      end_x,
      end_y,
    }
  }

  /// 整帧裁剪，边界向下取偶
  pub fn full_frame(width: u32, height: u32) -> Self {
    Self::new(0, 0, round_down_to_even(width), round_down_to_even(height))
  }

  pub fn width(&self) -> u32 {
    self.end_x.saturating_sub(self.start_x)
  }

  pub fn height(&self) -> u32 {
    self.end_y.saturating_sub(self.start_y)
  }

  pub fn is_empty(&self) -> bool {
    self.width() == 0 || self.height() == 0
  }

  /// 是否完全落在给定尺寸的帧内
  pub fn fits_within(&self, width: u32, height: u32) -> bool {
    !self.is_empty() && self.end_x <= width && self.end_y <= height
  }
}

/// 信箱内容在目标画布中的对齐方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LetterboxAlignment {
  #[default]
  Middle,
  UpLeft,
}

/// 信箱填充色（YUV）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillColor {
  pub y: u8,
  pub u: u8,
  pub v: u8,
}

impl Default for FillColor {
  fn default() -> Self {
    Self { y: 0, u: 128, v: 128 }
  }
}

impl FillColor {
  /// 近似换算为 RGB（BT.601）
  pub fn to_rgb(&self) -> [u8; 3] {
    let y = self.y as f32;
    let u = self.u as f32 - 128.0;
    let v = self.v as f32 - 128.0;
    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;
    [
      r.round().clamp(0.0, 255.0) as u8,
      g.round().clamp(0.0, 255.0) as u8,
      b.round().clamp(0.0, 255.0) as u8,
    ]
  }
}

/// 信箱参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LetterboxParams {
  pub alignment: LetterboxAlignment,
  pub fill: FillColor,
}

/// 信箱放置结果，用于之后反算叠加坐标
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Letterbox {
  pub performed: bool,
  pub scale: f32,
  pub offset_x: u32,
  pub offset_y: u32,
  pub width: u32,
  pub height: u32,
}

impl Letterbox {
  /// 未执行信箱
  pub fn none() -> Self {
    Self::default()
  }
}

/// 计算信箱放置
///
/// 缩放比取 `min(dst_w/crop_w, dst_h/crop_h)`；内容尺寸用整数交叉相乘求得，
/// 避免浮点截断造成的一像素误差。
pub fn compute_letterbox(crop: &CropRect, dst_w: u32, dst_h: u32, alignment: LetterboxAlignment) -> Letterbox {
  let (crop_w, crop_h) = (crop.width() as u64, crop.height() as u64);
  let (dw, dh) = (dst_w as u64, dst_h as u64);

  if crop_w == 0 || crop_h == 0 {
    return Letterbox {
      performed: true,
      ..Letterbox::default()
    };
  }

  let (width, height) = if dw * crop_h <= dh * crop_w {
    (dw, crop_h * dw / crop_w)
  } else {
    (crop_w * dh / crop_h, dh)
  };
  let scale = (dst_w as f32 / crop_w as f32).min(dst_h as f32 / crop_h as f32);

  let (offset_x, offset_y) = match alignment {
    LetterboxAlignment::Middle => ((dw - width) / 2, (dh - height) / 2),
    LetterboxAlignment::UpLeft => (0, 0),
  };

  Letterbox {
    performed: true,
    scale,
    offset_x: offset_x as u32,
    offset_y: offset_y as u32,
    width: width as u32,
    height: height as u32,
  }
}

/// 检测输入在源图像中的位置：裁剪区域及其所在帧的尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceRegion {
  pub crop: CropRect,
  pub frame_width: u32,
  pub frame_height: u32,
}

impl SourceRegion {
  pub fn new(crop: CropRect, frame_width: u32, frame_height: u32) -> Self {
    Self {
      crop,
      frame_width,
      frame_height,
    }
  }

  /// 不做裁剪的整帧
  pub fn full_frame(width: u32, height: u32) -> Self {
    Self::new(CropRect::new(0, 0, width, height), width, height)
  }
}

/// 显示分辨率下的像素矩形
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
  pub x: i32,
  pub y: i32,
  pub width: u32,
  pub height: u32,
}

/// 把网络输入空间中的归一化检测框映射到显示分辨率
///
/// 先换算到网络输入像素并减去信箱偏移，按信箱内容（或网络输入）尺寸归一到裁剪区域内，
/// 加上裁剪起点得到源帧像素，最后按显示尺寸与源帧尺寸之比缩放。
pub fn project_to_display(
  bbox: &BoundingBox,
  network_width: u32,
  network_height: u32,
  letterbox: &Letterbox,
  source: &SourceRegion,
  display_width: u32,
  display_height: u32,
) -> PixelRect {
  let (content_w, content_h, offset_x, offset_y) = if letterbox.performed {
    (
      letterbox.width as f32,
      letterbox.height as f32,
      letterbox.offset_x as f32,
      letterbox.offset_y as f32,
    )
  } else {
    (network_width as f32, network_height as f32, 0.0, 0.0)
  };

  let ratio = |size: f32, total: u32| if total > 0 { size / total as f32 } else { 0.0 };
  // 网络输入像素到源帧像素
  let crop_scale_x = if content_w > 0.0 { source.crop.width() as f32 / content_w } else { 0.0 };
  let crop_scale_y = if content_h > 0.0 { source.crop.height() as f32 / content_h } else { 0.0 };
  let display_x = ratio(display_width as f32, source.frame_width);
  let display_y = ratio(display_height as f32, source.frame_height);

  let x = (bbox.xmin * network_width as f32 - offset_x) * crop_scale_x + source.crop.start_x as f32;
  let y = (bbox.ymin * network_height as f32 - offset_y) * crop_scale_y + source.crop.start_y as f32;
  let w = bbox.width() * network_width as f32 * crop_scale_x;
  let h = bbox.height() * network_height as f32 * crop_scale_y;

  PixelRect {
    x: (x * display_x) as i32,
    y: (y * display_y) as i32,
    width: (w * display_x).max(0.0) as u32,
    height: (h * display_y).max(0.0) as u32,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_letterbox_same_size_is_identity() {
    let crop = CropRect::new(0, 0, 640, 640);
    let lb = compute_letterbox(&crop, 640, 640, LetterboxAlignment::Middle);
    assert!(lb.performed);
    assert!((lb.scale - 1.0).abs() < 1e-6);
    assert_eq!((lb.offset_x, lb.offset_y), (0, 0));
    assert_eq!((lb.width, lb.height), (640, 640));
  }

  #[test]
  fn test_letterbox_wide_source_centered() {
    let crop = CropRect::new(0, 0, 1920, 1080);
    let lb = compute_letterbox(&crop, 640, 640, LetterboxAlignment::Middle);
    assert!((lb.scale - 0.333).abs() < 1e-3);
    assert_eq!((lb.width, lb.height), (640, 360));
    assert_eq!((lb.offset_x, lb.offset_y), (0, 140));
  }

  #[test]
  fn test_letterbox_up_left_has_no_offset() {
    let crop = CropRect::new(0, 0, 3840, 2160);
    let lb = compute_letterbox(&crop, 640, 640, LetterboxAlignment::UpLeft);
    assert_eq!((lb.width, lb.height), (640, 360));
    assert_eq!((lb.offset_x, lb.offset_y), (0, 0));
  }

  #[test]
  fn test_letterbox_tall_source() {
    let crop = CropRect::new(100, 0, 460, 640);
    let lb = compute_letterbox(&crop, 640, 640, LetterboxAlignment::Middle);
    assert_eq!((lb.width, lb.height), (360, 640));
    assert_eq!((lb.offset_x, lb.offset_y), (140, 0));
  }

  #[test]
  fn test_full_frame_rounds_down_to_even() {
    let crop = CropRect::full_frame(1281, 721);
    assert_eq!(crop, CropRect::new(0, 0, 1280, 720));
  }

  #[test]
  fn test_project_inverts_letterbox() {
    let crop = CropRect::new(0, 0, 1920, 1080);
    let lb = compute_letterbox(&crop, 640, 640, LetterboxAlignment::Middle);
    // 网络输入中 (0, 140) - (640, 500) 恰好是内容区域
    let bbox = BoundingBox::new(0.0, 140.0 / 640.0, 1.0, 500.0 / 640.0);
    let source = SourceRegion::full_frame(1920, 1080);
    let rect = project_to_display(&bbox, 640, 640, &lb, &source, 1920, 1080);
    assert_eq!(rect.x, 0);
    assert!(rect.y.abs() <= 1);
    assert!((rect.width as i32 - 1920).abs() <= 1);
    assert!((rect.height as i32 - 1080).abs() <= 1);
  }

  #[test]
  fn test_project_without_letterbox() {
    let bbox = BoundingBox::new(0.25, 0.25, 0.75, 0.75);
    let source = SourceRegion::full_frame(1280, 720);
    let rect = project_to_display(&bbox, 640, 640, &Letterbox::none(), &source, 1280, 720);
    assert_eq!(rect, PixelRect { x: 320, y: 180, width: 640, height: 360 });
  }

  #[test]
  fn test_project_adds_crop_origin() {
    // 1920x1080 帧右下方 (1280, 440)-(1920, 1080) 区域送入 640x640 网络
    let crop = CropRect::new(1280, 440, 1920, 1080);
    let source = SourceRegion::new(crop, 1920, 1080);
    let bbox = BoundingBox::new(0.5, 0.5, 1.0, 1.0);
    let rect = project_to_display(&bbox, 640, 640, &Letterbox::none(), &source, 1920, 1080);
    assert_eq!(rect, PixelRect { x: 1600, y: 760, width: 320, height: 320 });

    // 同一区域画到半分辨率的显示上
    let rect = project_to_display(&bbox, 640, 640, &Letterbox::none(), &source, 960, 540);
    assert_eq!(rect, PixelRect { x: 800, y: 380, width: 160, height: 160 });
  }
}
