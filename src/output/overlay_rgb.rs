// 该文件是 Liushui （流水） 项目的一部分。
// src/output/overlay_rgb.rs - RGB 载荷上的检测框绘制
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

use image::{ImageBuffer, Rgb};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::{
  buffer::{BufferRole, Payload, PixelFormat},
  output::SinkError,
  stages::{OverlayBox, OverlayRenderer},
};

/// 在 RGB888 载荷上原地绘制空心矩形
pub struct RgbOverlayRenderer {
  /// 按类别编号取色
  colors: Vec<Rgb<u8>>,
  /// 高分辨率画面的线宽；其余角色使用 1 像素
  high_res_thickness: u32,
}

impl Default for RgbOverlayRenderer {
  fn default() -> Self {
    Self::new()
  }
}

impl RgbOverlayRenderer {
  pub fn new() -> Self {
    // 80 种颜色，对应 COCO 的 80 个类别
    let colors = (0..80)
      .map(|i| {
        let hue = (i as f32 / 80.0) * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();
    Self {
      colors,
      high_res_thickness: 3,
    }
  }

  pub fn with_thickness(mut self, thickness: u32) -> Self {
    self.high_res_thickness = thickness.max(1);
    self
  }

  fn color(&self, class_id: u32) -> Rgb<u8> {
    self.colors[class_id as usize % self.colors.len()]
  }
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = match h {
    h if h < 60.0 => (c, x, 0.0),
    h if h < 120.0 => (x, c, 0.0),
    h if h < 180.0 => (0.0, c, x),
    h if h < 240.0 => (0.0, x, c),
    h if h < 300.0 => (x, 0.0, c),
    _ => (c, 0.0, x),
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

impl OverlayRenderer for RgbOverlayRenderer {
  fn draw(&mut self, role: BufferRole, payload: &Payload, boxes: &[OverlayBox]) -> Result<(), SinkError> {
    if payload.format() != PixelFormat::Rgb888 {
      return Err(SinkError::UnsupportedFormat(payload.format()));
    }
    let thickness = match role {
      BufferRole::HighRes => self.high_res_thickness,
      _ => 1,
    };

    let (width, height) = (payload.width(), payload.height());
    let mut data = payload.write();
    let mut image = ImageBuffer::<Rgb<u8>, &mut [u8]>::from_raw(width, height, &mut data[..])
      .ok_or_else(|| SinkError::Render(format!("载荷不足以容纳 {}x{} 画面", width, height)))?;

    for overlay in boxes {
      let x = overlay.rect.x.max(0);
      let y = overlay.rect.y.max(0);
      let w = overlay.rect.width.min(width.saturating_sub(x as u32));
      let h = overlay.rect.height.min(height.saturating_sub(y as u32));
      let color = self.color(overlay.class_id);

      // 逐层向内收缩以得到线宽
      for inset in 0..thickness {
        let (iw, ih) = (w.saturating_sub(2 * inset), h.saturating_sub(2 * inset));
        if iw == 0 || ih == 0 {
          break;
        }
        let rect = Rect::at(x + inset as i32, y + inset as i32).of_size(iw, ih);
        draw_hollow_rect_mut(&mut image, rect, color);
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{buffer::ImageLayout, geometry::PixelRect};

  fn pixel(payload: &Payload, x: u32, y: u32) -> [u8; 3] {
    let data = payload.read();
    let offset = ((y * payload.width() + x) * 3) as usize;
    [data[offset], data[offset + 1], data[offset + 2]]
  }

  #[test]
  fn test_draws_outline_only() {
    let payload = Payload::zeroed(ImageLayout::new(32, 32, PixelFormat::Rgb888));
    let mut renderer = RgbOverlayRenderer::new();
    let overlay = OverlayBox {
      rect: PixelRect {
        x: 4,
        y: 4,
        width: 10,
        height: 10,
      },
      class_id: 0,
      confidence: 0.9,
    };
    renderer.draw(BufferRole::LowRes, &payload, &[overlay]).unwrap();

    assert_ne!(pixel(&payload, 4, 4), [0, 0, 0]);
    assert_ne!(pixel(&payload, 13, 8), [0, 0, 0]);
    assert_eq!(pixel(&payload, 8, 8), [0, 0, 0]);
    assert_eq!(pixel(&payload, 20, 20), [0, 0, 0]);
  }

  #[test]
  fn test_box_outside_frame_is_clipped() {
    let payload = Payload::zeroed(ImageLayout::new(16, 16, PixelFormat::Rgb888));
    let mut renderer = RgbOverlayRenderer::new().with_thickness(2);
    let overlay = OverlayBox {
      rect: PixelRect {
        x: -5,
        y: 10,
        width: 100,
        height: 100,
      },
      class_id: 7,
      confidence: 0.5,
    };
    renderer.draw(BufferRole::HighRes, &payload, &[overlay]).unwrap();
    assert_ne!(pixel(&payload, 0, 10), [0, 0, 0]);
  }

  #[test]
  fn test_gray_payload_is_rejected() {
    let payload = Payload::zeroed(ImageLayout::new(4, 4, PixelFormat::Gray8));
    let result = RgbOverlayRenderer::new().draw(BufferRole::LowRes, &payload, &[]);
    assert!(matches!(result, Err(SinkError::UnsupportedFormat(PixelFormat::Gray8))));
  }
}
