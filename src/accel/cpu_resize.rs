// 该文件是 Liushui （流水） 项目的一部分。
// src/accel/cpu_resize.rs - CPU 裁剪缩放实现
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

use image::{
  ImageBuffer, Luma, Pixel, Rgb,
  imageops::{self, FilterType},
};
use tracing::debug;

use super::{AcceleratorError, CropResizeAccelerator, Interpolation};
use crate::{
  buffer::{Payload, PixelFormat},
  geometry::{CropRect, FillColor, Letterbox},
};

/// 在 CPU 上完成裁剪、缩放与信箱填充，支持 RGB888 与 GRAY8
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuCropResize;

impl CpuCropResize {
  pub fn new() -> Self {
    Self
  }
}

fn filter(interpolation: Interpolation) -> FilterType {
  match interpolation {
    Interpolation::Bilinear => FilterType::Triangle,
    Interpolation::Nearest => FilterType::Nearest,
  }
}

fn transform_pixels<P>(
  src: &Payload,
  dst: &Payload,
  crop: &CropRect,
  interpolation: Interpolation,
  letterbox: Option<(&Letterbox, P)>,
) -> Result<(), AcceleratorError>
where
  P: Pixel<Subpixel = u8> + 'static,
{
  let src_data = src.read();
  let mut dst_data = dst.write();

  let channels = P::CHANNEL_COUNT as usize;
  let stride = src.width() as usize * channels;
  let expected = src.layout().frame_size();
  if src_data.len() < expected {
    return Err(AcceleratorError::SizeMismatch {
      expected,
      actual: src_data.len(),
    });
  }

  // 逐行复制裁剪区域到独立缓冲，源载荷的读锁之外不再借用
  let row_bytes = crop.width() as usize * channels;
  let mut region = Vec::with_capacity(row_bytes * crop.height() as usize);
  for y in crop.start_y..crop.start_y + crop.height() {
    let offset = y as usize * stride + crop.start_x as usize * channels;
    region.extend_from_slice(&src_data[offset..offset + row_bytes]);
  }
  let cropped = ImageBuffer::<P, Vec<u8>>::from_raw(crop.width(), crop.height(), region).ok_or(
    AcceleratorError::SizeMismatch {
      expected: row_bytes * crop.height() as usize,
      actual: 0,
    },
  )?;

  let expected = dst.layout().frame_size();
  let actual = dst_data.len();
  let mut dst_image =
    ImageBuffer::<P, &mut [u8]>::from_raw(dst.width(), dst.height(), &mut dst_data[..])
      .ok_or(AcceleratorError::SizeMismatch { expected, actual })?;

  match letterbox {
    Some((placement, fill)) if placement.performed => {
      for pixel in dst_image.pixels_mut() {
        *pixel = fill;
      }
      if placement.width > 0 && placement.height > 0 {
        let resized = imageops::resize(&cropped, placement.width, placement.height, filter(interpolation));
        imageops::replace(
          &mut dst_image,
          &resized,
          placement.offset_x as i64,
          placement.offset_y as i64,
        );
      }
    }
    _ => {
      let resized = imageops::resize(&cropped, dst.width(), dst.height(), filter(interpolation));
      imageops::replace(&mut dst_image, &resized, 0, 0);
    }
  }

  debug!(
    "CPU 缩放: {:?} -> {}x{}",
    crop,
    dst.width(),
    dst.height()
  );
  Ok(())
}

impl CropResizeAccelerator for CpuCropResize {
  fn transform(
    &self,
    src: &Payload,
    dst: &Payload,
    crop: &CropRect,
    interpolation: Interpolation,
    letterbox: Option<(&Letterbox, FillColor)>,
  ) -> Result<(), AcceleratorError> {
    if src.format() != dst.format() {
      return Err(AcceleratorError::FormatMismatch {
        src: src.format(),
        dst: dst.format(),
      });
    }
    if !crop.fits_within(src.width(), src.height()) {
      return Err(AcceleratorError::CropOutOfBounds {
        crop: *crop,
        width: src.width(),
        height: src.height(),
      });
    }

    match src.format() {
      PixelFormat::Rgb888 => transform_pixels(
        src,
        dst,
        crop,
        interpolation,
        letterbox.map(|(placement, fill)| (placement, Rgb(fill.to_rgb()))),
      ),
      PixelFormat::Gray8 => transform_pixels(
        src,
        dst,
        crop,
        interpolation,
        letterbox.map(|(placement, fill)| (placement, Luma([fill.y]))),
      ),
      format => Err(AcceleratorError::UnsupportedFormat(format)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    buffer::ImageLayout,
    geometry::{LetterboxAlignment, compute_letterbox},
  };

  fn solid_rgb(width: u32, height: u32, value: u8) -> Payload {
    let layout = ImageLayout::new(width, height, PixelFormat::Rgb888);
    Payload::from_vec(layout, vec![value; layout.frame_size()])
  }

  #[test]
  fn test_letterbox_fills_borders() {
    let src = solid_rgb(8, 4, 200);
    let dst = solid_rgb(8, 8, 0);
    let crop = CropRect::full_frame(8, 4);
    let placement = compute_letterbox(&crop, 8, 8, LetterboxAlignment::Middle);
    let fill = FillColor::default();
    CpuCropResize
      .transform(&src, &dst, &crop, Interpolation::Nearest, Some((&placement, fill)))
      .unwrap();

    let data = dst.read();
    // 第 0 行是填充区，第 4 行是内容区
    assert_eq!(&data[0..3], &fill.to_rgb());
    let content = (4 * 8) * 3;
    assert_eq!(&data[content..content + 3], &[200, 200, 200]);
  }

  #[test]
  fn test_plain_resize_covers_destination() {
    let src = solid_rgb(16, 16, 90);
    let dst = solid_rgb(4, 4, 0);
    CpuCropResize
      .transform(&src, &dst, &CropRect::new(4, 4, 12, 12), Interpolation::Bilinear, None)
      .unwrap();
    assert!(dst.read().iter().all(|v| *v == 90));
  }

  #[test]
  fn test_offset_crop_reads_its_own_region() {
    // 左半 GRAY 10，右半 GRAY 240
    let layout = ImageLayout::new(8, 4, PixelFormat::Gray8);
    let pixels = (0..4)
      .flat_map(|_| (0..8).map(|x| if x < 4 { 10 } else { 240 }))
      .collect();
    let src = Payload::from_vec(layout, pixels);
    let dst = Payload::zeroed(ImageLayout::new(2, 2, PixelFormat::Gray8));
    CpuCropResize
      .transform(&src, &dst, &CropRect::new(4, 0, 8, 4), Interpolation::Nearest, None)
      .unwrap();
    assert!(dst.read().iter().all(|v| *v == 240));

    CpuCropResize
      .transform(&src, &dst, &CropRect::new(1, 1, 3, 3), Interpolation::Nearest, None)
      .unwrap();
    assert!(dst.read().iter().all(|v| *v == 10));
  }

  #[test]
  fn test_out_of_bounds_crop_is_rejected() {
    let src = solid_rgb(8, 8, 0);
    let dst = solid_rgb(4, 4, 0);
    let result = CpuCropResize.transform(
      &src,
      &dst,
      &CropRect::new(4, 4, 10, 10),
      Interpolation::Nearest,
      None,
    );
    assert!(matches!(result, Err(AcceleratorError::CropOutOfBounds { .. })));
  }

  #[test]
  fn test_nv12_is_unsupported() {
    let layout = ImageLayout::new(4, 4, PixelFormat::Nv12);
    let src = Payload::zeroed(layout);
    let dst = Payload::zeroed(layout);
    let result = CpuCropResize.transform(
      &src,
      &dst,
      &CropRect::full_frame(4, 4),
      Interpolation::Nearest,
      None,
    );
    assert_eq!(result, Err(AcceleratorError::UnsupportedFormat(PixelFormat::Nv12)));
  }
}
