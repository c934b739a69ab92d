// 该文件是 Liushui （流水） 项目的一部分。
// src/ingest/synthetic_source.rs - 合成多分辨率帧源
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

use std::{
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::error;

use crate::{
  FromUrl, FromUrlWithScheme,
  buffer::{ImageLayout, Payload, PixelFormat},
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SyntheticSourceError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("无法解析分辨率: {0}")]
  InvalidResolution(String),
  #[error("无效帧率: {0}")]
  InvalidFps(String),
}

const BACKGROUND: u8 = 32;
const FOREGROUND: [u8; 3] = [230, 200, 40];

/// 合成帧源
///
/// 每个节拍按登记顺序为每种分辨率各产出一帧 RGB888 画面：
/// 深灰背景上一个随帧号水平移动的亮色方块。方块在各分辨率中的
/// 相对位置一致，便于检查高低分辨率之间的坐标映射。
pub struct SyntheticSource {
  resolutions: Vec<(u32, u32)>,
  interval: Option<Duration>,
  tick: u64,
  cursor: usize,
  last_tick: Option<Instant>,
}

impl FromUrlWithScheme for SyntheticSource {
  const SCHEME: &'static str = "synthetic";
}

impl FromUrl for SyntheticSource {
  type Error = SyntheticSourceError;

  /// `synthetic://?res=3840x2160&res=1280x720&fps=30`
  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(SyntheticSourceError::SchemeMismatch);
    }

    let mut resolutions = Vec::new();
    let mut interval = None;
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "res" => resolutions.push(parse_resolution(&value)?),
        "fps" => {
          let fps = value
            .parse::<f64>()
            .ok()
            .filter(|fps| *fps > 0.0)
            .ok_or_else(|| SyntheticSourceError::InvalidFps(value.to_string()))?;
          interval = Some(Duration::from_secs_f64(1.0 / fps));
        }
        _ => {}
      }
    }

    let mut source = if resolutions.is_empty() {
      Self::standard()
    } else {
      Self::new(resolutions)
    };
    source.interval = interval;
    Ok(source)
  }
}

fn parse_resolution(value: &str) -> Result<(u32, u32), SyntheticSourceError> {
  let invalid = || SyntheticSourceError::InvalidResolution(value.to_string());
  let (w, h) = value.split_once('x').ok_or_else(invalid)?;
  let width = w.parse::<u32>().map_err(|_| invalid())?;
  let height = h.parse::<u32>().map_err(|_| invalid())?;
  if width == 0 || height == 0 {
    return Err(invalid());
  }
  Ok((width, height))
}

impl SyntheticSource {
  pub fn new(resolutions: Vec<(u32, u32)>) -> Self {
    Self {
      resolutions,
      interval: None,
      tick: 0,
      cursor: 0,
      last_tick: None,
    }
  }

  /// 4K 与 720p 两路
  pub fn standard() -> Self {
    Self::new(vec![(3840, 2160), (1280, 720)])
  }

  /// 节拍间隔；为空时尽快产出
  pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
    self.interval = interval;
    self
  }

  pub fn resolutions(&self) -> &[(u32, u32)] {
    &self.resolutions
  }

  fn pace(&mut self) {
    if let (Some(interval), Some(last)) = (self.interval, self.last_tick) {
      let elapsed = last.elapsed();
      if elapsed < interval {
        thread::sleep(interval - elapsed);
      }
    }
    self.last_tick = Some(Instant::now());
  }

  fn render(&self, width: u32, height: u32) -> Payload {
    let layout = ImageLayout::new(width, height, PixelFormat::Rgb888);
    let mut data = vec![BACKGROUND; layout.frame_size()];

    // 方块边长为画面高度的 1/4，水平位置每帧移动画面宽度的 1/64
    let side = (height / 4).max(1);
    let span = width.saturating_sub(side).max(1) as u64;
    let x0 = ((self.tick * width as u64 / 64) % span) as u32;
    let y0 = (height - side) / 2;

    let stride = width as usize * 3;
    for y in y0..(y0 + side).min(height) {
      let row = y as usize * stride;
      for x in x0..(x0 + side).min(width) {
        let offset = row + x as usize * 3;
        data[offset..offset + 3].copy_from_slice(&FOREGROUND);
      }
    }
    Payload::from_vec(layout, data)
  }
}

impl Iterator for SyntheticSource {
  type Item = Payload;

  fn next(&mut self) -> Option<Self::Item> {
    if self.resolutions.is_empty() {
      return None;
    }
    if self.cursor == 0 {
      self.pace();
    }
    let (width, height) = self.resolutions[self.cursor];
    let frame = self.render(width, height);

    self.cursor += 1;
    if self.cursor == self.resolutions.len() {
      self.cursor = 0;
      self.tick += 1;
    }
    Some(frame)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pixel(payload: &Payload, x: u32, y: u32) -> [u8; 3] {
    let data = payload.read();
    let offset = ((y * payload.width() + x) * 3) as usize;
    [data[offset], data[offset + 1], data[offset + 2]]
  }

  #[test]
  fn test_cycles_through_resolutions() {
    let mut source = SyntheticSource::new(vec![(64, 32), (32, 16)]);
    let sizes: Vec<(u32, u32)> = source
      .by_ref()
      .take(5)
      .map(|p| (p.width(), p.height()))
      .collect();
    assert_eq!(sizes, vec![(64, 32), (32, 16), (64, 32), (32, 16), (64, 32)]);
    assert_eq!(source.tick, 2);
  }

  #[test]
  fn test_frame_contains_square() {
    let mut source = SyntheticSource::new(vec![(64, 32)]);
    let frame = source.next().unwrap();
    assert_eq!(frame.format(), PixelFormat::Rgb888);
    assert_eq!(frame.len(), 64 * 32 * 3);
    // 第 0 帧方块在左侧，边长 8，纵向居中
    assert_eq!(pixel(&frame, 0, 12), FOREGROUND);
    assert_eq!(pixel(&frame, 7, 19), FOREGROUND);
    assert_eq!(pixel(&frame, 8, 12), [BACKGROUND; 3]);
    assert_eq!(pixel(&frame, 0, 0), [BACKGROUND; 3]);

    // 下一帧右移 1 像素
    let frame = source.next().unwrap();
    assert_eq!(pixel(&frame, 0, 12), [BACKGROUND; 3]);
    assert_eq!(pixel(&frame, 8, 12), FOREGROUND);
  }

  #[test]
  fn test_from_url() {
    let url = url::Url::parse("synthetic://?res=640x360&res=320x180&fps=25").unwrap();
    let source = SyntheticSource::from_url(&url).unwrap();
    assert_eq!(source.resolutions(), &[(640, 360), (320, 180)]);
    assert_eq!(source.interval, Some(Duration::from_millis(40)));

    let url = url::Url::parse("synthetic://").unwrap();
    let source = SyntheticSource::from_url(&url).unwrap();
    assert_eq!(source.resolutions(), &[(3840, 2160), (1280, 720)]);

    let url = url::Url::parse("synthetic://?res=640by360").unwrap();
    assert_eq!(
      SyntheticSource::from_url(&url).err(),
      Some(SyntheticSourceError::InvalidResolution("640by360".to_string()))
    );

    let url = url::Url::parse("camera://").unwrap();
    assert_eq!(
      SyntheticSource::from_url(&url).err(),
      Some(SyntheticSourceError::SchemeMismatch)
    );
  }
}
