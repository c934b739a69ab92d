// 该文件是 Liushui （流水） 项目的一部分。
// src/output/record.rs - 检测结果记录输出
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
  fs::OpenOptions,
  io::Write,
  path::{Path, PathBuf},
};

use chrono::{DateTime, Datelike, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  buffer::{BBoxMetadata, Buffer},
  output::{FrameSink, SinkError},
};

/// 以 JSON Lines 记录每帧检测结果
///
/// 记录按日期分目录保存：`<dir>/YYYY/MM/DD/detections.jsonl`。
/// 默认只记录有检测结果的帧，`always` 时每帧都记录。
/// 启用 `snapshot` 且带有 CPU 后端时，同时把低分辨率 RGB 画面保存为 PNG。
pub struct DetectionRecordSink {
  directory: PathBuf,
  always: bool,
  snapshot: bool,
  frame_counter: u64,
}

impl FromUrlWithScheme for DetectionRecordSink {
  const SCHEME: &'static str = "record";
}

impl FromUrl for DetectionRecordSink {
  type Error = SinkError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SinkError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    let snapshot = uri.query_pairs().any(|(k, _)| k == "snapshot");

    Ok(DetectionRecordSink {
      directory: PathBuf::from(uri.path()),
      always,
      snapshot,
      frame_counter: 0,
    })
  }
}

impl DetectionRecordSink {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      always: false,
      snapshot: false,
      frame_counter: 0,
    }
  }

  /// 没有检测结果的帧也记录
  pub fn always(mut self) -> Self {
    self.always = true;
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn day_directory(&self, now: &DateTime<Utc>) -> Result<PathBuf, SinkError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }
    Ok(directory)
  }

  fn record_line(&self, now: &DateTime<Utc>, bbox: Option<&BBoxMetadata>) -> serde_json::Value {
    let detections: Vec<serde_json::Value> = bbox
      .map(|bbox| {
        bbox
          .detections
          .iter()
          .map(|d| {
            let b = d.bbox();
            json!({
              "class_id": d.class_id(),
              "confidence": d.confidence(),
              "bbox": [b.xmin, b.ymin, b.xmax, b.ymax],
            })
          })
          .collect()
      })
      .unwrap_or_default();

    json!({
      "timestamp": now.to_rfc3339(),
      "frame": self.frame_counter,
      "network": bbox.map(|b| [b.network_input_width, b.network_input_height]),
      "detections": detections,
    })
  }

  #[cfg(feature = "cpu_backend")]
  fn save_snapshot(&self, directory: &Path, now: &DateTime<Utc>, buffer: &Buffer) -> Result<(), SinkError> {
    use crate::buffer::{BufferRole, PixelFormat};

    let payload = buffer
      .payload(BufferRole::LowRes)
      .ok_or(SinkError::MissingPayload(BufferRole::LowRes))?;
    if payload.format() != PixelFormat::Rgb888 {
      return Err(SinkError::UnsupportedFormat(payload.format()));
    }
    let data = payload.read();
    let snapshot = image::RgbImage::from_raw(payload.width(), payload.height(), data.to_vec())
      .ok_or_else(|| SinkError::Render("快照尺寸与载荷不符".to_string()))?;
    let path = directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_counter
    ));
    snapshot.save(&path)?;
    debug!("保存快照 {}", path.display());
    Ok(())
  }
}

impl FrameSink for DetectionRecordSink {
  fn open(&mut self) -> Result<(), SinkError> {
    std::fs::create_dir_all(&self.directory)?;
    info!("检测记录输出目录: {}", self.directory.display());
    Ok(())
  }

  fn consume(&mut self, buffer: &Buffer) -> Result<(), SinkError> {
    self.frame_counter += 1;
    let bbox = buffer.bbox();
    let has_detections = bbox.as_ref().is_some_and(|b| !b.detections.is_empty());
    if !self.always && !has_detections {
      return Ok(());
    }

    let now = Utc::now();
    let directory = self.day_directory(&now)?;
    let line = self.record_line(&now, bbox.as_deref());
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(directory.join("detections.jsonl"))?;
    writeln!(file, "{}", serde_json::to_string(&line)?)?;

    #[cfg(feature = "cpu_backend")]
    if self.snapshot {
      self.save_snapshot(&directory, &now, buffer)?;
    }
    #[cfg(not(feature = "cpu_backend"))]
    if self.snapshot {
      debug!("未启用 CPU 后端，跳过快照");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    geometry::{Letterbox, SourceRegion},
    model::{BoundingBox, Detection},
  };

  fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("liushui-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
  }

  fn frame(detections: Vec<Detection>) -> Buffer {
    let buffer = Buffer::new();
    buffer.attach(BBoxMetadata {
      network_input_width: 640,
      network_input_height: 640,
      detections,
      letterbox: Letterbox::none(),
      source: SourceRegion::full_frame(640, 640),
    });
    buffer
  }

  fn read_lines(dir: &Path) -> Vec<serde_json::Value> {
    let now = Utc::now();
    let path = dir
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()))
      .join("detections.jsonl");
    std::fs::read_to_string(path)
      .unwrap_or_default()
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect()
  }

  #[test]
  fn test_from_url() {
    let url = url::Url::parse("record:///var/log/liushui?always&snapshot").unwrap();
    let sink = DetectionRecordSink::from_url(&url).unwrap();
    assert_eq!(sink.directory(), Path::new("/var/log/liushui"));
    assert!(sink.always);
    assert!(sink.snapshot);

    let url = url::Url::parse("folder:///tmp").unwrap();
    assert!(matches!(
      DetectionRecordSink::from_url(&url),
      Err(SinkError::SchemeMismatch)
    ));
  }

  #[test]
  fn test_records_only_frames_with_detections() {
    let dir = scratch_dir("record-only");
    let mut sink = DetectionRecordSink::new(&dir);
    sink.open().unwrap();

    sink.consume(&frame(Vec::new())).unwrap();
    sink
      .consume(&frame(vec![Detection::new(BoundingBox::new(0.1, 0.2, 0.3, 0.4), 0.75, 5)]))
      .unwrap();

    let lines = read_lines(&dir);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["frame"], 2);
    assert_eq!(lines[0]["detections"][0]["class_id"], 5);
    assert_eq!(lines[0]["network"][0], 640);
    let _ = std::fs::remove_dir_all(&dir);
  }

  #[test]
  fn test_always_records_empty_frames() {
    let dir = scratch_dir("record-always");
    let mut sink = DetectionRecordSink::new(&dir).always();
    sink.open().unwrap();
    sink.consume(&frame(Vec::new())).unwrap();
    sink.consume(&Buffer::new()).unwrap();

    let lines = read_lines(&dir);
    assert_eq!(lines.len(), 2);
    assert!(lines[1]["network"].is_null());
    let _ = std::fs::remove_dir_all(&dir);
  }
}
