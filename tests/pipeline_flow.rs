// 该文件是 Liushui （流水） 项目的一部分。
// tests/pipeline_flow.rs - 端到端流水线测试
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

#![cfg(feature = "cpu_backend")]

use std::{
  sync::{Arc, Mutex},
  thread,
  time::{Duration, Instant},
};

use liushui::{
  accel::{CpuCropResize, SyntheticAccelerator, SyntheticOutput},
  buffer::{
    BBoxMetadata, Buffer, BufferRole, ImageLayout, MetadataKind, Payload, PixelFormat, QuantParams,
    QuantizationInfo,
  },
  decoder::{Activation, DecoderSpec, YoloVariant},
  ingest::{FrameIngress, SyntheticSource},
  output::{FrameSink, RgbOverlayRenderer, SinkError},
  pipeline::Pipeline,
  queue::QueueConfig,
  stages::{
    AggregatorStage, DetectorResize, DispatchConfig, DispatchStage, GeometryStage, JoinOutput,
    JoinStage, OverlayStage, SinkStage,
  },
};

const HIGH: (u32, u32) = (128, 64);
const LOW: (u32, u32) = (64, 32);
const NETWORK: u32 = 64;
const CLASSES: usize = 2;
const ZERO_POINT: u8 = 128;
const BACKGROUND: [u8; 3] = [32, 32, 32];

/// 收集到达末端的缓冲区
#[derive(Clone, Default)]
struct Collect {
  frames: Arc<Mutex<Vec<Collected>>>,
}

struct Collected {
  bbox: Option<Arc<BBoxMetadata>>,
  has_bbox_metadata: bool,
  high: Option<Payload>,
  low: Option<Payload>,
}

impl Collect {
  fn len(&self) -> usize {
    self.frames.lock().unwrap().len()
  }
}

impl FrameSink for Collect {
  fn consume(&mut self, buffer: &Buffer) -> Result<(), SinkError> {
    self.frames.lock().unwrap().push(Collected {
      bbox: buffer.bbox(),
      has_bbox_metadata: buffer.has_metadata(MetadataKind::BBox),
      high: buffer.payload(BufferRole::HighRes).cloned(),
      low: buffer.payload(BufferRole::LowRes).cloned(),
    });
    Ok(())
  }
}

/// 2x2 特征图、单锚框；左上角单元放置一个类别 1 的目标
fn synthetic_accelerator() -> SyntheticAccelerator {
  let channels = 5 + CLASSES;
  let mut tensor = vec![0u8; 2 * 2 * channels];
  tensor[..4].fill(ZERO_POINT);
  tensor[4] = u8::MAX;
  tensor[5] = u8::MAX;
  SyntheticAccelerator::new(vec![SyntheticOutput {
    name: "tiny/out0".to_string(),
    tensor,
    quant: QuantizationInfo::single(QuantParams::new(ZERO_POINT as f32, 0.1)),
  }])
}

fn pixel(payload: &Payload, x: u32, y: u32) -> [u8; 3] {
  let data = payload.read();
  let offset = ((y * payload.width() + x) * 3) as usize;
  [data[offset], data[offset + 1], data[offset + 2]]
}

fn wait_for(collect: &Collect, count: usize) {
  let deadline = Instant::now() + Duration::from_secs(10);
  while collect.len() < count && Instant::now() < deadline {
    thread::sleep(Duration::from_millis(5));
  }
}

#[test]
fn test_frames_flow_from_ingress_to_overlay() {
  let spec = DecoderSpec {
    variant: YoloVariant::V5(Activation::Sigmoid),
    classes: CLASSES,
    confidence_threshold: 0.5,
    anchors_per_cell: 1,
    mask_size: 0,
  };
  let detections = Collect::default();
  let drawn = Collect::default();
  let queue = QueueConfig::leaky(8);

  let mut pipeline = Pipeline::new();
  let aggregator = pipeline.add_stage("aggregator", queue, AggregatorStage::new());
  let geometry = pipeline.add_stage(
    "geometry",
    queue,
    GeometryStage::new(
      "detector-input",
      CpuCropResize::new(),
      DetectorResize::new(NETWORK, NETWORK),
      ImageLayout::new(NETWORK, NETWORK, PixelFormat::Rgb888),
      8,
    )
    .with_source_role(BufferRole::LowRes),
  );
  let dispatch = pipeline.add_stage(
    "dispatch",
    queue,
    DispatchStage::new(synthetic_accelerator(), DispatchConfig::default()),
  );
  let join = pipeline.add_stage(
    "join",
    queue,
    JoinStage::new(spec, vec![JoinOutput::new("out0", 2, 2, &[16, 16])]),
  );
  let record = pipeline.add_stage("record", queue, SinkStage::new(detections.clone()));
  let overlay = pipeline.add_stage("overlay", queue, OverlayStage::new(RgbOverlayRenderer::new()));
  let display = pipeline.add_stage("display", queue, SinkStage::new(drawn.clone()));

  aggregator.add_subscriber(&geometry);
  geometry.add_subscriber(&dispatch);
  dispatch.add_subscriber(&join);
  join.add_subscriber(&record);
  record.add_subscriber(&overlay);
  overlay.add_subscriber(&display);

  let ingress = FrameIngress::new(aggregator)
    .with_route(HIGH.0, HIGH.1, BufferRole::HighRes)
    .with_route(LOW.0, LOW.1, BufferRole::LowRes);

  pipeline.run().unwrap();
  // 每个节拍一帧高分辨率、一帧低分辨率，另加一帧未登记的分辨率
  for frame in SyntheticSource::new(vec![HIGH, LOW]).take(6) {
    ingress.push_frame(frame).unwrap();
    thread::sleep(Duration::from_millis(5));
  }
  assert!(
    ingress
      .push_frame(Payload::zeroed(ImageLayout::new(32, 32, PixelFormat::Rgb888)))
      .is_err()
  );
  wait_for(&drawn, 3);
  pipeline.stop();

  assert_eq!(ingress.counters(), (6, 1));

  let detections = detections.frames.lock().unwrap();
  assert_eq!(detections.len(), 3);
  for frame in detections.iter() {
    let bbox = frame.bbox.as_ref().unwrap();
    assert_eq!(
      (bbox.network_input_width, bbox.network_input_height),
      (NETWORK, NETWORK)
    );
    assert_eq!(bbox.detections.len(), 1);
    let detection = &bbox.detections[0];
    assert_eq!(detection.class_id(), 1);
    assert!(detection.confidence() > 0.99);
    assert!((detection.bbox().xmin - 0.125).abs() < 1e-4);
    assert!((detection.bbox().ymax - 0.375).abs() < 1e-4);
    assert!(bbox.letterbox.performed);
    assert_eq!((bbox.letterbox.width, bbox.letterbox.height), LOW);
  }

  let drawn = drawn.frames.lock().unwrap();
  assert_eq!(drawn.len(), 3);
  for frame in drawn.iter() {
    assert!(!frame.has_bbox_metadata);
    // 高分辨率上检测框为 (16, 16) 起、边长 32；低分辨率为 (8, 8) 起、边长 16
    let high = frame.high.as_ref().unwrap();
    assert_ne!(pixel(high, 16, 44), BACKGROUND);
    assert_eq!(pixel(high, 100, 10), BACKGROUND);
    let low = frame.low.as_ref().unwrap();
    assert_ne!(pixel(low, 8, 22), BACKGROUND);
    assert_eq!(pixel(low, 50, 5), BACKGROUND);
  }
}
