// 该文件是 Liushui （流水） 项目的一部分。
// src/stages/join.rs - 多输出汇合与检测解码阶段
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

use tracing::{debug, info, warn};

use crate::{
  buffer::{BBoxMetadata, Buffer, BufferPtr, BufferRole, MetadataKind},
  decoder::{DecoderSpec, FeatureMap, MAX_OUTPUTS, TensorView, YoloDecoder},
  geometry::SourceRegion,
  stage::{Emitter, Stage, StageError},
};

/// 一个模型输出的汇合槽描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutput {
  /// 输出名后缀，例如 `conv93`
  pub suffix: String,
  pub rows: usize,
  pub cols: usize,
  /// 扁平的 `[w0, h0, w1, h1, ...]` 锚框
  pub anchors: Vec<u32>,
}

impl JoinOutput {
  pub fn new(suffix: &str, rows: usize, cols: usize, anchors: &[u32]) -> Self {
    Self {
      suffix: suffix.to_string(),
      rows,
      cols,
      anchors: anchors.to_vec(),
    }
  }
}

/// 汇合同一帧的多个推理输出并解码
///
/// 每个输出占一个槽位，按推理载荷标识的后缀归位，新到的缓冲区覆盖旧的。
/// 槽位全部就绪时解码，发出一个带 [`BBoxMetadata`] 的缓冲区并清空槽位。
/// 解码器在第一次凑齐时按裁剪元数据与各槽的量化信息构建。
pub struct JoinStage {
  spec: DecoderSpec,
  outputs: Vec<JoinOutput>,
  slots: Vec<Option<BufferPtr>>,
  decoder: Option<YoloDecoder>,
}

impl JoinStage {
  pub fn new(spec: DecoderSpec, outputs: Vec<JoinOutput>) -> Self {
    let slots = vec![None; outputs.len()];
    Self {
      spec,
      outputs,
      slots,
      decoder: None,
    }
  }

  /// 640x640 输入的 YOLOv5m 三输出布局
  pub fn yolov5m(spec: DecoderSpec) -> Self {
    Self::new(
      spec,
      vec![
        JoinOutput::new("conv93", 20, 20, &[116, 90, 156, 198, 373, 326]),
        JoinOutput::new("conv84", 40, 40, &[30, 61, 62, 45, 59, 119]),
        JoinOutput::new("conv74", 80, 80, &[10, 13, 16, 30, 33, 23]),
      ],
    )
  }

  pub fn outputs(&self) -> &[JoinOutput] {
    &self.outputs
  }

  /// 已填充的槽位数
  pub fn filled(&self) -> usize {
    self.slots.iter().filter(|slot| slot.is_some()).count()
  }

  fn slot_of(&self, id: &str) -> Option<usize> {
    self
      .outputs
      .iter()
      .position(|output| id.ends_with(output.suffix.as_str()))
  }

  fn build_decoder(&self, slots: &[BufferPtr]) -> Result<YoloDecoder, StageError> {
    let cropped = slots[0]
      .cropped()
      .ok_or_else(|| StageError::Topology("缺少裁剪元数据".to_string()))?;

    let mut decoder = self.spec.build();
    decoder.configure(
      self
        .spec
        .config(cropped.destination_width, cropped.destination_height),
    )?;
    for (output, slot) in self.outputs.iter().zip(slots.iter()) {
      let quant = slot.quantization().map(|info| info.primary());
      decoder.add_output(FeatureMap::new(output.rows, output.cols, &output.anchors, quant))?;
    }
    decoder.seal()?;
    info!(
      "解码器已构建: {:?}, 输入 {}x{}",
      decoder.variant(),
      cropped.destination_width,
      cropped.destination_height
    );
    Ok(decoder)
  }

  fn decode(&mut self, slots: &[BufferPtr]) -> Result<Buffer, StageError> {
    if self.decoder.is_none() {
      self.decoder = Some(self.build_decoder(slots)?);
    }
    let Some(decoder) = self.decoder.as_ref() else {
      return Err(StageError::Config("解码器不可用".to_string()));
    };

    let cropped = slots[0]
      .cropped()
      .ok_or_else(|| StageError::Topology("缺少裁剪元数据".to_string()))?;

    let guards = slots
      .iter()
      .map(|slot| {
        slot
          .payload(BufferRole::Inference)
          .map(|payload| payload.read())
          .ok_or_else(|| StageError::Topology(format!("缺少 {} 载荷", BufferRole::Inference)))
      })
      .collect::<Result<Vec<_>, _>>()?;
    let mut tensors: [Option<TensorView<'_>>; MAX_OUTPUTS] = [None; MAX_OUTPUTS];
    for (tensor, guard) in tensors.iter_mut().zip(guards.iter()) {
      *tensor = Some(TensorView::from(&guard[..]));
    }
    let detections = decoder.decode(tensors)?;
    drop(guards);

    let mut output = Buffer::derive(&[slots[0].as_ref()]);
    output.remove_payload(BufferRole::Inference);
    output.copy_metadata_from(&slots[0]);
    output.remove_metadata(MetadataKind::Cropped);
    output.remove_metadata(MetadataKind::QuantizationInfo);
    output.attach(BBoxMetadata {
      network_input_width: cropped.destination_width,
      network_input_height: cropped.destination_height,
      detections,
      letterbox: cropped.letterbox,
      source: SourceRegion::new(cropped.crop, cropped.source_width, cropped.source_height),
    });
    Ok(output)
  }
}

impl Stage for JoinStage {
  fn init(&mut self) -> Result<(), StageError> {
    if self.outputs.is_empty() || self.outputs.len() > MAX_OUTPUTS {
      return Err(StageError::Config(format!(
        "汇合输出数 {} 不在 1..={} 范围内",
        self.outputs.len(),
        MAX_OUTPUTS
      )));
    }
    Ok(())
  }

  fn process(&mut self, input: BufferPtr, emitter: &Emitter) -> Result<(), StageError> {
    let Some(id) = input.payload_id(BufferRole::Inference) else {
      warn!("{}: 缓冲区没有推理输出标识", emitter.stage_name());
      return Err(StageError::Topology("缺少推理输出标识".to_string()));
    };
    let Some(index) = self.slot_of(id) else {
      warn!("{}: 未知的推理输出 {}", emitter.stage_name(), id);
      return Err(StageError::Topology(format!("未知的推理输出 {}", id)));
    };
    self.slots[index] = Some(input);

    if self.slots.iter().any(Option::is_none) {
      return Ok(());
    }
    let slots: Vec<BufferPtr> = self.slots.iter_mut().filter_map(Option::take).collect();

    let output = self.decode(&slots)?;
    if let Some(bbox) = output.bbox() {
      debug!("{}: 检测到 {} 个目标", emitter.stage_name(), bbox.detections.len());
    }
    emitter.send_to_subscribers(output.into_ptr());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    buffer::{CroppedMetadata, ImageLayout, Payload, PixelFormat, QuantParams, QuantizationInfo},
    decoder::{DecodeError, YoloVariant},
    geometry::{CropRect, Letterbox},
    queue::QueueConfig,
    stage::StageHandle,
  };

  const CHANNELS: usize = 6;

  fn spec() -> DecoderSpec {
    DecoderSpec {
      variant: YoloVariant::X,
      classes: 1,
      confidence_threshold: 0.5,
      anchors_per_cell: 1,
      mask_size: 0,
    }
  }

  fn stage() -> JoinStage {
    let mut stage = JoinStage::new(
      spec(),
      vec![
        JoinOutput::new("conv93", 1, 1, &[1, 1]),
        JoinOutput::new("conv84", 1, 1, &[1, 1]),
        JoinOutput::new("conv74", 1, 1, &[1, 1]),
      ],
    );
    stage.init().unwrap();
    stage
  }

  /// `objectness` 为 0..=100 的百分数
  fn inference(name: &str, objectness: u8) -> BufferPtr {
    let tensor = vec![50, 50, 0, 0, objectness, 100];
    assert_eq!(tensor.len(), CHANNELS);
    let mut buffer = Buffer::from_payload(
      BufferRole::HighRes,
      Payload::zeroed(ImageLayout::new(8, 8, PixelFormat::Gray8)),
    );
    buffer.add_payload(
      BufferRole::Inference,
      Payload::from_vec(ImageLayout::tensor(CHANNELS), tensor),
    );
    buffer.set_payload_id(BufferRole::Inference, &format!("yolov5m/{}", name));
    buffer.attach(CroppedMetadata {
      destination_width: 640,
      destination_height: 640,
      crop: CropRect::full_frame(1920, 1080),
      source_width: 1920,
      source_height: 1080,
      letterbox: Letterbox {
        performed: true,
        scale: 1.0 / 3.0,
        offset_x: 0,
        offset_y: 140,
        width: 640,
        height: 360,
      },
    });
    buffer.attach(QuantizationInfo::single(QuantParams::new(0.0, 0.01)));
    buffer.into_ptr()
  }

  fn topology() -> (StageHandle, StageHandle) {
    let handle = StageHandle::new("join", QueueConfig::leaky(8));
    let out = StageHandle::new("out", QueueConfig::leaky(8));
    handle.add_subscriber(&out);
    (handle, out)
  }

  #[test]
  fn test_emits_only_when_all_slots_filled() {
    let mut join = stage();
    let (handle, out) = topology();

    join.process(inference("conv93", 90), &handle.emitter()).unwrap();
    assert!(out.try_pop().is_none());
    join.process(inference("conv84", 0), &handle.emitter()).unwrap();
    assert!(out.try_pop().is_none());
    assert_eq!(join.filled(), 2);

    join.process(inference("conv74", 0), &handle.emitter()).unwrap();
    let output = out.try_pop().unwrap();
    assert!(out.try_pop().is_none());
    assert_eq!(join.filled(), 0);

    let bbox = output.bbox().unwrap();
    assert_eq!((bbox.network_input_width, bbox.network_input_height), (640, 640));
    assert_eq!(bbox.letterbox.offset_y, 140);
    assert_eq!(bbox.detections.len(), 1);
    assert_eq!(bbox.detections[0].class_id(), 1);
    assert!((bbox.detections[0].confidence() - 0.9).abs() < 1e-4);

    assert!(!output.has_metadata(MetadataKind::Cropped));
    assert!(!output.has_metadata(MetadataKind::QuantizationInfo));
    assert!(!output.has_payload(BufferRole::Inference));
    assert!(output.has_payload(BufferRole::HighRes));
  }

  #[test]
  fn test_starts_clean_after_emit() {
    let mut join = stage();
    let (handle, out) = topology();
    for name in ["conv93", "conv84", "conv74"] {
      join.process(inference(name, 90), &handle.emitter()).unwrap();
    }
    assert!(out.try_pop().is_some());

    join.process(inference("conv74", 90), &handle.emitter()).unwrap();
    join.process(inference("conv84", 90), &handle.emitter()).unwrap();
    assert!(out.try_pop().is_none());
    join.process(inference("conv93", 90), &handle.emitter()).unwrap();
    assert!(out.try_pop().is_some());
  }

  #[test]
  fn test_repeated_output_overwrites_slot() {
    let mut join = stage();
    let (handle, out) = topology();
    join.process(inference("conv93", 90), &handle.emitter()).unwrap();
    join.process(inference("conv93", 0), &handle.emitter()).unwrap();
    join.process(inference("conv84", 0), &handle.emitter()).unwrap();
    join.process(inference("conv74", 0), &handle.emitter()).unwrap();
    let output = out.try_pop().unwrap();
    assert!(output.bbox().unwrap().detections.is_empty());
  }

  #[test]
  fn test_unknown_output_is_rejected() {
    let mut join = stage();
    let (handle, _out) = topology();
    let result = join.process(inference("conv12", 90), &handle.emitter());
    assert!(matches!(result, Err(StageError::Topology(_))));
    assert_eq!(join.filled(), 0);
  }

  #[test]
  fn test_short_tensor_reports_decode_error() {
    let mut join = stage();
    let (handle, out) = topology();
    join.process(inference("conv93", 90), &handle.emitter()).unwrap();
    join.process(inference("conv84", 90), &handle.emitter()).unwrap();

    let source = inference("conv74", 90);
    let mut short = Buffer::derive(&[source.as_ref()]);
    short.add_payload(BufferRole::Inference, Payload::zeroed(ImageLayout::tensor(2)));
    short.attach(CroppedMetadata {
      destination_width: 640,
      destination_height: 640,
      crop: CropRect::full_frame(640, 640),
      source_width: 640,
      source_height: 640,
      letterbox: Letterbox::none(),
    });
    let result = join.process(short.into_ptr(), &handle.emitter());
    assert!(matches!(
      result,
      Err(StageError::Decode(DecodeError::TensorTooShort { index: 2, .. }))
    ));
    assert!(out.try_pop().is_none());
    assert_eq!(join.filled(), 0);
  }
}
