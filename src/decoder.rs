// 该文件是 Liushui （流水） 项目的一部分。
// src/decoder.rs - 基于锚框的检测解码器
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

//! 解码器把最多三个特征图输出还原为检测结果。
//!
//! 生命周期为 `Unconfigured → Configured → OutputsRegistered → Ready`，
//! 只有 `Ready` 状态下才能 `decode`。每个锚框的通道排布为
//! `[x, y, w, h, obj, class_1..class_n, mask_1..mask_m]`。

use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  buffer::QuantParams,
  model::Detection,
};

mod nms;
mod tensor;
mod variant;

pub use self::nms::{IOU_THRESHOLD, non_max_suppression};
pub use self::tensor::TensorView;
pub use self::variant::{Activation, CellGeometry, RawBox, YoloVariant};

/// 单个锚框的前五个通道：四个坐标加目标置信度
const BOX_CHANNELS: usize = 5;
const OBJECTNESS_CHANNEL: usize = 4;

/// 一次最多解码的特征图数量
pub const MAX_OUTPUTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
  #[error("解码器状态为 {state}，无法执行 {operation}")]
  InvalidState {
    operation: &'static str,
    state: &'static str,
  },
  #[error("解码器配置无效: {0}")]
  InvalidConfig(String),
  #[error("最多只能注册 3 个输出")]
  TooManyOutputs,
  #[error("输出 {0} 未注册")]
  UnregisteredOutput(usize),
  #[error("输出 {index} 张量过短: 需要 {expected}，实际 {actual}")]
  TensorTooShort {
    index: usize,
    expected: usize,
    actual: usize,
  },
}

/// 解码器全局参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderConfig {
  /// 网络输入宽度
  pub image_width: u32,
  /// 网络输入高度
  pub image_height: u32,
  pub classes: usize,
  pub confidence_threshold: f32,
  pub anchors_per_cell: usize,
  /// 每个锚框末尾的分割掩码通道数
  pub mask_size: usize,
}

impl DecoderConfig {
  fn channels_per_anchor(&self) -> usize {
    BOX_CHANNELS + self.classes + self.mask_size
  }
}

/// 一个特征图输出
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
  pub rows: usize,
  pub cols: usize,
  /// 锚框宽高（网络输入像素）
  pub anchors: Vec<(f32, f32)>,
  pub quant: QuantParams,
}

impl FeatureMap {
  /// 以扁平的 `[w0, h0, w1, h1, ...]` 锚框列表构造
  pub fn new(rows: usize, cols: usize, anchors: &[u32], quant: Option<QuantParams>) -> Self {
    Self {
      rows,
      cols,
      anchors: anchors
        .chunks_exact(2)
        .map(|pair| (pair[0] as f32, pair[1] as f32))
        .collect(),
      quant: quant.unwrap_or_default(),
    }
  }
}

enum DecoderState {
  Unconfigured,
  Configured(DecoderConfig),
  OutputsRegistered(DecoderConfig, Vec<FeatureMap>),
  Ready(DecoderConfig, Vec<FeatureMap>),
}

impl DecoderState {
  fn name(&self) -> &'static str {
    match self {
      DecoderState::Unconfigured => "Unconfigured",
      DecoderState::Configured(_) => "Configured",
      DecoderState::OutputsRegistered(..) => "OutputsRegistered",
      DecoderState::Ready(..) => "Ready",
    }
  }
}

/// YOLO 系列解码器
pub struct YoloDecoder {
  variant: YoloVariant,
  state: DecoderState,
}

impl YoloDecoder {
  pub fn new(variant: YoloVariant) -> Self {
    Self {
      variant,
      state: DecoderState::Unconfigured,
    }
  }

  pub fn variant(&self) -> YoloVariant {
    self.variant
  }

  pub fn state_name(&self) -> &'static str {
    self.state.name()
  }

  pub fn is_ready(&self) -> bool {
    matches!(self.state, DecoderState::Ready(..))
  }

  /// 设置图像尺寸、类别数与阈值；只能在注册输出之前调用
  pub fn configure(&mut self, config: DecoderConfig) -> Result<(), DecodeError> {
    match self.state {
      DecoderState::Unconfigured | DecoderState::Configured(_) => {}
      _ => {
        return Err(DecodeError::InvalidState {
          operation: "configure",
          state: self.state.name(),
        });
      }
    }
    if config.image_width == 0 || config.image_height == 0 {
      return Err(DecodeError::InvalidConfig("图像尺寸为零".to_string()));
    }
    if config.classes == 0 || config.anchors_per_cell == 0 {
      return Err(DecodeError::InvalidConfig("类别数或锚框数为零".to_string()));
    }
    self.state = DecoderState::Configured(config);
    Ok(())
  }

  /// 注册一个特征图输出，返回已注册的数量
  pub fn add_output(&mut self, output: FeatureMap) -> Result<usize, DecodeError> {
    let state = std::mem::replace(&mut self.state, DecoderState::Unconfigured);
    let (config, mut outputs) = match state {
      DecoderState::Configured(config) => (config, Vec::new()),
      DecoderState::OutputsRegistered(config, outputs) => (config, outputs),
      other => {
        let name = other.name();
        self.state = other;
        return Err(DecodeError::InvalidState {
          operation: "add_output",
          state: name,
        });
      }
    };

    let check = if outputs.len() >= MAX_OUTPUTS {
      Err(DecodeError::TooManyOutputs)
    } else if output.anchors.len() != config.anchors_per_cell {
      Err(DecodeError::InvalidConfig(format!(
        "锚框数 {} 与配置 {} 不一致",
        output.anchors.len(),
        config.anchors_per_cell
      )))
    } else if output.rows == 0 || output.cols == 0 {
      Err(DecodeError::InvalidConfig("特征图尺寸为零".to_string()))
    } else {
      Ok(())
    };

    if let Err(e) = check {
      self.state = if outputs.is_empty() {
        DecoderState::Configured(config)
      } else {
        DecoderState::OutputsRegistered(config, outputs)
      };
      return Err(e);
    }

    outputs.push(output);
    let count = outputs.len();
    self.state = DecoderState::OutputsRegistered(config, outputs);
    Ok(count)
  }

  /// 结束输出注册，进入可解码状态
  pub fn seal(&mut self) -> Result<(), DecodeError> {
    let state = std::mem::replace(&mut self.state, DecoderState::Unconfigured);
    match state {
      DecoderState::OutputsRegistered(config, outputs) => {
        debug!("解码器就绪: {:?}, {} 个输出", self.variant, outputs.len());
        self.state = DecoderState::Ready(config, outputs);
        Ok(())
      }
      other => {
        let name = other.name();
        self.state = other;
        Err(DecodeError::InvalidState {
          operation: "seal",
          state: name,
        })
      }
    }
  }

  /// 解码一组输出张量，`None` 表示跳过对应的特征图
  pub fn decode(
    &self,
    tensors: [Option<TensorView<'_>>; MAX_OUTPUTS],
  ) -> Result<Vec<Detection>, DecodeError> {
    let DecoderState::Ready(config, outputs) = &self.state else {
      return Err(DecodeError::InvalidState {
        operation: "decode",
        state: self.state.name(),
      });
    };

    let mut candidates = Vec::new();
    for (index, tensor) in tensors.iter().enumerate() {
      let Some(tensor) = tensor else {
        continue;
      };
      let output = outputs
        .get(index)
        .ok_or(DecodeError::UnregisteredOutput(index))?;
      let expected = output.rows * output.cols * output.anchors.len() * config.channels_per_anchor();
      if tensor.len() < expected {
        return Err(DecodeError::TensorTooShort {
          index,
          expected,
          actual: tensor.len(),
        });
      }
      self.extract(config, output, tensor, &mut candidates);
    }

    let candidate_count = candidates.len();
    let detections = non_max_suppression(candidates, config.confidence_threshold, IOU_THRESHOLD);
    debug!("解码得到 {} 个候选，NMS 后保留 {}", candidate_count, detections.len());
    Ok(detections)
  }

  fn extract(
    &self,
    config: &DecoderConfig,
    output: &FeatureMap,
    tensor: &TensorView<'_>,
    candidates: &mut Vec<Detection>,
  ) {
    let act = self.variant.activation();
    let threshold = config.confidence_threshold;
    let channels = config.channels_per_anchor();
    let anchor_stride = channels * output.anchors.len();
    let row_stride = anchor_stride * output.cols;
    let quant = &output.quant;

    for row in 0..output.rows {
      for col in 0..output.cols {
        for (a, anchor) in output.anchors.iter().enumerate() {
          let base = row * row_stride + col * anchor_stride + a * channels;
          let objectness = act.apply(tensor.value(base + OBJECTNESS_CHANNEL, quant));
          if objectness < threshold {
            continue;
          }

          let mut best: Option<(u32, f32)> = None;
          let mut best_prob = 0.0f32;
          for c in 0..config.classes {
            let prob = act.apply(tensor.value(base + BOX_CHANNELS + c, quant)) * objectness;
            if prob > best_prob {
              best_prob = prob;
              best = Some((c as u32 + 1, prob));
            }
          }
          let Some((class_id, confidence)) = best else {
            continue;
          };
          if confidence < threshold {
            continue;
          }

          let raw = RawBox {
            tx: tensor.value(base, quant),
            ty: tensor.value(base + 1, quant),
            tw: tensor.value(base + 2, quant),
            th: tensor.value(base + 3, quant),
          };
          let cell = CellGeometry {
            col,
            row,
            cols: output.cols,
            rows: output.rows,
            anchor: *anchor,
            image_width: config.image_width,
            image_height: config.image_height,
          };
          let bbox = self.variant.decode_box(raw, &cell);
          let mut detection = Detection::new(bbox, confidence, class_id);

          if config.mask_size > 0 {
            let mask_start = base + BOX_CHANNELS + config.classes;
            let mask = (0..config.mask_size)
              .map(|i| tensor.value(mask_start + i, quant))
              .collect();
            detection = detection.with_mask(mask);
          }
          candidates.push(detection);
        }
      }
    }
  }
}

#[derive(Error, Debug, PartialEq)]
pub enum DecoderSpecError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("未知的 YOLO 变体: {0}")]
  UnknownVariant(String),
  #[error("无效的解码器参数 {key}: {value}")]
  InvalidParameter { key: String, value: String },
}

/// 由 URL 描述的解码器参数
///
/// `yolo://v5?classes=80&confidence=0.6&activation=sigmoid&mask=0&anchors=3`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderSpec {
  pub variant: YoloVariant,
  pub classes: usize,
  pub confidence_threshold: f32,
  pub anchors_per_cell: usize,
  pub mask_size: usize,
}

impl Default for DecoderSpec {
  fn default() -> Self {
    Self {
      variant: YoloVariant::V5(Activation::Sigmoid),
      classes: 80,
      confidence_threshold: 0.6,
      anchors_per_cell: 3,
      mask_size: 0,
    }
  }
}

impl DecoderSpec {
  /// 以网络输入尺寸生成解码器配置
  pub fn config(&self, image_width: u32, image_height: u32) -> DecoderConfig {
    DecoderConfig {
      image_width,
      image_height,
      classes: self.classes,
      confidence_threshold: self.confidence_threshold,
      anchors_per_cell: self.anchors_per_cell,
      mask_size: self.mask_size,
    }
  }

  pub fn build(&self) -> YoloDecoder {
    YoloDecoder::new(self.variant)
  }
}

impl FromUrlWithScheme for DecoderSpec {
  const SCHEME: &'static str = "yolo";
}

impl FromUrl for DecoderSpec {
  type Error = DecoderSpecError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DecoderSpecError::SchemeMismatch);
    }

    let invalid = |key: &str, value: &str| DecoderSpecError::InvalidParameter {
      key: key.to_string(),
      value: value.to_string(),
    };

    let mut spec = DecoderSpec::default();
    let mut activation = Activation::Sigmoid;
    for (k, v) in url.query_pairs() {
      let (key, value) = (k.as_ref(), v.as_ref());
      match key {
        "classes" => spec.classes = value.parse().map_err(|_| invalid(key, value))?,
        "confidence" => {
          spec.confidence_threshold = value.parse().map_err(|_| invalid(key, value))?
        }
        "anchors" => spec.anchors_per_cell = value.parse().map_err(|_| invalid(key, value))?,
        "mask" => spec.mask_size = value.parse().map_err(|_| invalid(key, value))?,
        "activation" => activation = value.parse().map_err(|_| invalid(key, value))?,
        _ => {}
      }
    }

    let name = url.host_str().unwrap_or("v5");
    spec.variant = YoloVariant::from_name(name, activation)
      .ok_or_else(|| DecoderSpecError::UnknownVariant(name.to_string()))?;
    Ok(spec)
  }
}
