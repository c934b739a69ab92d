// 该文件是 Liushui （流水） 项目的一部分。
// src/bin/synthetic_stream.rs - 合成数据驱动的完整检测流水线
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

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use url::Url;

use liushui::{
  FromUrl,
  accel::{CpuCropResize, SyntheticAccelerator, SyntheticOutput},
  buffer::{BufferRole, ImageLayout, PixelFormat, QuantParams, QuantizationInfo},
  decoder::DecoderSpec,
  ingest::{FrameIngress, SyntheticSource},
  output::{DetectionRecordSink, RgbOverlayRenderer},
  pipeline::Pipeline,
  queue::QueueConfig,
  stages::{
    AggregatorStage, DetectorResize, DispatchConfig, DispatchStage, GeometryStage, JoinOutput,
    JoinStage, OverlayStage, SinkStage,
  },
  task::StreamTask,
};
use tracing::info;

const NETWORK_SIZE: u32 = 640;
/// 合成张量的量化参数：零点 128 对应 0
const ZERO_POINT: u8 = 128;

/// Liushui 合成流水线参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 帧源
  #[arg(long, value_name = "SOURCE", default_value = "synthetic://?res=3840x2160&res=1280x720&fps=30")]
  pub input: Url,
  /// 解码器
  #[arg(long, value_name = "DECODER", default_value = "yolo://v5?classes=80&confidence=0.6")]
  pub decoder: Url,
  /// 各阶段队列
  #[arg(long, value_name = "QUEUE", default_value = "queue://?size=5")]
  pub queue: Url,
  /// 检测结果输出
  #[arg(long, value_name = "OUTPUT", default_value = "record:///tmp/liushui")]
  pub output: Url,

  #[arg(long, value_name = "BATCH", default_value_t = 1)]
  pub batch: usize,

  /// 合成推理每批的耗时（毫秒）
  #[arg(long, value_name = "MILLIS", default_value_t = 10)]
  pub latency_ms: u64,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

/// 生成 YOLOv5m 三个输出的合成张量
///
/// 全部通道量化为极小的 logit，只在 20x20 特征图中央放置一个类别 1 的目标。
fn synthetic_outputs(spec: &DecoderSpec, join: &[JoinOutput]) -> Vec<SyntheticOutput> {
  let channels = 5 + spec.classes + spec.mask_size;
  let quant = QuantizationInfo::single(QuantParams::new(ZERO_POINT as f32, 0.1));

  join
    .iter()
    .enumerate()
    .map(|(index, output)| {
      let anchors = output.anchors.len() / 2;
      let mut tensor = vec![0u8; output.rows * output.cols * anchors * channels];
      if index == 0 {
        let (row, col) = (output.rows / 2, output.cols / 2);
        let base = (row * output.cols + col) * anchors * channels;
        tensor[base..base + 4].fill(ZERO_POINT);
        tensor[base + 4] = u8::MAX;
        tensor[base + 5] = u8::MAX;
      }
      SyntheticOutput {
        name: format!("yolov5m/{}", output.suffix),
        tensor,
        quant: quant.clone(),
      }
    })
    .collect()
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("解码器: {}", args.decoder);
  info!("队列: {}", args.queue);
  info!("输出路径: {}", args.output);

  let source = SyntheticSource::from_url(&args.input)?;
  let spec = DecoderSpec::from_url(&args.decoder)?;
  let queue = QueueConfig::from_url(&args.queue)?;
  let sink = DetectionRecordSink::from_url(&args.output)?;

  let join = JoinStage::yolov5m(spec);
  let output_count = join.outputs().len();
  let accelerator = SyntheticAccelerator::new(synthetic_outputs(&spec, join.outputs()))
    .with_latency(Duration::from_millis(args.latency_ms));

  let mut pipeline = Pipeline::new();
  let aggregator = pipeline.add_stage("aggregator", queue, AggregatorStage::new());
  let geometry = pipeline.add_stage(
    "geometry",
    queue,
    GeometryStage::new(
      "detector-input",
      CpuCropResize::new(),
      DetectorResize::new(NETWORK_SIZE, NETWORK_SIZE),
      ImageLayout::new(NETWORK_SIZE, NETWORK_SIZE, PixelFormat::Rgb888),
      8,
    )
    .with_source_role(BufferRole::LowRes),
  );
  let dispatch = pipeline.add_stage(
    "dispatch",
    queue,
    DispatchStage::new(
      accelerator,
      DispatchConfig {
        batch_size: args.batch,
        ..DispatchConfig::default()
      },
    ),
  );
  // 每帧三个输出，队列按输出数放大
  let join_queue = QueueConfig {
    size: queue.size * output_count,
    ..queue
  };
  let join = pipeline.add_stage("join", join_queue, join);
  let record = pipeline.add_stage("record", queue, SinkStage::new(sink));
  let overlay = pipeline.add_stage("overlay", queue, OverlayStage::new(RgbOverlayRenderer::new()));

  aggregator.add_subscriber(&geometry);
  geometry.add_subscriber(&dispatch);
  dispatch.add_subscriber(&join);
  // 先记录再绘制，绘制会移除检测框元数据
  join.add_subscriber(&record);
  record.add_subscriber(&overlay);

  let ingress = FrameIngress::standard(aggregator);
  let summary = StreamTask::default()
    .with_frame_number(args.frame_number)
    .run(source, &ingress, &mut pipeline)?;

  info!(
    "处理完成: {} 帧，接收 {}，拒绝 {}",
    summary.frames, summary.accepted, summary.rejected
  );
  Ok(())
}
