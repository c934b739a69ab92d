// 该文件是 Liushui （流水） 项目的一部分。
// src/stages/crop_resize.rs - 裁剪/缩放阶段
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

use std::time::Instant;

use tracing::{debug, error, warn};

use crate::{
  accel::{CropResizeAccelerator, Interpolation},
  buffer::{
    Buffer, BufferPool, BufferPtr, BufferRole, CroppedMetadata, HeapBufferPool, ImageLayout,
    Payload,
  },
  geometry::{
    CropRect, Letterbox, LetterboxAlignment, LetterboxParams, compute_letterbox, project_to_display,
    round_down_to_even,
  },
  stage::{Emitter, Stage, StageError},
};

/// 一次裁剪/缩放请求
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropTarget {
  /// 源图像上的裁剪区域，缺省为整帧（边界向下取偶）
  pub crop: Option<CropRect>,
  pub destination_width: u32,
  pub destination_height: u32,
  /// 给定时执行信箱缩放
  pub letterbox: Option<LetterboxParams>,
}

/// 决定每个输入缓冲区要产出哪些裁剪
///
/// 返回空列表时该缓冲区不产生任何输出。
pub trait CropPlanner: Send + 'static {
  fn plan(&self, input: &Buffer, source: &Payload) -> Vec<CropTarget>;
}

/// 把整帧信箱缩放到检测网络的输入尺寸
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorResize {
  pub width: u32,
  pub height: u32,
  pub letterbox: LetterboxParams,
}

impl DetectorResize {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      letterbox: LetterboxParams {
        alignment: LetterboxAlignment::UpLeft,
        ..LetterboxParams::default()
      },
    }
  }

  pub fn with_letterbox(mut self, letterbox: LetterboxParams) -> Self {
    self.letterbox = letterbox;
    self
  }
}

impl CropPlanner for DetectorResize {
  fn plan(&self, _input: &Buffer, _source: &Payload) -> Vec<CropTarget> {
    vec![CropTarget {
      crop: None,
      destination_width: self.width,
      destination_height: self.height,
      letterbox: Some(self.letterbox),
    }]
  }
}

/// 按检测结果逐个裁剪目标
///
/// 检测框从网络输入空间回投到源图像像素，超过最大输出尺寸的目标被跳过。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionCrops {
  pub max_width: u32,
  pub max_height: u32,
}

impl DetectionCrops {
  pub fn new(max_width: u32, max_height: u32) -> Self {
    Self {
      max_width,
      max_height,
    }
  }
}

impl CropPlanner for DetectionCrops {
  fn plan(&self, input: &Buffer, source: &Payload) -> Vec<CropTarget> {
    let Some(bbox) = input.bbox() else {
      error!("缓冲区缺少检测框元数据");
      return Vec::new();
    };

    let (frame_w, frame_h) = (source.width() as i64, source.height() as i64);
    let mut targets = Vec::with_capacity(bbox.detections.len());
    for detection in bbox.detections.iter() {
      let rect = project_to_display(
        detection.bbox(),
        bbox.network_input_width,
        bbox.network_input_height,
        &bbox.letterbox,
        &bbox.source,
        source.width(),
        source.height(),
      );
      let x0 = (rect.x as i64).clamp(0, frame_w) as u32;
      let y0 = (rect.y as i64).clamp(0, frame_h) as u32;
      let x1 = (rect.x as i64 + rect.width as i64).clamp(0, frame_w) as u32;
      let y1 = (rect.y as i64 + rect.height as i64).clamp(0, frame_h) as u32;
      let crop = CropRect::new(
        round_down_to_even(x0),
        round_down_to_even(y0),
        round_down_to_even(x1),
        round_down_to_even(y1),
      );

      if crop.width() > self.max_width || crop.height() > self.max_height {
        error!(
          "检测框 {}x{} 超过最大输出 {}x{}，跳过",
          crop.width(),
          crop.height(),
          self.max_width,
          self.max_height
        );
        continue;
      }
      if crop.is_empty() {
        debug!("检测框 {:?} 裁剪后为空，跳过", rect);
        continue;
      }

      targets.push(CropTarget {
        crop: Some(crop),
        destination_width: crop.width(),
        destination_height: crop.height(),
        letterbox: None,
      });
    }
    targets
  }
}

/// 裁剪/缩放阶段
///
/// 对每个裁剪请求从池中取一块输出内存，交给加速器完成像素处理，
/// 再把输入的全部载荷连同新的 [`BufferRole::Cropped`] 载荷发往下游，
/// 并附带 [`CroppedMetadata`]。池耗尽或加速器失败只跳过对应请求。
pub struct GeometryStage<A, P> {
  accelerator: A,
  planner: P,
  pool: HeapBufferPool,
  source_role: BufferRole,
  interpolation: Interpolation,
}

impl<A, P> GeometryStage<A, P>
where
  A: CropResizeAccelerator + 'static,
  P: CropPlanner,
{
  /// `max_output` 决定输出池中每块内存的大小与像素格式
  pub fn new(name: &str, accelerator: A, planner: P, max_output: ImageLayout, pool_size: usize) -> Self {
    Self {
      accelerator,
      planner,
      pool: HeapBufferPool::new(name, max_output, pool_size),
      source_role: BufferRole::HighRes,
      interpolation: Interpolation::Bilinear,
    }
  }

  /// 从哪个载荷角色读取源图像，默认高分辨率
  pub fn with_source_role(mut self, role: BufferRole) -> Self {
    self.source_role = role;
    self
  }

  pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
    self.interpolation = interpolation;
    self
  }

  fn run_target(&self, input: &Buffer, source: &Payload, target: &CropTarget) -> Option<BufferPtr> {
    let crop = target
      .crop
      .unwrap_or_else(|| CropRect::full_frame(source.width(), source.height()));
    let layout = ImageLayout::new(
      target.destination_width,
      target.destination_height,
      self.pool.layout().format,
    );

    let output = match self.pool.acquire_with_layout(layout) {
      Ok(payload) => payload,
      Err(e) => {
        error!("获取输出缓冲失败: {}", e);
        return None;
      }
    };

    let letterbox = match target.letterbox {
      Some(params) => Some((
        compute_letterbox(&crop, layout.width, layout.height, params.alignment),
        params.fill,
      )),
      None => None,
    };

    if let Err(e) = self.accelerator.transform(
      source,
      &output,
      &crop,
      self.interpolation,
      letterbox.as_ref().map(|(placement, fill)| (placement, *fill)),
    ) {
      error!("裁剪缩放失败 {:?}: {}", crop, e);
      return None;
    }

    let mut buffer = Buffer::derive(&[input]);
    buffer.add_payload(BufferRole::Cropped, output);
    buffer.attach(CroppedMetadata {
      destination_width: layout.width,
      destination_height: layout.height,
      crop,
      source_width: source.width(),
      source_height: source.height(),
      letterbox: letterbox.map(|(placement, _)| placement).unwrap_or_else(Letterbox::none),
    });
    Some(buffer.into_ptr())
  }
}

impl<A, P> Stage for GeometryStage<A, P>
where
  A: CropResizeAccelerator + 'static,
  P: CropPlanner,
{
  fn init(&mut self) -> Result<(), StageError> {
    self.pool.init()?;
    Ok(())
  }

  fn process(&mut self, input: BufferPtr, emitter: &Emitter) -> Result<(), StageError> {
    let begin = Instant::now();
    let Some(source) = input.payload(self.source_role) else {
      warn!("{}: 缓冲区缺少 {} 载荷", emitter.stage_name(), self.source_role);
      return Err(StageError::Topology(format!("缺少 {} 载荷", self.source_role)));
    };

    let targets = self.planner.plan(&input, source);
    for target in targets.iter() {
      if let Some(output) = self.run_target(&input, source, target) {
        emitter.send_to_subscribers(output);
      }
    }

    debug!(
      "{}: {} 个裁剪耗时 {:?}",
      emitter.stage_name(),
      targets.len(),
      begin.elapsed()
    );
    Ok(())
  }
}
