// 该文件是 Liushui （流水） 项目的一部分。
// src/stages/overlay.rs - 检测框叠加阶段
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

use tracing::{debug, error, warn};

use crate::{
  buffer::{Buffer, BufferPtr, BufferRole, MetadataKind, Payload},
  geometry::{PixelRect, project_to_display},
  output::SinkError,
  stage::{Emitter, Stage, StageError},
};

/// 映射到显示分辨率后的一个检测框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayBox {
  pub rect: PixelRect,
  pub class_id: u32,
  pub confidence: f32,
}

/// 叠加绘制协作者，在载荷上原地绘制检测框
pub trait OverlayRenderer: Send + 'static {
  fn draw(&mut self, role: BufferRole, payload: &Payload, boxes: &[OverlayBox]) -> Result<(), SinkError>;
}

/// 把检测结果回投到每个显示分辨率并交给绘制协作者
///
/// 输出缓冲区与输入共享载荷，但不再带有检测框元数据。
pub struct OverlayStage<R> {
  renderer: R,
  roles: Vec<BufferRole>,
}

impl<R: OverlayRenderer> OverlayStage<R> {
  pub fn new(renderer: R) -> Self {
    Self {
      renderer,
      roles: vec![BufferRole::HighRes, BufferRole::LowRes],
    }
  }

  /// 需要绘制的显示角色，默认高、低分辨率两路
  pub fn with_roles(mut self, roles: &[BufferRole]) -> Self {
    self.roles = roles.to_vec();
    self
  }
}

impl<R: OverlayRenderer> Stage for OverlayStage<R> {
  fn process(&mut self, input: BufferPtr, emitter: &Emitter) -> Result<(), StageError> {
    let Some(bbox) = input.bbox() else {
      warn!("{}: 缓冲区缺少检测框元数据", emitter.stage_name());
      return Err(StageError::Topology("缺少检测框元数据".to_string()));
    };

    for role in self.roles.iter() {
      let Some(payload) = input.payload(*role) else {
        continue;
      };
      let boxes: Vec<OverlayBox> = bbox
        .detections
        .iter()
        .map(|detection| OverlayBox {
          rect: project_to_display(
            detection.bbox(),
            bbox.network_input_width,
            bbox.network_input_height,
            &bbox.letterbox,
            &bbox.source,
            payload.width(),
            payload.height(),
          ),
          class_id: detection.class_id(),
          confidence: detection.confidence(),
        })
        .collect();
      if let Err(e) = self.renderer.draw(*role, payload, &boxes) {
        error!("{}: 在 {} 上绘制失败: {}", emitter.stage_name(), role, e);
      }
    }
    debug!("{}: 绘制 {} 个检测框", emitter.stage_name(), bbox.detections.len());

    let output = Buffer::derive(&[input.as_ref()]);
    output.copy_metadata_from(&input);
    output.remove_metadata(MetadataKind::BBox);
    emitter.send_to_subscribers(output.into_ptr());
    Ok(())
  }
}
