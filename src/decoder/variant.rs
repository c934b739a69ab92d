// 该文件是 Liushui （流水） 项目的一部分。
// src/decoder/variant.rs - YOLO 变体与检测框解码公式
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

use std::str::FromStr;

use crate::model::BoundingBox;

const YOLOV4_SCALE_XY: f32 = 1.05;

/// 输出通道上的激活
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
  /// 模型已输出激活后的值
  Identity,
  #[default]
  Sigmoid,
}

impl Activation {
  pub fn apply(&self, x: f32) -> f32 {
    match self {
      Activation::Identity => x,
      Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
    }
  }
}

impl FromStr for Activation {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "sigmoid" => Ok(Activation::Sigmoid),
      "identity" | "none" | "linear" => Ok(Activation::Identity),
      other => Err(format!("未知激活函数: {}", other)),
    }
  }
}

/// 支持的 YOLO 变体，各自对应一个纯函数式的检测框解码公式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YoloVariant {
  V3(Activation),
  /// 中心点带 1.05 的 scale_xy
  V4(Activation),
  /// 宽高为线性输出，使用指数解码，其余通道已激活
  V4Hailo,
  V5(Activation),
  V7(Activation),
  /// 宽高按特征图尺寸做指数解码，其余通道已激活
  X,
}

impl YoloVariant {
  /// 与名称对应的变体，如 `v5`、`yolox`
  pub fn from_name(name: &str, activation: Activation) -> Option<Self> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_prefix("yolo").unwrap_or(name.as_str());
    match name {
      "v3" => Some(YoloVariant::V3(activation)),
      "v4" => Some(YoloVariant::V4(activation)),
      "v4hailo" | "v4-hailo" => Some(YoloVariant::V4Hailo),
      "v5" => Some(YoloVariant::V5(activation)),
      "v7" => Some(YoloVariant::V7(activation)),
      "x" => Some(YoloVariant::X),
      _ => None,
    }
  }

  /// 置信度、类别概率与坐标通道使用的激活
  pub fn activation(&self) -> Activation {
    match self {
      YoloVariant::V3(a) | YoloVariant::V4(a) | YoloVariant::V5(a) | YoloVariant::V7(a) => *a,
      YoloVariant::V4Hailo | YoloVariant::X => Activation::Identity,
    }
  }

  /// 把四个反量化后的坐标通道解码为归一化的检测框
  pub fn decode_box(&self, raw: RawBox, cell: &CellGeometry) -> BoundingBox {
    let act = self.activation();
    let (col, row) = (cell.col as f32, cell.row as f32);
    let (cols, rows) = (cell.cols as f32, cell.rows as f32);
    let (anchor_w, anchor_h) = cell.anchor;
    let (image_w, image_h) = (cell.image_width as f32, cell.image_height as f32);

    let squared = |t: f32| (2.0 * act.apply(t)).powi(2);

    let (cx, cy, w, h) = match self {
      YoloVariant::V5(_) | YoloVariant::V7(_) => (
        (act.apply(raw.tx) * 2.0 - 0.5 + col) / cols,
        (act.apply(raw.ty) * 2.0 - 0.5 + row) / rows,
        squared(raw.tw) * anchor_w / image_w,
        squared(raw.th) * anchor_h / image_h,
      ),
      YoloVariant::V4(_) => (
        scale_xy_center(act.apply(raw.tx), col, cols),
        scale_xy_center(act.apply(raw.ty), row, rows),
        squared(raw.tw) * anchor_w / image_w,
        squared(raw.th) * anchor_h / image_h,
      ),
      YoloVariant::V3(_) => (
        (act.apply(raw.tx) + col) / cols,
        (act.apply(raw.ty) + row) / rows,
        squared(raw.tw) * anchor_w / image_w,
        squared(raw.th) * anchor_h / image_h,
      ),
      YoloVariant::X => (
        (raw.tx + col) / cols,
        (raw.ty + row) / rows,
        raw.tw.exp() * anchor_w / cols,
        raw.th.exp() * anchor_h / rows,
      ),
      YoloVariant::V4Hailo => (
        scale_xy_center(raw.tx, col, cols),
        scale_xy_center(raw.ty, row, rows),
        raw.tw.exp() * anchor_w / image_w,
        raw.th.exp() * anchor_h / image_h,
      ),
    };

    BoundingBox::from_center(cx, cy, w, h)
  }
}

fn scale_xy_center(t: f32, cell: f32, cells: f32) -> f32 {
  (t * YOLOV4_SCALE_XY - 0.5 * (YOLOV4_SCALE_XY - 1.0) + cell) / cells
}

/// 反量化后、未激活的坐标通道
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawBox {
  pub tx: f32,
  pub ty: f32,
  pub tw: f32,
  pub th: f32,
}

/// 单元格与锚框信息
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellGeometry {
  pub col: usize,
  pub row: usize,
  pub cols: usize,
  pub rows: usize,
  /// 锚框宽高（网络输入像素）
  pub anchor: (f32, f32),
  pub image_width: u32,
  pub image_height: u32,
}
