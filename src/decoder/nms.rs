// 该文件是 Liushui （流水） 项目的一部分。
// src/decoder/nms.rs - 贪心非极大值抑制
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

use crate::model::Detection;

/// 同类别检测框的交并比达到该值即视为重复
pub const IOU_THRESHOLD: f32 = 0.45;

/// 按类别的贪心 NMS
///
/// 候选按置信度稳定降序排列；对每个置信度仍高于阈值的 `i`，把之后同类别、
/// 置信度仍不低于阈值且交并比不小于 `iou_threshold` 的 `j` 置零。
/// 抑制只通过置零完成，最终保留置信度不低于阈值的候选，顺序为降序。
pub fn non_max_suppression(
  mut candidates: Vec<Detection>,
  threshold: f32,
  iou_threshold: f32,
) -> Vec<Detection> {
  candidates.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
  let mut scores: Vec<f32> = candidates.iter().map(Detection::confidence).collect();

  for i in 0..candidates.len() {
    if scores[i] <= threshold {
      continue;
    }
    for j in (i + 1)..candidates.len() {
      if candidates[i].class_id() == candidates[j].class_id()
        && scores[j] >= threshold
        && candidates[i].bbox().iou(candidates[j].bbox()) >= iou_threshold
      {
        scores[j] = 0.0;
      }
    }
  }

  candidates
    .into_iter()
    .zip(scores)
    .filter(|(_, score)| *score >= threshold)
    .map(|(detection, _)| detection)
    .collect()
}
