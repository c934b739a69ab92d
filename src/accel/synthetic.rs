// 该文件是 Liushui （流水） 项目的一部分。
// src/accel/synthetic.rs - 合成推理加速器
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
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  thread::{self, JoinHandle},
  time::Duration,
};

use crossbeam_channel::Sender;
use tracing::{debug, error, info};

use super::{AcceleratorError, InferenceAccelerator, InferenceJob, OutputSpec};
use crate::buffer::QuantizationInfo;

/// 合成加速器的一个输出：每次推理都写入同样的张量
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticOutput {
  pub name: String,
  pub tensor: Vec<u8>,
  pub quant: QuantizationInfo,
}

/// 在独立线程上“推理”的加速器，用于无硬件环境下驱动整条流水线
pub struct SyntheticAccelerator {
  outputs: Arc<Vec<SyntheticOutput>>,
  latency: Duration,
  submissions: Arc<AtomicUsize>,
  worker: Option<(Sender<Vec<InferenceJob>>, JoinHandle<()>)>,
}

impl SyntheticAccelerator {
  pub fn new(outputs: Vec<SyntheticOutput>) -> Self {
    Self {
      outputs: Arc::new(outputs),
      latency: Duration::ZERO,
      submissions: Arc::new(AtomicUsize::new(0)),
      worker: None,
    }
  }

  /// 每批作业的模拟耗时
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  /// `submit` 调用次数计数器
  pub fn submissions(&self) -> Arc<AtomicUsize> {
    self.submissions.clone()
  }
}

fn write_outputs(outputs: &[SyntheticOutput], job: &InferenceJob) -> Result<(), AcceleratorError> {
  for (name, payload) in job.completion.outputs() {
    let Some(template) = outputs.iter().find(|output| &output.name == name) else {
      continue;
    };
    let mut data = payload.write();
    if data.len() < template.tensor.len() {
      let err = AcceleratorError::SizeMismatch {
        expected: template.tensor.len(),
        actual: data.len(),
      };
      error!("输出 {} 写入失败: {}", name, err);
      return Err(err);
    }
    data[..template.tensor.len()].copy_from_slice(&template.tensor);
  }
  Ok(())
}

fn run_job(outputs: &[SyntheticOutput], job: InferenceJob) {
  let result = write_outputs(outputs, &job);
  job.completion.complete(result);
}

impl InferenceAccelerator for SyntheticAccelerator {
  fn configure(&mut self, batch_size: usize) -> Result<Vec<OutputSpec>, AcceleratorError> {
    if batch_size == 0 {
      return Err(AcceleratorError::Inference("批大小为零".to_string()));
    }

    if self.worker.is_none() {
      let (tx, rx) = crossbeam_channel::unbounded::<Vec<InferenceJob>>();
      let outputs = self.outputs.clone();
      let latency = self.latency;
      let handle = thread::Builder::new()
        .name("synthetic-npu".to_string())
        .spawn(move || {
          for batch in rx.iter() {
            if !latency.is_zero() {
              thread::sleep(latency);
            }
            debug!("合成加速器处理 {} 个作业", batch.len());
            for job in batch {
              run_job(&outputs, job);
            }
          }
          debug!("合成加速器线程退出");
        })
        .map_err(|e| AcceleratorError::Inference(format!("无法启动加速器线程: {}", e)))?;
      self.worker = Some((tx, handle));
      info!("合成加速器已配置: 批大小 {}, {} 个输出", batch_size, self.outputs.len());
    }

    Ok(
      self
        .outputs
        .iter()
        .map(|output| OutputSpec {
          name: output.name.clone(),
          frame_size: output.tensor.len(),
          quant: output.quant.clone(),
        })
        .collect(),
    )
  }

  fn submit(&self, jobs: Vec<InferenceJob>) -> Result<(), AcceleratorError> {
    let (tx, _) = self.worker.as_ref().ok_or(AcceleratorError::NotConfigured)?;
    self.submissions.fetch_add(1, Ordering::SeqCst);
    tx.send(jobs).map_err(|_| AcceleratorError::Closed)
  }
}

impl Drop for SyntheticAccelerator {
  fn drop(&mut self) {
    if let Some((tx, handle)) = self.worker.take() {
      drop(tx);
      if handle.join().is_err() {
        error!("合成加速器线程异常退出");
      }
    }
  }
}
