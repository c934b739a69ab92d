// 该文件是 Liushui （流水） 项目的一部分。
// src/queue.rs - 有界队列
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
  collections::VecDeque,
  sync::{Condvar, Mutex, MutexGuard},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::error;

use crate::{FromUrl, FromUrlWithScheme};

/// 队列满时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
  /// 丢弃最旧的元素，`push` 从不阻塞
  Leaky,
  /// 最多等待 `timeout`，超时后丢弃新元素
  Blocking { timeout: Duration },
}

/// `push` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
  Queued,
  /// 丢弃了队首的旧元素
  DroppedOldest,
  /// 等待超时，新元素被丢弃
  DroppedNewest,
  /// 队列已关闭，新元素被丢弃
  Closed,
}

impl PushOutcome {
  pub fn is_queued(&self) -> bool {
    matches!(self, PushOutcome::Queued | PushOutcome::DroppedOldest)
  }
}

struct State<T> {
  items: VecDeque<T>,
  closed: bool,
  finishing: bool,
}

/// 多生产者、单消费者的有界队列
///
/// 一把锁加两个条件变量（非空、非满）。关闭后 `pop` 返回 `None`，
/// 残留元素随队列一起释放；`finish` 则拒绝新元素，但 `pop` 仍会取完残留元素。
pub struct BoundedQueue<T> {
  capacity: usize,
  policy: OverflowPolicy,
  state: Mutex<State<T>>,
  not_empty: Condvar,
  not_full: Condvar,
}

impl<T> BoundedQueue<T> {
  pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
    let capacity = capacity.max(1);
    Self {
      capacity,
      policy,
      state: Mutex::new(State {
        items: VecDeque::with_capacity(capacity),
        closed: false,
        finishing: false,
      }),
      not_empty: Condvar::new(),
      not_full: Condvar::new(),
    }
  }

  pub fn from_config(config: &QueueConfig) -> Self {
    Self::new(config.size, config.policy)
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn policy(&self) -> OverflowPolicy {
    self.policy
  }

  pub fn push(&self, item: T) -> PushOutcome {
    let mut state = self.lock();
    if state.closed || state.finishing {
      return PushOutcome::Closed;
    }

    let mut outcome = PushOutcome::Queued;
    if state.items.len() >= self.capacity {
      match self.policy {
        OverflowPolicy::Leaky => {
          state.items.pop_front();
          outcome = PushOutcome::DroppedOldest;
        }
        OverflowPolicy::Blocking { timeout } => {
          let deadline = Instant::now() + timeout;
          while state.items.len() >= self.capacity && !state.closed && !state.finishing {
            let now = Instant::now();
            if now >= deadline {
              return PushOutcome::DroppedNewest;
            }
            state = match self.not_full.wait_timeout(state, deadline - now) {
              Ok((guard, _)) => guard,
              Err(poisoned) => {
                error!("队列锁中毒，继续使用内部数据");
                poisoned.into_inner().0
              }
            };
          }
          if state.closed || state.finishing {
            return PushOutcome::Closed;
          }
        }
      }
    }

    state.items.push_back(item);
    drop(state);
    self.not_empty.notify_one();
    outcome
  }

  /// 阻塞直到取得元素；队列关闭，或收尾且已取空后返回 `None`
  pub fn pop(&self) -> Option<T> {
    let mut state = self.lock();
    loop {
      if state.closed {
        return None;
      }
      if let Some(item) = state.items.pop_front() {
        drop(state);
        self.not_full.notify_one();
        return Some(item);
      }
      if state.finishing {
        return None;
      }
      state = match self.not_empty.wait(state) {
        Ok(guard) => guard,
        Err(poisoned) => {
          error!("队列锁中毒，继续使用内部数据");
          poisoned.into_inner()
        }
      };
    }
  }

  pub fn try_pop(&self) -> Option<T> {
    let mut state = self.lock();
    if state.closed {
      return None;
    }
    let item = state.items.pop_front();
    if item.is_some() {
      drop(state);
      self.not_full.notify_one();
    }
    item
  }

  /// 关闭队列并唤醒所有等待者
  pub fn close(&self) {
    let mut state = self.lock();
    state.closed = true;
    state.items.clear();
    drop(state);
    self.not_empty.notify_all();
    self.not_full.notify_all();
  }

  /// 进入收尾：拒绝新元素，已入队的元素仍可取出
  pub fn finish(&self) {
    let mut state = self.lock();
    state.finishing = true;
    drop(state);
    self.not_empty.notify_all();
    self.not_full.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    self.lock().closed
  }

  pub fn len(&self) -> usize {
    self.lock().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> MutexGuard<'_, State<T>> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        error!("队列锁中毒，继续使用内部数据");
        poisoned.into_inner()
      }
    }
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueConfigError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("无效的队列参数 {key}: {value}")]
  InvalidParameter { key: String, value: String },
}

/// 队列配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
  pub size: usize,
  pub policy: OverflowPolicy,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      size: 5,
      policy: OverflowPolicy::Leaky,
    }
  }
}

impl QueueConfig {
  pub fn leaky(size: usize) -> Self {
    Self {
      size,
      policy: OverflowPolicy::Leaky,
    }
  }

  pub fn blocking(size: usize, timeout: Duration) -> Self {
    Self {
      size,
      policy: OverflowPolicy::Blocking { timeout },
    }
  }
}

impl FromUrlWithScheme for QueueConfig {
  const SCHEME: &'static str = "queue";
}

impl FromUrl for QueueConfig {
  type Error = QueueConfigError;

  /// `queue://?size=5&leaky=false&timeout_ms=1000`
  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(QueueConfigError::SchemeMismatch);
    }

    let invalid = |key: &str, value: &str| QueueConfigError::InvalidParameter {
      key: key.to_string(),
      value: value.to_string(),
    };

    let mut size = 5usize;
    let mut leaky = true;
    let mut timeout_ms = 1000u64;
    for (k, v) in url.query_pairs() {
      let (key, value) = (k.as_ref(), v.as_ref());
      match key {
        "size" => size = value.parse().map_err(|_| invalid(key, value))?,
        "leaky" => leaky = value.parse().map_err(|_| invalid(key, value))?,
        "timeout_ms" => timeout_ms = value.parse().map_err(|_| invalid(key, value))?,
        _ => {}
      }
    }
    if size == 0 {
      return Err(invalid("size", "0"));
    }

    let policy = if leaky {
      OverflowPolicy::Leaky
    } else {
      OverflowPolicy::Blocking {
        timeout: Duration::from_millis(timeout_ms),
      }
    };
    Ok(QueueConfig { size, policy })
  }
}
