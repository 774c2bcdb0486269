// 该文件是 Maogan （锚杆检测） 项目的一部分。
// src/pipeline/handoff.rs - 单槽结果交接
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

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Slot<T> {
  value: Option<T>,
  closed: bool,
  published: u64,
  dropped: u64,
}

/// 单槽交接
///
/// 新值覆盖尚未取走的旧值，内存占用有界。关闭后丢弃槽中的值，
/// 之后的 `publish` 返回 `false`。
pub struct FrameHandoff<T> {
  slot: Mutex<Slot<T>>,
  ready: Condvar,
}

impl<T> Default for FrameHandoff<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> FrameHandoff<T> {
  pub fn new() -> Self {
    Self {
      slot: Mutex::new(Slot {
        value: None,
        closed: false,
        published: 0,
        dropped: 0,
      }),
      ready: Condvar::new(),
    }
  }

  /// 放入新值，已关闭时返回 `false`
  pub fn publish(&self, value: T) -> bool {
    let mut slot = self.slot.lock();
    if slot.closed {
      return false;
    }
    if slot.value.replace(value).is_some() {
      slot.dropped += 1;
    }
    slot.published += 1;
    drop(slot);
    self.ready.notify_all();
    true
  }

  pub fn try_take(&self) -> Option<T> {
    self.slot.lock().value.take()
  }

  /// 等待新值，超时或已关闭时返回 `None`
  pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    let mut slot = self.slot.lock();
    loop {
      if let Some(value) = slot.value.take() {
        return Some(value);
      }
      if slot.closed {
        return None;
      }
      if self.ready.wait_until(&mut slot, deadline).timed_out() {
        return slot.value.take();
      }
    }
  }

  pub fn close(&self) {
    let mut slot = self.slot.lock();
    slot.closed = true;
    slot.value = None;
    drop(slot);
    self.ready.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    self.slot.lock().closed
  }

  /// 累计放入的数量
  pub fn published(&self) -> u64 {
    self.slot.lock().published
  }

  /// 未被取走就被覆盖的数量
  pub fn dropped(&self) -> u64 {
    self.slot.lock().dropped
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn newest_value_replaces_pending_one() {
    let handoff = FrameHandoff::new();
    assert!(handoff.publish(1));
    assert!(handoff.publish(2));
    assert!(handoff.publish(3));
    assert_eq!(handoff.try_take(), Some(3));
    assert_eq!(handoff.try_take(), None);
    assert_eq!(handoff.published(), 3);
    assert_eq!(handoff.dropped(), 2);
  }

  #[test]
  fn closed_handoff_rejects_and_discards() {
    let handoff = FrameHandoff::new();
    handoff.publish("pending");
    handoff.close();
    assert!(handoff.is_closed());
    assert_eq!(handoff.try_take(), None);
    assert!(!handoff.publish("late"));
    assert_eq!(handoff.take_timeout(Duration::from_millis(10)), None);
  }

  #[test]
  fn take_timeout_wakes_on_publish() {
    let handoff = Arc::new(FrameHandoff::new());
    let producer = {
      let handoff = handoff.clone();
      std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handoff.publish(42u32);
      })
    };
    assert_eq!(handoff.take_timeout(Duration::from_secs(5)), Some(42));
    producer.join().unwrap();
  }

  #[test]
  fn take_timeout_expires() {
    let handoff: FrameHandoff<u8> = FrameHandoff::new();
    let start = Instant::now();
    assert_eq!(handoff.take_timeout(Duration::from_millis(30)), None);
    assert!(start.elapsed() >= Duration::from_millis(30));
  }
}
