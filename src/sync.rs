// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use crate::util::lock;

/// Monotonic count of reconstructed CTU rows of a frame.
///
/// Only the frame encoder that owns the frame moves the counter forward;
/// encoders of dependent frames read it without locking and park on
/// [`wait_for_change`] until it moves.
///
/// [`wait_for_change`]: ReconRowCounter::wait_for_change
#[derive(Debug, Default)]
pub struct ReconRowCounter {
  value: AtomicUsize,
  mutex: Mutex<()>,
  changed: Condvar,
}

impl ReconRowCounter {
  pub fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub fn get(&self) -> usize {
    self.value.load(Ordering::Acquire)
  }

  /// Blocks until the counter no longer holds `prev` and returns the value
  /// observed at wake-up.
  pub fn wait_for_change(&self, prev: usize) -> usize {
    let mut guard = lock(&self.mutex);
    loop {
      let cur = self.get();
      if cur != prev {
        return cur;
      }
      guard =
        self.changed.wait(guard).unwrap_or_else(PoisonError::into_inner);
    }
  }

  /// Blocks until at least `needed` rows are reconstructed, or the whole
  /// frame (`total` rows) is.
  pub fn wait_for_rows(&self, needed: usize, total: usize) -> usize {
    let mut count = self.get();
    while count != total && count < needed {
      count = self.wait_for_change(count);
    }
    count
  }

  pub fn set(&self, value: usize) {
    let _guard = lock(&self.mutex);
    self.value.store(value, Ordering::Release);
    self.changed.notify_all();
  }

  /// Publishes one more reconstructed row, returning the new count.
  pub fn incr(&self) -> usize {
    let _guard = lock(&self.mutex);
    let value = self.value.fetch_add(1, Ordering::AcqRel) + 1;
    self.changed.notify_all();
    value
  }
}

/// One-shot signal, reset by creating a new one.
#[derive(Debug, Default)]
pub struct Event {
  fired: Mutex<bool>,
  cv: Condvar,
}

impl Event {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn trigger(&self) {
    *lock(&self.fired) = true;
    self.cv.notify_all();
  }

  pub fn wait(&self) {
    let mut fired = lock(&self.fired);
    while !*fired {
      fired = self.cv.wait(fired).unwrap_or_else(PoisonError::into_inner);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn wait_returns_immediately_on_stale_value() {
    let c = ReconRowCounter::new();
    c.set(3);
    assert_eq!(c.wait_for_change(1), 3);
  }

  #[test]
  fn waiter_sees_every_required_row() {
    let c = Arc::new(ReconRowCounter::new());
    let waiter = {
      let c = Arc::clone(&c);
      thread::spawn(move || c.wait_for_rows(5, 8))
    };
    for _ in 0..8 {
      c.incr();
    }
    assert!(waiter.join().unwrap() >= 5);
  }

  #[test]
  fn event_wakes_waiter() {
    let e = Arc::new(Event::new());
    let waiter = {
      let e = Arc::clone(&e);
      thread::spawn(move || e.wait())
    };
    e.trigger();
    waiter.join().unwrap();
    // Stays fired.
    e.wait();
  }

  #[test]
  fn full_frame_satisfies_any_requirement() {
    let c = ReconRowCounter::new();
    c.set(4);
    // The frame only has 4 rows, so a lag reaching past the end is satisfied.
    assert_eq!(c.wait_for_rows(9, 4), 4);
  }
}
