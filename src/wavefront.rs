// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

/// Job availability bitmaps for a set of rows.
///
/// A row is runnable when it is both *enabled* (its dependencies outside the
/// frame, such as reference reconstruction, are met) and *queued* (its
/// dependencies inside the frame are met and somebody asked for it to run).
/// Claiming a job atomically clears the queued bit, so each request is run
/// by exactly one worker.
#[derive(Debug)]
pub struct WaveFront {
  num_rows: usize,
  queued: Box<[AtomicU64]>,
  enabled: Box<[AtomicU64]>,
}

#[inline]
const fn split(row: usize) -> (usize, u64) {
  (row / WORD_BITS, 1u64 << (row % WORD_BITS))
}

impl WaveFront {
  pub fn new(num_rows: usize) -> Self {
    let words = (num_rows + WORD_BITS - 1) / WORD_BITS;
    let alloc = || (0..words).map(|_| AtomicU64::new(0)).collect();
    WaveFront { num_rows, queued: alloc(), enabled: alloc() }
  }

  pub const fn num_rows(&self) -> usize {
    self.num_rows
  }

  /// Forgets every enabled and queued row.
  pub fn clear_enabled_row_mask(&self) {
    for w in self.enabled.iter().chain(self.queued.iter()) {
      w.store(0, Ordering::SeqCst);
    }
  }

  pub fn enable_row(&self, row: usize) {
    debug_assert!(row < self.num_rows);
    let (w, bit) = split(row);
    self.enabled[w].fetch_or(bit, Ordering::SeqCst);
  }

  pub fn enqueue_row(&self, row: usize) {
    debug_assert!(row < self.num_rows);
    let (w, bit) = split(row);
    self.queued[w].fetch_or(bit, Ordering::SeqCst);
  }

  /// Withdraws a pending request for `row`.
  ///
  /// Returns `true` when the request was still pending, `false` when no
  /// request was queued or a worker already claimed it.
  pub fn dequeue_row(&self, row: usize) -> bool {
    let (w, bit) = split(row);
    self.queued[w].fetch_and(!bit, Ordering::SeqCst) & bit != 0
  }

  pub fn is_enabled(&self, row: usize) -> bool {
    let (w, bit) = split(row);
    self.enabled[w].load(Ordering::SeqCst) & bit != 0
  }

  pub fn is_queued(&self, row: usize) -> bool {
    let (w, bit) = split(row);
    self.queued[w].load(Ordering::SeqCst) & bit != 0
  }

  /// Claims the lowest runnable row, if any.
  pub fn find_job(&self) -> Option<usize> {
    for (w, (queued, enabled)) in
      self.queued.iter().zip(self.enabled.iter()).enumerate()
    {
      let mut ready =
        queued.load(Ordering::SeqCst) & enabled.load(Ordering::SeqCst);
      while ready != 0 {
        let id = ready.trailing_zeros() as usize;
        let bit = 1u64 << id;
        if queued.fetch_and(!bit, Ordering::SeqCst) & bit != 0 {
          return Some(w * WORD_BITS + id);
        }
        ready =
          queued.load(Ordering::SeqCst) & enabled.load(Ordering::SeqCst);
      }
    }
    None
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn job_needs_both_bits() {
    let wf = WaveFront::new(8);
    wf.enqueue_row(3);
    assert_eq!(wf.find_job(), None);
    wf.enable_row(3);
    assert_eq!(wf.find_job(), Some(3));
    // The request is consumed, the enable bit stays.
    assert_eq!(wf.find_job(), None);
    assert!(wf.is_enabled(3));
  }

  #[test]
  fn lowest_row_first() {
    let wf = WaveFront::new(200);
    for row in [150, 70, 2] {
      wf.enable_row(row);
      wf.enqueue_row(row);
    }
    assert_eq!(wf.find_job(), Some(2));
    assert_eq!(wf.find_job(), Some(70));
    assert_eq!(wf.find_job(), Some(150));
    assert_eq!(wf.find_job(), None);
  }

  #[test]
  fn dequeue_cancels_pending_request_once() {
    let wf = WaveFront::new(4);
    wf.enqueue_row(1);
    assert!(wf.dequeue_row(1));
    assert!(!wf.dequeue_row(1));
    wf.enable_row(1);
    assert_eq!(wf.find_job(), None);
  }

  #[test]
  fn claimed_job_cannot_be_dequeued() {
    let wf = WaveFront::new(4);
    wf.enable_row(0);
    wf.enqueue_row(0);
    assert_eq!(wf.find_job(), Some(0));
    assert!(!wf.dequeue_row(0));
  }

  #[test]
  fn clear_resets_everything() {
    let wf = WaveFront::new(4);
    wf.enable_row(2);
    wf.enqueue_row(2);
    wf.clear_enabled_row_mask();
    assert!(!wf.is_enabled(2));
    assert!(!wf.is_queued(2));
  }
}
