// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::reference::wait_for_references;
use super::{FrameState, NO_TRIGGER_ROW};
use crate::util::*;

impl<T: Pixel> FrameState<T> {
  /// Encodes and filters every CTU row of the frame, returning once the last
  /// filter row is done.
  ///
  /// With a pool and wavefront coding the rows run as jobs on the pool and
  /// this thread only feeds reference progress to the scheduler. Otherwise
  /// the rows are processed here, one encode step followed by one filter
  /// step `filter_row_delay` rows behind.
  #[profiling::function]
  pub(crate) fn compress_ctu_rows(self: &Arc<Self>) {
    self.all_rows_stop.store(false, Ordering::SeqCst);
    self.vbv_reset_trigger_row.store(NO_TRIGGER_ROW, Ordering::SeqCst);
    self.rows[0].flags().active = true;

    let p = self.params;
    if self.parallel {
      self.wave.clear_enabled_row_mask();
      for row in 0..p.num_rows {
        // Block until all references reconstructed the rows we need.
        wait_for_references(&self.slice, &self.mrefs, row, p.ref_lag_rows);
        self.wave.enable_row(row * 2);
        if row == 0 {
          self.wave.enqueue_row(0);
        }
        self.poke_idle_worker();
      }
      self.completion.wait();
    } else {
      for i in 0..p.num_rows + p.filter_row_delay {
        if i < p.num_rows {
          wait_for_references(&self.slice, &self.mrefs, i, p.ref_lag_rows);
          self.process_row(i * 2);
        }
        if i >= p.filter_row_delay {
          self.process_row((i - p.filter_row_delay) * 2 + 1);
        }
      }
    }
  }

  /// Hands a job pulling task to the pool.
  pub(crate) fn poke_idle_worker(self: &Arc<Self>) {
    if !self.parallel {
      return;
    }
    if let Some(pool) = &self.pool {
      let state = Arc::clone(self);
      pool.spawn(move || state.run_jobs());
    }
  }

  fn run_jobs(self: &Arc<Self>) {
    while let Some(id) = self.wave.find_job() {
      log::trace!("POC {} runs job {}", self.frame.poc, id);
      self.process_row(id);
    }
  }

  /// Runs job `id`: even ids encode row `id / 2`, odd ids filter it.
  pub(crate) fn process_row(self: &Arc<Self>, id: usize) {
    let row = id >> 1;
    if id & 1 == 0 {
      self.process_row_encoder(row);
      return;
    }

    self.filter.process_row(&*self.collab.loop_filter, &self.frame, row);
    if row + 1 != self.params.num_rows {
      self.wave.enqueue_row(id + 2);
      self.poke_idle_worker();
    } else {
      self.completion.trigger();
    }
  }
}
