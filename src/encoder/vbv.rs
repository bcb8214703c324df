// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::atomic::Ordering;
use std::thread;

use super::FrameState;
use crate::util::*;

impl<T: Pixel> FrameState<T> {
  /// Rolls rows `trigger..` back to their first CTU.
  ///
  /// Called by the worker of row `trigger` from its diagonal checkpoint.
  /// Every row below it is taken off the scheduler, or waited for if a
  /// worker owns it, before its progress is cleared. Rows above `trigger`
  /// are final and never touched.
  pub(crate) fn restart_rows(&self, trigger: usize) {
    let p = &self.params;
    // Keeps `find_job` from handing out rows below the trigger.
    self.vbv_reset_trigger_row.store(trigger, Ordering::SeqCst);
    self.all_rows_stop.store(true, Ordering::SeqCst);

    for r in (trigger..p.num_rows).rev() {
      let row = &self.rows[r];
      if r != trigger {
        loop {
          let mut flags = row.flags();
          if !flags.active || flags.busy {
            break;
          }
          if self.wave.dequeue_row(r * 2) {
            flags.active = false;
            break;
          }
          // A worker claimed the job but did not take the row yet; it
          // will see the stop flag once it does.
          drop(flags);
          thread::yield_now();
        }
        // The owner finishes its current CTU, sees the stop flag and
        // leaves the row inactive.
        row.wait_vacated().active = false;
      }

      row.reset();
      lock(&self.frame.row_diag)[r].reset_progress();
    }

    if !p.wavefront {
      let start = lock(&self.rows[trigger].start).clone();
      if let Some(cp) = start {
        lock(&self.rows[0].coder).rewind(&cp);
      }
    }

    self.vbv_restarts.fetch_add(1, Ordering::SeqCst);
    self.all_rows_stop.store(false, Ordering::SeqCst);
  }
}
