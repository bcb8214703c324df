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
use std::time::Instant;

use super::FrameState;
use crate::analysis::{AnalysisInput, CtuDecision};
use crate::rate::RowCheckpoint;
use crate::stats::MAX_CU_DEPTH;
use crate::util::*;

/// Lowres costs under one CTU, for the VBV row accounting.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct CtuCost {
  pub satd: u64,
  pub intra: u64,
}

impl<T: Pixel> FrameState<T> {
  /// Rows below a VBV restart trigger stop where they are.
  #[inline]
  fn must_stop(&self, row: usize) -> bool {
    self.all_rows_stopped() && row > self.trigger_row()
  }

  /// Base QP of a CTU before adaptive offsets.
  ///
  /// With VBV, CTUs at or left of the diagonal inherit the base QP of the
  /// CTU above and to the right, so a revision made at the diagonal of a row
  /// propagates down the wavefront.
  fn base_qp(&self, row: usize, col: usize) -> f64 {
    if !self.params.vbv {
      return self.avg_qp_rc;
    }
    let diag_qp = {
      let mut diag = lock(&self.frame.row_diag);
      if row == 0 {
        diag[0].diag_qp = self.avg_qp_rc;
        diag[0].diag_qscale = qp2qscale(self.avg_qp_rc);
      }
      diag[row].diag_qp
    };
    if row >= col && row > 0 && self.trigger_row() != row {
      let above_right = (col + 1).min(self.params.num_cols - 1);
      lock(&self.rows[row - 1].work).base_qp[above_right]
    } else {
      diag_qp
    }
  }

  /// QP of a CTU: `base_qp` plus the average offset of the 16x16 lowres
  /// blocks under it. Blocks clipped away by the picture edge are left out
  /// of the average rather than weighted by area.
  pub(crate) fn calc_qp_for_ctu(
    &self, row: usize, col: usize, base_qp: f64,
  ) -> (i32, CtuCost) {
    let p = &self.params;
    let lowres = &self.frame.lowres;
    let mut cost = CtuCost::default();
    if lowres.is_empty() {
      return (clamp((base_qp + 0.5) as i32, QP_MIN, QP_MAX_MAX), cost);
    }

    let offsets = if self.slice.is_referenced && p.cu_tree {
      &lowres.qp_cutree_offset
    } else {
      &lowres.qp_aq_offset
    };
    let per_ctu = p.ctu_size / LOWRES_BLOCK_SIZE;
    let (bx0, by0) = (col * per_ctu, row * per_ctu);
    let bx1 = (bx0 + per_ctu).min(lowres.blocks_w);
    let by1 = (by0 + per_ctu).min(lowres.blocks_h);

    let mut qp_offset = 0.;
    let mut cnt = 0;
    for by in by0..by1 {
      for bx in bx0..bx1 {
        let idx = bx + by * lowres.blocks_w;
        if p.aq {
          qp_offset += offsets[idx];
        }
        if p.vbv {
          cost.satd += u64::from(lowres.lowres_cost_for_rc[idx] & LOWRES_COST_MASK);
          cost.intra += u64::from(lowres.intra_cost[idx]);
        }
        cnt += 1;
      }
    }
    if cnt > 0 {
      qp_offset /= f64::from(cnt);
    }
    let qp = base_qp + qp_offset;
    (clamp((qp + 0.5) as i32, QP_MIN, QP_MAX_MAX), cost)
  }

  /// Codes the CTUs of `row` from its current position until it finishes or
  /// has to wait for the row above.
  pub(crate) fn process_row_encoder(self: &Arc<Self>, row: usize) {
    let cur = &self.rows[row];
    {
      let mut flags = cur.flags();
      if !flags.active {
        // A VBV restart is in progress.
        return;
      }
      if flags.busy {
        log::warn!(
          "internal error - simultaneous access to row {} of POC {}",
          row,
          self.frame.poc
        );
        return;
      }
      if self.must_stop(row) {
        flags.active = false;
        return;
      }
      flags.busy = true;
    }

    let start = Instant::now();
    let p = self.params;
    let num_cols = p.num_cols;
    // Without wavefront coding every row continues the coder of row 0.
    let coder_row = if p.wavefront { cur } else { &self.rows[0] };

    while cur.completed() < num_cols {
      let col = cur.completed();
      let base_qp = self.base_qp(row, col);
      let (qp, cost) = if p.aq || p.vbv {
        let (qp, cost) = self.calc_qp_for_ctu(row, col, base_qp);
        (clamp(qp, QP_MIN, QP_MAX), cost)
      } else {
        (self.slice_qp, CtuCost::default())
      };

      let decision = {
        let mut coder = lock(&coder_row.coder);
        if p.wavefront {
          if col == 0 && row > 0 {
            let above = lock(&self.rows[row - 1].saved_ctx).clone();
            coder.load_contexts(&above);
          }
        } else if col == 0 {
          *lock(&cur.start) = Some(coder.checkpoint());
        }
        let input = AnalysisInput {
          frame: &self.frame,
          slice: &self.slice,
          refs: &self.mrefs,
          row,
          col,
          x: col * p.ctu_size,
          y: row * p.ctu_size,
          ctu_size: p.ctu_size,
          qp,
          base_qp,
          ctx: coder.context(),
          nr: self.nr.as_deref(),
        };
        let decision = self.collab.analyzer.compress_ctu(&input);
        coder.encode_ctu(&decision.bins);
        if p.wavefront && col == 1 {
          lock(&cur.saved_ctx).clone_from(coder.context());
        }
        decision
      };

      self.record_ctu(row, col, base_qp, decision);
      cur.advance();

      if p.vbv || p.aq {
        let mut diag = lock(&self.frame.row_diag);
        let d = &mut diag[row];
        if p.aq {
          d.qpa_aq += f64::from(qp);
        }
        if p.vbv {
          d.diag_satd += cost.satd;
          d.diag_intra_satd += cost.intra;
          d.encoded_ctus = col + 1;
          d.qpa_rc += base_qp;
        }
      }

      if p.vbv && row == col && row > 0 {
        self.diagonal_checkpoint(row, base_qp);
      }

      if p.sao && p.sao_non_deblocked {
        self.collab.loop_filter.analyze_ctu(&self.frame, row, col);
      }

      let completed = cur.completed();
      if row + 1 < p.num_rows && (completed >= 2 || completed == num_cols) {
        let below = &self.rows[row + 1];
        let mut flags = below.flags();
        if !flags.active
          && (below.completed() + 2 <= completed || completed == num_cols)
          && (!self.all_rows_stopped() || row + 1 < self.trigger_row())
        {
          flags.active = true;
          drop(flags);
          self.wave.enqueue_row((row + 1) * 2);
          self.poke_idle_worker();
        }
      }

      let flags = cur.flags();
      let completed = cur.completed();
      if self.must_stop(row)
        || (row > 0
          && completed + 1 < num_cols
          && self.rows[row - 1].completed() < completed + 2)
      {
        self.add_row_time(start);
        cur.release(flags, false);
        return;
      }
    }

    // Flush the substream of the row, or of the frame once the last row
    // is done without wavefront coding. SAO defers this to the slice pass.
    if !p.sao && (p.wavefront || row == p.num_rows - 1) {
      lock(&coder_row.coder).finish_slice();
    }

    if p.abr {
      self.report_progress(row);
    }

    // Trigger the loop filter rows.
    let delay = p.filter_row_delay;
    if row >= delay {
      self.wave.enable_row((row - delay) * 2 + 1);
      if row == delay {
        self.wave.enqueue_row(1);
      }
      self.poke_idle_worker();
    }
    if row == p.num_rows - 1 {
      for i in p.num_rows.saturating_sub(delay)..p.num_rows {
        self.wave.enable_row(i * 2 + 1);
      }
      if p.num_rows <= delay {
        self.wave.enqueue_row(1);
      }
      self.poke_idle_worker();
    }

    self.add_row_time(start);
    let flags = cur.flags();
    cur.release(flags, true);
  }

  /// Stores what the row below and the slice pass need from a CTU.
  fn record_ctu(
    &self, row: usize, col: usize, base_qp: f64, decision: CtuDecision,
  ) {
    let p = &self.params;
    let mut work = lock(&self.rows[row].work);
    work.base_qp[col] = base_qp;
    work.total_bits += decision.total_bits;
    work.stats.ctus += 1;
    if p.stat_write {
      let s = &mut work.stats;
      s.mv_bits += decision.mv_bits;
      s.coeff_bits += decision.coeff_bits;
      s.misc_bits += decision
        .total_bits
        .saturating_sub(decision.mv_bits + decision.coeff_bits);
      let cus_per_ctu = p.ctu_size / MIN_CU_SIZE;
      for depth in 0..MAX_CU_DEPTH {
        // Smallest CUs covered by one CU at this depth.
        let n = ((cus_per_ctu >> depth).max(1) as u64).pow(2);
        s.intra_cus += u64::from(decision.intra_cnt[depth]) * n;
        s.inter_cus += u64::from(decision.inter_cnt[depth]) * n;
        s.skip_cus += u64::from(decision.skip_cnt[depth]) * n;
      }
    }
    if p.vbv {
      lock(&self.frame.row_diag)[row].encoded_bits += decision.total_bits;
    }
    if p.sao {
      work.bins[col] = decision.bins;
    }
  }

  /// Asks rate control whether the row stays on budget, restarting it and
  /// the rows below at a higher QP when it does not.
  fn diagonal_checkpoint(&self, row: usize, base_qp: f64) {
    let verdict = {
      let mut rce = lock(&self.rce);
      let diag = lock(&self.frame.row_diag);
      self.collab.rate_control.row_checkpoint(&mut rce, row, &diag, base_qp)
    };
    let bound = |qp: f64| clamp(qp, f64::from(QP_MIN), f64::from(QP_MAX_MAX));
    let (qp, reencode) = match verdict {
      RowCheckpoint::Continue => (bound(base_qp), false),
      RowCheckpoint::Revised(qp) => (bound(qp), false),
      RowCheckpoint::Reencode(qp) if bound(qp) > base_qp => (bound(qp), true),
      RowCheckpoint::Reencode(qp) => {
        // A restart at the same QP would produce the same overshoot.
        log::warn!(
          "POC {} row {} - ignoring VBV restart to qp {:.2}, not above {:.2}",
          self.frame.poc,
          row,
          qp,
          base_qp
        );
        (bound(base_qp), false)
      }
    };
    {
      let mut diag = lock(&self.frame.row_diag);
      diag[row].diag_qp = qp;
      diag[row].diag_qscale = qp2qscale(qp);
    }

    if reencode {
      log::debug!(
        "POC {} row {} - encode restart required for VBV, to {:.2} from {:.2}",
        self.frame.poc,
        row,
        qp,
        base_qp
      );
      self.restart_rows(row);
    }
  }

  /// Reports the bits of the first rows to rate control, early in the
  /// stream after half the frame and later after the reference lag.
  fn report_progress(&self, row: usize) {
    let p = &self.params;
    let mut rce = lock(&self.rce);
    let row_count = if rce.encode_order <= 2 * p.fps {
      ((p.num_rows + 1) / 2).min(p.num_rows - 1)
    } else {
      p.ref_lag_rows.min(p.num_rows - 1)
    };
    if row != row_count {
      return;
    }
    rce.row_total_bits =
      self.rows[..row_count].iter().map(|r| lock(&r.work).total_bits).sum();
    rce.row_total_satd = (0..row_count)
      .map(|r| self.frame.lowres.row_cost(p.ctu_size, r))
      .sum();
    self.collab.rate_control.update_stats(&rce);
  }

  fn add_row_time(&self, start: Instant) {
    let nanos = start.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64;
    self.row_time.fetch_add(nanos, Ordering::Relaxed);
  }
}
