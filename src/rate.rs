// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::{Condvar, Mutex, PoisonError};

use thiserror::Error;

use crate::frame::{RowDiagnostics, SliceType};
use crate::stats::FrameStats;
use crate::util::*;

/// Rate control verdict at a row's diagonal checkpoint.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RowCheckpoint {
  /// Keep the current base QP.
  Continue,
  /// Use this base QP for the rest of the row and the rows below.
  Revised(f64),
  /// The row and every row below it have to be coded again at this QP.
  Reencode(f64),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RateControlError {
  #[error("frame {0} finished out of encode order")]
  OutOfOrder(u64),
  #[error("rate control was aborted")]
  Aborted,
}

/// Initial CPB removal delays of a buffering period SEI, in 90 kHz ticks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferingPeriod {
  pub initial_cpb_removal_delay: u32,
  pub initial_cpb_removal_delay_offset: u32,
}

/// Per-frame record exchanged with the rate controller.
#[derive(Clone, Debug)]
pub struct RateControlEntry {
  pub encode_order: u64,
  pub poc: u64,
  pub slice_type: SliceType,
  pub is_keyframe: bool,
  /// Lowres cost of the whole frame.
  pub frame_satd: u64,
  /// QP picked by [`RateControl::start`].
  pub new_qp: i32,
  /// Frame average base QP; diagonal QPs start from it.
  pub avg_qp_rc: f64,
  /// Bits and lowres cost of the rows reported through
  /// [`RateControl::update_stats`].
  pub row_total_bits: u64,
  pub row_total_satd: u64,
  pub frame_bits: u64,
  /// VBV buffer level when the frame started, in bits.
  pub buffer_fill: f64,
}

impl RateControlEntry {
  pub fn new(
    encode_order: u64, poc: u64, slice_type: SliceType, is_keyframe: bool,
    frame_satd: u64,
  ) -> Self {
    RateControlEntry {
      encode_order,
      poc,
      slice_type,
      is_keyframe,
      frame_satd,
      new_qp: 0,
      avg_qp_rc: 0.,
      row_total_bits: 0,
      row_total_satd: 0,
      frame_bits: 0,
      buffer_fill: 0.,
    }
  }
}

/// The rate controller as seen by the frame encoders.
///
/// One instance is shared by every frame encoder of a session, hence the
/// `&self` receivers. `start` and `end` may block until the frames before
/// this one in encode order got that far.
pub trait RateControl: Send + Sync {
  fn start(&self, rce: &mut RateControlEntry) -> i32;

  /// Called once per row at the CTU where `row == col`, with the current
  /// diagnostics of every row of the frame.
  fn row_checkpoint(
    &self, rce: &mut RateControlEntry, row: usize, rows: &[RowDiagnostics],
    qp: f64,
  ) -> RowCheckpoint;

  /// Partial frame size, so the next `start` estimates from real data.
  fn update_stats(&self, _rce: &RateControlEntry) {}

  /// # Errors
  ///
  /// Fails when the frame cannot be accounted for in encode order; the
  /// session is not recoverable afterwards.
  fn end(
    &self, rce: &mut RateControlEntry, bits: u64, stats: &FrameStats,
  ) -> Result<(), RateControlError>;

  fn hrd_fullness(&self, _bp: &mut BufferingPeriod) {}

  /// Releases every caller blocked in `start` or `end`.
  fn abort(&self) {}
}

#[derive(Debug, Default)]
struct Order {
  started: u64,
  ended: u64,
  aborted: bool,
}

/// Serializes `start` and `end` calls by encode order.
#[derive(Debug, Default)]
struct OrderGate {
  order: Mutex<Order>,
  cv: Condvar,
}

impl OrderGate {
  fn wait_start(&self, n: u64) -> std::sync::MutexGuard<'_, Order> {
    let mut o = lock(&self.order);
    while !o.aborted && o.started < n {
      o = self.cv.wait(o).unwrap_or_else(PoisonError::into_inner);
    }
    o
  }

  fn wait_end(
    &self, n: u64,
  ) -> Result<std::sync::MutexGuard<'_, Order>, RateControlError> {
    let mut o = lock(&self.order);
    while !o.aborted && o.ended < n {
      o = self.cv.wait(o).unwrap_or_else(PoisonError::into_inner);
    }
    if o.aborted {
      return Err(RateControlError::Aborted);
    }
    if o.ended > n {
      return Err(RateControlError::OutOfOrder(n));
    }
    Ok(o)
  }

  fn finish_start(&self, mut o: std::sync::MutexGuard<'_, Order>, n: u64) {
    o.started = o.started.max(n + 1);
    self.cv.notify_all();
  }

  fn finish_end(&self, mut o: std::sync::MutexGuard<'_, Order>) {
    o.ended += 1;
    self.cv.notify_all();
  }

  fn abort(&self) {
    lock(&self.order).aborted = true;
    self.cv.notify_all();
  }
}

/// Fixed QP per slice type, frames accounted strictly in encode order.
#[derive(Debug, Default)]
pub struct ConstantQp {
  pub qp: i32,
  /// Added to the QP of P and B slices.
  pub inter_offset: i32,
  gate: OrderGate,
}

impl ConstantQp {
  pub fn new(qp: i32) -> Self {
    ConstantQp { qp, inter_offset: 0, gate: OrderGate::default() }
  }
}

impl RateControl for ConstantQp {
  fn start(&self, rce: &mut RateControlEntry) -> i32 {
    let o = self.gate.wait_start(rce.encode_order);
    let qp = match rce.slice_type {
      SliceType::I => self.qp,
      _ => self.qp + self.inter_offset,
    };
    rce.new_qp = clamp(qp, QP_MIN, QP_MAX);
    rce.avg_qp_rc = f64::from(rce.new_qp);
    self.gate.finish_start(o, rce.encode_order);
    rce.new_qp
  }

  fn row_checkpoint(
    &self, _rce: &mut RateControlEntry, _row: usize, _rows: &[RowDiagnostics],
    _qp: f64,
  ) -> RowCheckpoint {
    RowCheckpoint::Continue
  }

  fn end(
    &self, rce: &mut RateControlEntry, bits: u64, _stats: &FrameStats,
  ) -> Result<(), RateControlError> {
    let o = self.gate.wait_end(rce.encode_order)?;
    rce.frame_bits = bits;
    self.gate.finish_end(o);
    Ok(())
  }

  fn abort(&self) {
    self.gate.abort();
  }
}

/// Buffer settings of [`VbvRateControl`], in bits and frames per second.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VbvParams {
  pub buffer_size: f64,
  pub max_rate: f64,
  /// Average target; equal to `max_rate` for constrained VBR.
  pub bitrate: f64,
  pub fps: f64,
  pub init_fullness: f64,
  pub base_qp: i32,
}

#[derive(Debug)]
struct VbvState {
  buffer_fill: f64,
  /// Bits per unit of lowres cost at QP `model_qp`.
  bits_per_satd: Option<f64>,
  model_qp: f64,
}

/// Leaky bucket rate control.
///
/// Frame sizes are predicted from the lowres cost with a single
/// bits-per-cost coefficient learned from finished frames. At the diagonal
/// checkpoint the prediction is refreshed with the bits actually produced
/// by the rows coded so far, and a re-encode at a higher QP is requested
/// when the frame would drain the buffer below its safety margin.
#[derive(Debug)]
pub struct VbvRateControl {
  params: VbvParams,
  state: Mutex<VbvState>,
  gate: OrderGate,
}

const VBV_MIN_FILL: f64 = 0.1;
const MAX_QP_STEP: f64 = 6.;

impl VbvRateControl {
  pub fn new(params: VbvParams) -> Self {
    let base = f64::from(params.base_qp);
    VbvRateControl {
      state: Mutex::new(VbvState {
        buffer_fill: params.buffer_size * params.init_fullness,
        bits_per_satd: None,
        model_qp: base,
      }),
      params,
      gate: OrderGate::default(),
    }
  }

  fn frame_budget(&self) -> f64 {
    self.params.max_rate / self.params.fps
  }

  fn predict(coeff: f64, model_qp: f64, satd: f64, qp: f64) -> f64 {
    coeff * satd * qp2qscale(model_qp) / qp2qscale(qp)
  }

  pub fn buffer_fill(&self) -> f64 {
    lock(&self.state).buffer_fill
  }
}

impl RateControl for VbvRateControl {
  fn start(&self, rce: &mut RateControlEntry) -> i32 {
    let o = self.gate.wait_start(rce.encode_order);
    let st = lock(&self.state);
    let target = self.params.bitrate / self.params.fps;
    let room =
      st.buffer_fill - self.params.buffer_size * VBV_MIN_FILL + self.frame_budget();
    let budget = target.min(room.max(0.));
    let mut qp = self.params.base_qp;
    if let Some(coeff) = st.bits_per_satd {
      let satd = rce.frame_satd as f64;
      while qp < QP_MAX
        && Self::predict(coeff, st.model_qp, satd, f64::from(qp)) > budget
      {
        qp += 1;
      }
      while qp > QP_MIN
        && qp > self.params.base_qp - 3
        && Self::predict(coeff, st.model_qp, satd, f64::from(qp - 1))
          < budget * 0.5
      {
        qp -= 1;
      }
    }
    rce.new_qp = qp;
    rce.avg_qp_rc = f64::from(qp);
    rce.buffer_fill = st.buffer_fill;
    drop(st);
    self.gate.finish_start(o, rce.encode_order);
    qp
  }

  fn row_checkpoint(
    &self, rce: &mut RateControlEntry, row: usize, rows: &[RowDiagnostics],
    qp: f64,
  ) -> RowCheckpoint {
    let (bits, satd_done, planned) =
      rows.iter().fold((0u64, 0u64, 0u64), |(b, s, p), r| {
        (b + r.encoded_bits, s + r.diag_satd, p + r.planned_satd)
      });
    if satd_done == 0 || bits == 0 {
      return RowCheckpoint::Continue;
    }
    let coeff = bits as f64 / satd_done as f64;
    let remaining = planned.saturating_sub(satd_done) as f64;
    let predicted = bits as f64 + coeff * remaining;
    let room = rce.buffer_fill - self.params.buffer_size * VBV_MIN_FILL
      + self.frame_budget();

    if predicted > room && qp < f64::from(QP_MAX_MAX) {
      let step = (6. * (predicted / room.max(1.)).log2()).ceil();
      let new_qp =
        (qp + clamp(step, 1., MAX_QP_STEP)).min(f64::from(QP_MAX_MAX));
      log::trace!(
        "row {} predicts {:.0} bits with {:.0} available, qp {} -> {}",
        row,
        predicted,
        room,
        qp,
        new_qp
      );
      return RowCheckpoint::Reencode(new_qp);
    }
    let target = self.params.bitrate / self.params.fps;
    if predicted < target * 0.5 && qp > rce.avg_qp_rc - 3. {
      return RowCheckpoint::Revised(qp - 1.);
    }
    RowCheckpoint::Continue
  }

  fn update_stats(&self, rce: &RateControlEntry) {
    if rce.row_total_satd == 0 {
      return;
    }
    let mut st = lock(&self.state);
    if st.bits_per_satd.is_none() {
      st.bits_per_satd =
        Some(rce.row_total_bits as f64 / rce.row_total_satd as f64);
      st.model_qp = rce.avg_qp_rc;
    }
  }

  fn end(
    &self, rce: &mut RateControlEntry, bits: u64, _stats: &FrameStats,
  ) -> Result<(), RateControlError> {
    let o = self.gate.wait_end(rce.encode_order)?;
    let mut st = lock(&self.state);
    rce.frame_bits = bits;
    let fill = st.buffer_fill - bits as f64;
    if fill < 0. {
      log::warn!(
        "VBV underflow on frame {} ({:.0} bits)",
        rce.encode_order,
        -fill
      );
    }
    st.buffer_fill =
      (fill + self.frame_budget()).clamp(0., self.params.buffer_size);
    if rce.frame_satd > 0 {
      st.bits_per_satd = Some(bits as f64 / rce.frame_satd as f64);
      st.model_qp = rce.avg_qp_rc;
    }
    drop(st);
    self.gate.finish_end(o);
    Ok(())
  }

  fn hrd_fullness(&self, bp: &mut BufferingPeriod) {
    let st = lock(&self.state);
    let delay = 90_000. * st.buffer_fill / self.params.max_rate;
    let full = 90_000. * self.params.buffer_size / self.params.max_rate;
    bp.initial_cpb_removal_delay = delay as u32;
    bp.initial_cpb_removal_delay_offset = (full - delay).max(0.) as u32;
  }

  fn abort(&self) {
    self.gate.abort();
  }
}
