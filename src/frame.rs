// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use num_derive::FromPrimitive;

use crate::activity::Lowres;
use crate::sync::ReconRowCounter;
use crate::util::*;

/// Slice coding type, numbered as in the slice header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum SliceType {
  B = 0,
  P = 1,
  I = 2,
}

impl SliceType {
  /// Number of reference picture lists used for prediction.
  pub const fn num_pred_dirs(self) -> usize {
    match self {
      SliceType::I => 0,
      SliceType::P => 1,
      SliceType::B => 2,
    }
  }

  pub const fn is_intra(self) -> bool {
    matches!(self, SliceType::I)
  }
}

impl fmt::Display for SliceType {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let s = match self {
      SliceType::I => "I",
      SliceType::P => "P",
      SliceType::B => "B",
    };
    f.write_str(s)
  }
}

/// Explicit luma weighted prediction parameters for one reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WeightParam {
  pub log2_denom: u32,
  pub weight: i32,
  pub offset: i32,
}

impl WeightParam {
  pub const fn identity(log2_denom: u32) -> Self {
    WeightParam { log2_denom, weight: 1 << log2_denom, offset: 0 }
  }

  pub const fn is_identity(&self) -> bool {
    self.weight == 1 << self.log2_denom && self.offset == 0
  }

  #[inline]
  pub fn apply(&self, px: i32, max: i32) -> i32 {
    let round = if self.log2_denom > 0 { 1 << (self.log2_denom - 1) } else { 0 };
    clamp(((px * self.weight + round) >> self.log2_denom) + self.offset, 0, max)
  }
}

/// CTU grid of a picture.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
  pub width: usize,
  pub height: usize,
  pub ctu_size: usize,
  pub num_cols: usize,
  pub num_rows: usize,
}

impl FrameGeometry {
  pub const fn new(width: usize, height: usize, ctu_size: usize) -> Self {
    FrameGeometry {
      width,
      height,
      ctu_size,
      num_cols: ctu_count(width, ctu_size),
      num_rows: ctu_count(height, ctu_size),
    }
  }

  pub const fn num_ctus(&self) -> usize {
    self.num_cols * self.num_rows
  }

  /// Luma samples covered by `row`, accounting for the picture bottom.
  pub fn row_height(&self, row: usize) -> usize {
    (self.height - row * self.ctu_size).min(self.ctu_size)
  }

  pub fn col_width(&self, col: usize) -> usize {
    (self.width - col * self.ctu_size).min(self.ctu_size)
  }
}

/// Rate control progress of one CTU row.
///
/// Reset for the affected rows when a VBV re-encode rolls them back.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RowDiagnostics {
  /// Base QP decided at the row's diagonal checkpoint.
  pub diag_qp: f64,
  pub diag_qscale: f64,
  /// Accumulated lowres cost of the CTUs coded so far.
  pub diag_satd: u64,
  pub diag_intra_satd: u64,
  /// Lowres cost of the whole row, the denominator for bit predictions.
  pub planned_satd: u64,
  pub encoded_bits: u64,
  pub encoded_ctus: usize,
  /// Sum of the base QP of every coded CTU.
  pub qpa_rc: f64,
  /// Sum of the final (adaptive) QP of every coded CTU.
  pub qpa_aq: f64,
}

impl RowDiagnostics {
  /// Clears the coding progress, keeping the diagonal QP and the plan.
  pub fn reset_progress(&mut self) {
    *self = RowDiagnostics {
      diag_qp: self.diag_qp,
      diag_qscale: self.diag_qscale,
      planned_satd: self.planned_satd,
      ..Default::default()
    };
  }
}

/// A picture handed to a frame encoder.
pub struct Frame<T: Pixel> {
  pub poc: u64,
  pub geom: FrameGeometry,
  pub source: Plane<T>,
  /// Filtered reconstruction, published row by row.
  pub recon: Mutex<Plane<T>>,
  pub lowres: Lowres,
  /// Rows of `recon` that are final.
  pub recon_row_count: ReconRowCounter,
  /// Frame encoders currently predicting from this frame.
  pub count_ref_encoders: AtomicUsize,
  pub(crate) row_diag: Mutex<Vec<RowDiagnostics>>,
}

impl<T: Pixel> fmt::Debug for Frame<T> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Frame")
      .field("poc", &self.poc)
      .field("geom", &self.geom)
      .field("recon_row_count", &self.recon_row_count.get())
      .field("count_ref_encoders", &self.count_ref_encoders())
      .finish()
  }
}

impl<T: Pixel> Frame<T> {
  pub fn new(
    poc: u64, source: Plane<T>, ctu_size: usize, lowres: Lowres,
  ) -> Self {
    let geom = FrameGeometry::new(source.cfg.width, source.cfg.height, ctu_size);
    let recon = Plane::new(
      source.cfg.width,
      source.cfg.height,
      source.cfg.xdec,
      source.cfg.ydec,
      source.cfg.xpad,
      source.cfg.ypad,
    );
    Frame {
      poc,
      geom,
      source,
      recon: Mutex::new(recon),
      lowres,
      recon_row_count: ReconRowCounter::new(),
      count_ref_encoders: AtomicUsize::new(0),
      row_diag: Mutex::new(vec![RowDiagnostics::default(); geom.num_rows]),
    }
  }

  pub fn count_ref_encoders(&self) -> usize {
    self.count_ref_encoders.load(Ordering::Acquire)
  }

  /// Copy of the per-row rate control diagnostics.
  pub fn row_diagnostics(&self) -> Vec<RowDiagnostics> {
    lock(&self.row_diag).clone()
  }

  pub fn is_reconstructed(&self) -> bool {
    self.recon_row_count.get() == self.geom.num_rows
  }

  /// Publishes every row as final without reconstructing them, releasing
  /// the encoders of dependent frames when this frame failed.
  pub(crate) fn abandon(&self) {
    if !self.is_reconstructed() {
      self.recon_row_count.set(self.geom.num_rows);
    }
  }
}

/// Slice level coding parameters of one frame.
#[derive(Debug)]
pub struct Slice<T: Pixel> {
  pub slice_type: SliceType,
  pub is_keyframe: bool,
  pub is_referenced: bool,
  pub pps_id: u32,
  /// Reference pictures per prediction direction.
  pub ref_pic_list: [Vec<Arc<Frame<T>>>; 2],
  /// Filled in by weighted prediction analysis.
  pub weights: [Vec<Option<WeightParam>>; 2],
}

impl<T: Pixel> Slice<T> {
  pub fn new(slice_type: SliceType, is_keyframe: bool) -> Self {
    Slice {
      slice_type,
      is_keyframe,
      is_referenced: true,
      pps_id: 0,
      ref_pic_list: [Vec::new(), Vec::new()],
      weights: [Vec::new(), Vec::new()],
    }
  }

  pub fn intra() -> Self {
    Self::new(SliceType::I, true)
  }

  /// Appends `frame` to reference list `list`, taking a reference count on
  /// it that the frame encoder releases once compression ends.
  pub fn add_reference(&mut self, list: usize, frame: Arc<Frame<T>>) {
    frame.count_ref_encoders.fetch_add(1, Ordering::AcqRel);
    self.ref_pic_list[list].push(frame);
    self.weights[list].push(None);
  }

  pub fn with_reference(mut self, list: usize, frame: Arc<Frame<T>>) -> Self {
    self.add_reference(list, frame);
    self
  }

  pub fn not_referenced(mut self) -> Self {
    self.is_referenced = false;
    self
  }

  pub fn num_ref_idx(&self, list: usize) -> usize {
    self.ref_pic_list[list].len()
  }

  /// Iterates `(list, index, frame)` over the lists this slice predicts from.
  pub fn references(
    &self,
  ) -> impl Iterator<Item = (usize, usize, &Arc<Frame<T>>)> + '_ {
    (0..self.slice_type.num_pred_dirs()).flat_map(move |l| {
      self.ref_pic_list[l].iter().enumerate().map(move |(i, f)| (l, i, f))
    })
  }

  pub(crate) fn release_references(&self) {
    for list in self.ref_pic_list.iter() {
      for f in list {
        f.count_ref_encoders.fetch_sub(1, Ordering::AcqRel);
      }
    }
  }

  /// Hands the reference counts taken by `add_reference` to a guard that
  /// gives them back when dropped.
  pub(crate) fn hold_references(&self) -> ReferenceHold<T> {
    ReferenceHold(self.ref_pic_list.iter().flatten().cloned().collect())
  }
}

/// Reference counts of a slice being compressed.
pub(crate) struct ReferenceHold<T: Pixel>(Vec<Arc<Frame<T>>>);

impl<T: Pixel> Drop for ReferenceHold<T> {
  fn drop(&mut self) {
    for f in &self.0 {
      f.count_ref_encoders.fetch_sub(1, Ordering::AcqRel);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn frame(poc: u64) -> Arc<Frame<u8>> {
    Arc::new(Frame::new(
      poc,
      Plane::new(64, 48, 0, 0, 0, 0),
      16,
      Lowres::default(),
    ))
  }

  #[test]
  fn geometry_rounds_up() {
    let g = FrameGeometry::new(100, 40, 32);
    assert_eq!((g.num_cols, g.num_rows), (4, 2));
    assert_eq!(g.row_height(1), 8);
    assert_eq!(g.col_width(3), 4);
    assert_eq!(g.num_ctus(), 8);
  }

  #[test]
  fn slice_holds_reference_counts() {
    let r = frame(0);
    let s = Slice::new(SliceType::B, false)
      .with_reference(0, Arc::clone(&r))
      .with_reference(1, Arc::clone(&r));
    assert_eq!(r.count_ref_encoders(), 2);
    assert_eq!(s.references().count(), 2);
    s.release_references();
    assert_eq!(r.count_ref_encoders(), 0);
  }

  #[test]
  fn p_slice_ignores_second_list() {
    let r = frame(0);
    let s = Slice::new(SliceType::P, false)
      .with_reference(0, Arc::clone(&r))
      .with_reference(1, Arc::clone(&r));
    assert_eq!(s.references().count(), 1);
    s.release_references();
  }

  #[test]
  fn weight_identity_is_noop() {
    let w = WeightParam::identity(6);
    assert!(w.is_identity());
    assert_eq!(w.apply(117, 255), 117);
    let w = WeightParam { log2_denom: 6, weight: 32, offset: 10 };
    assert_eq!(w.apply(100, 255), 60);
  }

  #[test]
  fn reset_keeps_plan_and_diagonal_qp() {
    let mut d = RowDiagnostics {
      diag_qp: 30.,
      diag_qscale: qp2qscale(30.),
      diag_satd: 7,
      planned_satd: 100,
      encoded_bits: 900,
      encoded_ctus: 3,
      ..Default::default()
    };
    d.reset_progress();
    assert_eq!(d.diag_qp, 30.);
    assert_eq!(d.planned_satd, 100);
    assert_eq!(d.encoded_bits, 0);
    assert_eq!(d.encoded_ctus, 0);
  }
}
