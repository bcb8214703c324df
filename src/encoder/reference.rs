// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::{Arc, Mutex};

use crate::frame::{Frame, Slice, WeightParam};
use crate::util::*;

/// Log2 denominator used for estimated luma weights.
const WEIGHT_LOG2_DENOM: u32 = 6;

struct WeightedPlane<T: Pixel> {
  plane: Plane<T>,
  /// CTU rows of the reference already weighted.
  rows: usize,
}

/// A reference picture as seen by motion search.
///
/// With a weight, the weighted copy of the reconstruction is built up
/// incrementally as reference synchronization makes more rows visible.
pub struct MotionReference<T: Pixel> {
  pub frame: Arc<Frame<T>>,
  pub weight: Option<WeightParam>,
  weighted: Option<Mutex<WeightedPlane<T>>>,
  bit_depth: usize,
}

impl<T: Pixel> MotionReference<T> {
  pub fn new(
    frame: Arc<Frame<T>>, weight: Option<WeightParam>, bit_depth: usize,
  ) -> Self {
    let weight = weight.filter(|w| !w.is_identity());
    let weighted = weight.map(|_| {
      let cfg = &frame.source.cfg;
      Mutex::new(WeightedPlane {
        plane: Plane::new(cfg.width, cfg.height, 0, 0, 0, 0),
        rows: 0,
      })
    });
    MotionReference { frame, weight, weighted, bit_depth }
  }

  pub fn is_weighted(&self) -> bool {
    self.weighted.is_some()
  }

  /// Rows of the weighted copy that are ready.
  pub fn weighted_rows(&self) -> usize {
    self.weighted.as_ref().map_or(0, |w| lock(w).rows)
  }

  /// Weights the reference rows up to `finished_rows` (CTU rows of the
  /// reference, capped at `num_rows`) that were not weighted yet.
  pub fn apply_weight(&self, finished_rows: usize, num_rows: usize) {
    let (Some(weighted), Some(wp)) = (&self.weighted, self.weight) else {
      return;
    };
    let mut w = lock(weighted);
    let rows = finished_rows.min(num_rows);
    if w.rows >= rows {
      return;
    }
    let geom = self.frame.geom;
    let y0 = w.rows * geom.ctu_size;
    let y1 = (rows * geom.ctu_size).min(geom.height);
    let max = (1 << self.bit_depth) - 1;
    let recon = lock(&self.frame.recon);
    let stride = w.plane.cfg.stride;
    let width = geom.width;
    for y in y0..y1 {
      let src = &recon.row(y as isize)[..width];
      let dst = &mut w.plane.data_origin_mut()[y * stride..y * stride + width];
      for (d, &s) in dst.iter_mut().zip(src) {
        *d = T::cast_from(wp.apply(s.into(), max));
      }
    }
    w.rows = rows;
  }

  /// Sum of absolute differences between a block of `src` and the
  /// co-located block of this reference.
  pub fn sad(
    &self, src: &Plane<T>, x: usize, y: usize, w: usize, h: usize,
  ) -> u32 {
    let block = |r: &Plane<T>| -> u32 {
      (y..y + h)
        .map(|yy| {
          let a = &src.row(yy as isize)[x..x + w];
          let b = &r.row(yy as isize)[x..x + w];
          a.iter()
            .zip(b)
            .map(|(&pa, &pb)| {
              (Into::<i32>::into(pa) - Into::<i32>::into(pb)).unsigned_abs()
            })
            .sum::<u32>()
        })
        .sum()
    };
    match &self.weighted {
      Some(wp) => block(&lock(wp).plane),
      None => block(&lock(&self.frame.recon)),
    }
  }
}

/// Blocks until every reference of `slice` reconstructed the rows that row
/// `row` of the current frame may reach with its motion search, then brings
/// the weighted references up to date.
pub fn wait_for_references<T: Pixel>(
  slice: &Slice<T>, mrefs: &[Vec<MotionReference<T>>; 2], row: usize,
  ref_lag_rows: usize,
) {
  for (l, i, refpic) in slice.references() {
    let num_rows = refpic.geom.num_rows;
    let count =
      refpic.recon_row_count.wait_for_rows(row + ref_lag_rows, num_rows);
    log::trace!(
      "row {} may use POC {}: {}/{} rows reconstructed",
      row,
      refpic.poc,
      count,
      num_rows
    );
    if let Some(mref) = mrefs[l].get(i) {
      if mref.is_weighted() {
        mref.apply_weight(row + ref_lag_rows, num_rows);
      }
    }
  }
}

fn plane_mean<T: Pixel>(p: &Plane<T>) -> f64 {
  let (w, h) = (p.cfg.width, p.cfg.height);
  let sum: u64 = (0..h)
    .flat_map(|y| p.row(y as isize)[..w].iter())
    .map(|&px| u64::from(Into::<u32>::into(px)))
    .sum();
  sum as f64 / (w * h).max(1) as f64
}

/// Estimates a luma weight for each reference from the ratio of the source
/// means. References whose weight would be negligible stay unweighted.
pub fn weight_analyse<T: Pixel>(slice: &mut Slice<T>, source: &Plane<T>) {
  let cur = plane_mean(source);
  for l in 0..slice.slice_type.num_pred_dirs() {
    for i in 0..slice.ref_pic_list[l].len() {
      let refmean = plane_mean(&slice.ref_pic_list[l][i].source);
      let weight = if refmean > 0. {
        (cur / refmean * f64::from(1 << WEIGHT_LOG2_DENOM)).round() as i32
      } else {
        1 << WEIGHT_LOG2_DENOM
      };
      let wp = WeightParam {
        log2_denom: WEIGHT_LOG2_DENOM,
        weight: clamp(weight, -128, 127),
        offset: 0,
      };
      slice.weights[l][i] =
        if (wp.weight - (1 << WEIGHT_LOG2_DENOM)).abs() < 2 {
          None
        } else {
          Some(wp)
        };
    }
  }
}

/// Clears every estimated weight.
pub fn disable_weights<T: Pixel>(slice: &mut Slice<T>) {
  for list in slice.weights.iter_mut() {
    list.iter_mut().for_each(|w| *w = None);
  }
}
