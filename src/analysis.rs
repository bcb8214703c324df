// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::Mutex;

use crate::ec::{Bin, EntropyContext};
use crate::encoder::noise::NoiseReduction;
use crate::encoder::reference::MotionReference;
use crate::frame::{Frame, Slice};
use crate::stats::MAX_CU_DEPTH;
use crate::util::*;

/// Everything the mode decision of one CTU may look at.
pub struct AnalysisInput<'a, T: Pixel> {
  pub frame: &'a Frame<T>,
  pub slice: &'a Slice<T>,
  pub refs: &'a [Vec<MotionReference<T>>; 2],
  pub row: usize,
  pub col: usize,
  /// Top-left luma position of the CTU.
  pub x: usize,
  pub y: usize,
  pub ctu_size: usize,
  /// Final QP of the CTU, after adaptive offsets.
  pub qp: i32,
  pub base_qp: f64,
  /// Entropy state the CTU will be coded with; useful for rate estimation.
  pub ctx: &'a EntropyContext,
  pub nr: Option<&'a Mutex<NoiseReduction>>,
}

/// Coding decisions of one CTU, ready for the entropy coder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CtuDecision {
  pub bins: Vec<Bin>,
  pub total_bits: u64,
  pub mv_bits: u64,
  pub coeff_bits: u64,
  /// Coded CUs per quadtree depth.
  pub intra_cnt: [u32; MAX_CU_DEPTH],
  pub inter_cnt: [u32; MAX_CU_DEPTH],
  pub skip_cnt: [u32; MAX_CU_DEPTH],
}

/// Mode decision for a single CTU.
///
/// Implementations run concurrently on different rows, so any scratch
/// state has to be thread local. Row bookkeeping belongs to the caller.
pub trait CtuAnalyzer<T: Pixel>: Send + Sync {
  fn compress_ctu(&self, input: &AnalysisInput<'_, T>) -> CtuDecision;
}

const CTX_SPLIT: u8 = 0;
const CTX_SKIP: u8 = 4;
const CTX_PRED_MODE: u8 = 8;
const CTX_CBF: u8 = 12;
const CTX_GT1: u8 = 16;
const CTX_MVD: u8 = 24;

/// Deterministic variance driven quadtree decisions.
///
/// Splits a CU while its per-sample variance exceeds a QP dependent
/// threshold, chooses between DC intra prediction and the co-located block
/// of the first reference, and codes a coarse residual level per 4x4 block.
#[derive(Clone, Copy, Debug)]
pub struct ActivityAnalyzer {
  pub split_threshold: f64,
  pub bit_depth: usize,
}

impl Default for ActivityAnalyzer {
  fn default() -> Self {
    ActivityAnalyzer { split_threshold: 4.0, bit_depth: 8 }
  }
}

struct CuCost {
  mean: i32,
  variance: f64,
}

fn cu_cost<T: Pixel>(
  plane: &Plane<T>, x: usize, y: usize, w: usize, h: usize,
) -> CuCost {
  let mut sum = 0i64;
  let mut sum_sq = 0i64;
  for yy in y..y + h {
    for &px in &plane.row(yy as isize)[x..x + w] {
      let v = i64::from(Into::<i32>::into(px));
      sum += v;
      sum_sq += v * v;
    }
  }
  let n = (w * h) as i64;
  CuCost {
    mean: ((sum + n / 2) / n) as i32,
    variance: (sum_sq - sum * sum / n) as f64 / n as f64,
  }
}

/// Appends `v` as an order 0 exp-Golomb bypass code.
fn write_eg0(bins: &mut Vec<Bin>, v: u32) {
  let v1 = v + 1;
  let len = 31 - v1.leading_zeros();
  for _ in 0..len {
    bins.push(Bin::bypass(false));
  }
  for i in (0..=len).rev() {
    bins.push(Bin::bypass((v1 >> i) & 1 != 0));
  }
}

impl ActivityAnalyzer {
  pub fn new(bit_depth: usize) -> Self {
    ActivityAnalyzer { bit_depth, ..Default::default() }
  }

  fn code_cu<T: Pixel>(
    &self, input: &AnalysisInput<'_, T>, d: &mut CtuDecision, x: usize,
    y: usize, size: usize, depth: usize, qscale: f64,
  ) {
    let geom = &input.frame.geom;
    if x >= geom.width || y >= geom.height {
      return;
    }
    let w = (geom.width - x).min(size);
    let h = (geom.height - y).min(size);
    let inside = w == size && h == size;
    let src = &input.frame.source;
    let cost = cu_cost(src, x, y, w, h);
    let can_split = size > MIN_CU_SIZE && depth + 1 < MAX_CU_DEPTH;
    let sample_scale = (1 << (self.bit_depth - 8)) as f64;
    let split = can_split
      && (!inside
        || cost.variance
          > self.split_threshold * qscale * sample_scale * sample_scale);

    if can_split && inside {
      d.bins.push(Bin::ctx(CTX_SPLIT + depth as u8, split));
    }
    if split {
      let half = size / 2;
      for (dx, dy) in [(0, 0), (half, 0), (0, half), (half, half)] {
        self.code_cu(input, d, x + dx, y + dy, half, depth + 1, qscale);
      }
      return;
    }

    let area = (w * h) as f64;
    let intra_sad: u32 = (y..y + h)
      .flat_map(|yy| src.row(yy as isize)[x..x + w].iter())
      .map(|&px| (Into::<i32>::into(px) - cost.mean).unsigned_abs())
      .sum();
    let inter_sad = if input.slice.slice_type.is_intra() {
      None
    } else {
      input.refs[0].first().map(|r| r.sad(src, x, y, w, h))
    };

    let is_inter = inter_sad.map_or(false, |s| s < intra_sad);
    if !input.slice.slice_type.is_intra() {
      let skip = inter_sad
        .map_or(false, |s| f64::from(s) <= qscale * area * sample_scale / 4.);
      d.bins.push(Bin::ctx(CTX_SKIP + depth as u8, skip));
      if skip {
        d.skip_cnt[depth] += 1;
        return;
      }
      d.bins.push(Bin::ctx(CTX_PRED_MODE, !is_inter));
    }

    if is_inter {
      d.inter_cnt[depth] += 1;
      // Zero motion vector difference, both components.
      d.bins.push(Bin::ctx(CTX_MVD, false));
      d.bins.push(Bin::ctx(CTX_MVD + 1, false));
      d.mv_bits += 2;
    } else {
      d.intra_cnt[depth] += 1;
    }

    // One residual level per 4x4 block, scaled by the quantizer.
    let reference = if is_inter { input.refs[0].first() } else { None };
    let mut levels = Vec::with_capacity((w / 4 + 1) * (h / 4 + 1));
    for by in (y..y + h).step_by(4) {
      for bx in (x..x + w).step_by(4) {
        let bw = (x + w - bx).min(4);
        let bh = (y + h - by).min(4);
        let sad = match reference {
          Some(r) => r.sad(src, bx, by, bw, bh),
          None => (by..by + bh)
            .flat_map(|yy| src.row(yy as isize)[bx..bx + bw].iter())
            .map(|&px| (Into::<i32>::into(px) - cost.mean).unsigned_abs())
            .sum(),
        };
        levels.push((f64::from(sad) / (16. * qscale * sample_scale)) as i32);
      }
    }
    if let Some(nr) = input.nr {
      let tr = (size.trailing_zeros() as usize).saturating_sub(2).min(3);
      lock(nr).denoise(tr + if is_inter { 4 } else { 0 }, &mut levels);
    }

    let start = d.bins.len();
    let cbf = levels.iter().any(|&l| l > 0);
    d.bins.push(Bin::ctx(CTX_CBF + depth as u8, cbf));
    if cbf {
      for &l in &levels {
        let l = l.max(0) as u32;
        d.bins.push(Bin::ctx(CTX_GT1 + l.min(3) as u8, l > 0));
        if l > 1 {
          write_eg0(&mut d.bins, l - 2);
        }
      }
    }
    d.coeff_bits += (d.bins.len() - start) as u64;
  }
}

impl<T: Pixel> CtuAnalyzer<T> for ActivityAnalyzer {
  #[profiling::function]
  fn compress_ctu(&self, input: &AnalysisInput<'_, T>) -> CtuDecision {
    let mut d = CtuDecision::default();
    let qscale = qp2qscale(f64::from(input.qp));
    self.code_cu(input, &mut d, input.x, input.y, input.ctu_size, 0, qscale);
    d.total_bits = d.bins.len() as u64;
    d
  }
}
