// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::ops::{Add, AddAssign};

/// Maximum quadtree depth below the CTU, plus one.
pub const MAX_CU_DEPTH: usize = 4;

/// Per-row statistics gathered for two-pass rate control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct RowStats {
  pub mv_bits: u64,
  pub coeff_bits: u64,
  pub misc_bits: u64,
  /// Coded CU counts, in units of the smallest CU.
  pub intra_cus: u64,
  pub inter_cus: u64,
  pub skip_cus: u64,
  pub ctus: usize,
}

impl Add<&Self> for RowStats {
  type Output = Self;

  fn add(self, rhs: &RowStats) -> Self::Output {
    let mut lhs = self;
    lhs += rhs;
    lhs
  }
}

impl AddAssign<&Self> for RowStats {
  fn add_assign(&mut self, rhs: &RowStats) {
    self.mv_bits += rhs.mv_bits;
    self.coeff_bits += rhs.coeff_bits;
    self.misc_bits += rhs.misc_bits;
    self.intra_cus += rhs.intra_cus;
    self.inter_cus += rhs.inter_cus;
    self.skip_cus += rhs.skip_cus;
    self.ctus += rhs.ctus;
  }
}

/// Frame level aggregate of [`RowStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameStats {
  pub mv_bits: u64,
  pub coeff_bits: u64,
  pub misc_bits: u64,
  pub percent_intra: f64,
  pub percent_inter: f64,
  pub percent_skip: f64,
}

impl FrameStats {
  /// Sums `rows` and turns the CU counts into shares of `total_cus`, the
  /// number of smallest-size CUs in the frame.
  pub fn aggregate<'a, I>(rows: I, total_cus: u64) -> Self
  where
    I: IntoIterator<Item = &'a RowStats>,
  {
    let sum = rows.into_iter().fold(RowStats::default(), |acc, r| acc + r);
    let share =
      |n: u64| if total_cus > 0 { n as f64 / total_cus as f64 } else { 0. };
    FrameStats {
      mv_bits: sum.mv_bits,
      coeff_bits: sum.coeff_bits,
      misc_bits: sum.misc_bits,
      percent_intra: share(sum.intra_cus),
      percent_inter: share(sum.inter_cus),
      percent_skip: share(sum.skip_cus),
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn aggregate_sums_and_normalizes() {
    let a = RowStats {
      mv_bits: 10,
      coeff_bits: 100,
      misc_bits: 4,
      intra_cus: 8,
      inter_cus: 4,
      skip_cus: 4,
      ctus: 2,
    };
    let b = RowStats { mv_bits: 6, intra_cus: 16, ctus: 2, ..a };
    let f = FrameStats::aggregate([a, b].iter(), 64);
    assert_eq!(
      f,
      FrameStats {
        mv_bits: 16,
        coeff_bits: 200,
        misc_bits: 8,
        percent_intra: 0.375,
        percent_inter: 0.125,
        percent_skip: 0.125,
      }
    );
  }

  #[test]
  fn empty_frame_has_no_shares() {
    let f = FrameStats::aggregate(std::iter::empty(), 0);
    assert_eq!(f, FrameStats::default());
  }
}
