// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::util::*;

/// Marks a cost in the lowres cost map as coming from reference list 0.
pub const LOWRES_LIST0_FLAG: u32 = 1 << 14;

/// Strength of the CU-tree QP reduction for well propagated blocks.
const CUTREE_STRENGTH: f64 = 2.0;

/// Lowres analysis of a picture on a grid of 16x16 luma blocks.
///
/// This is what a lookahead would normally hand to the frame encoder: the
/// adaptive quantization and CU-tree QP offsets plus the cost estimates the
/// VBV rate control uses to predict row sizes.
#[derive(Debug, Default, Clone)]
pub struct Lowres {
  pub blocks_w: usize,
  pub blocks_h: usize,
  pub qp_aq_offset: Vec<f64>,
  pub qp_cutree_offset: Vec<f64>,
  pub intra_cost: Vec<u32>,
  /// Best of intra and inter cost, with the list bits above
  /// [`LOWRES_COST_MASK`].
  pub lowres_cost_for_rc: Vec<u32>,
  pub satd_cost: u64,
}

struct BlockStats {
  variance: u64,
  intra: u32,
}

#[inline]
fn block_row<T: Pixel>(
  plane: &Plane<T>, x0: usize, y: usize, w: usize,
) -> &[T] {
  &plane.row(y as isize)[x0..x0 + w]
}

fn block_stats<T: Pixel>(
  plane: &Plane<T>, x0: usize, y0: usize, w: usize, h: usize,
) -> BlockStats {
  let mut sum = 0u64;
  let mut sum_sq = 0u64;
  for y in y0..y0 + h {
    for &px in block_row(plane, x0, y, w) {
      let v = u64::from(Into::<u32>::into(px));
      sum += v;
      sum_sq += v * v;
    }
  }
  let n = (w * h) as u64;
  let mean = ((sum + n / 2) / n) as i32;
  let variance = sum_sq - sum * sum / n;

  // DC prediction error.
  let mut sad = 0u32;
  for y in y0..y0 + h {
    for &px in block_row(plane, x0, y, w) {
      sad += (Into::<i32>::into(px) - mean).unsigned_abs();
    }
  }
  BlockStats { variance, intra: sad }
}

fn sad<T: Pixel>(
  a: &Plane<T>, b: &Plane<T>, x0: usize, y0: usize, w: usize, h: usize,
) -> u32 {
  let mut sad = 0u32;
  for y in y0..y0 + h {
    let ra = block_row(a, x0, y, w);
    let rb = block_row(b, x0, y, w);
    for (&pa, &pb) in ra.iter().zip(rb) {
      sad += (Into::<i32>::into(pa) - Into::<i32>::into(pb)).unsigned_abs();
    }
  }
  sad
}

/// Maps a SAD over a 16x16 block into the 14 bit lowres cost range.
fn scale_cost(sad: u32, bit_depth: usize) -> u32 {
  (sad >> (2 + bit_depth - 8)).min(LOWRES_COST_MASK)
}

impl Lowres {
  /// Analyzes `source`; with a `reference` the inter cost of each block is
  /// its co-located SAD against that picture.
  pub fn analyze<T: Pixel>(
    source: &Plane<T>, reference: Option<&Plane<T>>, bit_depth: usize,
    aq_strength: f64,
  ) -> Lowres {
    let width = source.cfg.width;
    let height = source.cfg.height;
    let blocks_w = ctu_count(width, LOWRES_BLOCK_SIZE);
    let blocks_h = ctu_count(height, LOWRES_BLOCK_SIZE);
    let n = blocks_w * blocks_h;
    let mut lowres = Lowres {
      blocks_w,
      blocks_h,
      qp_aq_offset: Vec::with_capacity(n),
      qp_cutree_offset: Vec::with_capacity(n),
      intra_cost: Vec::with_capacity(n),
      lowres_cost_for_rc: Vec::with_capacity(n),
      satd_cost: 0,
    };
    let bias = 14.427 + 2.0 * (bit_depth as f64 - 8.0);

    for by in 0..blocks_h {
      for bx in 0..blocks_w {
        let x = bx * LOWRES_BLOCK_SIZE;
        let y = by * LOWRES_BLOCK_SIZE;
        let w = (width - x).min(LOWRES_BLOCK_SIZE);
        let h = (height - y).min(LOWRES_BLOCK_SIZE);
        let st = block_stats(source, x, y, w, h);
        // Normalize the energy of partial blocks to a full block.
        let energy =
          st.variance * (LOWRES_BLOCK_SIZE * LOWRES_BLOCK_SIZE) as u64
            / (w * h) as u64;
        let aq = aq_strength * ((energy.max(1) as f64).log2() - bias);

        let intra = scale_cost(st.intra, bit_depth);
        let (cost, propagate) = match reference {
          Some(r) => {
            let inter = scale_cost(sad(source, r, x, y, w, h), bit_depth);
            if inter < intra {
              (inter | LOWRES_LIST0_FLAG, intra - inter)
            } else {
              (intra, 0)
            }
          }
          None => (intra, 0),
        };
        let cutree = if propagate > 0 {
          aq
            - CUTREE_STRENGTH
              * (1.0 + f64::from(propagate) / f64::from(intra.max(1))).log2()
        } else {
          aq
        };

        lowres.qp_aq_offset.push(aq);
        lowres.qp_cutree_offset.push(cutree);
        lowres.intra_cost.push(intra);
        lowres.lowres_cost_for_rc.push(cost);
        lowres.satd_cost += u64::from(cost & LOWRES_COST_MASK);
      }
    }
    lowres
  }

  pub fn is_empty(&self) -> bool {
    self.lowres_cost_for_rc.is_empty()
  }

  /// Total rate control cost of the 16x16 blocks under a CTU row.
  pub fn row_cost(&self, ctu_size: usize, row: usize) -> u64 {
    if self.is_empty() {
      return 0;
    }
    let per_ctu = ctu_size / LOWRES_BLOCK_SIZE;
    let y0 = row * per_ctu;
    let y1 = (y0 + per_ctu).min(self.blocks_h);
    (y0..y1)
      .flat_map(|by| {
        let start = by * self.blocks_w;
        self.lowres_cost_for_rc[start..start + self.blocks_w].iter()
      })
      .map(|&c| u64::from(c & LOWRES_COST_MASK))
      .sum()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use rand::{Rng, SeedableRng};
  use rand_chacha::ChaChaRng;

  fn noise_plane(w: usize, h: usize, amp: u8, seed: u64) -> Plane<u8> {
    let mut rng = ChaChaRng::seed_from_u64(seed);
    let mut p = Plane::new(w, h, 0, 0, 0, 0);
    let stride = p.cfg.stride;
    for row in p.data_origin_mut().chunks_mut(stride).take(h) {
      for px in row[..w].iter_mut() {
        *px = 128u8.wrapping_add(rng.gen_range(0..=amp)) - amp / 2;
      }
    }
    p
  }

  #[test]
  fn flat_blocks_get_lower_qp_than_busy_ones() {
    let mut p = noise_plane(32, 16, 120, 1);
    let stride = p.cfg.stride;
    // Flatten the left block.
    for row in p.data_origin_mut().chunks_mut(stride).take(16) {
      row[..16].fill(100);
    }
    let l = Lowres::analyze(&p, None, 8, 1.0);
    assert_eq!((l.blocks_w, l.blocks_h), (2, 1));
    assert!(l.qp_aq_offset[0] < l.qp_aq_offset[1]);
    assert_eq!(l.intra_cost[0], 0);
  }

  #[test]
  fn identical_reference_is_free() {
    let p = noise_plane(48, 40, 60, 7);
    let l = Lowres::analyze(&p, Some(&p), 8, 1.0);
    assert_eq!((l.blocks_w, l.blocks_h), (3, 3));
    for (&c, &i) in l.lowres_cost_for_rc.iter().zip(&l.intra_cost) {
      assert_eq!(c & LOWRES_COST_MASK, 0);
      assert!(i > 0);
    }
    assert_eq!(l.satd_cost, 0);
    // Propagated blocks are favoured by the tree offsets.
    assert!(l.qp_cutree_offset[0] < l.qp_aq_offset[0]);
  }

  #[test]
  fn row_cost_matches_total() {
    let p = noise_plane(64, 64, 90, 3);
    let l = Lowres::analyze(&p, None, 8, 1.0);
    let rows: u64 = (0..2).map(|r| l.row_cost(32, r)).sum();
    assert_eq!(rows, l.satd_cost);
  }
}
