// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

/// Intra and inter, times four transform sizes.
pub const NR_CATEGORIES: usize = 8;

const MAX_BLOCKS_PER_TR_SIZE: [u32; 4] = [1 << 18, 1 << 16, 1 << 14, 1 << 12];

/// Coefficient domain noise reduction (adaptive deadzone).
///
/// The analyzer feeds residual magnitudes through [`denoise`], which both
/// accumulates them and applies the current offsets. The frame encoder
/// recomputes the offsets with [`update`] after every frame.
///
/// [`denoise`]: NoiseReduction::denoise
/// [`update`]: NoiseReduction::update
#[derive(Clone, Debug)]
pub struct NoiseReduction {
  pub strength: u32,
  pub count: [u32; NR_CATEGORIES],
  pub residual_sum: [Vec<u32>; NR_CATEGORIES],
  pub offset_denoise: [Vec<u16>; NR_CATEGORIES],
}

/// Coefficients in one block of category `cat`.
pub const fn coef_count(cat: usize) -> usize {
  1 << (((cat & 3) + 2) * 2)
}

impl NoiseReduction {
  pub fn new(strength: u32) -> Self {
    NoiseReduction {
      strength,
      count: [0; NR_CATEGORIES],
      residual_sum: std::array::from_fn(|cat| vec![0; coef_count(cat)]),
      offset_denoise: std::array::from_fn(|cat| vec![0; coef_count(cat)]),
    }
  }

  /// Accumulates `coefs` of one block and shrinks them towards zero by the
  /// current offsets, keeping their sign.
  pub fn denoise(&mut self, cat: usize, coefs: &mut [i32]) {
    self.count[cat] += 1;
    let n = coefs.len().min(coef_count(cat));
    let sums = &mut self.residual_sum[cat][..n];
    let offsets = &self.offset_denoise[cat][..n];
    for ((c, sum), &off) in coefs.iter_mut().zip(sums).zip(offsets) {
      let level = c.unsigned_abs();
      *sum = sum.saturating_add(level);
      let shrunk = level.saturating_sub(u32::from(off)) as i32;
      *c = if *c < 0 { -shrunk } else { shrunk };
    }
  }

  /// Recomputes the denoise offsets from the accumulated statistics.
  pub fn update(&mut self) {
    for cat in 0..NR_CATEGORIES {
      let tr = cat & 3;
      if self.count[cat] > MAX_BLOCKS_PER_TR_SIZE[tr] {
        for s in self.residual_sum[cat].iter_mut() {
          *s >>= 1;
        }
        self.count[cat] >>= 1;
      }

      let scaled = u64::from(self.strength) * u64::from(self.count[cat]);
      for (off, &sum) in
        self.offset_denoise[cat].iter_mut().zip(&self.residual_sum[cat])
      {
        let value = scaled + u64::from(sum) / 2;
        let denom = u64::from(sum) + 1;
        *off = (value / denom).min(u64::from(u16::MAX)) as u16;
      }

      // DC is never denoised.
      self.offset_denoise[cat][0] = 0;
    }
  }
}
