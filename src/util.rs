// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use v_frame::pixel::{CastFromPrimitive, Pixel};
pub use v_frame::plane::Plane;

/// Lowest QP the encoder will ever use.
pub const QP_MIN: i32 = 0;
/// Highest QP allowed by the bitstream syntax for 8-bit content.
pub const QP_MAX: i32 = 51;
/// Highest QP reachable after adaptive offsets, including the bit depth range.
pub const QP_MAX_MAX: i32 = 69;

/// Smallest coding unit handled by the quadtree, in luma samples.
pub const MIN_CU_SIZE: usize = 8;
/// Granularity of the lowres analysis maps, in luma samples.
pub const LOWRES_BLOCK_SIZE: usize = 16;

/// The lowres inter cost map stores the reference list in the upper bits.
pub const LOWRES_COST_MASK: u32 = (1 << 14) - 1;

/// Luma interpolation filter taps.
pub const NTAPS_LUMA: usize = 8;

#[inline]
pub fn clamp<T: PartialOrd>(input: T, min: T, max: T) -> T {
  if input < min {
    min
  } else if input > max {
    max
  } else {
    input
  }
}

/// QP offset introduced by bit depths above 8.
#[inline]
pub const fn qp_bd_offset(bit_depth: usize) -> i32 {
  6 * (bit_depth as i32 - 8)
}

/// Converts a QP to the linear quantizer scale.
#[inline]
pub fn qp2qscale(qp: f64) -> f64 {
  0.85 * 2f64.powf((qp - 12.0) / 6.0)
}

/// Converts a linear quantizer scale back to a QP.
#[inline]
pub fn qscale2qp(qscale: f64) -> f64 {
  12.0 + 6.0 * (qscale / 0.85).log2()
}

/// Number of CTUs needed to cover `len` samples.
#[inline]
pub const fn ctu_count(len: usize, ctu_size: usize) -> usize {
  (len + ctu_size - 1) / ctu_size
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
#[inline]
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}
