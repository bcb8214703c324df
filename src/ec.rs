// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Adaptive binary entropy coding state.
//!
//! The bit-level arithmetic is deliberately simple: every context-coded bin
//! is emitted as a single "was it the most probable symbol" bit, while the
//! probability state adapts exactly like a regular binary context model.
//! What matters to the frame engine is that the state is copyable,
//! comparable and evolves deterministically from the bins it sees.

use crate::frame::SliceType;
use crate::util::clamp;

/// Number of adaptive context models carried per coder.
pub const NUM_CONTEXTS: usize = 64;

const MAX_STATE: u8 = 62;

const INIT_VALUES: [u8; 8] = [154, 139, 169, 107, 141, 125, 140, 182];

/// One binarized syntax element.
///
/// `ctx` selects the adaptive model, `None` means bypass coded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Bin {
  pub ctx: Option<u8>,
  pub val: bool,
}

impl Bin {
  pub const fn ctx(ctx: u8, val: bool) -> Self {
    Bin { ctx: Some(ctx), val }
  }

  pub const fn bypass(val: bool) -> Self {
    Bin { ctx: None, val }
  }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextModel {
  state: u8,
  mps: bool,
}

impl ContextModel {
  fn init(init_value: u8, slice_qp: i32) -> Self {
    let slope = (i32::from(init_value) >> 4) * 5 - 45;
    let offset = ((i32::from(init_value) & 15) << 3) - 16;
    let pre = clamp(((slope * clamp(slice_qp, 0, 51)) >> 4) + offset, 1, 126);
    let mps = pre > 63;
    let state = if mps { pre - 64 } else { 63 - pre };
    ContextModel { state: state as u8, mps }
  }

  #[inline]
  fn update(&mut self, val: bool) {
    if val == self.mps {
      self.state = (self.state + 1).min(MAX_STATE);
    } else {
      if self.state == 0 {
        self.mps = !self.mps;
      }
      self.state -= self.state.min(1 + self.state / 4);
    }
  }

  pub const fn state(&self) -> u8 {
    self.state
  }

  pub const fn mps(&self) -> bool {
    self.mps
  }
}

/// Snapshot of all adaptive probability state of one coder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntropyContext {
  models: [ContextModel; NUM_CONTEXTS],
}

impl EntropyContext {
  /// Initial state for a slice coded at `slice_qp`.
  pub fn new(slice_qp: i32, slice_type: SliceType) -> Self {
    let shift = slice_type as usize;
    let mut models = [ContextModel::default(); NUM_CONTEXTS];
    for (i, m) in models.iter_mut().enumerate() {
      *m = ContextModel::init(
        INIT_VALUES[(i + shift) % INIT_VALUES.len()],
        slice_qp,
      );
    }
    EntropyContext { models }
  }

  pub fn model(&self, ctx: u8) -> ContextModel {
    self.models[usize::from(ctx) % NUM_CONTEXTS]
  }

  fn encode(&mut self, bs: &mut Bitstream, bin: Bin) {
    match bin.ctx {
      Some(ctx) => {
        let m = &mut self.models[usize::from(ctx) % NUM_CONTEXTS];
        bs.write_bit(bin.val != m.mps);
        m.update(bin.val);
      }
      None => bs.write_bit(bin.val),
    }
  }
}

/// Growable MSB-first bit buffer.
#[derive(Clone, Debug, Default)]
pub struct Bitstream {
  data: Vec<u8>,
  acc: u8,
  nacc: u32,
}

impl Bitstream {
  pub fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub fn write_bit(&mut self, bit: bool) {
    self.acc = (self.acc << 1) | u8::from(bit);
    self.nacc += 1;
    if self.nacc == 8 {
      self.data.push(self.acc);
      self.acc = 0;
      self.nacc = 0;
    }
  }

  pub fn write_bits(&mut self, value: u32, n: u32) {
    for i in (0..n).rev() {
      self.write_bit((value >> i) & 1 != 0);
    }
  }

  /// A stop bit followed by zero bits up to the next byte boundary.
  pub fn write_byte_alignment(&mut self) {
    self.write_bit(true);
    while self.nacc != 0 {
      self.write_bit(false);
    }
  }

  pub fn num_bits(&self) -> u64 {
    self.data.len() as u64 * 8 + u64::from(self.nacc)
  }

  pub fn reset_bits(&mut self) {
    self.data.clear();
    self.acc = 0;
    self.nacc = 0;
  }

  /// Completed bytes; a trailing partial byte is not included.
  pub fn bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn position(&self) -> BitPosition {
    BitPosition { bytes: self.data.len(), acc: self.acc, nacc: self.nacc }
  }

  /// Drops everything written after `pos`.
  pub fn truncate(&mut self, pos: BitPosition) {
    debug_assert!(pos.bytes <= self.data.len());
    self.data.truncate(pos.bytes);
    self.acc = pos.acc;
    self.nacc = pos.nacc;
  }
}

/// A point in a [`Bitstream`] that can be returned to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BitPosition {
  bytes: usize,
  acc: u8,
  nacc: u32,
}

/// Saved state of a [`RowCoder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoderCheckpoint {
  ctx: EntropyContext,
  pos: BitPosition,
  ctus: usize,
}

/// Entropy coder bound to one substream.
#[derive(Clone, Debug)]
pub struct RowCoder {
  ctx: EntropyContext,
  bs: Bitstream,
  ctus: usize,
}

impl RowCoder {
  pub fn new(ctx: EntropyContext) -> Self {
    RowCoder { ctx, bs: Bitstream::new(), ctus: 0 }
  }

  /// Replaces the probability state, keeping the bits written so far.
  pub fn load_contexts(&mut self, ctx: &EntropyContext) {
    self.ctx.clone_from(ctx);
  }

  pub fn context(&self) -> &EntropyContext {
    &self.ctx
  }

  pub fn encode_ctu(&mut self, bins: &[Bin]) {
    for &bin in bins {
      self.ctx.encode(&mut self.bs, bin);
    }
    self.ctus += 1;
  }

  /// Terminates the substream: end-of-substream bit plus byte alignment.
  pub fn finish_slice(&mut self) {
    self.bs.write_bit(true);
    self.bs.write_byte_alignment();
  }

  pub fn reset_bits(&mut self) {
    self.bs.reset_bits();
    self.ctus = 0;
  }

  pub fn checkpoint(&self) -> CoderCheckpoint {
    CoderCheckpoint {
      ctx: self.ctx.clone(),
      pos: self.bs.position(),
      ctus: self.ctus,
    }
  }

  /// Returns to `cp`, forgetting the CTUs coded since.
  pub fn rewind(&mut self, cp: &CoderCheckpoint) {
    self.ctx.clone_from(&cp.ctx);
    self.bs.truncate(cp.pos);
    self.ctus = cp.ctus;
  }

  pub fn num_bits(&self) -> u64 {
    self.bs.num_bits()
  }

  pub const fn num_ctus(&self) -> usize {
    self.ctus
  }

  pub fn bytes(&self) -> &[u8] {
    self.bs.bytes()
  }
}
