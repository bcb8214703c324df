// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::Mutex;

use arrayvec::ArrayVec;
use md5::{Digest, Md5};

use crate::api::PictureHash;
use crate::ec::Bin;
use crate::frame::Frame;
use crate::util::*;

/// Context of the SAO "off" flag coded by the default SAO syntax.
pub const CTX_SAO: u8 = 32;

/// In-loop filtering of reconstructed CTU rows.
pub trait LoopFilter<T: Pixel>: Send + Sync {
  /// Produces the final reconstruction of CTU row `row` in `recon`.
  fn filter_row(&self, frame: &Frame<T>, recon: &mut Plane<T>, row: usize);

  /// Gathers SAO statistics for a CTU before deblocking touches it.
  fn analyze_ctu(&self, _frame: &Frame<T>, _row: usize, _col: usize) {}

  /// SAO syntax of one CTU, coded by the final slice pass.
  fn sao_syntax(
    &self, _frame: &Frame<T>, _row: usize, _col: usize,
  ) -> Vec<Bin> {
    vec![Bin::ctx(CTX_SAO, false)]
  }
}

/// Takes the source as reconstruction, unfiltered.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyFilter;

impl<T: Pixel> LoopFilter<T> for CopyFilter {
  fn filter_row(&self, frame: &Frame<T>, recon: &mut Plane<T>, row: usize) {
    let geom = frame.geom;
    let y0 = row * geom.ctu_size;
    let y1 = y0 + geom.row_height(row);
    let stride = recon.cfg.stride;
    let dst = recon.data_origin_mut();
    for y in y0..y1 {
      dst[y * stride..y * stride + geom.width]
        .copy_from_slice(&frame.source.row(y as isize)[..geom.width]);
    }
  }
}

enum HashState {
  None,
  Md5(Md5),
  Crc(u32),
  Checksum(u32),
}

fn crc_update(mut crc: u32, byte: u32) -> u32 {
  for bit in 0..8 {
    let msb = (crc >> 15) & 1;
    let val = (byte >> (7 - bit)) & 1;
    crc = (((crc << 1) + val) & 0xffff) ^ (msb * 0x1021);
  }
  crc
}

fn crc_finish(mut crc: u32) -> u16 {
  for _ in 0..16 {
    let msb = (crc >> 15) & 1;
    crc = ((crc << 1) & 0xffff) ^ (msb * 0x1021);
  }
  crc as u16
}

/// Runs the loop filter over finished rows and publishes their progress.
pub struct FrameFilter {
  bit_depth: usize,
  kind: PictureHash,
  hash: Mutex<HashState>,
}

impl FrameFilter {
  pub fn new(bit_depth: usize, kind: PictureHash) -> Self {
    FrameFilter { bit_depth, kind, hash: Mutex::new(HashState::None) }
  }

  pub fn start(&self) {
    *lock(&self.hash) = match self.kind {
      PictureHash::None => HashState::None,
      PictureHash::Md5 => HashState::Md5(Md5::new()),
      PictureHash::Crc => HashState::Crc(0xffff),
      PictureHash::Checksum => HashState::Checksum(0),
    };
  }

  /// Filters `row`, folds it into the picture hash and makes it visible to
  /// frames predicting from this one. Rows must arrive in order.
  #[profiling::function]
  pub fn process_row<T: Pixel>(
    &self, filter: &dyn LoopFilter<T>, frame: &Frame<T>, row: usize,
  ) {
    {
      let mut recon = lock(&frame.recon);
      filter.filter_row(frame, &mut recon, row);
      let mut hash = lock(&self.hash);
      let geom = frame.geom;
      let y0 = row * geom.ctu_size;
      for y in y0..y0 + geom.row_height(row) {
        let line = &recon.row(y as isize)[..geom.width];
        self.update_hash(&mut hash, line, y);
      }
    }
    let count = frame.recon_row_count.incr();
    log::trace!("POC {} reconstructed {} rows", frame.poc, count);
  }

  fn update_hash<T: Pixel>(&self, state: &mut HashState, line: &[T], y: usize) {
    let wide = self.bit_depth > 8;
    match state {
      HashState::None => {}
      HashState::Md5(md5) => {
        // Samples wider than 8 bits are hashed little endian.
        let bytes: Vec<u8> = if wide {
          line
            .iter()
            .flat_map(|&px| {
              let v: u32 = px.into();
              (v as u16).to_le_bytes()
            })
            .collect()
        } else {
          line
            .iter()
            .map(|&px| {
              let v: u32 = px.into();
              v as u8
            })
            .collect()
        };
        md5.update(&bytes);
      }
      HashState::Crc(crc) => {
        for &px in line {
          let v: u32 = px.into();
          *crc = crc_update(*crc, v & 0xff);
          if wide {
            *crc = crc_update(*crc, v >> 8);
          }
        }
      }
      HashState::Checksum(sum) => {
        for (x, &px) in line.iter().enumerate() {
          let v: u32 = px.into();
          let mask = ((x & 0xff) ^ (y & 0xff) ^ (x >> 8) ^ (y >> 8)) as u32;
          *sum = sum.wrapping_add((v & 0xff) ^ mask);
          if wide {
            *sum = sum.wrapping_add((v >> 8) ^ mask);
          }
        }
      }
    }
  }

  /// Luma digest of everything processed since [`start`](Self::start).
  pub fn digest(&self) -> Option<ArrayVec<u8, 16>> {
    let mut out = ArrayVec::new();
    match &*lock(&self.hash) {
      HashState::None => return None,
      HashState::Md5(md5) => {
        out.try_extend_from_slice(&md5.clone().finalize()).ok()?
      }
      HashState::Crc(crc) => {
        out.try_extend_from_slice(&crc_finish(*crc).to_be_bytes()).ok()?
      }
      HashState::Checksum(sum) => {
        out.try_extend_from_slice(&sum.to_be_bytes()).ok()?
      }
    }
    Some(out)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::activity::Lowres;

  fn frame() -> Frame<u8> {
    let mut p = Plane::new(24, 20, 0, 0, 0, 0);
    let stride = p.cfg.stride;
    for (y, row) in p.data_origin_mut().chunks_mut(stride).take(20).enumerate()
    {
      for (x, px) in row[..24].iter_mut().enumerate() {
        *px = (x * 7 + y * 3) as u8;
      }
    }
    Frame::new(0, p, 16, Lowres::default())
  }

  #[test]
  fn rows_publish_progress() {
    let f = frame();
    let ff = FrameFilter::new(8, PictureHash::None);
    ff.start();
    ff.process_row(&CopyFilter, &f, 0);
    assert_eq!(f.recon_row_count.get(), 1);
    ff.process_row(&CopyFilter, &f, 1);
    assert!(f.is_reconstructed());
    assert_eq!(lock(&f.recon).p(23, 19), f.source.p(23, 19));
    assert_eq!(ff.digest(), None);
  }

  #[test]
  fn checksum_matches_direct_computation() {
    let f = frame();
    let ff = FrameFilter::new(8, PictureHash::Checksum);
    ff.start();
    ff.process_row(&CopyFilter, &f, 0);
    ff.process_row(&CopyFilter, &f, 1);
    let mut sum = 0u32;
    for y in 0..20usize {
      for x in 0..24usize {
        let mask = ((x & 0xff) ^ (y & 0xff) ^ (x >> 8) ^ (y >> 8)) as u32;
        sum = sum.wrapping_add(u32::from(f.source.p(x, y)) ^ mask);
      }
    }
    assert_eq!(ff.digest().unwrap().as_slice(), &sum.to_be_bytes());
  }

  #[test]
  fn md5_matches_whole_picture_digest() {
    let f = frame();
    let ff = FrameFilter::new(8, PictureHash::Md5);
    ff.start();
    ff.process_row(&CopyFilter, &f, 0);
    ff.process_row(&CopyFilter, &f, 1);
    let mut md5 = Md5::new();
    for y in 0..20 {
      md5.update(&f.source.row(y)[..24]);
    }
    assert_eq!(ff.digest().unwrap().as_slice(), md5.finalize().as_slice());
  }

  #[test]
  fn md5_of_wide_samples_is_little_endian() {
    let mut p = Plane::<u16>::new(16, 16, 0, 0, 0, 0);
    let stride = p.cfg.stride;
    for (y, row) in p.data_origin_mut().chunks_mut(stride).take(16).enumerate()
    {
      for (x, px) in row[..16].iter_mut().enumerate() {
        *px = (x * 61 + y * 37) as u16 & 0x3ff;
      }
    }
    let f = Frame::new(0, p, 16, Lowres::default());
    let ff = FrameFilter::new(10, PictureHash::Md5);
    ff.start();
    ff.process_row(&CopyFilter, &f, 0);
    let mut md5 = Md5::new();
    for y in 0..16 {
      for &px in &f.source.row(y)[..16] {
        md5.update(px.to_le_bytes());
      }
    }
    assert_eq!(ff.digest().unwrap().as_slice(), md5.finalize().as_slice());
  }

  #[test]
  fn crc_of_known_input() {
    // CRC-16/CCITT with augmented zero bits, initial value 0xffff.
    let crc =
      b"123456789".iter().fold(0xffff, |c, &b| crc_update(c, b.into()));
    assert_eq!(crc_finish(crc), 0xe5cc);
  }
}
