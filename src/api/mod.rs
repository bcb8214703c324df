// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

/// Encoder Configuration
pub mod config;
/// Encoder session and frame encoder handles
pub mod context;

#[cfg(test)]
mod test;

pub use config::*;
pub use context::*;

use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};

use thiserror::Error;

use crate::encoder::headers::Nal;
use crate::frame::{Frame, SliceType};
use crate::stats::{FrameStats, RowStats};
use crate::util::Pixel;

/// Status that can be returned by [`FrameEncoder`] functions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum EncoderStatus {
  /// Generic fatal error, raised when a bitstream unit could not be
  /// written.
  #[error("failure")]
  Failure,
  /// The session was aborted after a frame failed or the rate control
  /// lost track of the encode order.
  ///
  /// Returned for the frame that failed and refused for every frame
  /// submitted afterwards.
  #[error("aborted")]
  Aborted,
  /// A frame is still being compressed or was not retrieved yet.
  ///
  /// Emitted by [`FrameEncoder::start_compress_frame()`] when called twice
  /// without [`FrameEncoder::get_encoded_picture()`] in between.
  #[error("frame pending")]
  FramePending,
  /// The frame encoder thread is gone.
  #[error("disconnected")]
  Disconnected,
}

impl From<io::Error> for EncoderStatus {
  fn from(e: io::Error) -> Self {
    log::error!("bitstream write failed: {}", e);
    EncoderStatus::Failure
  }
}

/// A compressed picture.
///
/// Hands the frame back together with the units of its access unit.
pub struct EncodedPicture<T: Pixel> {
  /// The compressed frame, reconstructed and ready to serve as a reference.
  pub frame: Arc<Frame<T>>,
  /// Slice type the frame was coded with.
  pub slice_type: SliceType,
  /// Position of the frame in encode order.
  pub encode_order: u64,
  /// The NAL units of the access unit, start codes included.
  pub nals: Vec<Nal>,
  /// Size of the access unit without SEI and start codes, in bits.
  pub access_unit_bits: u64,
  /// Size of every substream of the slice, in bytes.
  pub substream_sizes: Vec<u32>,
  /// Frame QP picked by the rate control.
  pub qp: i32,
  /// QP signaled in the slice header.
  pub slice_qp: i32,
  /// Statistics of every CTU row.
  pub row_stats: Vec<RowStats>,
  /// Statistics of the whole frame, filled in when gathering two-pass
  /// statistics.
  pub frame_stats: FrameStats,
  /// Number of times the rows were rolled back to meet the VBV.
  pub vbv_restarts: usize,
  /// Wall time spent compressing the frame.
  pub elapsed: Duration,
  /// Time spent by all workers coding rows.
  pub row_time: Duration,
}

impl<T: Pixel> EncodedPicture<T> {
  /// The access unit as an Annex B byte stream.
  pub fn data(&self) -> Vec<u8> {
    self.nals.iter().flat_map(|n| n.data.iter().copied()).collect()
  }
}

impl<T: Pixel> fmt::Debug for EncodedPicture<T> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("EncodedPicture")
      .field("poc", &self.frame.poc)
      .field("slice_type", &self.slice_type)
      .field("encode_order", &self.encode_order)
      .field("nals", &self.nals.len())
      .field("access_unit_bits", &self.access_unit_bits)
      .field("qp", &self.qp)
      .field("vbv_restarts", &self.vbv_restarts)
      .finish()
  }
}

impl<T: Pixel> fmt::Display for EncodedPicture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "POC {} - {} - qp {} - {} bits",
      self.frame.poc, self.slice_type, self.qp, self.access_unit_bits
    )
  }
}
