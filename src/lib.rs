// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! wfenc compresses the frames of a CTU based video encoder one CTU row per
//! worker, each row trailing the row above it by two CTUs.
//!
//! A session is an [`Encoder`], created from a [`Config`] and the
//! [`Collaborators`] that make the coding decisions, pick the quantizers and
//! filter the reconstruction. Each [`FrameEncoder`] of a session compresses
//! one frame at a time on its own thread; frames coded concurrently wait on
//! the reconstructed rows of their references.
//!
//! ```no_run
//! use std::sync::Arc;
//! use wfenc::frame::Slice;
//! use wfenc::util::Plane;
//! use wfenc::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let enc = EncoderConfig { width: 320, height: 240, ..Default::default() };
//! let cfg = Config::new().with_encoder_config(enc).with_threads(4);
//! let encoder = cfg.new_encoder::<u8>(Collaborators::from_config(&enc))?;
//! let mut fe = encoder.new_frame_encoder()?;
//!
//! let source = Plane::new(320, 240, 0, 0, 0, 0);
//! let frame = Arc::new(encoder.new_frame(0, source, None));
//! fe.start_compress_frame(frame, Slice::intra())?;
//! if let Some(pic) = fe.get_encoded_picture()? {
//!   println!("{}", pic);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(bare_trait_objects)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::verbose_bit_mask)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::many_single_char_names)]
#![warn(clippy::expl_impl_clone_on_copy)]
#![warn(clippy::linkedlist)]
#![warn(clippy::map_flatten)]
#![warn(clippy::mem_forget)]
#![warn(clippy::mut_mut)]
#![warn(clippy::mutex_integer)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_continue)]
#![warn(clippy::path_buf_push_overwrite)]
#![warn(clippy::range_plus_one)]

pub mod activity;
pub mod analysis;
pub mod ec;
pub mod encoder;
pub mod frame;
pub mod rate;
pub mod stats;
pub mod sync;
pub mod util;
pub mod wavefront;

mod api;

pub use crate::api::*;

/// Commonly used types and traits.
pub mod prelude {
  pub use crate::analysis::{AnalysisInput, CtuAnalyzer, CtuDecision};
  pub use crate::api::*;
  pub use crate::encoder::filter::LoopFilter;
  pub use crate::encoder::headers::StreamHeaders;
  pub use crate::frame::{Frame, Slice, SliceType};
  pub use crate::rate::{RateControl, RateControlEntry, RowCheckpoint};
  pub use crate::util::{Pixel, Plane};
}
