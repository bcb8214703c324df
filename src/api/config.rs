// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::fmt;
use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

use crate::api::{Collaborators, Encoder};
use crate::util::{Pixel, QP_MAX, QP_MIN};

/// A rational number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Rational {
  /// Numerator.
  pub num: u64,
  /// Denominator.
  pub den: u64,
}

impl Rational {
  /// Creates a rational number from the given numerator and denominator.
  pub const fn new(num: u64, den: u64) -> Self {
    Rational { num, den }
  }

  /// Returns a rational number that is the reciprocal of the given one.
  pub const fn from_reciprocal(reciprocal: Self) -> Self {
    Rational { num: reciprocal.den, den: reciprocal.num }
  }

  /// Returns the rational number as a floating-point number.
  pub fn as_f64(self) -> f64 {
    self.num as f64 / self.den as f64
  }
}

#[cfg(feature = "serialize")]
impl serde::Serialize for Rational {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    (self.num, self.den).serialize(serializer)
  }
}

#[cfg(feature = "serialize")]
impl<'a> serde::Deserialize<'a> for Rational {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'a>,
  {
    let (num, den) = serde::Deserialize::deserialize(deserializer)?;

    Ok(Rational::new(num, den))
  }
}

/// Enumeration of possible invalid configuration errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum InvalidConfig {
  /// The width is invalid.
  #[error("invalid width {0} (expected >= 1, <= 65535)")]
  InvalidWidth(usize),
  /// The height is invalid.
  #[error("invalid height {0} (expected >= 1, <= 65535)")]
  InvalidHeight(usize),
  /// The CTU size is invalid.
  #[error("invalid CTU size {0} (expected 16, 32 or 64)")]
  InvalidCtuSize(usize),
  /// The bit depth is invalid or does not fit the pixel type.
  #[error("invalid bit depth {0} for this pixel type")]
  InvalidBitDepth(usize),
  /// The base quantizer is out of range.
  #[error("invalid qp {0} (expected >= 0, <= 51)")]
  InvalidQp(i32),
  /// The AQ strength is invalid.
  #[error("invalid AQ strength (expected >= 0, <= 3)")]
  InvalidAqStrength,
  /// Framerate numerator is invalid.
  #[error("invalid framerate numerator {actual} (expected > 0, <= {max})")]
  InvalidFrameRateNum {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// Framerate denominator is invalid.
  #[error("invalid framerate denominator {actual} (expected > 0, <= {max})")]
  InvalidFrameRateDen {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// Only one of the VBV buffer size and maximum rate is set.
  #[error("VBV needs both a buffer size and a maximum bitrate")]
  VbvMismatch,
  /// The rate control needs a target bitrate in order to produce results
  #[error("The rate control requires a target bitrate")]
  TargetBitrateNeeded,
  /// The worker pool could not be created.
  #[error("unable to create the thread pool")]
  ThreadPool,
  /// The frame encoder thread could not be spawned.
  #[error("unable to spawn the frame encoder thread")]
  FrameThread,
}

/// Field order signaled in picture timing SEI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Interlace {
  /// Frames.
  #[default]
  Progressive,
  /// Fields, top field first.
  TopFieldFirst,
  /// Fields, bottom field first.
  BottomFieldFirst,
}

/// Hash of the reconstruction sent in a decoded picture hash SEI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PictureHash {
  /// No hash SEI.
  #[default]
  None,
  /// MD5 of the samples.
  Md5,
  /// 16 bit CRC.
  Crc,
  /// 32 bit position dependent checksum.
  Checksum,
}

impl fmt::Display for PictureHash {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let s = match self {
      PictureHash::None => "none",
      PictureHash::Md5 => "md5",
      PictureHash::Crc => "crc",
      PictureHash::Checksum => "checksum",
    };
    f.write_str(s)
  }
}

/// Rate control mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum RcMode {
  /// Constant QP.
  #[default]
  Cqp,
  /// Average bitrate.
  Abr,
}

/// Adaptive quantization mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum AqMode {
  /// No adaptive quantization.
  #[default]
  None,
  /// QP offsets from the block variance.
  Variance,
}

/// Rate control settings.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct RateControlConfig {
  /// Rate control mode.
  pub mode: RcMode,
  /// Base quantizer; also the initial QP signaled in the PPS.
  pub qp: i32,
  /// Target bitrate in kbps, for ABR.
  pub bitrate: u32,
  /// VBV buffer size in kbits, 0 disables VBV.
  pub vbv_buffer_size: u32,
  /// VBV maximum bitrate in kbps, 0 disables VBV.
  pub vbv_max_bitrate: u32,
  /// Adaptive quantization mode.
  pub aq_mode: AqMode,
  /// Adaptive quantization strength.
  pub aq_strength: f64,
  /// Use the CU-tree offsets for referenced frames.
  pub cu_tree: bool,
  /// Gather two-pass statistics.
  pub stat_write: bool,
}

impl Default for RateControlConfig {
  fn default() -> Self {
    RateControlConfig {
      mode: RcMode::Cqp,
      qp: 32,
      bitrate: 0,
      vbv_buffer_size: 0,
      vbv_max_bitrate: 0,
      aq_mode: AqMode::None,
      aq_strength: 1.0,
      cu_tree: false,
      stat_write: false,
    }
  }
}

impl RateControlConfig {
  /// VBV is enabled when both the buffer size and the maximum rate are set.
  pub const fn vbv_enabled(&self) -> bool {
    self.vbv_buffer_size > 0 && self.vbv_max_bitrate > 0
  }

  /// Whether QP offsets from the lowres analysis are applied.
  pub fn aq_enabled(&self) -> bool {
    self.aq_mode != AqMode::None && self.aq_strength > 0.
  }
}

/// Encoder settings which impact the produced bitstream.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EncoderConfig {
  /// Width of the frames in pixels.
  pub width: usize,
  /// Height of the frames in pixels.
  pub height: usize,
  /// Bit depth.
  pub bit_depth: usize,
  /// Size of the coding tree units, in luma samples.
  pub ctu_size: usize,
  /// Video time base.
  pub time_base: Rational,
  /// Code the rows as wavefront substreams.
  pub wavefront: bool,
  /// Sample adaptive offset.
  pub sao: bool,
  /// Gather SAO statistics from pixels before deblocking.
  pub sao_non_deblocked: bool,
  /// Deblocking.
  pub loop_filter: bool,
  /// Full pel motion search range.
  pub search_range: usize,
  /// Emit an access unit delimiter in front of every picture.
  pub access_unit_delimiters: bool,
  /// Repeat the parameter sets in front of every keyframe.
  pub repeat_headers: bool,
  /// Emit buffering period and picture timing SEI.
  pub emit_hrd_sei: bool,
  /// Field signaling.
  pub interlace: Interlace,
  /// Decoded picture hash SEI.
  pub picture_hash: PictureHash,
  /// Noise reduction strength, 0 disables it.
  pub noise_reduction: u32,
  /// Weighted prediction for P slices.
  pub weighted_pred: bool,
  /// Weighted prediction for B slices.
  pub weighted_bipred: bool,
  /// Number of pictures preceding any picture in decoding order and
  /// following it in output order.
  pub num_reorder_pics: u32,
  /// Rate control.
  pub rate_control: RateControlConfig,
}

impl Default for EncoderConfig {
  fn default() -> Self {
    EncoderConfig {
      width: 640,
      height: 480,
      bit_depth: 8,
      ctu_size: 64,
      time_base: Rational { num: 1, den: 30 },
      wavefront: true,
      sao: false,
      sao_non_deblocked: false,
      loop_filter: true,
      search_range: 57,
      access_unit_delimiters: false,
      repeat_headers: true,
      emit_hrd_sei: false,
      interlace: Interlace::Progressive,
      picture_hash: PictureHash::None,
      noise_reduction: 0,
      weighted_pred: true,
      weighted_bipred: false,
      num_reorder_pics: 0,
      rate_control: RateControlConfig::default(),
    }
  }
}

impl EncoderConfig {
  /// Frames per second.
  pub fn frame_rate(&self) -> f64 {
    Rational::from_reciprocal(self.time_base).as_f64()
  }
}

/// Contains the encoder configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
  /// Settings which impact the produced bitstream.
  pub(crate) enc: EncoderConfig,
  /// The number of threads in the threadpool.
  pub(crate) threads: usize,
  /// Shared thread pool
  pub(crate) pool: Option<Arc<ThreadPool>>,
}

impl Config {
  /// Create a default configuration
  ///
  /// same as `Default::default()`
  pub fn new() -> Self {
    Config::default()
  }

  /// Set the encoder configuration
  ///
  /// `EncoderConfig` contains the settings impacting the
  /// codec features used in the produced bitstream.
  pub const fn with_encoder_config(mut self, enc: EncoderConfig) -> Self {
    self.enc = enc;
    self
  }

  /// Set the number of workers in the threadpool
  ///
  /// `1` runs the rows sequentially on the frame encoder threads, `0` lets
  /// rayon size the pool.
  pub const fn with_threads(mut self, threads: usize) -> Self {
    self.threads = threads;
    self
  }

  /// Use the provided threadpool
  ///
  /// It takes priority over `with_threads()`
  pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
    self.pool = Some(pool);
    self
  }

  /// The encoder settings.
  pub const fn encoder_config(&self) -> &EncoderConfig {
    &self.enc
  }

  /// Create a new threadpool with this configuration if set,
  /// or return `None` if the rows should run without a pool.
  pub(crate) fn new_thread_pool(
    &self,
  ) -> Result<Option<Arc<ThreadPool>>, InvalidConfig> {
    if let Some(ref p) = self.pool {
      return Ok(Some(p.clone()));
    }
    match self.threads {
      1 => Ok(None),
      n => {
        let mut builder = ThreadPoolBuilder::new()
          .thread_name(|i| format!("wfenc-worker-{}", i));
        if n != 0 {
          builder = builder.num_threads(n);
        }
        let pool = builder.build().map_err(|e| {
          log::warn!("unable to create the thread pool: {}", e);
          InvalidConfig::ThreadPool
        })?;
        Ok(Some(Arc::new(pool)))
      }
    }
  }

  /// Creates an [`Encoder`] session with this configuration.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig` if the config is invalid.
  pub fn new_encoder<T: Pixel>(
    &self, collab: Collaborators<T>,
  ) -> Result<Arc<Encoder<T>>, InvalidConfig> {
    self.validate()?;
    if 8 * std::mem::size_of::<T>() < self.enc.bit_depth {
      return Err(InvalidConfig::InvalidBitDepth(self.enc.bit_depth));
    }
    let pool = self.new_thread_pool()?;
    Ok(Arc::new(Encoder::new(self.enc, collab, pool)))
  }

  /// Validates the configuration.
  ///
  /// # Errors
  ///
  /// - Returns `InvalidConfig` if any setting is out of range.
  pub fn validate(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    let config = &self.enc;

    if config.width < 1 || config.width > u16::MAX as usize {
      return Err(InvalidWidth(config.width));
    }
    if config.height < 1 || config.height > u16::MAX as usize {
      return Err(InvalidHeight(config.height));
    }
    if ![16, 32, 64].contains(&config.ctu_size) {
      return Err(InvalidCtuSize(config.ctu_size));
    }
    if ![8, 10].contains(&config.bit_depth) {
      return Err(InvalidBitDepth(config.bit_depth));
    }

    // This is a hack to make sure the frame rate stays representable in the
    // HRD timing fields.
    let limit = u32::MAX as u64;
    if config.time_base.num == 0 || config.time_base.num > limit {
      return Err(InvalidFrameRateDen {
        actual: config.time_base.num,
        max: limit,
      });
    }
    if config.time_base.den == 0 || config.time_base.den > limit {
      return Err(InvalidFrameRateNum {
        actual: config.time_base.den,
        max: limit,
      });
    }

    let rc = &config.rate_control;
    if rc.qp < QP_MIN || rc.qp > QP_MAX {
      return Err(InvalidQp(rc.qp));
    }
    if !(0.0..=3.0).contains(&rc.aq_strength) {
      return Err(InvalidAqStrength);
    }
    if (rc.vbv_buffer_size > 0) != (rc.vbv_max_bitrate > 0) {
      return Err(VbvMismatch);
    }
    if rc.mode == RcMode::Abr && rc.bitrate == 0 {
      return Err(TargetBitrateNeeded);
    }

    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn default_is_valid() {
    assert_eq!(Config::new().validate(), Ok(()));
  }

  #[test]
  fn rejects_bad_settings() {
    let check = |f: &dyn Fn(&mut EncoderConfig)| {
      let mut enc = EncoderConfig::default();
      f(&mut enc);
      Config::new().with_encoder_config(enc).validate()
    };
    assert_eq!(check(&|e| e.width = 0), Err(InvalidConfig::InvalidWidth(0)));
    assert_eq!(check(&|e| e.height = 0), Err(InvalidConfig::InvalidHeight(0)));
    assert_eq!(
      check(&|e| e.ctu_size = 8),
      Err(InvalidConfig::InvalidCtuSize(8))
    );
    assert_eq!(
      check(&|e| e.rate_control.qp = 52),
      Err(InvalidConfig::InvalidQp(52))
    );
    assert_eq!(
      check(&|e| e.rate_control.vbv_buffer_size = 1000),
      Err(InvalidConfig::VbvMismatch)
    );
    assert_eq!(
      check(&|e| e.rate_control.mode = RcMode::Abr),
      Err(InvalidConfig::TargetBitrateNeeded)
    );
    assert!(matches!(
      check(&|e| e.time_base = Rational::new(1, 0)),
      Err(InvalidConfig::InvalidFrameRateNum { .. })
    ));
  }

  #[test]
  fn single_thread_means_no_pool() {
    let cfg = Config::new().with_threads(1);
    assert!(cfg.new_thread_pool().unwrap().is_none());
    let cfg = Config::new().with_threads(2);
    let pool = cfg.new_thread_pool().unwrap().unwrap();
    assert_eq!(pool.current_num_threads(), 2);
  }

  #[test]
  fn vbv_needs_both_values() {
    let mut rc = RateControlConfig::default();
    rc.vbv_buffer_size = 100;
    assert!(!rc.vbv_enabled());
    rc.vbv_max_bitrate = 100;
    assert!(rc.vbv_enabled());
  }
}
