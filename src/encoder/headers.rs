// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::io;

use arrayvec::ArrayVec;
use bitstream_io::{BigEndian, BitWrite, BitWriter};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::api::{EncoderConfig, PictureHash};
use crate::frame::SliceType;
use crate::rate::BufferingPeriod;

/// Bit lengths of the HRD delay fields.
pub const INITIAL_CPB_REMOVAL_DELAY_LEN: u32 = 24;
pub const CPB_REMOVAL_DELAY_LEN: u32 = 24;
pub const DPB_OUTPUT_DELAY_LEN: u32 = 24;

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum NalUnitType {
  TRAIL_N = 0,
  TRAIL_R = 1,
  IDR_W_RADL = 19,
  CRA = 21,
  VPS = 32,
  SPS = 33,
  PPS = 34,
  ACCESS_UNIT_DELIMITER = 35,
  PREFIX_SEI = 39,
  SUFFIX_SEI = 40,
}

impl NalUnitType {
  /// Parses the type out of the first byte of a NAL unit header.
  pub fn from_header_byte(b: u8) -> Option<Self> {
    Self::from_u8((b >> 1) & 0x3f)
  }

  pub const fn is_parameter_set(self) -> bool {
    matches!(self, NalUnitType::VPS | NalUnitType::SPS | NalUnitType::PPS)
  }

  pub const fn is_sei(self) -> bool {
    matches!(self, NalUnitType::PREFIX_SEI | NalUnitType::SUFFIX_SEI)
  }
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SeiPayloadType {
  BufferingPeriod = 0,
  PictureTiming = 1,
  RecoveryPoint = 6,
  DecodedPictureHash = 132,
}

/// One serialized NAL unit, start code included.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Nal {
  pub nal_type: NalUnitType,
  pub data: Vec<u8>,
}

impl Nal {
  /// Length of the Annex-B start code in front of the unit.
  pub fn start_code_len(&self) -> usize {
    if self.data.starts_with(&[0, 0, 0, 1]) {
      4
    } else {
      3
    }
  }
}

/// Appends `src` to `dst`, inserting emulation prevention bytes.
fn escape_into(dst: &mut Vec<u8>, src: &[u8]) {
  let mut zeros = 0;
  for &b in src {
    if zeros >= 2 && b <= 3 {
      dst.push(3);
      zeros = 0;
    }
    dst.push(b);
    zeros = if b == 0 { zeros + 1 } else { 0 };
  }
}

/// Access unit under construction.
#[derive(Clone, Debug, Default)]
pub struct NalList {
  pub nals: Vec<Nal>,
  /// Escaped slice substreams waiting for their slice header.
  extra: Vec<u8>,
}

impl NalList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.nals.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nals.is_empty()
  }

  /// Wraps `rbsp` into a NAL unit. Any pending substreams are appended
  /// after it, already escaped.
  pub fn serialize(&mut self, nal_type: NalUnitType, rbsp: &[u8]) {
    let long_start = self.nals.is_empty() || nal_type.is_parameter_set();
    let mut data = Vec::with_capacity(rbsp.len() + self.extra.len() + 8);
    if long_start {
      data.push(0);
    }
    data.extend_from_slice(&[0, 0, 1]);
    data.push((nal_type as u8) << 1);
    data.push(1); // nuh_layer_id 0, nuh_temporal_id_plus1 1
    escape_into(&mut data, rbsp);
    data.append(&mut self.extra);
    // A unit may not end in a zero byte.
    if data.last() == Some(&0) {
      data.push(3);
    }
    self.nals.push(Nal { nal_type, data });
  }

  /// Escapes each substream for the next [`serialize`](Self::serialize)
  /// call and returns their escaped sizes, for the entry point offsets.
  pub fn serialize_substreams(&mut self, streams: &[&[u8]]) -> Vec<u32> {
    self.extra.clear();
    streams
      .iter()
      .map(|s| {
        let start = self.extra.len();
        escape_into(&mut self.extra, s);
        (self.extra.len() - start) as u32
      })
      .collect()
  }

  pub fn take_contents(&mut self, other: &mut NalList) {
    self.nals.append(&mut other.nals);
  }

  /// Concatenated Annex-B byte stream of all units.
  pub fn to_bytes(&self) -> Vec<u8> {
    self.nals.iter().flat_map(|n| n.data.iter().copied()).collect()
  }
}

pub trait ExpGolombWriter {
  fn write_ue(&mut self, v: u32) -> io::Result<()>;
  fn write_se(&mut self, v: i32) -> io::Result<()>;
}

impl<W: io::Write> ExpGolombWriter for BitWriter<W, BigEndian> {
  fn write_ue(&mut self, v: u32) -> io::Result<()> {
    let v1 = u64::from(v) + 1;
    let len = 63 - v1.leading_zeros();
    if len > 0 {
      self.write(len, 0u32)?;
    }
    self.write(len + 1, v1)
  }

  fn write_se(&mut self, v: i32) -> io::Result<()> {
    let mapped = if v > 0 { 2 * v as u32 - 1 } else { 2 * v.unsigned_abs() };
    self.write_ue(mapped)
  }
}

/// rbsp_trailing_bits() and friends.
pub trait TrailingBits {
  fn write_trailing_bits(&mut self) -> io::Result<()>;
}

impl<W: io::Write> TrailingBits for BitWriter<W, BigEndian> {
  fn write_trailing_bits(&mut self) -> io::Result<()> {
    self.write_bit(true)?;
    self.byte_align()
  }
}

fn rbsp<F>(f: F) -> io::Result<Vec<u8>>
where
  F: FnOnce(&mut BitWriter<&mut Vec<u8>, BigEndian>) -> io::Result<()>,
{
  let mut data = Vec::new();
  {
    let mut bw = BitWriter::endian(&mut data, BigEndian);
    f(&mut bw)?;
    bw.byte_align()?;
  }
  Ok(data)
}

/// Wraps one SEI payload into a message, rbsp trailing bits included.
fn sei_message<F>(payload_type: SeiPayloadType, f: F) -> io::Result<Vec<u8>>
where
  F: FnOnce(&mut BitWriter<&mut Vec<u8>, BigEndian>) -> io::Result<()>,
{
  let payload = rbsp(|bw| {
    f(bw)?;
    // sei payload alignment
    if !bw.byte_aligned() {
      bw.write_bit(true)?;
      bw.byte_align()?;
    }
    Ok(())
  })?;
  rbsp(|bw| {
    let mut t = payload_type as u32;
    while t >= 0xff {
      bw.write(8, 0xffu32)?;
      t -= 0xff;
    }
    bw.write(8, t)?;
    let mut size = payload.len();
    while size >= 0xff {
      bw.write(8, 0xffu32)?;
      size -= 0xff;
    }
    bw.write(8, size as u32)?;
    bw.write_bytes(&payload)?;
    bw.write_trailing_bits()
  })
}

pub fn write_aud(slice_type: SliceType) -> io::Result<Vec<u8>> {
  rbsp(|bw| {
    let pic_type: u32 = match slice_type {
      SliceType::I => 0,
      SliceType::P => 1,
      SliceType::B => 2,
    };
    bw.write(3, pic_type)?;
    bw.write_trailing_bits()
  })
}

pub fn write_recovery_point_sei() -> io::Result<Vec<u8>> {
  sei_message(SeiPayloadType::RecoveryPoint, |bw| {
    bw.write_se(0)?; // recovery_poc_cnt
    bw.write_bit(true)?; // exact_match_flag
    bw.write_bit(false) // broken_link_flag
  })
}

pub fn write_buffering_period_sei(bp: &BufferingPeriod) -> io::Result<Vec<u8>> {
  sei_message(SeiPayloadType::BufferingPeriod, |bw| {
    bw.write_ue(0)?; // bp_seq_parameter_set_id
    bw.write_bit(false)?; // irap_cpb_params_present_flag
    bw.write_bit(false)?; // concatenation_flag
    bw.write(CPB_REMOVAL_DELAY_LEN, 0u32)?; // au_cpb_removal_delay_delta_minus1
    bw.write(INITIAL_CPB_REMOVAL_DELAY_LEN, bp.initial_cpb_removal_delay)?;
    bw.write(
      INITIAL_CPB_REMOVAL_DELAY_LEN,
      bp.initial_cpb_removal_delay_offset,
    )
  })
}

/// Picture timing SEI fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureTiming {
  /// Present when field information is signaled.
  pub pic_struct: Option<u32>,
  /// `(au_cpb_removal_delay, pic_dpb_output_delay)` when HRD is signaled.
  pub hrd: Option<(u32, u32)>,
}

pub fn write_picture_timing_sei(pt: &PictureTiming) -> io::Result<Vec<u8>> {
  sei_message(SeiPayloadType::PictureTiming, |bw| {
    if let Some(pic_struct) = pt.pic_struct {
      bw.write(4, pic_struct)?;
      bw.write(2, 0u32)?; // source_scan_type
      bw.write_bit(false)?; // duplicate_flag
    }
    if let Some((cpb_removal, dpb_output)) = pt.hrd {
      bw.write(CPB_REMOVAL_DELAY_LEN, cpb_removal.saturating_sub(1))?;
      bw.write(DPB_OUTPUT_DELAY_LEN, dpb_output)?;
    }
    Ok(())
  })
}

pub fn write_picture_hash_sei(
  kind: PictureHash, digest: &ArrayVec<u8, 16>,
) -> io::Result<Vec<u8>> {
  sei_message(SeiPayloadType::DecodedPictureHash, |bw| {
    let hash_type: u32 = match kind {
      PictureHash::None => return Ok(()),
      PictureHash::Md5 => 0,
      PictureHash::Crc => 1,
      PictureHash::Checksum => 2,
    };
    bw.write(8, hash_type)?;
    bw.write_bytes(digest)
  })
}

/// Slice segment header fields this encoder signals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeader {
  pub nal_type: NalUnitType,
  pub pps_id: u32,
  pub slice_type: SliceType,
  pub slice_qp_delta: i32,
  /// Escaped sizes of all substreams; entry points are signaled for all
  /// but the last one.
  pub substream_sizes: Option<Vec<u32>>,
}

pub fn write_slice_header(sh: &SliceHeader) -> io::Result<Vec<u8>> {
  rbsp(|bw| {
    bw.write_bit(true)?; // first_slice_segment_in_pic_flag
    if matches!(sh.nal_type, NalUnitType::IDR_W_RADL | NalUnitType::CRA) {
      bw.write_bit(false)?; // no_output_of_prior_pics_flag
    }
    bw.write_ue(sh.pps_id)?;
    bw.write_ue(sh.slice_type as u32)?;
    bw.write_se(sh.slice_qp_delta)?;
    if let Some(sizes) = &sh.substream_sizes {
      let offsets = &sizes[..sizes.len().saturating_sub(1)];
      bw.write_ue(offsets.len() as u32)?;
      if !offsets.is_empty() {
        let max = offsets.iter().copied().max().unwrap_or(1).max(1);
        let bits = 32 - (max - 1).leading_zeros();
        let bits = bits.max(1);
        bw.write_ue(bits - 1)?; // offset_len_minus1
        for &o in offsets {
          bw.write(bits, o.saturating_sub(1))?;
        }
      }
    }
    bw.write_trailing_bits() // byte_alignment()
  })
}

/// Source of the parameter sets repeated in front of keyframes.
pub trait StreamHeaders: Send + Sync {
  /// # Errors
  ///
  /// Returns an error if a header could not be written.
  fn write_headers(&self, nals: &mut NalList) -> io::Result<()>;
}

/// Minimal VPS, SPS and PPS describing the luma-only stream produced by
/// this encoder.
#[derive(Clone, Debug)]
pub struct BasicStreamHeaders {
  pub width: u32,
  pub height: u32,
  pub bit_depth: u32,
  pub log2_ctu_size: u32,
  pub init_qp: i32,
  pub wavefront: bool,
  pub sao: bool,
}

impl BasicStreamHeaders {
  pub fn new(cfg: &EncoderConfig) -> Self {
    BasicStreamHeaders {
      width: cfg.width as u32,
      height: cfg.height as u32,
      bit_depth: cfg.bit_depth as u32,
      log2_ctu_size: cfg.ctu_size.trailing_zeros(),
      init_qp: cfg.rate_control.qp,
      wavefront: cfg.wavefront,
      sao: cfg.sao,
    }
  }
}

impl StreamHeaders for BasicStreamHeaders {
  fn write_headers(&self, nals: &mut NalList) -> io::Result<()> {
    let vps = rbsp(|bw| {
      bw.write(4, 0u32)?; // vps_video_parameter_set_id
      bw.write(6, 0u32)?; // vps_max_layers_minus1
      bw.write(3, 0u32)?; // vps_max_sub_layers_minus1
      bw.write_trailing_bits()
    })?;
    nals.serialize(NalUnitType::VPS, &vps);

    let sps = rbsp(|bw| {
      bw.write_ue(0)?; // sps_seq_parameter_set_id
      bw.write_ue(0)?; // chroma_format_idc, monochrome
      bw.write_ue(self.width)?;
      bw.write_ue(self.height)?;
      bw.write_ue(self.bit_depth - 8)?;
      bw.write_ue(self.log2_ctu_size - 3)?;
      bw.write_bit(self.sao)?;
      bw.write_trailing_bits()
    })?;
    nals.serialize(NalUnitType::SPS, &sps);

    let pps = rbsp(|bw| {
      bw.write_ue(0)?; // pps_pic_parameter_set_id
      bw.write_ue(0)?; // pps_seq_parameter_set_id
      bw.write_se(self.init_qp - 26)?;
      bw.write_bit(self.wavefront)?; // entropy_coding_sync_enabled_flag
      bw.write_trailing_bits()
    })?;
    nals.serialize(NalUnitType::PPS, &pps);
    Ok(())
  }
}
