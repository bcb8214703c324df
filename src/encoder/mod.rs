// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

pub mod filter;
pub mod headers;
pub mod noise;
pub mod reference;
mod row;
pub mod row_state;
mod scheduler;
mod vbv;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use itertools::Itertools;
use rayon::ThreadPool;

use crate::api::{
  Collaborators, EncodedPicture, Encoder, EncoderConfig, EncoderStatus,
  Interlace, RcMode,
};
use crate::ec::{EntropyContext, RowCoder};
use crate::frame::{Frame, RowDiagnostics, Slice, SliceType};
use crate::rate::{BufferingPeriod, RateControlEntry};
use crate::stats::{FrameStats, RowStats};
use crate::sync::Event;
use crate::util::*;
use crate::wavefront::WaveFront;

use self::filter::FrameFilter;
use self::headers::*;
use self::noise::NoiseReduction;
use self::reference::{disable_weights, weight_analyse, MotionReference};
use self::row_state::CtuRow;

/// Row trigger value meaning no VBV restart happened in this frame.
const NO_TRIGGER_ROW: usize = usize::MAX;

/// Per frame encoder constants derived from the configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameParams {
  pub num_rows: usize,
  pub num_cols: usize,
  pub ctu_size: usize,
  pub bit_depth: usize,
  /// Rows the loop filter trails the row encoders by.
  pub filter_row_delay: usize,
  /// Rows of every reference that have to be reconstructed beyond the row
  /// being coded.
  pub ref_lag_rows: usize,
  pub wavefront: bool,
  pub sao: bool,
  pub sao_non_deblocked: bool,
  pub vbv: bool,
  pub aq: bool,
  pub cu_tree: bool,
  pub stat_write: bool,
  pub abr: bool,
  /// Integer frame rate, for the ABR progress report schedule.
  pub fps: u64,
}

impl FrameParams {
  pub fn new(cfg: &EncoderConfig) -> Self {
    let ctu_size = cfg.ctu_size;
    let filter_row_delay = if cfg.sao && cfg.sao_non_deblocked {
      2
    } else if cfg.sao || cfg.loop_filter {
      1
    } else {
      0
    };

    let range = cfg.search_range // full pel search
      + 1 // diamond search range check lag
      + 2 // subpel refine
      + NTAPS_LUMA / 2; // subpel filter half-length
    let ref_lag_rows = 1 + ctu_count(range, ctu_size);

    let rc = &cfg.rate_control;
    FrameParams {
      num_rows: ctu_count(cfg.height, ctu_size),
      num_cols: ctu_count(cfg.width, ctu_size),
      ctu_size,
      bit_depth: cfg.bit_depth,
      filter_row_delay,
      ref_lag_rows,
      wavefront: cfg.wavefront,
      sao: cfg.sao,
      sao_non_deblocked: cfg.sao_non_deblocked,
      vbv: rc.vbv_enabled(),
      aq: rc.aq_enabled(),
      cu_tree: rc.cu_tree,
      stat_write: rc.stat_write,
      abr: rc.mode == RcMode::Abr,
      fps: cfg.frame_rate().round().max(1.) as u64,
    }
  }

  pub const fn num_substreams(&self) -> usize {
    if self.wavefront {
      self.num_rows
    } else {
      1
    }
  }
}

/// Everything the row workers of one frame share.
pub(crate) struct FrameState<T: Pixel> {
  pub frame: Arc<Frame<T>>,
  pub slice: Slice<T>,
  pub mrefs: [Vec<MotionReference<T>>; 2],
  pub params: FrameParams,
  pub collab: Collaborators<T>,
  pub filter: Arc<FrameFilter>,
  pub nr: Option<Arc<Mutex<NoiseReduction>>>,
  pub pool: Option<Arc<ThreadPool>>,
  /// Row workers run on the pool; otherwise rows are processed in line.
  pub parallel: bool,
  pub rows: Vec<CtuRow>,
  /// Encode jobs are `2 * row`, filter jobs `2 * row + 1`.
  pub wave: WaveFront,
  pub init_ctx: EntropyContext,
  pub slice_qp: i32,
  pub avg_qp_rc: f64,
  pub rce: Mutex<RateControlEntry>,
  pub all_rows_stop: AtomicBool,
  pub vbv_reset_trigger_row: AtomicUsize,
  pub vbv_restarts: AtomicUsize,
  pub completion: Event,
  /// Nanoseconds spent by workers inside row encoders.
  pub row_time: AtomicU64,
}

impl<T: Pixel> FrameState<T> {
  #[inline]
  pub fn trigger_row(&self) -> usize {
    self.vbv_reset_trigger_row.load(Ordering::SeqCst)
  }

  #[inline]
  pub fn all_rows_stopped(&self) -> bool {
    self.all_rows_stop.load(Ordering::SeqCst)
  }

  /// Re-codes every CTU from its stored decisions, with the SAO syntax in
  /// front, into the final substreams.
  fn encode_slice(&self) -> Vec<Vec<u8>> {
    let p = &self.params;
    let mut coders = (0..p.num_substreams())
      .map(|_| RowCoder::new(self.init_ctx.clone()))
      .collect_vec();
    let mut saved = vec![self.init_ctx.clone(); p.num_rows];
    for (row, ctu_row) in self.rows.iter().enumerate() {
      let work = lock(&ctu_row.work);
      let coder = &mut coders[row % p.num_substreams()];
      for col in 0..p.num_cols {
        // Synchronize with the row above at the start of a line.
        if p.wavefront && col == 0 && row > 0 {
          coder.load_contexts(&saved[row - 1]);
        }
        let mut bins =
          self.collab.loop_filter.sao_syntax(&self.frame, row, col);
        bins.extend_from_slice(&work.bins[col]);
        coder.encode_ctu(&bins);
        if p.wavefront {
          if col == 1 {
            saved[row].clone_from(coder.context());
          }
          if col == p.num_cols - 1 {
            coder.finish_slice();
          }
        }
      }
    }
    if !p.wavefront {
      coders[0].finish_slice();
    }
    coders.into_iter().map(|c| c.bytes().to_vec()).collect()
  }

  /// Substreams as left behind by the row coders.
  fn row_substreams(&self) -> Vec<Vec<u8>> {
    self.rows[..self.params.num_substreams()]
      .iter()
      .map(|r| lock(&r.coder).bytes().to_vec())
      .collect()
  }
}

/// Compresses the frames handed to one frame encoder, one at a time.
pub(crate) struct FrameCompressor<T: Pixel> {
  encoder: Arc<Encoder<T>>,
  params: FrameParams,
  filter: Arc<FrameFilter>,
  nr: Option<Arc<Mutex<NoiseReduction>>>,
}

impl<T: Pixel> FrameCompressor<T> {
  pub fn new(encoder: Arc<Encoder<T>>) -> Self {
    let cfg = &encoder.config;
    let params = FrameParams::new(cfg);
    let filter = Arc::new(FrameFilter::new(cfg.bit_depth, cfg.picture_hash));
    let nr = (cfg.noise_reduction > 0)
      .then(|| Arc::new(Mutex::new(NoiseReduction::new(cfg.noise_reduction))));
    FrameCompressor { encoder, params, filter, nr }
  }

  pub const fn params(&self) -> &FrameParams {
    &self.params
  }

  /// Runs one frame end to end: leading units, rate control, the CTU
  /// rows, slice assembly and the rate control report.
  ///
  /// Any failure aborts the session: the frames after this one in encode
  /// order would otherwise wait forever for its rate control turn or its
  /// reconstruction.
  ///
  /// # Errors
  ///
  /// `Failure` when a unit could not be written, `Aborted` when the rate
  /// control rejected the frame or the session is over.
  #[profiling::function]
  pub fn compress_frame(
    &mut self, frame: Arc<Frame<T>>, slice: Slice<T>, encode_order: u64,
  ) -> Result<EncodedPicture<T>, EncoderStatus> {
    let failed = Arc::clone(&frame);
    self.encode_frame(frame, slice, encode_order).map_err(|e| {
      if !self.encoder.is_aborted() {
        log::error!("POC {} failed, aborting: {}", failed.poc, e);
        self.encoder.abort();
      }
      failed.abandon();
      e
    })
  }

  fn encode_frame(
    &mut self, frame: Arc<Frame<T>>, mut slice: Slice<T>, encode_order: u64,
  ) -> Result<EncodedPicture<T>, EncoderStatus> {
    let start_time = Instant::now();
    // The references are released however the frame ends.
    let refs = slice.hold_references();
    let enc = Arc::clone(&self.encoder);
    let cfg = &*enc.config;
    let p = self.params;
    let rc = Arc::clone(&enc.collab.rate_control);
    let mut nals = NalList::new();

    // The delimiter has to be the first unit of the access unit, so the
    // very first one is skipped unless headers are repeated.
    if cfg.access_unit_delimiters && (frame.poc != 0 || cfg.repeat_headers) {
      nals.serialize(
        NalUnitType::ACCESS_UNIT_DELIMITER,
        &write_aud(slice.slice_type)?,
      );
    }
    if slice.is_keyframe && cfg.repeat_headers {
      enc.collab.headers.write_headers(&mut nals)?;
    }

    let use_weights = match slice.slice_type {
      SliceType::P => cfg.weighted_pred,
      SliceType::B => cfg.weighted_bipred,
      SliceType::I => false,
    };
    if use_weights {
      weight_analyse(&mut slice, &frame.source);
    } else {
      disable_weights(&mut slice);
    }
    let mrefs: [Vec<MotionReference<T>>; 2] = std::array::from_fn(|l| {
      if l >= slice.slice_type.num_pred_dirs() {
        return Vec::new();
      }
      slice.ref_pic_list[l]
        .iter()
        .zip(&slice.weights[l])
        .map(|(f, &w)| MotionReference::new(Arc::clone(f), w, p.bit_depth))
        .collect()
    });

    let mut rce = RateControlEntry::new(
      encode_order,
      frame.poc,
      slice.slice_type,
      slice.is_keyframe,
      frame.lowres.satd_cost,
    );
    // May block until the frames before this one in encode order ended.
    let qp = rc.start(&mut rce);
    if enc.is_aborted() {
      return Err(EncoderStatus::Aborted);
    }
    rce.new_qp = qp;
    let slice_qp = clamp(qp, -qp_bd_offset(p.bit_depth), QP_MAX);
    let init_ctx = EntropyContext::new(slice_qp, slice.slice_type);

    self.filter.start();
    for (r, d) in lock(&frame.row_diag).iter_mut().enumerate() {
      *d = RowDiagnostics {
        planned_satd: frame.lowres.row_cost(p.ctu_size, r),
        ..Default::default()
      };
    }

    if slice.is_keyframe {
      if cfg.emit_hrd_sei {
        let mut bp = BufferingPeriod::default();
        rc.hrd_fullness(&mut bp);
        nals.serialize(
          NalUnitType::PREFIX_SEI,
          &write_buffering_period_sei(&bp)?,
        );
        enc.last_bp_sei.store(encode_order, Ordering::SeqCst);
      }
      // Nothing references pictures before the keyframe, so every picture
      // following it in output order is decodable.
      nals.serialize(NalUnitType::PREFIX_SEI, &write_recovery_point_sei()?);
    }

    if cfg.emit_hrd_sei || cfg.interlace != Interlace::Progressive {
      let odd = frame.poc & 1 != 0;
      let pic_struct = match cfg.interlace {
        Interlace::Progressive => None,
        Interlace::TopFieldFirst => Some(if odd { 2 } else { 1 }),
        Interlace::BottomFieldFirst => Some(if odd { 1 } else { 2 }),
      };
      let hrd = cfg.emit_hrd_sei.then(|| {
        let since_bp =
          encode_order.saturating_sub(enc.last_bp_sei.load(Ordering::SeqCst));
        let cpb_removal = since_bp.clamp(1, 1 << CPB_REMOVAL_DELAY_LEN);
        let dpb_output = (i64::from(cfg.num_reorder_pics) + frame.poc as i64
          - encode_order as i64)
          .max(0);
        (cpb_removal as u32, dpb_output as u32)
      });
      nals.serialize(
        NalUnitType::PREFIX_SEI,
        &write_picture_timing_sei(&PictureTiming { pic_struct, hrd })?,
      );
    }

    let avg_qp_rc = rce.avg_qp_rc;
    let parallel = enc.pool.is_some() && p.wavefront;
    let state = Arc::new(FrameState {
      rows: (0..p.num_rows).map(|_| CtuRow::new(&init_ctx, p.num_cols)).collect(),
      wave: WaveFront::new(p.num_rows * 2),
      frame: Arc::clone(&frame),
      slice,
      mrefs,
      params: p,
      collab: enc.collab.clone(),
      filter: Arc::clone(&self.filter),
      nr: self.nr.clone(),
      pool: enc.pool.clone(),
      parallel,
      init_ctx,
      slice_qp,
      avg_qp_rc,
      rce: Mutex::new(rce),
      all_rows_stop: AtomicBool::new(false),
      vbv_reset_trigger_row: AtomicUsize::new(NO_TRIGGER_ROW),
      vbv_restarts: AtomicUsize::new(0),
      completion: Event::new(),
      row_time: AtomicU64::new(0),
    });

    // Most of the work happens here.
    state.compress_ctu_rows();

    let row_stats =
      state.rows.iter().map(|r| lock(&r.work).stats).collect_vec();
    let frame_stats = if p.stat_write {
      let total_cus =
        row_stats.iter().map(|s| s.intra_cus + s.inter_cus + s.skip_cus).sum();
      FrameStats::aggregate(&row_stats, total_cus)
    } else {
      FrameStats::default()
    };

    let substreams =
      if p.sao { state.encode_slice() } else { state.row_substreams() };
    let sizes = nals
      .serialize_substreams(&substreams.iter().map(Vec::as_slice).collect_vec());
    let nal_type = if state.slice.is_keyframe {
      NalUnitType::IDR_W_RADL
    } else {
      NalUnitType::TRAIL_R
    };
    let header = SliceHeader {
      nal_type,
      pps_id: state.slice.pps_id,
      slice_type: state.slice.slice_type,
      slice_qp_delta: slice_qp - cfg.rate_control.qp,
      substream_sizes: p.wavefront.then(|| sizes.clone()),
    };
    nals.serialize(nal_type, &write_slice_header(&header)?);

    if let Some(digest) = self.filter.digest() {
      nals.serialize(
        NalUnitType::SUFFIX_SEI,
        &write_picture_hash_sei(cfg.picture_hash, &digest)?,
      );
    }

    // SEI and start codes do not count against the rate.
    let access_unit_bits = 8
      * nals
        .nals
        .iter()
        .filter(|n| !n.nal_type.is_sei())
        .map(|n| (n.data.len() - n.start_code_len()) as u64)
        .sum::<u64>();

    let elapsed = start_time.elapsed();
    let mut rce = lock(&state.rce).clone();
    // May block until the frames before this one in encode order ended.
    let ended = rc.end(&mut rce, access_unit_bits, &frame_stats);
    if let Err(e) = &ended {
      log::error!("rate control failed on POC {}: {}", frame.poc, e);
    }

    if let Some(nr) = &self.nr {
      lock(nr).update();
    }

    // Let the reference frames be recycled.
    drop(refs);

    if ended.is_err() {
      return Err(EncoderStatus::Aborted);
    }

    log::debug!(
      "POC {} ({}) qp {} {} bits in {:.2?}, {} VBV restarts",
      frame.poc,
      state.slice.slice_type,
      rce.new_qp,
      access_unit_bits,
      elapsed,
      state.vbv_restarts.load(Ordering::SeqCst)
    );

    Ok(EncodedPicture {
      frame,
      slice_type: state.slice.slice_type,
      encode_order,
      nals: nals.nals,
      access_unit_bits,
      substream_sizes: sizes,
      qp: rce.new_qp,
      slice_qp,
      row_stats,
      frame_stats,
      vbv_restarts: state.vbv_restarts.load(Ordering::SeqCst),
      elapsed,
      row_time: Duration::from_nanos(state.row_time.load(Ordering::SeqCst)),
    })
  }
}
