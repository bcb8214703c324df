// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver};

use interpolate_name::interpolate_test;
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

use crate::analysis::{ActivityAnalyzer, AnalysisInput, CtuAnalyzer, CtuDecision};
use crate::api::*;
use crate::ec::EntropyContext;
use crate::encoder::headers::{NalList, NalUnitType, StreamHeaders};
use crate::encoder::FrameParams;
use crate::frame::{RowDiagnostics, Slice, SliceType};
use crate::rate::{RateControl, RateControlEntry, RateControlError, RowCheckpoint};
use crate::stats::FrameStats;
use crate::util::Plane;

fn noise_plane(w: usize, h: usize, seed: u64) -> Plane<u8> {
  let mut rng = ChaChaRng::seed_from_u64(seed);
  let mut p = Plane::new(w, h, 0, 0, 0, 0);
  let stride = p.cfg.stride;
  for (y, row) in p.data_origin_mut().chunks_mut(stride).take(h).enumerate() {
    for (x, px) in row[..w].iter_mut().enumerate() {
      // A gradient with some texture, so CTUs differ.
      let base = ((x + 2 * y) % 200) as u8;
      *px = base.wrapping_add(rng.gen_range(0..24));
    }
  }
  p
}

fn setup_config(
  w: usize, h: usize, ctu_size: usize, threads: usize, wavefront: bool,
) -> Config {
  let enc = EncoderConfig {
    width: w,
    height: h,
    ctu_size,
    wavefront,
    ..Default::default()
  };
  Config::new().with_encoder_config(enc).with_threads(threads)
}

/// What the analyzer saw, in call order.
#[derive(Clone, Debug, PartialEq)]
enum Event {
  Start(usize, usize),
  End(usize, usize),
}

/// Runs the reference analyzer and records every call.
struct RecordingAnalyzer {
  inner: ActivityAnalyzer,
  events: Mutex<Vec<Event>>,
  contexts: Mutex<HashMap<(usize, usize), EntropyContext>>,
  calls: AtomicUsize,
  /// Time spent on each CTU, so the rows of a pool overlap.
  delay: Option<Duration>,
}

impl RecordingAnalyzer {
  fn new() -> Self {
    RecordingAnalyzer {
      inner: ActivityAnalyzer::new(8),
      events: Mutex::new(Vec::new()),
      contexts: Mutex::new(HashMap::new()),
      calls: AtomicUsize::new(0),
      delay: None,
    }
  }

  fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }
}

impl CtuAnalyzer<u8> for RecordingAnalyzer {
  fn compress_ctu(&self, input: &AnalysisInput<'_, u8>) -> CtuDecision {
    let (row, col) = (input.row, input.col);
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.events.lock().unwrap().push(Event::Start(row, col));
    self.contexts.lock().unwrap().insert((row, col), input.ctx.clone());
    if let Some(delay) = self.delay {
      thread::sleep(delay);
    }
    let d = self.inner.compress_ctu(input);
    self.events.lock().unwrap().push(Event::End(row, col));
    d
  }
}

/// Fixed QP, asking once for a re-encode at the checkpoint of `row`.
struct RestartOnce {
  qp: i32,
  row: usize,
  /// QP change asked for with the re-encode.
  step: f64,
  fired: AtomicBool,
  checkpoints: Mutex<Vec<(usize, f64)>>,
}

impl RestartOnce {
  fn new(qp: i32, row: usize) -> Self {
    RestartOnce {
      qp,
      row,
      step: 4.,
      fired: AtomicBool::new(false),
      checkpoints: Mutex::new(Vec::new()),
    }
  }

  fn with_step(mut self, step: f64) -> Self {
    self.step = step;
    self
  }
}

impl RateControl for RestartOnce {
  fn start(&self, rce: &mut RateControlEntry) -> i32 {
    rce.new_qp = self.qp;
    rce.avg_qp_rc = f64::from(self.qp);
    self.qp
  }

  fn row_checkpoint(
    &self, _rce: &mut RateControlEntry, row: usize, _rows: &[RowDiagnostics],
    qp: f64,
  ) -> RowCheckpoint {
    self.checkpoints.lock().unwrap().push((row, qp));
    if row == self.row && !self.fired.swap(true, Ordering::SeqCst) {
      RowCheckpoint::Reencode(qp + self.step)
    } else {
      RowCheckpoint::Continue
    }
  }

  fn end(
    &self, rce: &mut RateControlEntry, bits: u64, _stats: &FrameStats,
  ) -> Result<(), RateControlError> {
    rce.frame_bits = bits;
    Ok(())
  }
}

/// Fails the accounting of every frame.
struct BrokenRateControl;

impl RateControl for BrokenRateControl {
  fn start(&self, rce: &mut RateControlEntry) -> i32 {
    rce.avg_qp_rc = 30.;
    30
  }

  fn row_checkpoint(
    &self, _rce: &mut RateControlEntry, _row: usize, _rows: &[RowDiagnostics],
    _qp: f64,
  ) -> RowCheckpoint {
    RowCheckpoint::Continue
  }

  fn end(
    &self, rce: &mut RateControlEntry, _bits: u64, _stats: &FrameStats,
  ) -> Result<(), RateControlError> {
    Err(RateControlError::OutOfOrder(rce.encode_order))
  }
}

/// Checks at every CTU that the references reconstructed the rows the
/// motion search of its row may reach.
struct ReferenceRowsChecker {
  inner: ActivityAnalyzer,
  lag: usize,
  delay: Duration,
  violations: AtomicUsize,
  /// CTUs started while a reference was still being reconstructed.
  overlapped: AtomicUsize,
}

impl CtuAnalyzer<u8> for ReferenceRowsChecker {
  fn compress_ctu(&self, input: &AnalysisInput<'_, u8>) -> CtuDecision {
    for (_, _, refpic) in input.slice.references() {
      let total = refpic.geom.num_rows;
      let done = refpic.recon_row_count.get();
      if done != total {
        self.overlapped.fetch_add(1, Ordering::SeqCst);
        if done < input.row + self.lag {
          self.violations.fetch_add(1, Ordering::SeqCst);
        }
      }
    }
    thread::sleep(self.delay);
    self.inner.compress_ctu(input)
  }
}

/// Fails to write the parameter sets once `release` fires.
struct FailingHeaders {
  release: Receiver<()>,
}

impl StreamHeaders for FailingHeaders {
  fn write_headers(&self, _nals: &mut NalList) -> std::io::Result<()> {
    self.release.recv().ok();
    Err(std::io::Error::new(std::io::ErrorKind::Other, "no parameter sets"))
  }
}

fn encode_intra(
  cfg: &Config, collab: Collaborators<u8>, seed: u64,
) -> EncodedPicture<u8> {
  let enc = cfg.new_encoder(collab).unwrap();
  let e = enc.config();
  let frame = Arc::new(enc.new_frame(0, noise_plane(e.width, e.height, seed), None));
  let mut fe = enc.new_frame_encoder().unwrap();
  fe.start_compress_frame(frame, Slice::intra()).unwrap();
  fe.get_encoded_picture().unwrap().unwrap()
}

#[interpolate_test(sequential_wpp, 1, true)]
#[interpolate_test(parallel_wpp, 4, true)]
#[interpolate_test(sequential_single_substream, 1, false)]
#[interpolate_test(parallel_single_substream, 4, false)]
fn every_ctu_is_coded_once(threads: usize, wavefront: bool) {
  let cfg = setup_config(256, 256, 64, threads, wavefront);
  let analyzer = Arc::new(RecordingAnalyzer::new());
  let collab = Collaborators::<u8>::from_config(cfg.encoder_config())
    .with_analyzer(analyzer.clone());
  let pic = encode_intra(&cfg, collab, 1);

  assert_eq!(analyzer.calls.load(Ordering::SeqCst), 16);
  assert_eq!(pic.row_stats.iter().map(|s| s.ctus).collect::<Vec<_>>(), [4; 4]);
  assert_eq!(pic.substream_sizes.len(), if wavefront { 4 } else { 1 });
  assert_eq!(pic.vbv_restarts, 0);
  assert!(pic.frame.is_reconstructed());
  assert_eq!(pic.nals.last().unwrap().nal_type, NalUnitType::IDR_W_RADL);
}

#[interpolate_test(sequential, 1)]
#[interpolate_test(parallel, 4)]
fn rows_trail_the_row_above(threads: usize) {
  let cfg = setup_config(320, 192, 64, threads, true);
  let analyzer = Arc::new(RecordingAnalyzer::new());
  let collab = Collaborators::<u8>::from_config(cfg.encoder_config())
    .with_analyzer(analyzer.clone());
  encode_intra(&cfg, collab, 2);

  let events = analyzer.events.lock().unwrap().clone();
  let num_cols = 5;
  for (i, ev) in events.iter().enumerate() {
    if let Event::Start(row, col) = *ev {
      if row == 0 {
        continue;
      }
      let above = Event::End(row - 1, (col + 1).min(num_cols - 1));
      assert!(
        events[..i].contains(&above),
        "CTU ({}, {}) started before {:?}",
        row,
        col,
        above
      );
    }
  }
}

#[test]
fn row_starts_from_the_context_above() {
  let cfg = setup_config(256, 192, 64, 4, true);
  let analyzer = Arc::new(RecordingAnalyzer::new());
  let collab = Collaborators::<u8>::from_config(cfg.encoder_config())
    .with_analyzer(analyzer.clone());
  encode_intra(&cfg, collab, 3);

  let contexts = analyzer.contexts.lock().unwrap();
  let init = contexts[&(0, 0)].clone();
  for row in 1..3 {
    // The state after the second CTU of the row above is what the third
    // CTU of that row starts from.
    assert_eq!(contexts[&(row, 0)], contexts[&(row - 1, 2)]);
    assert_ne!(contexts[&(row, 0)], init);
  }
}

#[test]
fn parallel_and_sequential_bitstreams_match() {
  let seq = encode_intra(
    &setup_config(256, 256, 64, 1, true),
    Collaborators::<u8>::from_config(setup_config(256, 256, 64, 1, true).encoder_config()),
    4,
  );
  let par = encode_intra(
    &setup_config(256, 256, 64, 4, true),
    Collaborators::<u8>::from_config(setup_config(256, 256, 64, 4, true).encoder_config()),
    4,
  );
  assert_eq!(seq.substream_sizes, par.substream_sizes);
  assert_eq!(seq.data(), par.data());
}

fn vbv_config(threads: usize) -> Config {
  let mut enc = *setup_config(256, 256, 64, threads, true).encoder_config();
  enc.rate_control.vbv_buffer_size = 1000;
  enc.rate_control.vbv_max_bitrate = 1000;
  enc.rate_control.stat_write = true;
  Config::new().with_encoder_config(enc).with_threads(threads)
}

#[test]
fn vbv_restart_recodes_rows_below_trigger() {
  let cfg = vbv_config(1);
  let analyzer = Arc::new(RecordingAnalyzer::new());
  let rc = Arc::new(RestartOnce::new(30, 2));
  let collab = Collaborators::<u8>::from_config(cfg.encoder_config())
    .with_analyzer(analyzer.clone())
    .with_rate_control(rc.clone());
  let pic = encode_intra(&cfg, collab, 5);

  // Rows 0 and 1 once, row 2 up to its diagonal and then again, row 3 once.
  assert_eq!(analyzer.calls.load(Ordering::SeqCst), 4 + 4 + 3 + 4 + 4);
  assert_eq!(pic.vbv_restarts, 1);
  assert_eq!(pic.row_stats.iter().map(|s| s.ctus).collect::<Vec<_>>(), [4; 4]);

  // The rows above the trigger are identical to an encode without restart.
  let plain = Arc::new(RestartOnce::new(30, usize::MAX));
  let collab =
    Collaborators::<u8>::from_config(cfg.encoder_config()).with_rate_control(plain);
  let reference = encode_intra(&cfg, collab, 5);
  assert_eq!(pic.row_stats[..2], reference.row_stats[..2]);
  assert_eq!(reference.vbv_restarts, 0);

  // The revised QP flows down to the row below.
  let checkpoints = rc.checkpoints.lock().unwrap().clone();
  assert_eq!(checkpoints.first(), Some(&(1, 30.)));
  assert_eq!(checkpoints.last(), Some(&(3, 34.)));
}

#[test]
fn vbv_restart_in_parallel_completes() {
  let cfg = vbv_config(4);
  let rc = Arc::new(RestartOnce::new(30, 1));
  let collab =
    Collaborators::<u8>::from_config(cfg.encoder_config()).with_rate_control(rc);
  let pic = encode_intra(&cfg, collab, 6);
  assert_eq!(pic.vbv_restarts, 1);
  assert_eq!(pic.row_stats.iter().map(|s| s.ctus).collect::<Vec<_>>(), [4; 4]);
  assert!(pic.frame.is_reconstructed());
}

#[test]
fn restart_to_lower_qp_is_ignored() {
  let cfg = vbv_config(1);
  let rc = Arc::new(RestartOnce::new(30, 2).with_step(-2.));
  let collab = Collaborators::<u8>::from_config(cfg.encoder_config())
    .with_rate_control(rc.clone());
  let pic = encode_intra(&cfg, collab, 20);

  assert_eq!(pic.vbv_restarts, 0);
  // The refused verdict leaves the row at the QP it was coded with.
  assert_eq!(pic.frame.row_diagnostics()[2].diag_qp, 30.);
  assert_eq!(rc.checkpoints.lock().unwrap().last(), Some(&(3, 30.)));
}

#[test]
fn vbv_restart_with_progress_below_trigger() {
  let mut enc = *setup_config(512, 512, 64, 1, true).encoder_config();
  enc.rate_control.vbv_buffer_size = 1000;
  enc.rate_control.vbv_max_bitrate = 1000;
  enc.rate_control.stat_write = true;

  let run = |threads: usize| {
    let cfg = Config::new().with_encoder_config(enc).with_threads(threads);
    let analyzer = Arc::new(
      RecordingAnalyzer::new().with_delay(Duration::from_millis(2)),
    );
    let collab = Collaborators::<u8>::from_config(&enc)
      .with_analyzer(analyzer.clone())
      .with_rate_control(Arc::new(RestartOnce::new(30, 5)));
    let pic = encode_intra(&cfg, collab, 17);
    (pic, analyzer.calls.load(Ordering::SeqCst))
  };

  let (seq, seq_calls) = run(1);
  let (par, par_calls) = run(8);
  // 64 CTUs, plus row 5 up to its diagonal coded twice.
  assert_eq!(seq_calls, 64 + 6);
  // Rows 6 and 7 may have been queued, busy or partly coded when row 5
  // asked for the restart; they are coded from scratch either way.
  assert!(par_calls >= seq_calls);
  assert_eq!(seq.vbv_restarts, 1);
  assert_eq!(par.vbv_restarts, 1);
  assert_eq!(par.row_stats, seq.row_stats);
  assert_eq!(par.substream_sizes, seq.substream_sizes);
  assert_eq!(par.data(), seq.data());
  assert!(par.frame.is_reconstructed());
}

#[test]
fn rows_wait_for_reference_reconstruction() {
  let mut enc = *setup_config(256, 1024, 64, 8, true).encoder_config();
  enc.search_range = 8;
  let lag = FrameParams::new(&enc).ref_lag_rows;
  assert_eq!(lag, 2);
  let cfg = Config::new().with_encoder_config(enc).with_threads(8);
  let checker = Arc::new(ReferenceRowsChecker {
    inner: ActivityAnalyzer::new(8),
    lag,
    delay: Duration::from_millis(1),
    violations: AtomicUsize::new(0),
    overlapped: AtomicUsize::new(0),
  });
  let collab =
    Collaborators::<u8>::from_config(&enc).with_analyzer(checker.clone());
  let enc = cfg.new_encoder(collab).unwrap();

  let f0 = Arc::new(enc.new_frame(0, noise_plane(256, 1024, 18), None));
  let f1 = Arc::new(enc.new_frame(1, noise_plane(256, 1024, 19), Some(&f0)));
  let mut fe0 = enc.new_frame_encoder().unwrap();
  let mut fe1 = enc.new_frame_encoder().unwrap();
  fe0.start_compress_frame(f0.clone(), Slice::intra()).unwrap();
  let slice = Slice::new(SliceType::P, false).with_reference(0, f0.clone());
  fe1.start_compress_frame(f1, slice).unwrap();

  fe0.get_encoded_picture().unwrap().unwrap();
  let p_pic = fe1.get_encoded_picture().unwrap().unwrap();
  assert_eq!(p_pic.row_stats.len(), 16);
  assert_eq!(checker.violations.load(Ordering::SeqCst), 0);
  // The P frame ran alongside its reference, so the lag was enforced.
  assert!(checker.overlapped.load(Ordering::SeqCst) > 0);
}

#[interpolate_test(sequential, 1)]
#[interpolate_test(parallel, 4)]
fn references_are_released(threads: usize) {
  let cfg = setup_config(192, 192, 64, threads, true);
  let enc = cfg.new_encoder(Collaborators::<u8>::from_config(cfg.encoder_config())).unwrap();
  let src0 = noise_plane(192, 192, 7);
  let src1 = noise_plane(192, 192, 8);
  let i_frame = Arc::new(enc.new_frame(0, src0, None));
  let p_frame = Arc::new(enc.new_frame(1, src1, Some(&i_frame)));

  let mut fe0 = enc.new_frame_encoder().unwrap();
  let mut fe1 = enc.new_frame_encoder().unwrap();
  fe0.start_compress_frame(i_frame.clone(), Slice::intra()).unwrap();
  let slice = Slice::new(SliceType::P, false).with_reference(0, i_frame.clone());
  assert_eq!(i_frame.count_ref_encoders(), 1);
  fe1.start_compress_frame(p_frame, slice).unwrap();

  let i_pic = fe0.get_encoded_picture().unwrap().unwrap();
  let p_pic = fe1.get_encoded_picture().unwrap().unwrap();
  assert_eq!(i_pic.encode_order, 0);
  assert_eq!(p_pic.encode_order, 1);
  assert_eq!(p_pic.slice_type, SliceType::P);
  assert_eq!(i_frame.count_ref_encoders(), 0);
  // The reference was fully reconstructed before the P frame could end.
  assert!(i_frame.is_reconstructed());
}

#[test]
fn second_frame_needs_retrieval_first() {
  let cfg = setup_config(128, 64, 64, 1, true);
  let enc = cfg.new_encoder(Collaborators::<u8>::from_config(cfg.encoder_config())).unwrap();
  let mut fe = enc.new_frame_encoder().unwrap();
  assert!(fe.get_encoded_picture().unwrap().is_none());

  let f0 = Arc::new(enc.new_frame(0, noise_plane(128, 64, 9), None));
  let f1 = Arc::new(enc.new_frame(1, noise_plane(128, 64, 10), None));
  fe.start_compress_frame(f0.clone(), Slice::intra()).unwrap();
  let slice = Slice::new(SliceType::P, false).with_reference(0, f0.clone());
  assert_eq!(
    fe.start_compress_frame(f1, slice),
    Err(EncoderStatus::FramePending)
  );
  assert!(fe.get_encoded_picture().unwrap().is_some());
  assert_eq!(f0.count_ref_encoders(), 0);
}

#[test]
fn rate_control_failure_aborts_session() {
  let cfg = setup_config(128, 128, 64, 1, true);
  let collab = Collaborators::<u8>::from_config(cfg.encoder_config())
    .with_rate_control(Arc::new(BrokenRateControl));
  let enc = cfg.new_encoder(collab).unwrap();
  let mut fe = enc.new_frame_encoder().unwrap();
  let f0 = Arc::new(enc.new_frame(0, noise_plane(128, 128, 11), None));
  fe.start_compress_frame(f0.clone(), Slice::intra()).unwrap();
  assert!(matches!(fe.get_encoded_picture(), Err(EncoderStatus::Aborted)));
  assert!(enc.is_aborted());

  let f1 = Arc::new(enc.new_frame(1, noise_plane(128, 128, 12), None));
  let slice = Slice::new(SliceType::P, false).with_reference(0, f0.clone());
  assert_eq!(fe.start_compress_frame(f1, slice), Err(EncoderStatus::Aborted));
  assert_eq!(f0.count_ref_encoders(), 0);
}

#[test]
fn keyframe_units_in_order() {
  let mut enc = *setup_config(128, 128, 64, 1, true).encoder_config();
  enc.access_unit_delimiters = true;
  enc.emit_hrd_sei = true;
  enc.picture_hash = PictureHash::Checksum;
  let cfg = Config::new().with_encoder_config(enc).with_threads(1);
  let pic = encode_intra(&cfg, Collaborators::<u8>::from_config(&enc), 13);

  let types: Vec<_> = pic.nals.iter().map(|n| n.nal_type).collect();
  assert_eq!(
    types,
    [
      NalUnitType::ACCESS_UNIT_DELIMITER,
      NalUnitType::VPS,
      NalUnitType::SPS,
      NalUnitType::PPS,
      NalUnitType::PREFIX_SEI, // buffering period
      NalUnitType::PREFIX_SEI, // recovery point
      NalUnitType::PREFIX_SEI, // picture timing
      NalUnitType::IDR_W_RADL,
      NalUnitType::SUFFIX_SEI, // picture hash
    ]
  );
  let non_sei: u64 = pic
    .nals
    .iter()
    .filter(|n| !n.nal_type.is_sei())
    .map(|n| 8 * (n.data.len() - n.start_code_len()) as u64)
    .sum();
  assert_eq!(pic.access_unit_bits, non_sei);
}

#[test]
fn two_pass_statistics_cover_every_cu() {
  let mut enc = *setup_config(128, 128, 32, 1, true).encoder_config();
  enc.rate_control.stat_write = true;
  let cfg = Config::new().with_encoder_config(enc).with_threads(1);
  let pic = encode_intra(&cfg, Collaborators::<u8>::from_config(&enc), 14);

  // Every 8x8 unit is counted exactly once.
  let cus: u64 =
    pic.row_stats.iter().map(|s| s.intra_cus + s.inter_cus + s.skip_cus).sum();
  assert_eq!(cus, (128 / 8) * (128 / 8));
  let fs = pic.frame_stats;
  assert!((fs.percent_intra + fs.percent_inter + fs.percent_skip - 1.).abs() < 1e-9);
  assert_eq!(fs.percent_intra, 1.);
}

#[test]
fn header_failure_aborts_session() {
  let cfg = setup_config(128, 128, 64, 4, true);
  let (release, gate) = bounded(1);
  let collab = Collaborators::<u8>::from_config(cfg.encoder_config())
    .with_headers(Arc::new(FailingHeaders { release: gate }));
  let enc = cfg.new_encoder(collab).unwrap();
  let mut fe0 = enc.new_frame_encoder().unwrap();
  let mut fe1 = enc.new_frame_encoder().unwrap();

  let f0 = Arc::new(enc.new_frame(0, noise_plane(128, 128, 15), None));
  let f1 = Arc::new(enc.new_frame(1, noise_plane(128, 128, 16), Some(&f0)));
  fe0.start_compress_frame(f0.clone(), Slice::intra()).unwrap();
  // Waits on the rate control turn of frame 0, then on its rows.
  let slice = Slice::new(SliceType::P, false).with_reference(0, f0.clone());
  fe1.start_compress_frame(f1, slice).unwrap();
  release.send(()).unwrap();

  assert!(matches!(fe0.get_encoded_picture(), Err(EncoderStatus::Failure)));
  assert!(matches!(fe1.get_encoded_picture(), Err(EncoderStatus::Aborted)));
  assert!(enc.is_aborted());
  assert_eq!(f0.count_ref_encoders(), 0);

  let f2 = Arc::new(enc.new_frame(2, noise_plane(128, 128, 17), None));
  assert_eq!(
    fe0.start_compress_frame(f2, Slice::intra()),
    Err(EncoderStatus::Aborted)
  );
}
