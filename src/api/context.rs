// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use rayon::ThreadPool;

use crate::activity::Lowres;
use crate::analysis::{ActivityAnalyzer, CtuAnalyzer};
use crate::api::config::*;
use crate::api::{EncodedPicture, EncoderStatus};
use crate::encoder::filter::{CopyFilter, LoopFilter};
use crate::encoder::headers::{BasicStreamHeaders, StreamHeaders};
use crate::encoder::{FrameCompressor, FrameParams};
use crate::frame::{Frame, Slice};
use crate::rate::{ConstantQp, RateControl, VbvParams, VbvRateControl};
use crate::util::{Pixel, Plane};

/// Initial VBV buffer fullness of the reference rate control.
const VBV_INIT_FULLNESS: f64 = 0.9;

/// The components a frame encoder calls out to.
///
/// They are shared by every frame encoder of a session.
pub struct Collaborators<T: Pixel> {
  /// Picks frame QPs and polices the VBV at the row checkpoints.
  pub rate_control: Arc<dyn RateControl>,
  /// Makes the coding decisions of one CTU.
  pub analyzer: Arc<dyn CtuAnalyzer<T>>,
  /// Filters reconstructed rows.
  pub loop_filter: Arc<dyn LoopFilter<T>>,
  /// Writes the parameter sets.
  pub headers: Arc<dyn StreamHeaders>,
}

impl<T: Pixel> Clone for Collaborators<T> {
  fn clone(&self) -> Self {
    Collaborators {
      rate_control: Arc::clone(&self.rate_control),
      analyzer: Arc::clone(&self.analyzer),
      loop_filter: Arc::clone(&self.loop_filter),
      headers: Arc::clone(&self.headers),
    }
  }
}

impl<T: Pixel> Collaborators<T> {
  /// The reference components for `cfg`: [`ActivityAnalyzer`], a
  /// [`VbvRateControl`] when the VBV is configured or [`ConstantQp`]
  /// otherwise, [`CopyFilter`] and [`BasicStreamHeaders`].
  pub fn from_config(cfg: &EncoderConfig) -> Self {
    let rc = &cfg.rate_control;
    let rate_control: Arc<dyn RateControl> = if rc.vbv_enabled() {
      let max_rate = f64::from(rc.vbv_max_bitrate) * 1000.;
      let bitrate = match rc.mode {
        RcMode::Abr => (f64::from(rc.bitrate) * 1000.).min(max_rate),
        RcMode::Cqp => max_rate,
      };
      Arc::new(VbvRateControl::new(VbvParams {
        buffer_size: f64::from(rc.vbv_buffer_size) * 1000.,
        max_rate,
        bitrate,
        fps: cfg.frame_rate(),
        init_fullness: VBV_INIT_FULLNESS,
        base_qp: rc.qp,
      }))
    } else {
      Arc::new(ConstantQp::new(rc.qp))
    };
    Collaborators {
      rate_control,
      analyzer: Arc::new(ActivityAnalyzer::new(cfg.bit_depth)),
      loop_filter: Arc::new(CopyFilter),
      headers: Arc::new(BasicStreamHeaders::new(cfg)),
    }
  }

  /// Replaces the rate control.
  pub fn with_rate_control(mut self, rc: Arc<dyn RateControl>) -> Self {
    self.rate_control = rc;
    self
  }

  /// Replaces the CTU analyzer.
  pub fn with_analyzer(mut self, analyzer: Arc<dyn CtuAnalyzer<T>>) -> Self {
    self.analyzer = analyzer;
    self
  }

  /// Replaces the loop filter.
  pub fn with_loop_filter(mut self, filter: Arc<dyn LoopFilter<T>>) -> Self {
    self.loop_filter = filter;
    self
  }

  /// Replaces the parameter set writer.
  pub fn with_headers(mut self, headers: Arc<dyn StreamHeaders>) -> Self {
    self.headers = headers;
    self
  }
}

/// An encoding session.
///
/// Holds what the frame encoders of a session share: the configuration,
/// the collaborators, the worker pool and the HRD bookkeeping.
pub struct Encoder<T: Pixel> {
  pub(crate) config: Arc<EncoderConfig>,
  pub(crate) collab: Collaborators<T>,
  pub(crate) pool: Option<Arc<ThreadPool>>,
  aborted: AtomicBool,
  /// Encode order of the last buffering period SEI.
  pub(crate) last_bp_sei: AtomicU64,
  next_encode_order: AtomicU64,
  frame_encoders: AtomicUsize,
}

impl<T: Pixel> fmt::Debug for Encoder<T> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Encoder")
      .field("config", &self.config)
      .field("threads", &self.pool.as_ref().map(|p| p.current_num_threads()))
      .field("aborted", &self.is_aborted())
      .finish()
  }
}

impl<T: Pixel> Encoder<T> {
  pub(crate) fn new(
    config: EncoderConfig, collab: Collaborators<T>,
    pool: Option<Arc<ThreadPool>>,
  ) -> Self {
    Encoder {
      config: Arc::new(config),
      collab,
      pool,
      aborted: AtomicBool::new(false),
      last_bp_sei: AtomicU64::new(0),
      next_encode_order: AtomicU64::new(0),
      frame_encoders: AtomicUsize::new(0),
    }
  }

  /// The settings of this session.
  pub fn config(&self) -> &EncoderConfig {
    &self.config
  }

  /// Wraps `source` into a frame ready to be compressed.
  ///
  /// Runs the lowres analysis; with a `reference` the inter costs are
  /// measured against its source pixels.
  pub fn new_frame(
    &self, poc: u64, source: Plane<T>, reference: Option<&Frame<T>>,
  ) -> Frame<T> {
    let cfg = &self.config;
    let rc = &cfg.rate_control;
    let lowres = Lowres::analyze(
      &source,
      reference.map(|r| &r.source),
      cfg.bit_depth,
      if rc.aq_enabled() { rc.aq_strength } else { 0. },
    );
    Frame::new(poc, source, cfg.ctu_size, lowres)
  }

  /// Starts a frame encoder with its own thread.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig` if the picture has no CTU or the thread could
  /// not be spawned.
  pub fn new_frame_encoder(
    self: &Arc<Self>,
  ) -> Result<FrameEncoder<T>, InvalidConfig> {
    FrameEncoder::new(Arc::clone(self))
  }

  /// Whether the session was aborted.
  pub fn is_aborted(&self) -> bool {
    self.aborted.load(Ordering::SeqCst)
  }

  /// Ends the session: frame encoders refuse new frames and whoever waits
  /// on the rate control is released.
  pub fn abort(&self) {
    self.aborted.store(true, Ordering::SeqCst);
    self.collab.rate_control.abort();
  }
}

struct FrameJob<T: Pixel> {
  frame: Arc<Frame<T>>,
  slice: Slice<T>,
  encode_order: u64,
}

type FrameResult<T> = Result<EncodedPicture<T>, EncoderStatus>;

/// Handle of a frame encoder thread.
///
/// Compresses one frame at a time: every [`start_compress_frame`] has to
/// be paired with a [`get_encoded_picture`]. Several frame encoders of one
/// session run concurrently, the rows of a frame waiting on the
/// reconstruction of its references.
///
/// [`start_compress_frame`]: FrameEncoder::start_compress_frame
/// [`get_encoded_picture`]: FrameEncoder::get_encoded_picture
pub struct FrameEncoder<T: Pixel> {
  encoder: Arc<Encoder<T>>,
  params: FrameParams,
  jobs: Option<Sender<FrameJob<T>>>,
  done: Receiver<FrameResult<T>>,
  active: Arc<AtomicBool>,
  pending: bool,
  thread: Option<JoinHandle<()>>,
}

impl<T: Pixel> FrameEncoder<T> {
  fn new(encoder: Arc<Encoder<T>>) -> Result<Self, InvalidConfig> {
    let cfg = &encoder.config;
    let compressor = FrameCompressor::new(Arc::clone(&encoder));
    let params = *compressor.params();
    if params.num_cols == 0 {
      return Err(InvalidConfig::InvalidWidth(cfg.width));
    }
    if params.num_rows == 0 {
      return Err(InvalidConfig::InvalidHeight(cfg.height));
    }

    let (job_send, job_recv) = bounded::<FrameJob<T>>(1);
    let (done_send, done_recv) = bounded::<FrameResult<T>>(1);
    let active = Arc::new(AtomicBool::new(true));
    let id = encoder.frame_encoders.fetch_add(1, Ordering::SeqCst);

    let thread_active = Arc::clone(&active);
    let thread = thread::Builder::new()
      .name(format!("wfenc-frame-{}", id))
      .spawn(move || {
        let mut compressor = compressor;
        // Ends when the handle closes the channel.
        for job in job_recv.iter() {
          if !thread_active.load(Ordering::SeqCst) {
            job.slice.release_references();
            break;
          }
          let out =
            compressor.compress_frame(job.frame, job.slice, job.encode_order);
          if done_send.send(out).is_err() {
            break;
          }
        }
      })
      .map_err(|e| {
        log::warn!("unable to spawn frame encoder thread: {}", e);
        InvalidConfig::FrameThread
      })?;

    Ok(FrameEncoder {
      encoder,
      params,
      jobs: Some(job_send),
      done: done_recv,
      active,
      pending: false,
      thread: Some(thread),
    })
  }

  /// Number of CTU rows of every frame.
  pub fn num_rows(&self) -> usize {
    self.params.num_rows
  }

  /// Number of CTU columns of every frame.
  pub fn num_cols(&self) -> usize {
    self.params.num_cols
  }

  /// Hands `frame` to the frame encoder thread and returns immediately.
  ///
  /// The slice holds a count on each of its references until the frame is
  /// compressed.
  ///
  /// # Errors
  ///
  /// - `FramePending` if the previous frame was not retrieved.
  /// - `Aborted` once the session was aborted.
  /// - `Disconnected` if the thread is gone.
  pub fn start_compress_frame(
    &mut self, frame: Arc<Frame<T>>, slice: Slice<T>,
  ) -> Result<(), EncoderStatus> {
    if self.pending {
      slice.release_references();
      return Err(EncoderStatus::FramePending);
    }
    if self.encoder.is_aborted() {
      slice.release_references();
      return Err(EncoderStatus::Aborted);
    }
    let Some(jobs) = self.jobs.as_ref() else {
      slice.release_references();
      return Err(EncoderStatus::Disconnected);
    };
    let encode_order =
      self.encoder.next_encode_order.fetch_add(1, Ordering::SeqCst);
    jobs.send(FrameJob { frame, slice, encode_order }).map_err(|e| {
      e.into_inner().slice.release_references();
      EncoderStatus::Disconnected
    })?;
    self.pending = true;
    Ok(())
  }

  /// Waits for the frame handed to [`start_compress_frame`].
  ///
  /// Returns `None` if no frame is being compressed.
  ///
  /// # Errors
  ///
  /// Passes on the failure of the frame, or `Disconnected` if the thread
  /// is gone.
  ///
  /// [`start_compress_frame`]: FrameEncoder::start_compress_frame
  pub fn get_encoded_picture(
    &mut self,
  ) -> Result<Option<EncodedPicture<T>>, EncoderStatus> {
    if !self.pending {
      return Ok(None);
    }
    let out = self.done.recv().map_err(|_| EncoderStatus::Disconnected)?;
    self.pending = false;
    out.map(Some)
  }
}

impl<T: Pixel> Drop for FrameEncoder<T> {
  fn drop(&mut self) {
    self.active.store(false, Ordering::SeqCst);
    // Wakes the thread out of its wait for a frame.
    self.jobs.take();
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        log::error!("frame encoder thread panicked");
      }
    }
  }
}
