// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

mod error;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

use wfenc::frame::{Frame, Slice, SliceType};
use wfenc::util::Plane;
use wfenc::*;

use crate::error::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum HashArg {
  None,
  Md5,
  Crc,
  Checksum,
}

impl From<HashArg> for PictureHash {
  fn from(h: HashArg) -> Self {
    match h {
      HashArg::None => PictureHash::None,
      HashArg::Md5 => PictureHash::Md5,
      HashArg::Crc => PictureHash::Crc,
      HashArg::Checksum => PictureHash::Checksum,
    }
  }
}

/// Encodes a synthetic test pattern with wavefront parallel frame encoders
#[derive(Parser, Debug)]
#[command(name = "wfenc", version, about)]
struct CliOptions {
  /// Width of the test pattern
  #[arg(long, default_value_t = 416)]
  width: usize,
  /// Height of the test pattern
  #[arg(long, default_value_t = 240)]
  height: usize,
  /// Number of frames to encode
  #[arg(short, long, default_value_t = 10)]
  frames: u64,
  /// Worker threads, 0 lets the pool decide, 1 codes the rows in line
  #[arg(short, long, default_value_t = 0)]
  threads: usize,
  /// CTU size
  #[arg(long = "ctu", default_value_t = 64)]
  ctu_size: usize,
  /// Code the frame as a single substream
  #[arg(long)]
  no_wpp: bool,
  /// Sample adaptive offset
  #[arg(long)]
  sao: bool,
  /// Base quantizer
  #[arg(short, long, default_value_t = 32)]
  qp: i32,
  /// Target bitrate in kbps, enables ABR
  #[arg(short, long, default_value_t = 0)]
  bitrate: u32,
  /// VBV buffer size in kbits
  #[arg(long = "vbv-bufsize", default_value_t = 0)]
  vbv_bufsize: u32,
  /// VBV maximum bitrate in kbps
  #[arg(long = "vbv-maxrate", default_value_t = 0)]
  vbv_maxrate: u32,
  /// Adaptive quantization strength, 0 disables it
  #[arg(long, default_value_t = 0.)]
  aq: f64,
  /// Decoded picture hash SEI
  #[arg(long, value_enum, default_value_t = HashArg::None)]
  hash: HashArg,
  /// Annex B byte stream output
  #[arg(short, long)]
  output: Option<PathBuf>,
}

impl CliOptions {
  fn encoder_config(&self) -> EncoderConfig {
    let rate_control = RateControlConfig {
      mode: if self.bitrate > 0 { RcMode::Abr } else { RcMode::Cqp },
      qp: self.qp,
      bitrate: self.bitrate,
      vbv_buffer_size: self.vbv_bufsize,
      vbv_max_bitrate: self.vbv_maxrate,
      aq_mode: if self.aq > 0. { AqMode::Variance } else { AqMode::None },
      aq_strength: self.aq,
      ..Default::default()
    };
    EncoderConfig {
      width: self.width,
      height: self.height,
      ctu_size: self.ctu_size,
      wavefront: !self.no_wpp,
      sao: self.sao,
      picture_hash: self.hash.into(),
      rate_control,
      ..Default::default()
    }
  }
}

/// A diagonal ramp sliding one pixel per frame, with seeded noise on top.
fn test_pattern(w: usize, h: usize, n: u64, rng: &mut ChaChaRng) -> Plane<u8> {
  let mut p = Plane::new(w, h, 0, 0, 0, 0);
  let stride = p.cfg.stride;
  let shift = n as usize;
  for (y, row) in p.data_origin_mut().chunks_mut(stride).take(h).enumerate() {
    for (x, px) in row[..w].iter_mut().enumerate() {
      let ramp = ((x + y + shift) % 224) as u8;
      *px = ramp.saturating_add(rng.gen_range(0..32));
    }
  }
  p
}

fn main() {
  init_logger();

  run().unwrap_or_else(|e| {
    error::print_error(&e);
    exit(1);
  });
}

fn init_logger() {
  use std::str::FromStr;
  fn level_colored(l: log::Level) -> console::StyledObject<&'static str> {
    use console::style;
    use log::Level;
    match l {
      Level::Trace => style("??").dim(),
      Level::Debug => style("? ").dim(),
      Level::Info => style("> ").green(),
      Level::Warn => style("! ").yellow(),
      Level::Error => style("!!").red(),
    }
  }

  let level = std::env::var("WFENC_LOG")
    .ok()
    .and_then(|l| log::LevelFilter::from_str(&l).ok())
    .unwrap_or(log::LevelFilter::Info);

  fern::Dispatch::new()
    .format(move |out, message, record| {
      out.finish(format_args!(
        "{level} {message}",
        level = level_colored(record.level()),
        message = message,
      ));
    })
    .level(log::LevelFilter::Warn)
    .level_for("wfenc", level)
    .chain(std::io::stderr())
    .apply()
    .unwrap();
}

fn write_picture(
  out: &mut Option<BufWriter<File>>, pic: &EncodedPicture<u8>,
) -> Result<u64, CliError> {
  log::info!(
    "{} in {:.2?} ({} VBV restarts)",
    pic,
    pic.elapsed,
    pic.vbv_restarts
  );
  let data = pic.data();
  if let Some(out) = out {
    out.write_all(&data).map_err(|e| e.context("Unable to write output"))?;
  }
  Ok(data.len() as u64)
}

fn run() -> Result<(), CliError> {
  let cli = CliOptions::parse();
  let enc = cli.encoder_config();
  let cfg = Config::new().with_encoder_config(enc).with_threads(cli.threads);
  let encoder = cfg
    .new_encoder::<u8>(Collaborators::from_config(&enc))
    .map_err(|e| e.context("Invalid encoder settings"))?;

  // Two frame encoders, so a P frame starts while its reference is still
  // being filtered.
  let mut fes = [
    encoder
      .new_frame_encoder()
      .map_err(|e| e.context("Unable to start a frame encoder"))?,
    encoder
      .new_frame_encoder()
      .map_err(|e| e.context("Unable to start a frame encoder"))?,
  ];

  let mut out = match &cli.output {
    Some(path) => Some(BufWriter::new(
      File::create(path).map_err(|e| e.context("Cannot create output file"))?,
    )),
    None => None,
  };

  let mut rng = ChaChaRng::seed_from_u64(0);
  let mut prev: Option<Arc<Frame<u8>>> = None;
  let mut bytes = 0;
  let start = Instant::now();

  for n in 0..cli.frames {
    let fe = &mut fes[(n % 2) as usize];
    if let Some(pic) =
      fe.get_encoded_picture().map_err(|e| e.context("Encoding failed"))?
    {
      bytes += write_picture(&mut out, &pic)?;
    }

    let source = test_pattern(enc.width, enc.height, n, &mut rng);
    let frame = Arc::new(encoder.new_frame(n, source, prev.as_deref()));
    let slice = match &prev {
      Some(r) => Slice::new(SliceType::P, false).with_reference(0, r.clone()),
      None => Slice::intra(),
    };
    fe.start_compress_frame(frame.clone(), slice)
      .map_err(|e| e.context("Unable to start the frame"))?;
    prev = Some(frame);
  }

  for n in cli.frames..cli.frames + 2 {
    let fe = &mut fes[(n % 2) as usize];
    if let Some(pic) =
      fe.get_encoded_picture().map_err(|e| e.context("Encoding failed"))?
    {
      bytes += write_picture(&mut out, &pic)?;
    }
  }

  if let Some(out) = &mut out {
    out.flush().map_err(|e| e.context("Unable to write output"))?;
  }

  let elapsed = start.elapsed();
  log::info!(
    "{} frames, {} bytes in {:.2?} ({:.2} fps)",
    cli.frames,
    bytes,
    elapsed,
    cli.frames as f64 / elapsed.as_secs_f64().max(1e-9)
  );
  Ok(())
}
