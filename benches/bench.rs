// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::Arc;

use criterion::{
  black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
  Throughput,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

use wfenc::activity::Lowres;
use wfenc::frame::Slice;
use wfenc::util::Plane;
use wfenc::wavefront::WaveFront;
use wfenc::*;

const WIDTH: usize = 640;
const HEIGHT: usize = 384;

fn fill_plane(ra: &mut ChaChaRng, w: usize, h: usize) -> Plane<u8> {
  let mut p = Plane::new(w, h, 0, 0, 0, 0);
  let stride = p.cfg.stride;
  for (y, row) in p.data_origin_mut().chunks_mut(stride).take(h).enumerate() {
    for (x, px) in row[..w].iter_mut().enumerate() {
      *px = (((x ^ y) & 0x7f) as u8).wrapping_add(ra.gen_range(0..64));
    }
  }
  p
}

fn encode_intra(c: &mut Criterion) {
  let mut group = c.benchmark_group("encode_intra");
  group.throughput(Throughput::Elements((WIDTH * HEIGHT) as u64));
  group.sample_size(20);

  let mut ra = ChaChaRng::from_seed([0; 32]);
  let source = fill_plane(&mut ra, WIDTH, HEIGHT);

  for (threads, wavefront) in [(1, true), (4, true), (4, false)] {
    let enc = EncoderConfig {
      width: WIDTH,
      height: HEIGHT,
      wavefront,
      ..Default::default()
    };
    let cfg = Config::new().with_encoder_config(enc).with_threads(threads);
    let encoder =
      cfg.new_encoder::<u8>(Collaborators::from_config(&enc)).unwrap();
    let mut fe = encoder.new_frame_encoder().unwrap();
    let id = format!("{}t-{}", threads, if wavefront { "wpp" } else { "single" });
    group.bench_function(BenchmarkId::from_parameter(id), |b| {
      b.iter(|| {
        let frame = Arc::new(encoder.new_frame(0, source.clone(), None));
        fe.start_compress_frame(frame, Slice::intra()).unwrap();
        black_box(fe.get_encoded_picture().unwrap())
      })
    });
  }

  group.finish();
}

fn lowres_analysis(c: &mut Criterion) {
  let mut ra = ChaChaRng::from_seed([0; 32]);
  let cur = fill_plane(&mut ra, WIDTH, HEIGHT);
  let prev = fill_plane(&mut ra, WIDTH, HEIGHT);
  c.bench_function("lowres_analyze", |b| {
    b.iter(|| black_box(Lowres::analyze(&cur, Some(&prev), 8, 1.0)))
  });
}

fn wavefront_find_job(c: &mut Criterion) {
  let wave = WaveFront::new(136);
  c.bench_function("wavefront_find_job", |b| {
    b.iter(|| {
      for row in (0..136).step_by(3) {
        wave.enable_row(row);
        wave.enqueue_row(row);
      }
      while let Some(id) = wave.find_job() {
        black_box(id);
      }
    })
  });
}

criterion_group!(benches, encode_intra, lowres_analysis, wavefront_find_job);
criterion_main!(benches);
