// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::ec::{Bin, CoderCheckpoint, EntropyContext, RowCoder};
use crate::stats::RowStats;
use crate::util::lock;

/// Scheduling flags of a CTU row.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RowFlags {
  /// The row is queued or running and will make progress on its own.
  pub active: bool,
  /// A worker owns the row.
  pub busy: bool,
}

/// What a row produced so far, cleared by a VBV rollback.
#[derive(Debug, Default)]
pub struct RowWork {
  pub stats: RowStats,
  /// Estimated bits of every coded CTU of the row.
  pub total_bits: u64,
  /// Base QP of every coded CTU, read diagonally by the row below.
  pub base_qp: Vec<f64>,
  /// Coded syntax of every CTU, kept for the deferred slice pass.
  pub bins: Vec<Vec<Bin>>,
}

impl RowWork {
  fn new(num_cols: usize) -> Self {
    RowWork {
      base_qp: vec![0.; num_cols],
      bins: vec![Vec::new(); num_cols],
      ..Default::default()
    }
  }

  pub fn reset(&mut self) {
    self.stats = RowStats::default();
    self.total_bits = 0;
    self.base_qp.iter_mut().for_each(|q| *q = 0.);
    self.bins.iter_mut().for_each(Vec::clear);
  }
}

/// State of one CTU row of the frame being compressed.
#[derive(Debug)]
pub struct CtuRow {
  pub flags: Mutex<RowFlags>,
  /// Signaled whenever `busy` drops.
  vacated: Condvar,
  /// CTUs finished in the current pass. Only the owning worker moves it
  /// forward; a rollback sets it back to zero while the row is idle.
  completed: AtomicUsize,
  pub coder: Mutex<RowCoder>,
  /// Contexts after the second CTU, seeding the row below.
  pub saved_ctx: Mutex<EntropyContext>,
  /// Position of the shared coder when this row started, for rewinding a
  /// non-wavefront slice.
  pub start: Mutex<Option<CoderCheckpoint>>,
  pub work: Mutex<RowWork>,
}

impl CtuRow {
  pub fn new(init: &EntropyContext, num_cols: usize) -> Self {
    CtuRow {
      flags: Mutex::new(RowFlags::default()),
      vacated: Condvar::new(),
      completed: AtomicUsize::new(0),
      coder: Mutex::new(RowCoder::new(init.clone())),
      saved_ctx: Mutex::new(init.clone()),
      start: Mutex::new(None),
      work: Mutex::new(RowWork::new(num_cols)),
    }
  }

  #[inline]
  pub fn completed(&self) -> usize {
    self.completed.load(Ordering::Acquire)
  }

  #[inline]
  pub fn advance(&self) -> usize {
    self.completed.fetch_add(1, Ordering::AcqRel) + 1
  }

  pub fn flags(&self) -> MutexGuard<'_, RowFlags> {
    lock(&self.flags)
  }

  /// Gives the row up, waking anybody waiting for it to vacate.
  pub fn release(&self, mut flags: MutexGuard<'_, RowFlags>, active: bool) {
    flags.active = active;
    flags.busy = false;
    drop(flags);
    self.vacated.notify_all();
  }

  /// Blocks until no worker owns the row.
  pub fn wait_vacated(&self) -> MutexGuard<'_, RowFlags> {
    let mut flags = self.flags();
    while flags.busy {
      flags =
        self.vacated.wait(flags).unwrap_or_else(PoisonError::into_inner);
    }
    flags
  }

  /// Forgets all progress of the row. The row must be idle.
  pub fn reset(&self) {
    self.completed.store(0, Ordering::Release);
    lock(&self.coder).reset_bits();
    lock(&self.work).reset();
  }
}
