// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

#[derive(Debug, thiserror::Error)]
pub enum CliError {
  #[error("{msg}: {io}")]
  Io { msg: String, io: std::io::Error },
  #[error("{msg}: {status}")]
  Enc { msg: String, status: wfenc::EncoderStatus },
  #[error("{msg}: {status}")]
  Config { msg: String, status: wfenc::InvalidConfig },
}

pub trait ToError {
  fn context(self, msg: &str) -> CliError;
}

impl ToError for std::io::Error {
  fn context(self, msg: &str) -> CliError {
    CliError::Io { msg: msg.to_owned(), io: self }
  }
}

impl ToError for wfenc::EncoderStatus {
  fn context(self, msg: &str) -> CliError {
    CliError::Enc { msg: msg.to_owned(), status: self }
  }
}

impl ToError for wfenc::InvalidConfig {
  fn context(self, msg: &str) -> CliError {
    CliError::Config { msg: msg.to_owned(), status: self }
  }
}

pub fn print_error(e: &dyn std::error::Error) {
  log::error!("{}", e);
  let mut cause = e.source();
  while let Some(e) = cause {
    log::error!("Caused by: {}", e);
    cause = e.source();
  }
}
