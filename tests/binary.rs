// Copyright (c) 2024, The wfenc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

#[cfg(feature = "binaries")]
mod binary {
  use assert_cmd::Command;
  use rand::distributions::Alphanumeric;
  use rand::{thread_rng, Rng};
  use std::env::temp_dir;
  use std::fs;
  use std::path::PathBuf;

  fn get_tempfile_path(extension: &str) -> PathBuf {
    let mut path = temp_dir();
    let filename = thread_rng()
      .sample_iter(&Alphanumeric)
      .take(12)
      .map(char::from)
      .collect::<String>();
    path.push(format!("{}.{}", filename, extension));
    path
  }

  #[cfg(not(windows))]
  fn get_wfenc_command() -> Command {
    let mut cmd = Command::cargo_bin("wfenc").unwrap();
    cmd.env_clear();
    cmd
  }

  #[cfg(windows)]
  fn get_wfenc_command() -> Command {
    Command::cargo_bin("wfenc").unwrap()
  }

  fn get_common_cmd(outfile: &PathBuf) -> Command {
    let mut cmd = get_wfenc_command();
    cmd
      .arg("--width")
      .arg("160")
      .arg("--height")
      .arg("96")
      .arg("--frames")
      .arg("4")
      .arg("-o")
      .arg(outfile);
    cmd
  }

  /// The stream starts with a 4 byte start code and a VPS.
  fn check_stream(outfile: &PathBuf) {
    let data = fs::read(outfile).unwrap();
    assert!(data.len() > 5);
    assert_eq!(&data[..4], &[0, 0, 0, 1]);
    assert_eq!(data[4] >> 1, 32);
    fs::remove_file(outfile).unwrap();
  }

  #[test]
  fn qp_based() {
    let outfile = get_tempfile_path("hevc");
    get_common_cmd(&outfile).arg("--qp").arg("30").assert().success();
    check_stream(&outfile);
  }

  #[test]
  fn sequential_rows() {
    let outfile = get_tempfile_path("hevc");
    get_common_cmd(&outfile).arg("--threads").arg("1").assert().success();
    check_stream(&outfile);
  }

  #[test]
  fn single_substream_with_sao() {
    let outfile = get_tempfile_path("hevc");
    get_common_cmd(&outfile)
      .arg("--no-wpp")
      .arg("--sao")
      .arg("--hash")
      .arg("crc")
      .assert()
      .success();
    check_stream(&outfile);
  }

  #[test]
  fn vbv_constrained() {
    let outfile = get_tempfile_path("hevc");
    get_common_cmd(&outfile)
      .arg("--ctu")
      .arg("32")
      .arg("--bitrate")
      .arg("200")
      .arg("--vbv-bufsize")
      .arg("100")
      .arg("--vbv-maxrate")
      .arg("200")
      .arg("--aq")
      .arg("1.0")
      .assert()
      .success();
    check_stream(&outfile);
  }

  #[test]
  fn rejects_invalid_ctu_size() {
    let outfile = get_tempfile_path("hevc");
    get_common_cmd(&outfile).arg("--ctu").arg("24").assert().failure();
  }
}
