// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tests to ensure there is no stderr output for successful commands.

use crate::{get_cmd_output, selfcal_bin};

#[test]
fn test_simulate_selfcal_no_stderr() {
    #[rustfmt::skip]
    let cmd = selfcal_bin()
        .args([
            "simulate-selfcal",
            "--num-antennas", "4",
            "--num-times", "2",
            "--num-channels", "1",
            "--iterations", "1",
        ])
        .ok();
    assert!(
        cmd.is_ok(),
        "simulate-selfcal failed on simple parameters: {}",
        cmd.err().unwrap()
    );
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.is_empty(), "stderr wasn't empty: {stderr}");
}

#[test]
fn test_controls_no_stderr() {
    let cmd = selfcal_bin().args(["controls"]).ok();
    assert!(cmd.is_ok(), "controls failed: {}", cmd.err().unwrap());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.is_empty(), "stderr wasn't empty: {stderr}");
}
