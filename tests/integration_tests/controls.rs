// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fs::read_to_string, io::Write};

use indexmap::IndexMap;
use indoc::indoc;
use tempfile::{Builder, TempDir};

use crate::{get_cmd_output, selfcal_bin};
use selfcal::{CalibrationControls, JonesShape, TermControls, TimeSlice};

#[test]
fn test_default_controls_are_printed() {
    let cmd = selfcal_bin().args(["controls", "--no-progress-bars"]).ok();
    assert!(cmd.is_ok(), "controls failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("[T]"), "{stdout}");
    assert!(stdout.contains("[G]"), "{stdout}");
    assert!(stdout.contains("[B]"), "{stdout}");
    assert!(stdout.contains("shape = \"scalar\""), "{stdout}");
    assert!(stdout.contains("time_slice = \"auto\""), "{stdout}");
}

#[test]
fn test_controls_with_overrides_written_to_file() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let output = tmp_dir.path().join("controls.toml");
    let mut overrides = Builder::new().suffix(".toml").tempfile().unwrap();
    overrides
        .write_all(
            indoc! {r#"
                [G]
                first_selfcal = 3

                [P]
                shape = "matrix"
                timeslice = 120.0
                phase_only = false
            "#}
            .as_bytes(),
        )
        .unwrap();

    #[rustfmt::skip]
    let cmd = selfcal_bin()
        .args([
            "controls",
            "--overrides", &format!("{}", overrides.path().display()),
            "--output", &format!("{}", output.display()),
        ])
        .ok();
    assert!(cmd.is_ok(), "controls failed: {}", cmd.err().unwrap());

    let terms: IndexMap<String, TermControls> =
        toml::from_str(&read_to_string(&output).unwrap()).unwrap();
    assert_eq!(
        terms.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
        vec!["T", "G", "B", "P"]
    );
    assert_eq!(terms["G"].first_selfcal, 3);
    assert_eq!(terms["P"].shape, JonesShape::Matrix);
    assert_eq!(terms["P"].time_slice, TimeSlice::Seconds(120.0));

    // The written file is itself a valid registry.
    let controls: CalibrationControls =
        toml::from_str(&read_to_string(&output).unwrap()).unwrap();
    assert_eq!(controls.len(), 4);
}

#[test]
fn test_incomplete_new_term_is_an_error() {
    let mut overrides = Builder::new().suffix(".json").tempfile().unwrap();
    overrides
        .write_all(br#"{"P": {"shape": "matrix"}}"#)
        .unwrap();

    let cmd = selfcal_bin()
        .args([
            "controls",
            "--overrides",
            &format!("{}", overrides.path().display()),
        ])
        .ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("'P'"), "{stderr}");
    assert!(stderr.contains("time_slice"), "{stderr}");
}
