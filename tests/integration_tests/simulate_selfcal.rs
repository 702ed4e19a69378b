// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fs::File, io::Write};

use indoc::indoc;
use serde_json::Value;
use tempfile::{Builder, TempDir};

use crate::{get_cmd_output, selfcal_bin};

#[test]
fn test_simulate_selfcal_writes_gains() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let gains = tmp_dir.path().join("gains.json");

    #[rustfmt::skip]
    let cmd = selfcal_bin()
        .args([
            "simulate-selfcal",
            "--num-antennas", "6",
            "--num-times", "4",
            "--num-channels", "2",
            "--pols", "linearnp",
            "--context", "TG",
            "--iterations", "2",
            "--tolerance", "1e-10",
            "--outputs", &format!("{}", gains.display()),
            "--no-progress-bars",
        ])
        .ok();
    assert!(cmd.is_ok(), "simulate-selfcal failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("Iteration 0"), "{stdout}");
    assert!(stdout.contains("Iteration 1"), "{stdout}");

    let record: Value = serde_json::from_reader(File::open(&gains).unwrap()).unwrap();
    assert_eq!(record["context"], "TG");
    let partitions = record["partitions"].as_array().unwrap();
    assert_eq!(partitions.len(), 1);
    let terms = partitions[0]["terms"].as_object().unwrap();
    assert!(terms.contains_key("T"));
    assert!(terms.contains_key("G"));
    assert_eq!(terms["T"]["shape"], "scalar");
    assert_eq!(terms["G"]["polarisations"], "XX_YY");
    // Four timesteps give four "auto" slices of six antennas and two channels.
    let t_gains = terms["T"]["gains"].as_array().unwrap();
    assert_eq!(t_gains.len(), 4);
    assert_eq!(t_gains[0].as_array().unwrap().len(), 6);
    assert_eq!(t_gains[0][0].as_array().unwrap().len(), 2);
    assert_eq!(t_gains[0][0][0].as_array().unwrap().len(), 8);
}

#[test]
fn test_simulate_selfcal_args_file() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let gains = tmp_dir.path().join("gains.yaml");
    let mut args_file = Builder::new().suffix(".toml").tempfile().unwrap();
    args_file
        .write_all(
            format!(
                indoc! {r#"
                    [observation]
                    num_antennas = 5
                    num_times = 2
                    num_channels = 4

                    [selfcal]
                    context = "GB"
                    iterations = 2
                    partitions = 2
                    outputs = ["{}"]

                    [selfcal.terms.B]
                    first_selfcal = 1
                "#},
                gains.display()
            )
            .as_bytes(),
        )
        .unwrap();

    let cmd = selfcal_bin()
        .args([
            "simulate-selfcal",
            &format!("{}", args_file.path().display()),
            "--no-progress-bars",
        ])
        .ok();
    assert!(cmd.is_ok(), "simulate-selfcal failed: {}", cmd.err().unwrap());

    let record: Value = serde_yaml::from_reader(File::open(&gains).unwrap()).unwrap();
    let partitions = record["partitions"].as_array().unwrap();
    assert_eq!(partitions.len(), 2);
    for p in partitions {
        let terms = p["terms"].as_object().unwrap();
        // B is only solved from iteration 1, which is the last.
        assert!(terms.contains_key("G"));
        assert!(terms.contains_key("B"));
    }
}

#[test]
fn test_simulate_selfcal_dry_run_and_save_toml() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let toml_file = tmp_dir.path().join("args.toml");
    let gains = tmp_dir.path().join("gains.json");

    #[rustfmt::skip]
    let cmd = selfcal_bin()
        .args([
            "simulate-selfcal",
            "--num-antennas", "4",
            "--seed", "7",
            "--outputs", &format!("{}", gains.display()),
            "--dry-run",
            "--save-toml", &format!("{}", toml_file.display()),
        ])
        .ok();
    assert!(cmd.is_ok(), "simulate-selfcal failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("Dry run"), "{stdout}");
    // Nothing was simulated.
    assert!(!gains.exists());

    // The saved arguments can be used to run again.
    let saved = std::fs::read_to_string(&toml_file).unwrap();
    assert!(saved.contains("num_antennas = 4"), "{saved}");
    assert!(saved.contains("seed = 7"), "{saved}");
    let cmd = selfcal_bin()
        .args([
            "simulate-selfcal",
            &format!("{}", toml_file.display()),
            "--no-progress-bars",
        ])
        .ok();
    assert!(cmd.is_ok(), "simulate-selfcal failed: {}", cmd.err().unwrap());
    assert!(gains.exists());
}

#[test]
fn test_simulate_selfcal_bad_args() {
    let cmd = selfcal_bin()
        .args(["simulate-selfcal", "--context", "TQ", "--dry-run"])
        .ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("'Q'"), "{stderr}");

    let cmd = selfcal_bin()
        .args(["simulate-selfcal", "--partitions", "9", "--dry-run"])
        .ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("partitions"), "{stderr}");

    let cmd = selfcal_bin()
        .args(["simulate-selfcal", "args.ini", "--dry-run"])
        .ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("recognised file extension"), "{stderr}");
}
