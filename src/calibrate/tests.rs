// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use indexmap::indexmap;
use indoc::indoc;
use marlu::Jones;
use ndarray::prelude::*;
use vec1::vec1;

use super::*;
use crate::{
    gain_table::{JonesShape, TimeSlice},
    simulate::{simulate_gain_table, simulate_point_source, GainErrors},
    vis::{Polarisations, VisContext, Visibility},
    DEFAULT_CALIBRATE_TOLERANCE, DEFAULT_SOLVE_TOLERANCE,
};

fn get_model() -> BlockVisibility {
    let context = VisContext {
        num_antennas: 6,
        frequencies: vec1![150e6, 160e6],
        channel_bandwidths: vec1![10e6, 10e6],
        integration_time: 10.0,
        polarisations: Polarisations::XX_YY,
    };
    simulate_point_source(context, vec1![0.0, 10.0, 20.0], 1.0).unwrap()
}

/// The model corrupted by vector gains that are constant in time.
fn get_data(model: &BlockVisibility) -> BlockVisibility {
    let gains = simulate_gain_table(
        model,
        TimeSlice::Seconds(60.0),
        JonesShape::Vector,
        GainErrors {
            phase: 0.5,
            amplitude: 0.1,
            leakage: 0.0,
        },
        1234,
    )
    .unwrap();
    apply_gaintable(model, &gains, false, None)
}

/// T at iteration 0, G at 2 and B at 5.
fn get_staggered_controls() -> CalibrationControls {
    let overrides = indexmap! {
        'G' => TermOverrides { first_selfcal: Some(2), ..Default::default() },
        'B' => TermOverrides { first_selfcal: Some(5), ..Default::default() },
    };
    CalibrationControls::new(Some(&overrides)).unwrap()
}

fn max_difference(a: &BlockVisibility, b: &BlockVisibility) -> f64 {
    a.vis()
        .iter()
        .zip(b.vis().iter())
        .fold(0.0, |acc, (a, b)| acc.max((a - b).norm()))
}

#[test]
fn test_default_controls() {
    let controls = CalibrationControls::default();
    assert_eq!(
        controls.iter().map(|(c, _)| c).collect::<String>(),
        "TGB"
    );
    assert_eq!(
        controls['T'],
        TermControls {
            shape: JonesShape::Scalar,
            time_slice: TimeSlice::Auto,
            phase_only: true,
            first_selfcal: 0,
        }
    );
    assert_eq!(controls['G'].time_slice, TimeSlice::Seconds(60.0));
    assert_eq!(controls['B'].time_slice, TimeSlice::Seconds(1e5));
    assert!(!controls['B'].phase_only);
    assert_eq!(CalibrationControls::new(None).unwrap(), controls);
}

#[test]
fn test_controls_overrides() {
    let controls = get_staggered_controls();
    assert_eq!(controls['T'].first_selfcal, 0);
    assert_eq!(controls['G'].first_selfcal, 2);
    assert_eq!(controls['G'].shape, JonesShape::Vector);
    assert_eq!(controls['B'].first_selfcal, 5);

    // New terms must be fully specified.
    let overrides = indexmap! {
        'P' => TermOverrides { shape: Some(JonesShape::Matrix), ..Default::default() },
    };
    assert_eq!(
        CalibrationControls::new(Some(&overrides)),
        Err(ControlsError::IncompleteTerm {
            term: 'P',
            missing: "time_slice"
        })
    );
    let overrides = indexmap! {
        'P' => TermOverrides {
            shape: Some(JonesShape::Matrix),
            time_slice: Some(TimeSlice::Seconds(1e4)),
            phase_only: Some(false),
            first_selfcal: None,
        },
    };
    let controls = CalibrationControls::new(Some(&overrides)).unwrap();
    assert_eq!(controls.len(), 4);
    assert_eq!(controls['P'].shape, JonesShape::Matrix);
    assert_eq!(controls['P'].first_selfcal, 0);
}

#[test]
fn test_controls_serde() {
    let controls = get_staggered_controls();
    let toml_str = toml::to_string(&controls).unwrap();
    let round_tripped: CalibrationControls = toml::from_str(&toml_str).unwrap();
    assert_eq!(round_tripped, controls);

    let controls: CalibrationControls = toml::from_str(indoc! {r#"
        [T]
        shape = "scalar"
        timeslice = "auto"
        phase_only = true
        first_selfcal = 1

        [I]
        shape = "vector"
        time_slice = 1.0
        phase_only = true
        first_selfcal = 3
    "#})
    .unwrap();
    assert_eq!(controls.len(), 2);
    assert_eq!(controls['T'].first_selfcal, 1);
    assert_eq!(controls['I'].time_slice, TimeSlice::Seconds(1.0));

    let result: Result<CalibrationControls, _> = serde_json::from_str(
        r#"{"TG": {"shape": "scalar", "time_slice": "auto", "phase_only": true, "first_selfcal": 0}}"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_parse_term_keys() {
    let map = indexmap! { "G".to_string() => 1, "B".to_string() => 2 };
    assert_eq!(parse_term_keys(map).unwrap(), indexmap! { 'G' => 1, 'B' => 2 });
    let map = indexmap! { "GB".to_string() => 1 };
    assert_eq!(
        parse_term_keys(map),
        Err(ControlsError::BadTermKey("GB".to_string()))
    );
}

#[test]
fn test_context_parsing() {
    let controls = CalibrationControls::default();
    let context = CalibrationContext::parse("TGB", &controls).unwrap();
    assert_eq!(context.iter().collect::<Vec<_>>(), vec!['T', 'G', 'B']);
    assert_eq!(
        CalibrationContext::parse("", &controls),
        Err(CalibrationError::EmptyContext)
    );
    assert_eq!(
        CalibrationContext::parse("TX", &controls),
        Err(CalibrationError::UnknownTerm {
            term: 'X',
            context: "TX".to_string()
        })
    );
    assert_eq!(
        CalibrationContext::parse("TGT", &controls),
        Err(CalibrationError::DuplicateTerm {
            term: 'T',
            context: "TGT".to_string()
        })
    );
}

#[test]
fn test_solve_calibrate_returns_every_term() {
    let model = get_model();
    let data = get_data(&model);
    let controls = get_staggered_controls();
    let tables = solve_calibrate(
        &data,
        &model,
        "TGB",
        Some(&controls),
        1,
        DEFAULT_SOLVE_TOLERANCE,
    )
    .unwrap();
    assert_eq!(tables.keys().copied().collect::<String>(), "TGB");
    assert!(tables[&'T'].is_solved());
    assert_eq!(tables[&'T'].shape(), JonesShape::Scalar);
    assert_eq!(tables[&'T'].num_slices(), 3);
    // Not active yet.
    for term in ['G', 'B'] {
        assert!(!tables[&term].is_solved());
        assert!(tables[&term]
            .gains()
            .iter()
            .all(|&g| g == Jones::identity()));
    }
    assert_eq!(tables[&'G'].num_slices(), 1);

    // The inputs are untouched.
    assert_eq!(data, get_data(&get_model()));
}

#[test]
fn test_solve_calibrate_zero_weights() {
    let model = get_model();
    let mut data = get_data(&model);
    data.set_weights(Array5::zeros(data.dim())).unwrap();

    let controls = CalibrationControls::default();
    let tables = solve_calibrate(&data, &model, "TGB", None, 10, DEFAULT_SOLVE_TOLERANCE).unwrap();
    assert_eq!(tables.len(), 3);
    for (term, table) in tables {
        let c = controls[term];
        assert_eq!(table, build_gain_table(&data, c.time_slice, c.shape));
        assert!(table.results().iter().all(|r| r.num_sweeps == 0));
    }
}

#[test]
fn test_solve_calibrate_zero_model() {
    let model = get_model();
    let data = get_data(&model);
    let mut zero_model = model.clone();
    zero_model.vis_mut().fill(Default::default());

    let tables = solve_calibrate(&data, &zero_model, "G", None, 0, DEFAULT_SOLVE_TOLERANCE).unwrap();
    assert!(!tables[&'G'].is_solved());
}

#[test]
fn test_aliasing_is_rejected() {
    let model = get_model();
    assert_eq!(
        solve_calibrate(&model, &model, "T", None, 0, DEFAULT_SOLVE_TOLERANCE),
        Err(CalibrationError::AliasedVisibilities)
    );
    assert!(matches!(
        calibrate(&model, &model, "T", None, 0, DEFAULT_CALIBRATE_TOLERANCE),
        Err(CalibrationError::AliasedVisibilities)
    ));

    // A copy is fine.
    let copy = model.clone();
    assert!(solve_calibrate(&model, &copy, "T", None, 0, DEFAULT_SOLVE_TOLERANCE).is_ok());
}

#[test]
fn test_shape_mismatch_is_rejected() {
    let model = get_model();
    let data = get_data(&model).select_channels(0..1).unwrap();
    assert!(matches!(
        solve_calibrate(&data, &model, "T", None, 0, DEFAULT_SOLVE_TOLERANCE),
        Err(CalibrationError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_calibrate_selective_activation() {
    let model = get_model();
    let data = get_data(&model);
    let controls = get_staggered_controls();

    let (corrected, tables) = calibrate(
        &data,
        &model,
        "TGB",
        Some(&controls),
        1,
        DEFAULT_CALIBRATE_TOLERANCE,
    )
    .unwrap();
    assert_eq!(tables.keys().copied().collect::<String>(), "T");
    assert!(matches!(corrected, Cow::Owned(_)));
    assert_ne!(*corrected, data);

    let (_, tables) = calibrate(
        &data,
        &model,
        "TGB",
        Some(&controls),
        3,
        DEFAULT_CALIBRATE_TOLERANCE,
    )
    .unwrap();
    assert_eq!(tables.keys().copied().collect::<String>(), "TG");

    let (corrected, tables) = calibrate(
        &data,
        &model,
        "TGB",
        Some(&controls),
        5,
        DEFAULT_CALIBRATE_TOLERANCE,
    )
    .unwrap();
    assert_eq!(tables.keys().copied().collect::<String>(), "TGB");
    assert!(tables.values().all(|t| t.is_solved()));
    // With all three terms removed, the data look like the model.
    assert!(max_difference(&corrected, &model) < 1e-3);
}

#[test]
fn test_calibrate_short_circuits() {
    let model = get_model();
    let data = get_data(&model);
    let overrides = indexmap! {
        'T' => TermOverrides { first_selfcal: Some(1), ..Default::default() },
    };
    let controls = CalibrationControls::new(Some(&overrides)).unwrap();

    let (same, tables) = calibrate(
        &data,
        &model,
        "T",
        Some(&controls),
        0,
        DEFAULT_CALIBRATE_TOLERANCE,
    )
    .unwrap();
    assert!(matches!(same, Cow::Borrowed(_)));
    assert!(tables.is_empty());
}

#[test]
fn test_calibrate_preserves_representation() {
    let model = get_model();
    let data = get_data(&model);
    let flat_model = model.to_visibility();
    let flat_data = data.to_visibility();

    let (block_result, block_tables) =
        calibrate(&data, &model, "TG", None, 0, DEFAULT_CALIBRATE_TOLERANCE).unwrap();
    let (flat_result, flat_tables): (Cow<Visibility>, _) = calibrate(
        &flat_data,
        &flat_model,
        "TG",
        None,
        0,
        DEFAULT_CALIBRATE_TOLERANCE,
    )
    .unwrap();
    assert_eq!(*flat_result, block_result.to_visibility());
    assert_eq!(flat_tables, block_tables);

    // Mixed representations work too.
    let (mixed_result, _) =
        calibrate(&flat_data, &model, "TG", None, 0, DEFAULT_CALIBRATE_TOLERANCE).unwrap();
    assert_eq!(*mixed_result, *flat_result);
}

#[test]
fn test_apply_calibration() {
    let model = get_model();
    let data = get_data(&model);
    let (_, tables) = calibrate(&data, &model, "TG", None, 0, 1e-10).unwrap();

    // Applying the solved gains to the model reproduces the data.
    let reproduced = apply_calibration(&model, &tables, "TG", None, 0).unwrap();
    assert!(max_difference(&reproduced, &data) < 1e-5);

    // B has no table, and G isn't active at iteration 0 with these controls.
    let overrides = indexmap! {
        'G' => TermOverrides { first_selfcal: Some(1), ..Default::default() },
    };
    let controls = CalibrationControls::new(Some(&overrides)).unwrap();
    let result = apply_calibration(&model, &tables, "GB", Some(&controls), 0).unwrap();
    assert!(matches!(result, Cow::Borrowed(_)));

    // Flat visibilities come back flat.
    let flat = model.to_visibility();
    let result = apply_calibration(&flat, &tables, "TG", None, 0).unwrap();
    assert_eq!(result.to_block_visibility(), *reproduced);
}

#[test]
fn test_apply_calibration_antenna_mismatch() {
    let model = get_model();
    let data = get_data(&model);
    let (_, tables) = calibrate(&data, &model, "T", None, 0, 1e-8).unwrap();

    let other = {
        let context = VisContext {
            num_antennas: 3,
            ..model.context().clone()
        };
        simulate_point_source(context, model.times().clone(), 1.0).unwrap()
    };
    assert_eq!(
        apply_calibration(&other, &tables, "T", None, 0),
        Err(CalibrationError::AntennaMismatch {
            term: 'T',
            table: 6,
            vis: 3
        })
    );
}
