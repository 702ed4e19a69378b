// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use itertools::Itertools;
use marlu::{c64, Jones};
use ndarray::prelude::*;
use strum::IntoEnumIterator;
use vec1::vec1;

use super::*;
use crate::{
    gain_table::{build_gain_table, JonesShape},
    simulate::{simulate_gain_table, simulate_point_source, GainErrors},
    vis::{BlockVisibility, Polarisations, VisContext},
};

fn get_vis(polarisations: Polarisations) -> BlockVisibility {
    let context = VisContext {
        num_antennas: 3,
        frequencies: vec1![150e6, 151e6, 152e6],
        channel_bandwidths: vec1![1e6, 1e6, 1e6],
        integration_time: 2.0,
        polarisations,
    };
    let mut vis = simulate_point_source(context, vec1![0.0, 2.0, 4.0, 6.0], 2.5).unwrap();
    // Give every sample a distinct value.
    vis.vis_mut()
        .indexed_iter_mut()
        .for_each(|((t, a1, a2, c, p), v)| {
            *v += c64::new((t + a1) as f64 * 0.1, (a2 + c + p) as f64 * 0.05);
        });
    vis
}

#[test]
fn test_apply_then_remove_is_identity() {
    for (pols, shape) in Polarisations::iter().cartesian_product(JonesShape::iter()) {
        let vis = get_vis(pols);
        let gains = simulate_gain_table(
            &vis,
            TimeSlice::Seconds(4.0),
            shape,
            GainErrors {
                phase: 1.0,
                amplitude: 0.3,
                leakage: 0.1,
            },
            1,
        )
        .unwrap();
        let corrupted = apply_gaintable(&vis, &gains, false, None);
        let restored = apply_gaintable(&corrupted, &gains, true, None);
        for (a, b) in restored.vis().iter().zip(vis.vis().iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-12);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-12);
        }
        assert!(corrupted.vis().iter().zip(vis.vis().iter()).any(|(a, b)| a != b));
        assert_eq!(restored.weights(), vis.weights());
        assert_eq!(restored.flags(), vis.flags());
    }
}

#[test]
fn test_apply_forward_sandwich() {
    let vis = get_vis(Polarisations::XX_XY_YX_YY);
    let mut table = build_gain_table(&vis, TimeSlice::Auto, JonesShape::Vector);
    let g = Jones::from([
        c64::new(2.0, 0.0),
        c64::default(),
        c64::default(),
        c64::new(0.0, 1.0),
    ]);
    table.gains.slice_mut(s![.., 1, ..]).fill(g);

    let out = apply_gaintable(&vis, &table, false, None);
    // Antenna 1 with antenna 2: G D.
    let d = vis.jones(3, 1, 2, 0);
    assert_abs_diff_eq!(out.jones(3, 1, 2, 0), g * d, epsilon = 1e-12);
    // Antenna 0 with antenna 1: D G^H.
    let d = vis.jones(0, 0, 1, 2);
    assert_abs_diff_eq!(out.jones(0, 0, 1, 2), d * g.h(), epsilon = 1e-12);
    // Neither antenna has a non-identity gain.
    assert_eq!(out.jones(2, 0, 2, 1), vis.jones(2, 0, 2, 1));
}

#[test]
fn test_singular_gains_are_not_inverted() {
    let vis = get_vis(Polarisations::XX_YY);
    let mut table = build_gain_table(&vis, TimeSlice::Auto, JonesShape::Vector);
    table.gains[(0, 0, 0)] = Jones::default();

    let out = apply_gaintable(&vis, &table, true, None);
    // Every sample touching antenna 0 in the first timestep and channel is
    // untouched; as the other gains are identity, so is everything else.
    assert_eq!(out, vis);
}

#[test]
fn test_nearest_slice_and_channel_are_used() {
    let vis = get_vis(Polarisations::XX_YY);
    // A table with a single channel and one slice.
    let single = vis.select_channels(1..2).unwrap();
    let mut table = build_gain_table(&single, TimeSlice::Seconds(1e5), JonesShape::Scalar);
    table.gains.fill(Jones::identity() * 2.0);

    let out = apply_gaintable(&vis, &table, false, Some(TimeSlice::Seconds(1e5)));
    for (a, b) in out.vis().iter().zip(vis.vis().iter()) {
        assert_abs_diff_eq!(a.re, b.re * 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(a.im, b.im * 4.0, epsilon = 1e-12);
    }
}

#[test]
#[should_panic]
fn test_antenna_mismatch_panics() {
    let vis = get_vis(Polarisations::XX_YY);
    let other = {
        let context = VisContext {
            num_antennas: 5,
            ..vis.context().clone()
        };
        BlockVisibility::zeros(context, vis.times().clone()).unwrap()
    };
    let table = build_gain_table(&other, TimeSlice::Auto, JonesShape::Scalar);
    apply_gaintable(&vis, &table, false, None);
}
