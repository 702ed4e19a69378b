// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Direction-independent gain solving.
//!
//! Gains are found by iterative substitution ("MitchCal", equation 11 of
//! Mitchell et al. 2008, with the StefCal averaging of Salvini & Wijnholds
//! 2014). Each (time slice, channel) cell of a gain table is solved
//! independently.


use log::{debug, trace};
use marlu::{c64, Jones};
use ndarray::prelude::*;

use crate::{
    constants::{DEFAULT_MAX_SWEEPS, DENOMINATOR_EPSILON},
    gain_table::{bin_times, build_gain_table, GainTable, JonesShape, SolveResult, TimeSlice},
    vis::BlockVisibility,
};

/// Solve for the gains that best turn `model` into `vis`, i.e. find `G` such
/// that `D_pq ≈ G_p M_pq G_q^H` for every cross-correlation.
///
/// If `model` is `None`, the model is a unit point source at the phase
/// centre. `crosspol` only has an effect for matrix-shaped tables; otherwise
/// only the parallel hands are solved and the off-diagonal terms stay at
/// zero. With `phase_only`, the parallel-hand gains are forced to unit
/// amplitude.
///
/// If `vis` has no usable samples, or either `vis` or `model` has no
/// non-zero samples, no solving is attempted and an identity table is
/// returned. Non-convergence is not an error; the returned table's
/// [`SolveResult`]s say whether each cell converged.
///
/// # Panics
///
/// Panics if `vis` and `model` don't have the same dimensions.
pub fn solve_gaintable(
    vis: &BlockVisibility,
    model: Option<&BlockVisibility>,
    time_slice: TimeSlice,
    shape: JonesShape,
    phase_only: bool,
    crosspol: bool,
    tol: f64,
) -> GainTable {
    solve_gaintable_inner(
        vis,
        model,
        time_slice,
        shape,
        phase_only,
        crosspol,
        tol,
        DEFAULT_MAX_SWEEPS,
    )
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn solve_gaintable_inner(
    vis: &BlockVisibility,
    model: Option<&BlockVisibility>,
    time_slice: TimeSlice,
    shape: JonesShape,
    phase_only: bool,
    crosspol: bool,
    tol: f64,
    max_sweeps: u32,
) -> GainTable {
    if let Some(model) = model {
        assert_eq!(
            vis.dim(),
            model.dim(),
            "Observed and model visibilities must have the same dimensions"
        );
    }

    let mut table = build_gain_table(vis, time_slice, shape);
    if !vis.has_usable_samples() {
        debug!("All visibility weights are zero or flagged; not solving");
        return table;
    }
    if vis.max_abs_vis() <= 0.0 {
        debug!("Observed visibilities are all zero; not solving");
        return table;
    }
    if model.map(|m| m.max_abs_vis() <= 0.0).unwrap_or(false) {
        debug!("Model visibilities are all zero; not solving");
        return table;
    }

    let crosspol = crosspol && shape.crosspol();
    let slices = bin_times(vis.times(), vis.context().integration_time, time_slice);
    let num_slices = slices.centres.len();
    for i_slice in 0..num_slices {
        let timesteps: Vec<usize> = slices
            .slice_of_time
            .iter()
            .enumerate()
            .filter(|(_, &s)| s == i_slice)
            .map(|(i_time, _)| i_time)
            .collect();

        for i_chan in 0..vis.num_channels() {
            let samples = gather_samples(vis, model, &timesteps, i_chan);
            let mut antenna_weights = table.weights.slice_mut(s![i_slice, .., i_chan]);
            antenna_weights.fill(0.0);
            for s in &samples {
                antenna_weights[s.ant1] += s.weight;
                antenna_weights[s.ant2] += s.weight;
            }
            if samples.is_empty() {
                trace!("Slice {i_slice} channel {i_chan}: no usable samples");
                continue;
            }

            let result = solve_cell(
                &samples,
                table.gains.slice_mut(s![i_slice, .., i_chan]),
                shape,
                phase_only,
                crosspol,
                tol,
                max_sweeps,
            );
            trace!(
                "Slice {i_slice} channel {i_chan}: {} sweeps, converged: {}, max change {:e}",
                result.num_sweeps,
                result.converged,
                result.max_change
            );
            table.results[(i_slice, i_chan)] = result;
        }
    }

    table
}

/// A cross-correlation contributing to a cell's solution.
#[derive(Debug, Clone, Copy)]
struct CellSample {
    ant1: usize,
    ant2: usize,
    weight: f64,
    data: Jones<f64>,
    model: Jones<f64>,
}

fn gather_samples(
    vis: &BlockVisibility,
    model: Option<&BlockVisibility>,
    timesteps: &[usize],
    i_chan: usize,
) -> Vec<CellSample> {
    let num_ants = vis.num_antennas();
    let mut samples = vec![];
    for &i_time in timesteps {
        for ant1 in 0..num_ants {
            for ant2 in ant1 + 1..num_ants {
                let weight = vis.solve_weight(i_time, ant1, ant2, i_chan);
                if weight <= 0.0 {
                    continue;
                }
                samples.push(CellSample {
                    ant1,
                    ant2,
                    weight,
                    data: vis.jones(i_time, ant1, ant2, i_chan),
                    model: match model {
                        Some(m) => m.jones(i_time, ant1, ant2, i_chan),
                        None => Jones::identity(),
                    },
                });
            }
        }
    }
    samples
}

/// Iterate on the gains of a single cell until they converge or the sweep
/// ceiling is reached. `gains` must be identity on entry.
fn solve_cell(
    samples: &[CellSample],
    mut gains: ArrayViewMut1<Jones<f64>>,
    shape: JonesShape,
    phase_only: bool,
    crosspol: bool,
    tol: f64,
    max_sweeps: u32,
) -> SolveResult {
    let num_ants = gains.len();
    let mut old_gains = gains.to_owned();
    let mut top = Array1::from_elem(num_ants, Jones::default());
    let mut bot = Array1::from_elem(num_ants, Jones::default());
    let mut changes: Array1<f64> = Array1::zeros(num_ants);

    let mut result = SolveResult::default();
    while result.num_sweeps < max_sweeps {
        result.num_sweeps += 1;
        top.fill(Jones::default());
        bot.fill(Jones::default());
        accumulate(samples, gains.view(), top.view_mut(), bot.view_mut());
        let scale = largest_element(bot.view());

        // If `top` and `bot` already agree, the data match the model and the
        // identity gains are the solution.
        if result.num_sweeps == 1 && top_and_bot_agree(top.view(), bot.view(), tol * scale) {
            result.converged = true;
            break;
        }

        for ((gain, top), bot) in gains.iter_mut().zip(top.iter()).zip(bot.iter()) {
            let new = update_gain(*gain, *top, *bot, scale, shape, crosspol);
            *gain = if phase_only { project_phase(new) } else { new };
        }

        // Every second sweep, replace the gains with the average of the last
        // two sweeps and check for convergence.
        if result.num_sweeps % 2 == 0 {
            for ((gain, old), change) in gains
                .iter_mut()
                .zip(old_gains.iter())
                .zip(changes.iter_mut())
            {
                let diff = *gain - *old;
                *change = (0..4).map(|i| diff[i].norm()).fold(0.0, f64::max);
                let avg = (*gain + *old) * 0.5;
                *gain = if phase_only { project_phase(avg) } else { avg };
            }
            result.max_change = changes.iter().fold(0.0, |acc, &c| acc.max(c));
            if changes.iter().all(|&c| c < tol) {
                result.converged = true;
                break;
            }
        }
        old_gains.assign(&gains);
    }

    result
}

/// Sum the numerator ("top") and denominator ("bot") of each antenna's next
/// gain estimate, holding the other antennas' gains fixed.
#[allow(non_snake_case)]
fn accumulate(
    samples: &[CellSample],
    gains: ArrayView1<Jones<f64>>,
    mut top: ArrayViewMut1<Jones<f64>>,
    mut bot: ArrayViewMut1<Jones<f64>>,
) {
    for s in samples {
        let D = s.data;
        let M = s.model;
        // Antenna 1: ( D G2 M^H ) / ( (G2 M^H)^H (G2 M^H) )
        {
            let Z = gains[s.ant2] * M.h();
            top[s.ant1] += D * Z * s.weight;
            bot[s.ant1] += Z.h() * Z * s.weight;
        }
        // Antenna 2: ( D^H G1 M ) / ( (G1 M)^H (G1 M) )
        {
            let Z = gains[s.ant1] * M;
            top[s.ant2] += D.h() * Z * s.weight;
            bot[s.ant2] += Z.h() * Z * s.weight;
        }
    }
}

/// The largest element magnitude of any antenna's accumulated Jones matrix.
fn largest_element(js: ArrayView1<Jones<f64>>) -> f64 {
    js.iter()
        .flat_map(|j| (0..4).map(move |i| j[i].norm()))
        .fold(0.0, f64::max)
}

fn top_and_bot_agree(top: ArrayView1<Jones<f64>>, bot: ArrayView1<Jones<f64>>, tol: f64) -> bool {
    top.iter().zip(bot.iter()).all(|(top, bot)| {
        let diff = *top - *bot;
        (0..4).all(|i| diff[i].re.abs() <= tol && diff[i].im.abs() <= tol)
    })
}

/// The next estimate of a gain given its accumulated `top` and `bot`. Any
/// element with a degenerate denominator keeps its `prior` value; a
/// denominator is degenerate when it is negligible next to `scale`, the
/// largest denominator element in the cell.
fn update_gain(
    prior: Jones<f64>,
    top: Jones<f64>,
    bot: Jones<f64>,
    scale: f64,
    shape: JonesShape,
    crosspol: bool,
) -> Jones<f64> {
    let zero = c64::default();
    let floor = DENOMINATOR_EPSILON * scale;
    let new = match shape {
        JonesShape::Scalar => {
            let b = bot[0] + bot[3];
            if b.norm() <= floor {
                return prior;
            }
            let g = (top[0] + top[3]) / b;
            Jones::from([g, zero, zero, g])
        }

        JonesShape::Matrix if crosspol => {
            let det = bot[0] * bot[3] - bot[1] * bot[2];
            if det.norm() <= floor * scale {
                return prior;
            }
            top * bot.inv()
        }

        JonesShape::Vector | JonesShape::Matrix => {
            let div = |t: c64, b: c64, p: c64| {
                if b.norm() <= floor {
                    p
                } else {
                    t / b
                }
            };
            Jones::from([
                div(top[0], bot[0], prior[0]),
                prior[1],
                prior[2],
                div(top[3], bot[3], prior[3]),
            ])
        }
    };

    if new.any_nan() {
        prior
    } else {
        new
    }
}

/// Force the parallel-hand gains onto the unit circle.
fn project_phase(j: Jones<f64>) -> Jones<f64> {
    let unit = |z: c64| {
        let norm = z.norm();
        if norm > 0.0 {
            z / norm
        } else {
            c64::new(1.0, 0.0)
        }
    };
    Jones::from([unit(j[0]), j[1], j[2], unit(j[3])])
}
