// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Applying gain tables to visibilities.

#[cfg(test)]
mod tests;

use log::{trace, warn};
use marlu::Jones;

use crate::{
    constants::DENOMINATOR_EPSILON,
    gain_table::{GainTable, TimeSlice},
    vis::BlockVisibility,
};

/// Return a copy of `vis` with the gains of `table` applied.
///
/// Each sample is corrupted as `G_p D_pq G_q^H`, or corrected as
/// `G_p^-1 D_pq G_q^-H` when `inverse` is `true`. Samples whose gains can't be
/// inverted are left untouched. Weights and flags are passed through unchanged.
///
/// Each visibility timestep uses the table's time slice containing it (or
/// failing that, the nearest one), and each channel uses the table's channel
/// with the nearest frequency. `time_slice` is the slice width the caller
/// expects the table to have; a mismatch is only worth a warning.
///
/// # Panics
///
/// Panics if `table` doesn't have the same number of antennas as `vis`.
pub fn apply_gaintable(
    vis: &BlockVisibility,
    table: &GainTable,
    inverse: bool,
    time_slice: Option<TimeSlice>,
) -> BlockVisibility {
    assert_eq!(
        vis.num_antennas(),
        table.num_antennas(),
        "The gain table and visibilities have different numbers of antennas"
    );
    if let Some(time_slice) = time_slice {
        if time_slice != table.time_slice() {
            warn!(
                "Applying a gain table with time slice {} as if it had {}",
                table.time_slice(),
                time_slice
            );
        }
    }

    let slice_indices: Vec<usize> = vis
        .times()
        .iter()
        .map(|&t| table.slice_for_time(t))
        .collect();
    let chan_indices: Vec<usize> = vis
        .context()
        .frequencies
        .iter()
        .map(|&f| table.channel_for_frequency(f))
        .collect();
    trace!("Gain-table slices per timestep: {slice_indices:?}");

    // Invert all of the gains once, rather than for every baseline.
    let gains = if inverse {
        table.gains().mapv(invert)
    } else {
        table.gains().mapv(Some)
    };

    let mut out = vis.clone();
    let num_ants = vis.num_antennas();
    let mut num_skipped = 0;
    for (i_time, &i_slice) in slice_indices.iter().enumerate() {
        for ant1 in 0..num_ants {
            for ant2 in 0..num_ants {
                for (i_chan, &i_gain_chan) in chan_indices.iter().enumerate() {
                    let (g1, g2) = match (
                        gains[(i_slice, ant1, i_gain_chan)],
                        gains[(i_slice, ant2, i_gain_chan)],
                    ) {
                        (Some(g1), Some(g2)) => (g1, g2),
                        _ => {
                            num_skipped += 1;
                            continue;
                        }
                    };
                    let d = vis.jones(i_time, ant1, ant2, i_chan);
                    out.set_jones(i_time, ant1, ant2, i_chan, g1 * d * g2.h());
                }
            }
        }
    }
    if num_skipped > 0 {
        warn!("{num_skipped} visibilities had non-invertible gains and were left uncorrected");
    }

    out
}

/// The inverse of a gain, if it has one.
fn invert(g: Jones<f64>) -> Option<Jones<f64>> {
    let det = g[0] * g[3] - g[1] * g[2];
    if g.any_nan() || det.norm() <= DENOMINATOR_EPSILON {
        return None;
    }
    let inv = g.inv();
    if inv.any_nan() {
        None
    } else {
        Some(inv)
    }
}
