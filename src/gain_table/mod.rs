// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gain tables: per-antenna Jones matrices for each time slice and channel.

mod error;

pub use error::TimeSliceError;

use std::{fmt, str::FromStr};

use itertools::Itertools;
use log::debug;
use marlu::Jones;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use vec1::Vec1;

use crate::vis::{BlockVisibility, Polarisations};

/// How a calibration term's Jones matrices are parameterised.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum JonesShape {
    /// One complex gain shared by both polarisations.
    Scalar,

    /// Independent gains on the diagonal.
    Vector,

    /// A full 2x2 Jones matrix.
    Matrix,
}

impl JonesShape {
    /// Only matrix-shaped terms solve for the off-diagonal leakage terms.
    pub fn crosspol(self) -> bool {
        matches!(self, JonesShape::Matrix)
    }

    /// The most general shape no wider than `self` whose gains survive being
    /// applied to visibilities in `pols`. Stokes I holds a single receptor
    /// gain and the parallel hands hold no leakage.
    pub fn representable_in(self, pols: Polarisations) -> JonesShape {
        match (pols, self) {
            (Polarisations::I, _) => JonesShape::Scalar,
            (Polarisations::XX_YY, JonesShape::Matrix) => JonesShape::Vector,
            _ => self,
        }
    }
}

/// The time granularity over which a gain is held constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TimeSliceRepr", into = "TimeSliceRepr")]
pub enum TimeSlice {
    /// One slice per distinct timestep in the visibilities.
    Auto,

    /// Slices of this many seconds, counted from the first timestep.
    Seconds(f64),
}

impl TimeSlice {
    pub fn seconds(s: f64) -> Result<TimeSlice, TimeSliceError> {
        if s.is_finite() && s > 0.0 {
            Ok(TimeSlice::Seconds(s))
        } else {
            Err(TimeSliceError::NotPositive(s))
        }
    }
}

impl FromStr for TimeSlice {
    type Err = TimeSliceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(TimeSlice::Auto);
        }
        let seconds: f64 = s.parse().map_err(|_| TimeSliceError::Parse(s.to_string()))?;
        TimeSlice::seconds(seconds)
    }
}

impl fmt::Display for TimeSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSlice::Auto => write!(f, "auto"),
            TimeSlice::Seconds(s) => write!(f, "{s}s"),
        }
    }
}

/// Time slices are written in argument files as either `"auto"` or a number.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TimeSliceRepr {
    Seconds(f64),
    Named(String),
}

impl TryFrom<TimeSliceRepr> for TimeSlice {
    type Error = TimeSliceError;

    fn try_from(value: TimeSliceRepr) -> Result<Self, Self::Error> {
        match value {
            TimeSliceRepr::Seconds(s) => TimeSlice::seconds(s),
            TimeSliceRepr::Named(s) => s.parse(),
        }
    }
}

impl From<TimeSlice> for TimeSliceRepr {
    fn from(value: TimeSlice) -> Self {
        match value {
            TimeSlice::Auto => TimeSliceRepr::Named("auto".to_string()),
            TimeSlice::Seconds(s) => TimeSliceRepr::Seconds(s),
        }
    }
}

/// The outcome of solving one (time slice, channel) cell of a gain table.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SolveResult {
    /// Zero if the cell was never solved.
    pub num_sweeps: u32,

    /// Did the gains settle within the tolerance before the sweep ceiling?
    pub converged: bool,

    /// The largest change of any gain element between the last two sweeps,
    /// as seen at the last convergence check.
    pub max_change: f64,
}

/// The time slices derived from a set of timestamps.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TimeSlices {
    pub(crate) centres: Vec1<f64>,
    pub(crate) intervals: Vec1<f64>,

    /// The slice index of each input timestamp.
    pub(crate) slice_of_time: Vec<usize>,
}

/// Group ascending `times` into slices.
pub(crate) fn bin_times(times: &Vec1<f64>, integration_time: f64, time_slice: TimeSlice) -> TimeSlices {
    match time_slice {
        TimeSlice::Auto => TimeSlices {
            centres: times.clone(),
            intervals: times.mapped_ref(|_| integration_time),
            slice_of_time: (0..times.len()).collect(),
        },

        TimeSlice::Seconds(width) => {
            let t0 = *times.first();
            let mut centres = vec![];
            let mut slice_of_time = Vec::with_capacity(times.len());
            for (_, group) in &times
                .iter()
                .group_by(|&&t| ((t - t0) / width).floor() as i64)
            {
                let group: Vec<f64> = group.copied().collect();
                let i_slice = centres.len();
                slice_of_time.extend(std::iter::repeat(i_slice).take(group.len()));
                centres.push(group.iter().sum::<f64>() / group.len() as f64);
            }
            // `times` is non-empty, so there's at least one slice.
            let centres = Vec1::try_from_vec(centres).unwrap_or_else(|_| unreachable!());
            TimeSlices {
                intervals: centres.mapped_ref(|_| width),
                centres,
                slice_of_time,
            }
        }
    }
}

/// Solved (or identity) gains for one calibration term.
#[derive(Debug, Clone, PartialEq)]
pub struct GainTable {
    /// Dimensions (time slice, antenna, channel).
    pub(crate) gains: Array3<Jones<f64>>,

    /// The solution quality of each gain; zero means the gain should not be
    /// trusted. Same dimensions as `gains`.
    pub(crate) weights: Array3<f64>,

    /// Dimensions (time slice, channel).
    pub(crate) results: Array2<SolveResult>,

    pub(crate) slice_centres: Vec1<f64>,
    pub(crate) slice_intervals: Vec1<f64>,
    pub(crate) time_slice: TimeSlice,
    pub(crate) shape: JonesShape,
    pub(crate) frequencies: Vec1<f64>,
    pub(crate) polarisations: Polarisations,
}

/// Build an identity gain table for `vis`.
///
/// The table has a gain for every antenna and channel of `vis` in each time
/// slice. If `vis` has no usable (unflagged, positive-weight) samples, the
/// table's weights are all zero, but it is otherwise still an identity table.
pub fn build_gain_table(vis: &BlockVisibility, time_slice: TimeSlice, shape: JonesShape) -> GainTable {
    let context = vis.context();
    let slices = bin_times(vis.times(), context.integration_time, time_slice);
    let dim = (
        slices.centres.len(),
        context.num_antennas,
        context.num_channels(),
    );
    let weight = if vis.has_usable_samples() {
        1.0
    } else {
        debug!("No usable visibilities; gain table weights are all zero");
        0.0
    };

    GainTable {
        gains: Array3::from_elem(dim, Jones::identity()),
        weights: Array3::from_elem(dim, weight),
        results: Array2::default((dim.0, dim.2)),
        slice_centres: slices.centres,
        slice_intervals: slices.intervals,
        time_slice,
        shape,
        frequencies: context.frequencies.clone(),
        polarisations: context.polarisations,
    }
}

impl GainTable {
    pub fn gains(&self) -> ArrayView3<Jones<f64>> {
        self.gains.view()
    }

    pub fn weights(&self) -> ArrayView3<f64> {
        self.weights.view()
    }

    pub fn results(&self) -> ArrayView2<SolveResult> {
        self.results.view()
    }

    pub fn slice_centres(&self) -> &Vec1<f64> {
        &self.slice_centres
    }

    pub fn slice_intervals(&self) -> &Vec1<f64> {
        &self.slice_intervals
    }

    pub fn time_slice(&self) -> TimeSlice {
        self.time_slice
    }

    pub fn shape(&self) -> JonesShape {
        self.shape
    }

    pub fn frequencies(&self) -> &Vec1<f64> {
        &self.frequencies
    }

    pub fn polarisations(&self) -> Polarisations {
        self.polarisations
    }

    pub fn num_slices(&self) -> usize {
        self.gains.len_of(Axis(0))
    }

    pub fn num_antennas(&self) -> usize {
        self.gains.len_of(Axis(1))
    }

    pub fn num_channels(&self) -> usize {
        self.gains.len_of(Axis(2))
    }

    /// Did every cell of this table converge? Tables that were never solved
    /// report `false`.
    pub fn is_converged(&self) -> bool {
        self.results.iter().all(|r| r.converged)
    }

    /// Was any cell of this table actually solved?
    pub fn is_solved(&self) -> bool {
        self.results.iter().any(|r| r.num_sweeps > 0)
    }

    /// The slice whose interval contains `time`, or failing that, the slice
    /// with the nearest centre.
    pub fn slice_for_time(&self, time: f64) -> usize {
        let containing = self
            .slice_centres
            .iter()
            .zip(self.slice_intervals.iter())
            .position(|(&c, &w)| (time - c).abs() <= w / 2.0);
        containing.unwrap_or_else(|| nearest(&self.slice_centres, time))
    }

    /// The channel with the nearest frequency to `freq`.
    pub fn channel_for_frequency(&self, freq: f64) -> usize {
        nearest(&self.frequencies, freq)
    }

    /// Summarise the amplitudes and phases of the trusted gains.
    pub fn qa(&self) -> GainTableQa {
        // Look at the parallel hands only.
        let mut amps = vec![];
        let mut phases = vec![];
        for (g, &w) in self.gains.iter().zip(self.weights.iter()) {
            if w <= 0.0 || g.any_nan() {
                continue;
            }
            for p in [g[0], g[3]] {
                amps.push(p.norm());
                phases.push(p.arg());
            }
        }
        amps.sort_unstable_by(f64::total_cmp);

        let num_cells = self.results.len();
        let num_converged = self.results.iter().filter(|r| r.converged).count();
        let max_sweeps = self.results.iter().map(|r| r.num_sweeps).max().unwrap_or(0);
        let (min_amp, max_amp, median_amp) = match (amps.first(), amps.last()) {
            (Some(&min), Some(&max)) => (min, max, amps[amps.len() / 2]),
            _ => (f64::NAN, f64::NAN, f64::NAN),
        };
        let rms_phase = if phases.is_empty() {
            f64::NAN
        } else {
            (phases.iter().map(|p| p * p).sum::<f64>() / phases.len() as f64).sqrt()
        };

        GainTableQa {
            shape: self.shape,
            time_slice: self.time_slice,
            num_slices: self.num_slices(),
            num_antennas: self.num_antennas(),
            num_channels: self.num_channels(),
            min_amp,
            max_amp,
            median_amp,
            rms_phase,
            num_converged,
            num_cells,
            max_sweeps,
        }
    }
}

fn nearest(values: &[f64], target: f64) -> usize {
    values
        .iter()
        .map(|v| (v - target).abs())
        .position_min_by(|a, b| a.total_cmp(b))
        .unwrap_or(0)
}

/// A quality-assessment summary of a [`GainTable`].
#[derive(Debug, Clone, PartialEq)]
pub struct GainTableQa {
    pub shape: JonesShape,
    pub time_slice: TimeSlice,
    pub num_slices: usize,
    pub num_antennas: usize,
    pub num_channels: usize,

    /// Statistics of the parallel-hand gain amplitudes.
    pub min_amp: f64,
    pub max_amp: f64,
    pub median_amp: f64,

    /// \[radians\]
    pub rms_phase: f64,

    pub num_converged: usize,
    pub num_cells: usize,
    pub max_sweeps: u32,
}

impl fmt::Display for GainTableQa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} gains, time slice {}: {} slices x {} antennas x {} channels; amplitude min {:.4} median {:.4} max {:.4}; rms phase {:.4} rad; {}/{} cells converged (max {} sweeps)",
            self.shape,
            self.time_slice,
            self.num_slices,
            self.num_antennas,
            self.num_channels,
            self.min_amp,
            self.median_amp,
            self.max_amp,
            self.rms_phase,
            self.num_converged,
            self.num_cells,
            self.max_sweeps,
        )
    }
}
