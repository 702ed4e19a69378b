// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Visibility containers.
//!
//! Visibilities come in two representations. A [`BlockVisibility`] holds
//! samples in a dense `(time, antenna1, antenna2, channel, pol)` block; this
//! is what the gain solver and applicator work on. A [`Visibility`] holds the
//! same samples "baseline-flattened", i.e. one row per `(time, antenna1,
//! antenna2, channel)` with a column per polarisation. Conversion between the
//! two is lossless in both directions.
//!
//! Both representations store the full antenna-pair grid (autocorrelations and
//! both orientations of each baseline). Calibration only reads the
//! cross-correlations with `antenna1 < antenna2`.

mod error;

pub use error::VisibilityError;

use std::{borrow::Cow, ops::Range};

use itertools::Itertools;
use marlu::{c64, Jones};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use vec1::Vec1;

/// The polarisations present in a visibility set.
#[allow(non_camel_case_types)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum Polarisations {
    /// Stokes I only.
    #[strum(to_string = "I", serialize = "stokesI")]
    I,

    /// The parallel hands of linear feeds.
    #[strum(to_string = "XX_YY", serialize = "linearnp")]
    XX_YY,

    /// All four correlations of linear feeds.
    #[strum(to_string = "XX_XY_YX_YY", serialize = "linear")]
    XX_XY_YX_YY,
}

impl Default for Polarisations {
    fn default() -> Self {
        Polarisations::XX_XY_YX_YY
    }
}

impl Polarisations {
    pub fn num_pols(self) -> usize {
        match self {
            Polarisations::I => 1,
            Polarisations::XX_YY => 2,
            Polarisations::XX_XY_YX_YY => 4,
        }
    }

    /// Arrange a sample's polarisation vector into a Jones matrix. Missing
    /// cross-hands are zero; Stokes I occupies both diagonal elements.
    pub(crate) fn pols_to_jones(self, pols: ArrayView1<c64>) -> Jones<f64> {
        let zero = c64::default();
        match self {
            Polarisations::I => Jones::from([pols[0], zero, zero, pols[0]]),
            Polarisations::XX_YY => Jones::from([pols[0], zero, zero, pols[1]]),
            Polarisations::XX_XY_YX_YY => Jones::from([pols[0], pols[1], pols[2], pols[3]]),
        }
    }

    /// The inverse of [`Polarisations::pols_to_jones`]. Stokes I is recovered
    /// as the mean of the diagonal elements; elements that have no slot in
    /// this frame are discarded.
    pub(crate) fn jones_to_pols(self, j: Jones<f64>, mut out: ArrayViewMut1<c64>) {
        match self {
            Polarisations::I => out[0] = (j[0] + j[3]) * 0.5,
            Polarisations::XX_YY => {
                out[0] = j[0];
                out[1] = j[3];
            }
            Polarisations::XX_XY_YX_YY => {
                out[0] = j[0];
                out[1] = j[1];
                out[2] = j[2];
                out[3] = j[3];
            }
        }
    }
}

/// Metadata shared by every sample of a visibility set.
#[derive(Debug, Clone, PartialEq)]
pub struct VisContext {
    /// The total number of antennas (stations) in the array.
    pub num_antennas: usize,

    /// The centre frequency of each channel \[Hz\].
    pub frequencies: Vec1<f64>,

    /// The bandwidth of each channel \[Hz\].
    pub channel_bandwidths: Vec1<f64>,

    /// The integration time of each timestep \[seconds\].
    pub integration_time: f64,

    pub polarisations: Polarisations,
}

impl VisContext {
    fn validate(&self) -> Result<(), VisibilityError> {
        if self.num_antennas == 0 {
            return Err(VisibilityError::NoAntennas);
        }
        if self.frequencies.len() != self.channel_bandwidths.len() {
            return Err(VisibilityError::BandwidthMismatch {
                num_freqs: self.frequencies.len(),
                num_bandwidths: self.channel_bandwidths.len(),
            });
        }
        Ok(())
    }

    pub fn num_channels(&self) -> usize {
        self.frequencies.len()
    }
}

fn check_times(times: &[f64]) -> Result<(), VisibilityError> {
    if let Some(&time) = times.iter().find(|t| !t.is_finite()) {
        return Err(VisibilityError::NonFiniteTime { time });
    }
    for (&prev, &next) in times.iter().tuple_windows() {
        if next <= prev {
            return Err(VisibilityError::UnsortedTimes { prev, next });
        }
    }
    Ok(())
}

fn check_weights<'a, I: IntoIterator<Item = &'a f64>>(weights: I) -> Result<(), VisibilityError> {
    match weights
        .into_iter()
        .find(|w| !w.is_finite() || **w < 0.0)
    {
        Some(&weight) => Err(VisibilityError::InvalidWeight { weight }),
        None => Ok(()),
    }
}

/// Visibilities in block form, indexed by `(time, antenna1, antenna2,
/// channel, pol)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockVisibility {
    context: VisContext,

    /// The centroid of each timestep \[seconds\]. Strictly ascending.
    times: Vec1<f64>,

    vis: Array5<c64>,

    /// Always non-negative.
    weights: Array5<f64>,

    /// `true` means the sample is excluded from solving.
    flags: Array5<bool>,
}

impl BlockVisibility {
    pub fn new(
        context: VisContext,
        times: Vec1<f64>,
        vis: Array5<c64>,
        weights: Array5<f64>,
        flags: Array5<bool>,
    ) -> Result<BlockVisibility, VisibilityError> {
        context.validate()?;
        check_times(&times)?;
        let expected = [
            times.len(),
            context.num_antennas,
            context.num_antennas,
            context.num_channels(),
            context.polarisations.num_pols(),
        ];
        for (thing, actual) in [
            ("vis", vis.shape()),
            ("weights", weights.shape()),
            ("flags", flags.shape()),
        ] {
            if actual != expected {
                return Err(VisibilityError::BadShape {
                    thing,
                    expected: expected.to_vec(),
                    actual: actual.to_vec(),
                });
            }
        }
        check_weights(weights.iter())?;

        Ok(BlockVisibility {
            context,
            times,
            vis,
            weights,
            flags,
        })
    }

    /// Make a block of zero-valued, unflagged visibilities with unit weights.
    pub fn zeros(context: VisContext, times: Vec1<f64>) -> Result<BlockVisibility, VisibilityError> {
        context.validate()?;
        check_times(&times)?;
        let shape = (
            times.len(),
            context.num_antennas,
            context.num_antennas,
            context.num_channels(),
            context.polarisations.num_pols(),
        );
        Ok(BlockVisibility {
            context,
            times,
            vis: Array5::zeros(shape),
            weights: Array5::ones(shape),
            flags: Array5::from_elem(shape, false),
        })
    }

    pub fn context(&self) -> &VisContext {
        &self.context
    }

    pub fn times(&self) -> &Vec1<f64> {
        &self.times
    }

    pub fn vis(&self) -> ArrayView5<c64> {
        self.vis.view()
    }

    pub fn vis_mut(&mut self) -> ArrayViewMut5<c64> {
        self.vis.view_mut()
    }

    pub fn weights(&self) -> ArrayView5<f64> {
        self.weights.view()
    }

    /// Replace all of the weights. The new weights must have the same shape
    /// and be non-negative.
    pub fn set_weights(&mut self, weights: Array5<f64>) -> Result<(), VisibilityError> {
        if weights.dim() != self.weights.dim() {
            return Err(VisibilityError::BadShape {
                thing: "weights",
                expected: self.weights.shape().to_vec(),
                actual: weights.shape().to_vec(),
            });
        }
        check_weights(weights.iter())?;
        self.weights = weights;
        Ok(())
    }

    pub fn flags(&self) -> ArrayView5<bool> {
        self.flags.view()
    }

    pub fn flags_mut(&mut self) -> ArrayViewMut5<bool> {
        self.flags.view_mut()
    }

    pub fn num_times(&self) -> usize {
        self.times.len()
    }

    pub fn num_antennas(&self) -> usize {
        self.context.num_antennas
    }

    pub fn num_channels(&self) -> usize {
        self.context.num_channels()
    }

    pub fn polarisations(&self) -> Polarisations {
        self.context.polarisations
    }

    /// `(num_times, num_antennas, num_antennas, num_channels, num_pols)`.
    pub fn dim(&self) -> (usize, usize, usize, usize, usize) {
        self.vis.dim()
    }

    /// Is there at least one unflagged sample with a positive weight?
    pub fn has_usable_samples(&self) -> bool {
        self.weights
            .iter()
            .zip(self.flags.iter())
            .any(|(&w, &f)| !f && w > 0.0)
    }

    /// The largest absolute weight.
    pub fn max_abs_weight(&self) -> f64 {
        self.weights.iter().fold(0.0, |acc, w| acc.max(w.abs()))
    }

    /// The largest visibility amplitude.
    pub fn max_abs_vis(&self) -> f64 {
        self.vis.iter().fold(0.0, |acc, v| acc.max(v.norm()))
    }

    /// The sample at `(time, antenna1, antenna2, channel)` as a Jones matrix.
    pub(crate) fn jones(&self, i_time: usize, ant1: usize, ant2: usize, i_chan: usize) -> Jones<f64> {
        self.context
            .polarisations
            .pols_to_jones(self.vis.slice(s![i_time, ant1, ant2, i_chan, ..]))
    }

    pub(crate) fn set_jones(
        &mut self,
        i_time: usize,
        ant1: usize,
        ant2: usize,
        i_chan: usize,
        j: Jones<f64>,
    ) {
        let pols = self.context.polarisations;
        pols.jones_to_pols(j, self.vis.slice_mut(s![i_time, ant1, ant2, i_chan, ..]));
    }

    /// The weight a sample carries when solving. If any polarisation of the
    /// sample is flagged the weight is zero, otherwise it's the smallest
    /// polarisation weight.
    pub(crate) fn solve_weight(&self, i_time: usize, ant1: usize, ant2: usize, i_chan: usize) -> f64 {
        let flags = self.flags.slice(s![i_time, ant1, ant2, i_chan, ..]);
        if flags.iter().any(|&f| f) {
            return 0.0;
        }
        self.weights
            .slice(s![i_time, ant1, ant2, i_chan, ..])
            .iter()
            .fold(f64::INFINITY, |acc, &w| acc.min(w))
    }

    /// Does `other` have the same axes as `self`?
    pub fn same_shape(&self, other: &BlockVisibility) -> bool {
        self.dim() == other.dim()
    }

    /// Make a new block containing only the channels in `range`. This is how
    /// a visibility set is partitioned by frequency.
    pub fn select_channels(&self, range: Range<usize>) -> Result<BlockVisibility, VisibilityError> {
        let num_channels = self.num_channels();
        if range.start >= range.end || range.end > num_channels {
            return Err(VisibilityError::BadChannelRange {
                start: range.start,
                end: range.end,
                num_channels,
            });
        }
        let select = |v: &[f64]| -> Result<Vec1<f64>, VisibilityError> {
            Vec1::try_from_vec(v[range.clone()].to_vec()).map_err(|_| {
                VisibilityError::BadChannelRange {
                    start: range.start,
                    end: range.end,
                    num_channels,
                }
            })
        };
        let context = VisContext {
            frequencies: select(self.context.frequencies.as_slice())?,
            channel_bandwidths: select(self.context.channel_bandwidths.as_slice())?,
            ..self.context.clone()
        };
        let chans = s![.., .., .., range.clone(), ..];
        Ok(BlockVisibility {
            context,
            times: self.times.clone(),
            vis: self.vis.slice(chans).to_owned(),
            weights: self.weights.slice(chans).to_owned(),
            flags: self.flags.slice(chans).to_owned(),
        })
    }

    /// Flatten this block into one row per `(time, antenna1, antenna2,
    /// channel)`.
    pub fn to_visibility(&self) -> Visibility {
        let (num_times, num_ants, _, num_chans, num_pols) = self.dim();
        let num_rows = num_times * num_ants * num_ants * num_chans;
        let mut time = Vec::with_capacity(num_rows);
        let mut antenna1 = Vec::with_capacity(num_rows);
        let mut antenna2 = Vec::with_capacity(num_rows);
        let mut channel = Vec::with_capacity(num_rows);
        for &t in self.times.iter() {
            for ant1 in 0..num_ants {
                for ant2 in 0..num_ants {
                    for i_chan in 0..num_chans {
                        time.push(t);
                        antenna1.push(ant1);
                        antenna2.push(ant2);
                        channel.push(i_chan);
                    }
                }
            }
        }

        // The block's standard layout is already the canonical row order.
        let block_index = |row: usize| {
            let i_chan = row % num_chans;
            let ant2 = (row / num_chans) % num_ants;
            let ant1 = (row / (num_chans * num_ants)) % num_ants;
            let i_time = row / (num_chans * num_ants * num_ants);
            (i_time, ant1, ant2, i_chan)
        };
        let vis = Array2::from_shape_fn((num_rows, num_pols), |(row, p)| {
            let (t, a1, a2, c) = block_index(row);
            self.vis[(t, a1, a2, c, p)]
        });
        let weights = Array2::from_shape_fn((num_rows, num_pols), |(row, p)| {
            let (t, a1, a2, c) = block_index(row);
            self.weights[(t, a1, a2, c, p)]
        });
        let flags = Array2::from_shape_fn((num_rows, num_pols), |(row, p)| {
            let (t, a1, a2, c) = block_index(row);
            self.flags[(t, a1, a2, c, p)]
        });

        Visibility {
            context: self.context.clone(),
            times: self.times.clone(),
            time,
            antenna1,
            antenna2,
            channel,
            vis,
            weights,
            flags,
        }
    }
}

/// Baseline-flattened visibilities; one row per `(time, antenna1, antenna2,
/// channel)` sample, with a column per polarisation.
///
/// Rows are always kept in canonical (time, antenna1, antenna2, channel)
/// order and always cover the complete grid, which is what makes conversion
/// to and from [`BlockVisibility`] lossless.
#[derive(Debug, Clone, PartialEq)]
pub struct Visibility {
    context: VisContext,

    /// The distinct timestamps, ascending \[seconds\].
    times: Vec1<f64>,

    time: Vec<f64>,
    antenna1: Vec<usize>,
    antenna2: Vec<usize>,
    channel: Vec<usize>,

    /// Dimensions of (row, pol).
    vis: Array2<c64>,
    weights: Array2<f64>,
    flags: Array2<bool>,
}

impl Visibility {
    /// Make a flattened visibility set from rows in any order. The rows are
    /// sorted into canonical order; they must cover every `(time, antenna1,
    /// antenna2, channel)` combination exactly once.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: VisContext,
        time: Vec<f64>,
        antenna1: Vec<usize>,
        antenna2: Vec<usize>,
        channel: Vec<usize>,
        vis: Array2<c64>,
        weights: Array2<f64>,
        flags: Array2<bool>,
    ) -> Result<Visibility, VisibilityError> {
        context.validate()?;
        let num_rows = time.len();
        let num_pols = context.polarisations.num_pols();
        let num_ants = context.num_antennas;
        let num_chans = context.num_channels();
        for (thing, len) in [
            ("antenna1", antenna1.len()),
            ("antenna2", antenna2.len()),
            ("channel", channel.len()),
        ] {
            if len != num_rows {
                return Err(VisibilityError::BadShape {
                    thing,
                    expected: vec![num_rows],
                    actual: vec![len],
                });
            }
        }
        for (thing, actual) in [
            ("vis", vis.shape()),
            ("weights", weights.shape()),
            ("flags", flags.shape()),
        ] {
            if actual != [num_rows, num_pols] {
                return Err(VisibilityError::BadShape {
                    thing,
                    expected: vec![num_rows, num_pols],
                    actual: actual.to_vec(),
                });
            }
        }
        check_weights(weights.iter())?;

        let mut unique_times = time.clone();
        unique_times.sort_by(|a, b| a.total_cmp(b));
        unique_times.dedup();
        let times = Vec1::try_from_vec(unique_times).map_err(|_| VisibilityError::IncompleteGrid {
            expected: num_ants * num_ants * num_chans,
            actual: 0,
        })?;
        check_times(&times)?;

        let expected_rows = times.len() * num_ants * num_ants * num_chans;
        if num_rows != expected_rows {
            return Err(VisibilityError::IncompleteGrid {
                expected: expected_rows,
                actual: num_rows,
            });
        }

        // Map each canonical slot to the row that fills it.
        let mut source_rows: Vec<Option<usize>> = vec![None; num_rows];
        for row in 0..num_rows {
            let (a1, a2, c) = (antenna1[row], antenna2[row], channel[row]);
            for antenna in [a1, a2] {
                if antenna >= num_ants {
                    return Err(VisibilityError::AntennaOutOfRange {
                        row,
                        antenna,
                        num_antennas: num_ants,
                    });
                }
            }
            if c >= num_chans {
                return Err(VisibilityError::ChannelOutOfRange {
                    row,
                    channel: c,
                    num_channels: num_chans,
                });
            }
            // Every row's time is in `times`, so the search always succeeds.
            let i_time = times
                .binary_search_by(|t| t.total_cmp(&time[row]))
                .unwrap_or_else(|i| i);
            let slot = ((i_time * num_ants + a1) * num_ants + a2) * num_chans + c;
            if source_rows[slot].is_some() {
                return Err(VisibilityError::DuplicateRow {
                    row,
                    time: time[row],
                    antenna1: a1,
                    antenna2: a2,
                    channel: c,
                });
            }
            source_rows[slot] = Some(row);
        }
        // With as many rows as slots and no duplicates, every slot is filled.
        let order: Vec<usize> = source_rows.into_iter().flatten().collect();

        Ok(Visibility {
            context,
            time: order.iter().map(|&r| time[r]).collect(),
            antenna1: order.iter().map(|&r| antenna1[r]).collect(),
            antenna2: order.iter().map(|&r| antenna2[r]).collect(),
            channel: order.iter().map(|&r| channel[r]).collect(),
            vis: vis.select(Axis(0), &order),
            weights: weights.select(Axis(0), &order),
            flags: flags.select(Axis(0), &order),
            times,
        })
    }

    pub fn context(&self) -> &VisContext {
        &self.context
    }

    pub fn num_rows(&self) -> usize {
        self.time.len()
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn antenna1(&self) -> &[usize] {
        &self.antenna1
    }

    pub fn antenna2(&self) -> &[usize] {
        &self.antenna2
    }

    pub fn channel(&self) -> &[usize] {
        &self.channel
    }

    pub fn vis(&self) -> ArrayView2<c64> {
        self.vis.view()
    }

    pub fn vis_mut(&mut self) -> ArrayViewMut2<c64> {
        self.vis.view_mut()
    }

    pub fn weights(&self) -> ArrayView2<f64> {
        self.weights.view()
    }

    pub fn flags(&self) -> ArrayView2<bool> {
        self.flags.view()
    }

    pub fn flags_mut(&mut self) -> ArrayViewMut2<bool> {
        self.flags.view_mut()
    }

    /// Gather the rows back into a block.
    pub fn to_block_visibility(&self) -> BlockVisibility {
        let num_ants = self.context.num_antennas;
        let num_chans = self.context.num_channels();
        let shape = (
            self.times.len(),
            num_ants,
            num_ants,
            num_chans,
            self.context.polarisations.num_pols(),
        );
        let row_index = |t: usize, a1: usize, a2: usize, c: usize| {
            ((t * num_ants + a1) * num_ants + a2) * num_chans + c
        };
        BlockVisibility {
            context: self.context.clone(),
            times: self.times.clone(),
            vis: Array5::from_shape_fn(shape, |(t, a1, a2, c, p)| {
                self.vis[(row_index(t, a1, a2, c), p)]
            }),
            weights: Array5::from_shape_fn(shape, |(t, a1, a2, c, p)| {
                self.weights[(row_index(t, a1, a2, c), p)]
            }),
            flags: Array5::from_shape_fn(shape, |(t, a1, a2, c, p)| {
                self.flags[(row_index(t, a1, a2, c), p)]
            }),
        }
    }
}

/// Uniform access to either visibility representation.
///
/// Calibration entry points are generic over this trait; they ask for the
/// block form once when they're called and hand back the caller's
/// representation when they return.
pub trait VisRepresentation: Clone {
    /// The block form, borrowed when `self` is already a block.
    fn to_block(&self) -> Cow<'_, BlockVisibility>;

    /// The flattened form, borrowed when `self` is already flat.
    fn to_flat(&self) -> Cow<'_, Visibility>;

    /// Convert a block into this representation.
    fn from_block(block: BlockVisibility) -> Self;
}

impl VisRepresentation for BlockVisibility {
    fn to_block(&self) -> Cow<'_, BlockVisibility> {
        Cow::Borrowed(self)
    }

    fn to_flat(&self) -> Cow<'_, Visibility> {
        Cow::Owned(self.to_visibility())
    }

    fn from_block(block: BlockVisibility) -> Self {
        block
    }
}

impl VisRepresentation for Visibility {
    fn to_block(&self) -> Cow<'_, BlockVisibility> {
        Cow::Owned(self.to_block_visibility())
    }

    fn to_flat(&self) -> Cow<'_, Visibility> {
        Cow::Borrowed(self)
    }

    fn from_block(block: BlockVisibility) -> Self {
        block.to_visibility()
    }
}
