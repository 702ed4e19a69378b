// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with constructing visibility containers.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum VisibilityError {
    #[error("Expected {thing} to have shape {expected:?}, but it had {actual:?} instead!")]
    BadShape {
        /// What was it that wasn't sensible? Weights, flags, etc.
        thing: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("A visibility set needs at least one antenna")]
    NoAntennas,

    #[error("The visibility context has {num_freqs} frequencies but {num_bandwidths} channel bandwidths")]
    BandwidthMismatch {
        num_freqs: usize,
        num_bandwidths: usize,
    },

    #[error("Timestamps must be finite, but got {time}")]
    NonFiniteTime { time: f64 },

    #[error("Timestamps must be strictly ascending, but {prev} was followed by {next}")]
    UnsortedTimes { prev: f64, next: f64 },

    #[error("Found an invalid weight ({weight}); weights must be finite and non-negative")]
    InvalidWeight { weight: f64 },

    #[error("Row {row} refers to antenna {antenna}, but there are only {num_antennas} antennas")]
    AntennaOutOfRange {
        row: usize,
        antenna: usize,
        num_antennas: usize,
    },

    #[error("Row {row} refers to channel {channel}, but there are only {num_channels} channels")]
    ChannelOutOfRange {
        row: usize,
        channel: usize,
        num_channels: usize,
    },

    #[error("Row {row} duplicates the sample at time {time}, antennas ({antenna1}, {antenna2}), channel {channel}")]
    DuplicateRow {
        row: usize,
        time: f64,
        antenna1: usize,
        antenna2: usize,
        channel: usize,
    },

    #[error("The visibility rows do not form a complete (time, antenna1, antenna2, channel) grid; expected {expected} rows, got {actual}")]
    IncompleteGrid { expected: usize, actual: usize },

    #[error("Channel range {start}..{end} is not valid for a visibility set with {num_channels} channels")]
    BadChannelRange {
        start: usize,
        end: usize,
        num_channels: usize,
    },
}
