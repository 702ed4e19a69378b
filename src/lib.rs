// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Direction-independent gain solving and self-calibration control for radio
interferometers.

Observed visibilities are calibrated against model visibilities with a
sequence of named Jones terms (e.g. atmospheric phase "T", electronic gain "G",
bandpass "B"), each solved on its own time slicing and only from a configured
self-calibration iteration onwards.
 */

pub mod apply;
pub mod calibrate;
mod cli;
pub mod constants;
pub mod gain_table;
pub mod simulate;
pub mod solver;
pub mod vis;

use crossbeam_utils::atomic::AtomicCell;

/// Should progress bars be drawn? Only the binary turns these on.
pub(crate) static PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);

// Re-exports.
pub use apply::apply_gaintable;
pub use calibrate::{
    apply_calibration, calibrate, solve_calibrate, CalibrationContext, CalibrationControls,
    CalibrationError, ControlsError, TermControls, TermOverrides,
};
pub use cli::{Selfcal, SelfcalError};
pub use constants::*;
pub use gain_table::{build_gain_table, GainTable, GainTableQa, JonesShape, SolveResult, TimeSlice};
pub use solver::solve_gaintable;
pub use vis::{BlockVisibility, Polarisations, VisContext, VisRepresentation, Visibility};
