// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All constants *must* be double precision. All gain arithmetic is done in
double precision.
 */

pub use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// The convergence tolerance used by `calibrate` when none is supplied.
pub const DEFAULT_CALIBRATE_TOLERANCE: f64 = 1e-8;

/// The convergence tolerance used by `solve_calibrate` and
/// `apply_calibration` when none is supplied.
pub const DEFAULT_SOLVE_TOLERANCE: f64 = 1e-6;

/// The maximum number of sweeps the gain solver performs for a single
/// (time-slice, channel) cell before giving up and returning its best
/// estimate.
pub const DEFAULT_MAX_SWEEPS: u32 = 50;

/// Gains whose Jones determinant has a magnitude at or below this are not
/// inverted. The solver scales it by the largest normalising denominator of
/// each cell; smaller denominators are treated as zero and the affected gain
/// keeps its prior value.
pub const DENOMINATOR_EPSILON: f64 = 1e-15;

/// The default time slice of the electronic-gain ("G") term \[seconds\].
pub const DEFAULT_G_TIME_SLICE: f64 = 60.0;

/// The default time slice of the bandpass ("B") term \[seconds\]. This is
/// intentionally longer than any sensible observation.
pub const DEFAULT_B_TIME_SLICE: f64 = 1e5;
