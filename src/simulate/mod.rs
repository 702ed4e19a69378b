// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Simple visibility and gain simulations, used to exercise self-calibration
//! without any real data.


use log::debug;
use marlu::{c64, Jones};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use thiserror::Error;
use vec1::Vec1;

use crate::{
    constants::PI,
    gain_table::{build_gain_table, GainTable, JonesShape, TimeSlice},
    vis::{BlockVisibility, VisContext, VisibilityError},
};

#[derive(Error, Debug, PartialEq)]
pub enum SimulateError {
    #[error("The {thing} must be finite and non-negative, but got {value}")]
    BadParameter { thing: &'static str, value: f64 },

    #[error(transparent)]
    Vis(#[from] VisibilityError),
}

/// The size of the random errors put into simulated gains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainErrors {
    /// The largest phase error \[radians\].
    pub phase: f64,

    /// The largest fractional amplitude error.
    pub amplitude: f64,

    /// The largest amplitude of off-diagonal leakage. Only used by
    /// matrix-shaped gains.
    pub leakage: f64,
}

impl GainErrors {
    fn validate(&self) -> Result<(), SimulateError> {
        for (thing, value) in [
            ("phase error", self.phase),
            ("amplitude error", self.amplitude),
            ("leakage", self.leakage),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SimulateError::BadParameter { thing, value });
            }
        }
        Ok(())
    }
}

/// Visibilities of an unpolarised point source of `flux` Jy at the phase
/// centre, with unit weights and no flags.
pub fn simulate_point_source(
    context: VisContext,
    times: Vec1<f64>,
    flux: f64,
) -> Result<BlockVisibility, SimulateError> {
    if !flux.is_finite() {
        return Err(SimulateError::BadParameter {
            thing: "flux density",
            value: flux,
        });
    }
    let mut vis = BlockVisibility::zeros(context, times)?;
    let source = Jones::identity() * flux;
    let (num_times, num_ants, _, num_chans, _) = vis.dim();
    for i_time in 0..num_times {
        for ant1 in 0..num_ants {
            for ant2 in 0..num_ants {
                for i_chan in 0..num_chans {
                    vis.set_jones(i_time, ant1, ant2, i_chan, source);
                }
            }
        }
    }
    Ok(vis)
}

/// A gain table for `vis` filled with random gains. Amplitudes are drawn
/// uniformly from `1 ± errors.amplitude` and phases from `± errors.phase`.
/// Scalar tables share one gain between both polarisations; matrix tables
/// also get random leakage terms.
///
/// The table keeps the requested `shape`, but its gains only vary as much as
/// the polarisations of `vis` can carry (see
/// [`JonesShape::representable_in`]), so applying and then removing them
/// recovers `vis`.
pub fn simulate_gain_table(
    vis: &BlockVisibility,
    time_slice: TimeSlice,
    shape: JonesShape,
    errors: GainErrors,
    seed: u64,
) -> Result<GainTable, SimulateError> {
    errors.validate()?;
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut table = build_gain_table(vis, time_slice, shape);
    let effective = shape.representable_in(vis.polarisations());
    debug!(
        "Simulating {} gains with seed {seed}: phase error {} rad, amplitude error {}",
        shape, errors.phase, errors.amplitude
    );
    if effective != shape {
        debug!(
            "{} visibilities can't carry {shape} gains; simulating {effective} gains instead",
            vis.polarisations()
        );
    }

    let random_gain = |rng: &mut Xoshiro256PlusPlus| {
        let amp = 1.0 + symmetric(rng, errors.amplitude);
        let phase = symmetric(rng, errors.phase);
        c64::from_polar(amp, phase)
    };
    for gain in table.gains.iter_mut() {
        let zero = c64::default();
        *gain = match effective {
            JonesShape::Scalar => {
                let g = random_gain(&mut rng);
                Jones::from([g, zero, zero, g])
            }
            JonesShape::Vector => {
                let gx = random_gain(&mut rng);
                let gy = random_gain(&mut rng);
                Jones::from([gx, zero, zero, gy])
            }
            JonesShape::Matrix => {
                let gx = random_gain(&mut rng);
                let gy = random_gain(&mut rng);
                let mut leak = || {
                    c64::from_polar(
                        symmetric(&mut rng, errors.leakage).abs(),
                        symmetric(&mut rng, PI),
                    )
                };
                let dxy = leak();
                let dyx = leak();
                Jones::from([gx, dxy, dyx, gy])
            }
        };
    }

    Ok(table)
}

/// A uniform random number in `[-half_width, half_width]`.
fn symmetric(rng: &mut Xoshiro256PlusPlus, half_width: f64) -> f64 {
    if half_width > 0.0 {
        rng.gen_range(-half_width..=half_width)
    } else {
        0.0
    }
}
