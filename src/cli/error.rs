// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all selfcal-related errors. This should be the *only* error
//! enum that is publicly visible from the binary.

use thiserror::Error;

use super::simulate_selfcal::SimulateSelfcalArgsError;
use crate::{
    calibrate::{CalibrationError, ControlsError},
    simulate::SimulateError,
    vis::VisibilityError,
};

/// The *only* publicly visible error from the selfcal binary. Each error
/// message should point to where more help can be found, unless it's
/// "generic".
#[derive(Error, Debug)]
pub enum SelfcalError {
    /// An error related to simulate-selfcal.
    #[error("{0}\n\nSee for more info: selfcal simulate-selfcal --help")]
    SimulateSelfcal(String),

    /// An error related to the calibration-term registry.
    #[error("{0}\n\nSee for more info: selfcal controls --help")]
    Controls(String),

    /// An error raised by the calibration controller.
    #[error("Calibration failed: {0}")]
    Calibration(String),

    /// An error related to argument files.
    #[error("{0}\n\nArgument files may be toml, json or yaml; see selfcal <SUBCOMMAND> --help")]
    ArgFile(String),

    /// A generic error that can't be clarified further, e.g. IO errors.
    #[error("{0}")]
    Generic(String),
}

// When changing the error propagation below, ensure `Self::from(e)` uses the
// correct `e`!

impl From<SimulateSelfcalArgsError> for SelfcalError {
    fn from(e: SimulateSelfcalArgsError) -> Self {
        match e {
            SimulateSelfcalArgsError::Controls(e) => Self::from(e),
            SimulateSelfcalArgsError::Calibration(e) => Self::from(e),
            SimulateSelfcalArgsError::Simulate(e) => Self::from(e),
            SimulateSelfcalArgsError::IO(e) => Self::from(e),
            _ => Self::SimulateSelfcal(e.to_string()),
        }
    }
}

impl From<ControlsError> for SelfcalError {
    fn from(e: ControlsError) -> Self {
        Self::Controls(e.to_string())
    }
}

impl From<CalibrationError> for SelfcalError {
    fn from(e: CalibrationError) -> Self {
        match e {
            CalibrationError::Controls(e) => Self::from(e),
            CalibrationError::UnknownTerm { .. } | CalibrationError::DuplicateTerm { .. } => {
                Self::Controls(e.to_string())
            }
            CalibrationError::AliasedVisibilities
            | CalibrationError::ShapeMismatch { .. }
            | CalibrationError::EmptyContext
            | CalibrationError::AntennaMismatch { .. } => Self::Calibration(e.to_string()),
        }
    }
}

impl From<SimulateError> for SelfcalError {
    fn from(e: SimulateError) -> Self {
        match e {
            SimulateError::BadParameter { .. } => Self::SimulateSelfcal(e.to_string()),
            SimulateError::Vis(e) => Self::from(e),
        }
    }
}

impl From<VisibilityError> for SelfcalError {
    fn from(e: VisibilityError) -> Self {
        Self::SimulateSelfcal(e.to_string())
    }
}

impl From<std::io::Error> for SelfcalError {
    fn from(e: std::io::Error) -> Self {
        Self::Generic(e.to_string())
    }
}
