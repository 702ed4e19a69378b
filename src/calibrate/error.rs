// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with self-calibration.

use thiserror::Error;

/// Errors in building a calibration-term registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlsError {
    #[error("Calibration term identifiers must be a single character, but got '{0}'")]
    BadTermKey(String),

    #[error("Calibration term '{term}' isn't one of the defaults, so it needs a '{missing}'")]
    IncompleteTerm { term: char, missing: &'static str },
}

/// Precondition violations of the self-calibration entry points. Numerical
/// problems (zero weights, zero models, singular gains) are never errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("The observed and model visibilities are the same object; a separate model is required")]
    AliasedVisibilities,

    #[error("The observed visibilities have dimensions {vis:?}, but the model visibilities have {model:?}")]
    ShapeMismatch { vis: Vec<usize>, model: Vec<usize> },

    #[error("The calibration context is empty; at least one term is required")]
    EmptyContext,

    #[error("Calibration context '{context}' refers to term '{term}', which isn't in the calibration controls")]
    UnknownTerm { term: char, context: String },

    #[error("Calibration context '{context}' contains term '{term}' more than once")]
    DuplicateTerm { term: char, context: String },

    #[error("The gain table for term '{term}' has {table} antennas, but the visibilities have {vis}")]
    AntennaMismatch {
        term: char,
        table: usize,
        vis: usize,
    },

    #[error(transparent)]
    Controls(#[from] ControlsError),
}
