// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The registry of calibration terms and how each is solved.

use std::ops::Index;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use vec1::Vec1;

use super::{CalibrationError, ControlsError};
use crate::{
    constants::{DEFAULT_B_TIME_SLICE, DEFAULT_G_TIME_SLICE},
    gain_table::{JonesShape, TimeSlice},
};

/// How a single calibration term is solved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TermControls {
    pub shape: JonesShape,

    #[serde(alias = "timeslice")]
    pub time_slice: TimeSlice,

    pub phase_only: bool,

    /// The first self-calibration iteration on which this term is solved.
    pub first_selfcal: u32,
}

/// Changes to a term's controls. Unset fields keep the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TermOverrides {
    #[serde(default)]
    pub shape: Option<JonesShape>,

    #[serde(default, alias = "timeslice")]
    pub time_slice: Option<TimeSlice>,

    #[serde(default)]
    pub phase_only: Option<bool>,

    #[serde(default)]
    pub first_selfcal: Option<u32>,
}

impl TermOverrides {
    fn apply(self, base: TermControls) -> TermControls {
        TermControls {
            shape: self.shape.unwrap_or(base.shape),
            time_slice: self.time_slice.unwrap_or(base.time_slice),
            phase_only: self.phase_only.unwrap_or(base.phase_only),
            first_selfcal: self.first_selfcal.unwrap_or(base.first_selfcal),
        }
    }

    /// A term that isn't a default must be fully specified.
    fn complete(self, term: char) -> Result<TermControls, ControlsError> {
        let missing = |missing| ControlsError::IncompleteTerm { term, missing };
        Ok(TermControls {
            shape: self.shape.ok_or_else(|| missing("shape"))?,
            time_slice: self.time_slice.ok_or_else(|| missing("time_slice"))?,
            phase_only: self.phase_only.ok_or_else(|| missing("phase_only"))?,
            first_selfcal: self.first_selfcal.unwrap_or(0),
        })
    }
}

/// Turn string-keyed overrides (as found in argument files) into
/// character-keyed ones.
pub fn parse_term_keys<T>(map: IndexMap<String, T>) -> Result<IndexMap<char, T>, ControlsError> {
    map.into_iter()
        .map(|(key, value)| {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if !c.is_whitespace() => Ok((c, value)),
                _ => Err(ControlsError::BadTermKey(key)),
            }
        })
        .collect()
}

/// The calibration-term registry: a fixed mapping from single-character term
/// identifiers to their [`TermControls`].
///
/// The registry is an ordinary value. It is built once per run and passed by
/// reference to each calibration entry point, which never modify it, so any
/// number of concurrent calibrations may share one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "IndexMap<String, TermControls>",
    into = "IndexMap<String, TermControls>"
)]
pub struct CalibrationControls(IndexMap<char, TermControls>);

impl Default for CalibrationControls {
    /// Atmospheric phase ("T"), electronic gain ("G") and bandpass ("B").
    fn default() -> Self {
        let mut terms = IndexMap::with_capacity(3);
        terms.insert(
            'T',
            TermControls {
                shape: JonesShape::Scalar,
                time_slice: TimeSlice::Auto,
                phase_only: true,
                first_selfcal: 0,
            },
        );
        terms.insert(
            'G',
            TermControls {
                shape: JonesShape::Vector,
                time_slice: TimeSlice::Seconds(DEFAULT_G_TIME_SLICE),
                phase_only: false,
                first_selfcal: 0,
            },
        );
        terms.insert(
            'B',
            TermControls {
                shape: JonesShape::Vector,
                time_slice: TimeSlice::Seconds(DEFAULT_B_TIME_SLICE),
                phase_only: false,
                first_selfcal: 0,
            },
        );
        CalibrationControls(terms)
    }
}

impl CalibrationControls {
    /// The default registry with `overrides` applied. Overrides for a term
    /// that isn't a default add that term, in which case its shape, time
    /// slice and phase-only flag must be given.
    pub fn new(
        overrides: Option<&IndexMap<char, TermOverrides>>,
    ) -> Result<CalibrationControls, ControlsError> {
        let mut controls = CalibrationControls::default();
        if let Some(overrides) = overrides {
            for (&term, &o) in overrides {
                let new = match controls.0.get(&term) {
                    Some(&base) => o.apply(base),
                    None => o.complete(term)?,
                };
                controls.0.insert(term, new);
            }
        }
        Ok(controls)
    }

    pub fn get(&self, term: char) -> Option<&TermControls> {
        self.0.get(&term)
    }

    pub fn iter(&self) -> impl Iterator<Item = (char, &TermControls)> {
        self.0.iter().map(|(&c, t)| (c, t))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Index<char> for CalibrationControls {
    type Output = TermControls;

    fn index(&self, term: char) -> &TermControls {
        &self.0[&term]
    }
}

impl TryFrom<IndexMap<String, TermControls>> for CalibrationControls {
    type Error = ControlsError;

    fn try_from(value: IndexMap<String, TermControls>) -> Result<Self, Self::Error> {
        parse_term_keys(value).map(CalibrationControls)
    }
}

impl From<CalibrationControls> for IndexMap<String, TermControls> {
    fn from(value: CalibrationControls) -> Self {
        value
            .0
            .into_iter()
            .map(|(c, t)| (c.to_string(), t))
            .collect()
    }
}

/// The terms to calibrate, in the order they're solved and applied, e.g.
/// "TGB". Every term is in the registry it was parsed against, and no term
/// appears twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationContext(Vec1<char>);

impl CalibrationContext {
    pub fn parse(
        context: &str,
        controls: &CalibrationControls,
    ) -> Result<CalibrationContext, CalibrationError> {
        let mut terms: Vec<char> = Vec::with_capacity(context.len());
        for term in context.chars() {
            if controls.get(term).is_none() {
                return Err(CalibrationError::UnknownTerm {
                    term,
                    context: context.to_string(),
                });
            }
            if terms.contains(&term) {
                return Err(CalibrationError::DuplicateTerm {
                    term,
                    context: context.to_string(),
                });
            }
            terms.push(term);
        }
        Vec1::try_from_vec(terms)
            .map(CalibrationContext)
            .map_err(|_| CalibrationError::EmptyContext)
    }

    pub fn iter(&self) -> impl Iterator<Item = char> + '_ {
        self.0.iter().copied()
    }
}
