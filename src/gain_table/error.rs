// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimeSliceError {
    #[error("Couldn't parse '{0}' as a time slice; expected 'auto' or a number of seconds")]
    Parse(String),

    #[error("A time slice must be a positive, finite number of seconds, but got {0}")]
    NotPositive(f64),
}
