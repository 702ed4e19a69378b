// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Print the effective calibration-term registry.

use std::{fs::File, io::Write, path::PathBuf};

use clap::Parser;
use log::info;

use super::common::{read_term_overrides, CONTROLS_FILE_HELP};
use crate::{calibrate::CalibrationControls, SelfcalError};

#[derive(Parser, Debug, Clone, Default)]
pub(super) struct ControlsArgs {
    #[clap(long, help = CONTROLS_FILE_HELP.as_str(), parse(from_os_str))]
    overrides: Option<PathBuf>,

    /// Write the registry to this TOML file rather than stdout.
    #[clap(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
}

impl ControlsArgs {
    pub(super) fn run(self) -> Result<(), SelfcalError> {
        let overrides = self
            .overrides
            .as_deref()
            .map(read_term_overrides)
            .transpose()?;
        let controls = CalibrationControls::new(overrides.as_ref())?;
        let toml_str = toml::to_string(&controls)
            .map_err(|e| SelfcalError::Generic(format!("toml serialisation error: {e}")))?;

        match self.output {
            Some(file) => {
                let mut f = File::create(&file)?;
                f.write_all(toml_str.as_bytes())?;
                info!(
                    "Wrote {} calibration terms to {}",
                    controls.len(),
                    file.display()
                );
            }
            None => print!("{toml_str}"),
        }

        Ok(())
    }
}
