// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Simulate a point-source observation, corrupt it with random gains, and
//! self-calibrate it over several iterations.


use std::{
    fs::File,
    io::BufWriter,
    ops::Range,
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::Parser;
use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use log::{debug, info, trace, warn};
use marlu::Jones;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;
use vec1::Vec1;

use super::common::{read_term_overrides, ARG_FILE_HELP, CONTROLS_FILE_HELP};
use crate::{
    apply::apply_gaintable,
    calibrate::{
        apply_calibration, calibrate, parse_term_keys, solve_calibrate, CalibrationContext,
        CalibrationControls, CalibrationError, ControlsError, TermOverrides,
    },
    constants::{DEFAULT_CALIBRATE_TOLERANCE, DEFAULT_SOLVE_TOLERANCE},
    gain_table::{GainTable, JonesShape, TimeSlice},
    simulate::{simulate_gain_table, simulate_point_source, GainErrors, SimulateError},
    vis::{BlockVisibility, Polarisations, VisContext},
    SelfcalError, PROGRESS_BARS,
};

const DEFAULT_NUM_ANTENNAS: usize = 10;
const DEFAULT_NUM_TIMES: usize = 6;
const DEFAULT_INTEGRATION_TIME: f64 = 10.0;
const DEFAULT_NUM_CHANNELS: usize = 4;
const DEFAULT_FREQ_START_MHZ: f64 = 150.0;
const DEFAULT_FREQ_RES_KHZ: f64 = 1000.0;
const DEFAULT_FLUX: f64 = 1.0;
const DEFAULT_CONTEXT: &str = "TG";
const DEFAULT_ITERATIONS: u32 = 3;
const DEFAULT_PHASE_ERROR_DEG: f64 = 30.0;
const DEFAULT_AMPLITUDE_ERROR: f64 = 0.1;
const DEFAULT_LEAKAGE_ERROR: f64 = 0.0;
const DEFAULT_SEED: u64 = 0;

lazy_static::lazy_static! {
    static ref NUM_ANTENNAS_HELP: String =
        format!("The number of antennas in the simulated array. Default: {DEFAULT_NUM_ANTENNAS}");

    static ref NUM_TIMES_HELP: String =
        format!("The number of timesteps. Default: {DEFAULT_NUM_TIMES}");

    static ref INTEGRATION_TIME_HELP: String =
        format!("The time resolution [seconds]. Default: {DEFAULT_INTEGRATION_TIME}");

    static ref NUM_CHANNELS_HELP: String =
        format!("The number of frequency channels. Default: {DEFAULT_NUM_CHANNELS}");

    static ref FREQ_START_HELP: String =
        format!("The centre frequency of the first channel [MHz]. Default: {DEFAULT_FREQ_START_MHZ}");

    static ref FREQ_RES_HELP: String =
        format!("The channel resolution [kHz]. Default: {DEFAULT_FREQ_RES_KHZ}");

    static ref POLS_HELP: String =
        format!("The polarisation frame of the visibilities. Supported: {}. Default: {}",
                Polarisations::iter().join(", "), Polarisations::default());

    static ref FLUX_HELP: String =
        format!("The flux density of the point source [Jy]. Default: {DEFAULT_FLUX}");

    static ref CONTEXT_HELP: String =
        format!("The calibration terms to corrupt with and solve for, in order of correction. Default: {DEFAULT_CONTEXT}");

    static ref ITERATIONS_HELP: String =
        format!("The number of self-calibration iterations. Terms are only solved from their first_selfcal iteration onwards. Default: {DEFAULT_ITERATIONS}");

    static ref TOLERANCE_HELP: String =
        format!("The convergence tolerance of each gain solve. Default: {DEFAULT_CALIBRATE_TOLERANCE:e}");

    static ref PHASE_ERROR_HELP: String =
        format!("The largest phase error of the corrupting gains [degrees]. Default: {DEFAULT_PHASE_ERROR_DEG}");

    static ref AMPLITUDE_ERROR_HELP: String =
        format!("The largest fractional amplitude error of the corrupting gains. Ignored for phase-only terms. Default: {DEFAULT_AMPLITUDE_ERROR}");

    static ref LEAKAGE_ERROR_HELP: String =
        format!("The largest off-diagonal leakage of the corrupting gains. Only used by matrix-shaped terms. Default: {DEFAULT_LEAKAGE_ERROR}");

    static ref SEED_HELP: String =
        format!("The seed of the random gain errors. Default: {DEFAULT_SEED}");

    static ref OUTPUTS_HELP: String =
        format!("Paths to write the final gain tables to. Supported formats: {}", *GAIN_OUTPUT_TYPES_COMMA_SEPARATED);

    static ref GAIN_OUTPUT_TYPES_COMMA_SEPARATED: String = GainOutputType::iter().join(", ");
}

#[derive(Debug, Clone, Copy, Display, EnumIter, EnumString)]
enum GainOutputType {
    #[strum(serialize = "json")]
    Json,
    #[strum(to_string = "yaml", serialize = "yml")]
    Yaml,
}

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct ObservationArgs {
    #[clap(long, help = NUM_ANTENNAS_HELP.as_str(), help_heading = "OBSERVATION PARAMETERS")]
    pub(super) num_antennas: Option<usize>,

    #[clap(short = 't', long, help = NUM_TIMES_HELP.as_str(), help_heading = "OBSERVATION PARAMETERS")]
    pub(super) num_times: Option<usize>,

    #[clap(long, help = INTEGRATION_TIME_HELP.as_str(), help_heading = "OBSERVATION PARAMETERS")]
    pub(super) integration_time: Option<f64>,

    #[clap(short = 'c', long, help = NUM_CHANNELS_HELP.as_str(), help_heading = "OBSERVATION PARAMETERS")]
    pub(super) num_channels: Option<usize>,

    #[clap(long, help = FREQ_START_HELP.as_str(), help_heading = "OBSERVATION PARAMETERS")]
    pub(super) freq_start: Option<f64>,

    #[clap(short, long, help = FREQ_RES_HELP.as_str(), help_heading = "OBSERVATION PARAMETERS")]
    pub(super) freq_res: Option<f64>,

    #[clap(long, help = POLS_HELP.as_str(), help_heading = "OBSERVATION PARAMETERS")]
    pub(super) pols: Option<String>,

    #[clap(long, help = FLUX_HELP.as_str(), help_heading = "SKY MODEL")]
    pub(super) flux: Option<f64>,
}

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct SelfcalCliArgs {
    #[clap(long, help = CONTEXT_HELP.as_str(), help_heading = "CALIBRATION")]
    pub(super) context: Option<String>,

    #[clap(short = 'n', long, help = ITERATIONS_HELP.as_str(), help_heading = "CALIBRATION")]
    pub(super) iterations: Option<u32>,

    #[clap(long, help = TOLERANCE_HELP.as_str(), help_heading = "CALIBRATION")]
    pub(super) tolerance: Option<f64>,

    #[clap(long, help = CONTROLS_FILE_HELP.as_str(), help_heading = "CALIBRATION", parse(from_os_str))]
    pub(super) controls: Option<PathBuf>,

    /// Calibration-term overrides given directly in an argument file, keyed
    /// by term.
    #[clap(skip)]
    #[serde(default)]
    pub(super) terms: Option<IndexMap<String, TermOverrides>>,

    /// Split the channels into this many contiguous partitions and calibrate
    /// each independently in parallel. Default: 1
    #[clap(long, help_heading = "CALIBRATION")]
    pub(super) partitions: Option<usize>,

    #[clap(long, help = PHASE_ERROR_HELP.as_str(), help_heading = "GAIN ERRORS")]
    pub(super) phase_error: Option<f64>,

    #[clap(long, help = AMPLITUDE_ERROR_HELP.as_str(), help_heading = "GAIN ERRORS")]
    pub(super) amplitude_error: Option<f64>,

    #[clap(long, help = LEAKAGE_ERROR_HELP.as_str(), help_heading = "GAIN ERRORS")]
    pub(super) leakage_error: Option<f64>,

    #[clap(long, help = SEED_HELP.as_str(), help_heading = "GAIN ERRORS")]
    pub(super) seed: Option<u64>,

    #[clap(
        short = 'o',
        long,
        multiple_values(true),
        help = OUTPUTS_HELP.as_str(),
        help_heading = "OUTPUT FILES",
        parse(from_os_str)
    )]
    pub(super) outputs: Option<Vec<PathBuf>>,
}

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct SimulateSelfcalArgs {
    #[clap(name = "ARGUMENTS_FILE", help = ARG_FILE_HELP.as_str(), parse(from_os_str))]
    pub(super) args_file: Option<PathBuf>,

    #[clap(flatten)]
    #[serde(rename = "observation")]
    #[serde(default)]
    pub(super) observation_args: ObservationArgs,

    #[clap(flatten)]
    #[serde(rename = "selfcal")]
    #[serde(default)]
    pub(super) selfcal_args: SelfcalCliArgs,
}

impl SimulateSelfcalArgs {
    /// Both command-line and file arguments overlap in terms of what is
    /// available; this function consolidates everything that was specified into
    /// a single struct. Where applicable, it will prefer CLI parameters over
    /// those in the file.
    ///
    /// This function should only ever merge arguments, and not try to make
    /// sense of them.
    pub(super) fn merge(self) -> Result<SimulateSelfcalArgs, SelfcalError> {
        debug!("Merging command-line arguments with the argument file");

        let cli_args = self;

        if let Some(arg_file) = cli_args.args_file {
            // Read in the file arguments. Ensure all of the file args are
            // accounted for by pattern matching.
            let SimulateSelfcalArgs {
                args_file: _,
                observation_args,
                selfcal_args,
            } = unpack_arg_file!(arg_file);

            // Merge all the arguments, preferring the CLI args when available.
            Ok(SimulateSelfcalArgs {
                args_file: None,
                observation_args: cli_args.observation_args.merge(observation_args),
                selfcal_args: cli_args.selfcal_args.merge(selfcal_args),
            })
        } else {
            Ok(cli_args)
        }
    }

    fn parse(self) -> Result<SimulateSelfcalParams, SelfcalError> {
        debug!("{:#?}", self);

        // Expose all the struct fields to ensure they're all used.
        let SimulateSelfcalArgs {
            args_file: _,
            observation_args:
                ObservationArgs {
                    num_antennas,
                    num_times,
                    integration_time,
                    num_channels,
                    freq_start,
                    freq_res,
                    pols,
                    flux,
                },
            selfcal_args:
                SelfcalCliArgs {
                    context,
                    iterations,
                    tolerance,
                    controls,
                    terms,
                    partitions,
                    phase_error,
                    amplitude_error,
                    leakage_error,
                    seed,
                    outputs,
                },
        } = self;

        let num_antennas = num_antennas.unwrap_or(DEFAULT_NUM_ANTENNAS);
        if num_antennas < 2 {
            return Err(SimulateSelfcalArgsError::TooFewAntennas(num_antennas).into());
        }
        let integration_time = integration_time.unwrap_or(DEFAULT_INTEGRATION_TIME);
        if !integration_time.is_finite() || integration_time <= 0.0 {
            return Err(SimulateSelfcalArgsError::BadIntegrationTime(integration_time).into());
        }
        let times = {
            let num_times = num_times.unwrap_or(DEFAULT_NUM_TIMES);
            let times = (0..num_times)
                .map(|i| i as f64 * integration_time)
                .collect();
            Vec1::try_from_vec(times).map_err(|_| SimulateSelfcalArgsError::ZeroTimes)?
        };

        let freq_start = freq_start.unwrap_or(DEFAULT_FREQ_START_MHZ);
        if !freq_start.is_finite() || freq_start <= 0.0 {
            return Err(SimulateSelfcalArgsError::BadFreqStart(freq_start).into());
        }
        let freq_res = freq_res.unwrap_or(DEFAULT_FREQ_RES_KHZ);
        if !freq_res.is_finite() || freq_res <= 0.0 {
            return Err(SimulateSelfcalArgsError::BadFreqRes(freq_res).into());
        }
        let num_channels = num_channels.unwrap_or(DEFAULT_NUM_CHANNELS);
        let frequencies = Vec1::try_from_vec(
            (0..num_channels)
                .map(|i| freq_start * 1e6 + i as f64 * freq_res * 1e3)
                .collect(),
        )
        .map_err(|_| SimulateSelfcalArgsError::ZeroChannels)?;
        let channel_bandwidths = frequencies.mapped_ref(|_| freq_res * 1e3);

        let polarisations = match pols {
            Some(p) => Polarisations::from_str(&p).map_err(|_| SimulateSelfcalArgsError::BadPols {
                got: p,
                valid: Polarisations::iter().join(", "),
            })?,
            None => Polarisations::default(),
        };

        let vis_context = VisContext {
            num_antennas,
            frequencies,
            channel_bandwidths,
            integration_time,
            polarisations,
        };
        info!(
            "Simulating {} antennas, {} timesteps of {}s, {} channels from {} MHz every {} kHz ({})",
            num_antennas,
            times.len(),
            integration_time,
            num_channels,
            freq_start,
            freq_res,
            polarisations
        );

        let overrides = match (controls, terms) {
            (Some(_), Some(_)) => return Err(SimulateSelfcalArgsError::ConflictingControls.into()),
            (Some(file), None) => Some(read_term_overrides(&file)?),
            (None, Some(terms)) => Some(parse_term_keys(terms)?),
            (None, None) => None,
        };
        let controls = CalibrationControls::new(overrides.as_ref())?;
        let context = context.unwrap_or_else(|| DEFAULT_CONTEXT.to_string());
        // Validate the context against the registry now, rather than after
        // simulating.
        CalibrationContext::parse(&context, &controls)?;
        for term in context.chars() {
            let c = controls[term];
            debug!(
                "Term {term}: {} gains, time slice {}, phase only: {}, first selfcal: {}",
                c.shape, c.time_slice, c.phase_only, c.first_selfcal
            );
        }

        let iterations = iterations.unwrap_or(DEFAULT_ITERATIONS);
        if iterations == 0 {
            return Err(SimulateSelfcalArgsError::ZeroIterations.into());
        }
        let tol = tolerance.unwrap_or(DEFAULT_CALIBRATE_TOLERANCE);
        if !tol.is_finite() || tol <= 0.0 {
            return Err(SimulateSelfcalArgsError::BadTolerance(tol).into());
        }
        let partitions = partitions.unwrap_or(1);
        if partitions == 0 || partitions > num_channels {
            return Err(SimulateSelfcalArgsError::BadPartitions {
                partitions,
                num_channels,
            }
            .into());
        }

        let errors = GainErrors {
            phase: phase_error.unwrap_or(DEFAULT_PHASE_ERROR_DEG).to_radians(),
            amplitude: amplitude_error.unwrap_or(DEFAULT_AMPLITUDE_ERROR),
            leakage: leakage_error.unwrap_or(DEFAULT_LEAKAGE_ERROR),
        };

        let outputs = outputs
            .unwrap_or_default()
            .into_iter()
            .map(|file| {
                let output_type = file
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_lowercase())
                    .and_then(|e| GainOutputType::from_str(&e).ok());
                match output_type {
                    Some(t) => Ok((file, t)),
                    None => Err(SimulateSelfcalArgsError::BadOutputExtension {
                        file,
                        valid: GAIN_OUTPUT_TYPES_COMMA_SEPARATED.clone(),
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        if outputs.is_empty() {
            warn!("No output files were specified; the gain tables will not be written");
        }

        Ok(SimulateSelfcalParams {
            vis_context,
            times,
            flux: flux.unwrap_or(DEFAULT_FLUX),
            context,
            controls,
            iterations,
            tol,
            partitions,
            errors,
            seed: seed.unwrap_or(DEFAULT_SEED),
            outputs,
        })
    }

    pub(super) fn run(self, dry_run: bool) -> Result<(), SelfcalError> {
        debug!("Converting arguments into parameters");
        trace!("{:#?}", self);
        let params = self.parse()?;

        if dry_run {
            info!("Dry run -- exiting now.");
            return Ok(());
        }

        params.run()?;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub(super) enum SimulateSelfcalArgsError {
    #[error("At least 2 antennas are required, but {0} were specified")]
    TooFewAntennas(usize),

    #[error("Number of timesteps cannot be 0!")]
    ZeroTimes,

    #[error("The integration time must be positive, but got {0}")]
    BadIntegrationTime(f64),

    #[error("Number of channels cannot be 0!")]
    ZeroChannels,

    #[error("The first channel frequency must be positive, but got {0} MHz")]
    BadFreqStart(f64),

    #[error("The channel resolution must be positive, but got {0} kHz")]
    BadFreqRes(f64),

    #[error("Couldn't parse polarisations '{got}'; valid values are: {valid}")]
    BadPols { got: String, valid: String },

    #[error("Number of selfcal iterations cannot be 0!")]
    ZeroIterations,

    #[error("The tolerance must be positive, but got {0}")]
    BadTolerance(f64),

    #[error("Cannot split {num_channels} channels into {partitions} partitions")]
    BadPartitions {
        partitions: usize,
        num_channels: usize,
    },

    #[error("Calibration-term overrides were given as both a file and inline terms; only one may be used")]
    ConflictingControls,

    #[error("Output file {file:?} doesn't have a recognised extension! Valid extensions are: {valid}")]
    BadOutputExtension { file: PathBuf, valid: String },

    #[error("Couldn't write gain tables to {file:?}: {err}")]
    Write { file: PathBuf, err: String },

    #[error(transparent)]
    Controls(#[from] ControlsError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Simulate(#[from] SimulateError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl ObservationArgs {
    fn merge(self, other: Self) -> Self {
        Self {
            num_antennas: self.num_antennas.or(other.num_antennas),
            num_times: self.num_times.or(other.num_times),
            integration_time: self.integration_time.or(other.integration_time),
            num_channels: self.num_channels.or(other.num_channels),
            freq_start: self.freq_start.or(other.freq_start),
            freq_res: self.freq_res.or(other.freq_res),
            pols: self.pols.or(other.pols),
            flux: self.flux.or(other.flux),
        }
    }
}

impl SelfcalCliArgs {
    fn merge(self, other: Self) -> Self {
        Self {
            context: self.context.or(other.context),
            iterations: self.iterations.or(other.iterations),
            tolerance: self.tolerance.or(other.tolerance),
            controls: self.controls.or(other.controls),
            terms: self.terms.or(other.terms),
            partitions: self.partitions.or(other.partitions),
            phase_error: self.phase_error.or(other.phase_error),
            amplitude_error: self.amplitude_error.or(other.amplitude_error),
            leakage_error: self.leakage_error.or(other.leakage_error),
            seed: self.seed.or(other.seed),
            outputs: self.outputs.or(other.outputs),
        }
    }
}

/// Everything needed to run a simulated self-calibration.
struct SimulateSelfcalParams {
    vis_context: VisContext,
    times: Vec1<f64>,
    flux: f64,
    context: String,
    controls: CalibrationControls,
    iterations: u32,
    tol: f64,
    partitions: usize,
    errors: GainErrors,
    seed: u64,
    outputs: Vec<(PathBuf, GainOutputType)>,
}

/// A contiguous range of channels, calibrated independently of the others.
struct Partition {
    channels: Range<usize>,
    data: BlockVisibility,
    model: BlockVisibility,
}

impl SimulateSelfcalParams {
    fn run(self) -> Result<(), SimulateSelfcalArgsError> {
        let SimulateSelfcalParams {
            vis_context,
            times,
            flux,
            context,
            controls,
            iterations,
            tol,
            partitions,
            errors,
            seed,
            outputs,
        } = self;

        let model = simulate_point_source(vis_context, times, flux)?;
        let (data, true_gains) = corrupt(&model, &context, &controls, errors, seed)?;
        for (term, table) in &true_gains {
            debug!("Corrupting term {term}: {}", table.qa());
        }
        info!(
            "Corrupted visibilities have residual RMS {:.6e} against the model",
            residual_rms(&data, &model)
        );

        let num_channels = model.num_channels();
        let partitions = (0..partitions)
            .map(|i| {
                let channels = i * num_channels / partitions..(i + 1) * num_channels / partitions;
                Ok(Partition {
                    data: data.select_channels(channels.clone())?,
                    model: model.select_channels(channels.clone())?,
                    channels,
                })
            })
            .collect::<Result<Vec<_>, SimulateError>>()?;
        if partitions.len() > 1 {
            info!(
                "Calibrating {} channel partitions in parallel: {}",
                partitions.len(),
                partitions
                    .iter()
                    .map(|p| format!("{:?}", p.channels))
                    .join(", ")
            );
        }

        let pb = ProgressBar::with_draw_target(
            Some(u64::from(iterations)),
            if PROGRESS_BARS.load() {
                ProgressDrawTarget::stdout()
            } else {
                ProgressDrawTarget::hidden()
            },
        )
        .with_style(
            ProgressStyle::default_bar()
                .template("{msg:17}: [{wide_bar:.blue}] {pos:2}/{len:2} iterations ({elapsed_precise}<{eta_precise})").unwrap()
                .progress_chars("=> "),
        )
        .with_position(0)
        .with_message("Self-calibrating");

        let mut final_tables = vec![IndexMap::new(); partitions.len()];
        let mut final_corrected = Vec::with_capacity(partitions.len());
        for iteration in 0..iterations {
            // Every partition shares the one registry.
            let results = partitions
                .par_iter()
                .map(|p| {
                    let (corrected, tables) = calibrate(
                        &p.data,
                        &p.model,
                        &context,
                        Some(&controls),
                        iteration,
                        tol,
                    )?;
                    Ok((corrected.into_owned(), tables))
                })
                .collect::<Result<Vec<_>, CalibrationError>>()?;

            let (corrected, tables): (Vec<_>, Vec<_>) = results.into_iter().unzip();
            let terms = tables
                .first()
                .map(|t| t.keys().collect::<String>())
                .unwrap_or_default();
            let num_unconverged = tables
                .iter()
                .flat_map(|t| t.values())
                .filter(|t| t.is_solved() && !t.is_converged())
                .count();
            pb.suspend(|| {
                info!(
                    "Iteration {iteration}: solved terms '{terms}', residual RMS {:.6e}",
                    partitions_rms(&corrected, &partitions)
                );
                if num_unconverged > 0 {
                    warn!("Iteration {iteration}: {num_unconverged} gain tables didn't converge");
                }
            });
            for table_map in &tables {
                for (term, table) in table_map {
                    debug!("Iteration {iteration}, term {term}: {}", table.qa());
                }
            }

            // Terms solved in earlier iterations stay until re-solved.
            for (kept, new) in final_tables.iter_mut().zip(tables) {
                kept.extend(new);
            }
            final_corrected = corrected;
            pb.inc(1);
        }
        pb.finish_with_message("Self-calibrated");

        let last_iteration = iterations - 1;
        for (p, (tables, corrected)) in partitions
            .iter()
            .zip(final_tables.iter().zip(final_corrected.iter()))
        {
            // The solved gains, applied to the model, should reproduce the
            // data.
            let predicted = apply_calibration(
                &p.model,
                tables,
                &context,
                Some(&controls),
                last_iteration,
            )?;
            info!(
                "Channels {:?}: model with solved gains has residual RMS {:.6e} against the data",
                p.channels,
                residual_rms(&predicted, &p.data)
            );

            // Nothing should be left to solve for in the corrected data.
            let leftover = solve_calibrate(
                corrected,
                &p.model,
                &context,
                Some(&controls),
                last_iteration,
                DEFAULT_SOLVE_TOLERANCE,
            )?;
            for (term, table) in &leftover {
                if table.is_solved() {
                    debug!(
                        "Channels {:?}: term {term} left over in corrected data deviates from identity by at most {:.3e}",
                        p.channels,
                        max_identity_deviation(table)
                    );
                }
            }
        }

        for (file, output_type) in outputs {
            write_gain_tables(&file, output_type, &context, iterations, &partitions, &final_tables)?;
            info!("Gain tables written to {}", file.display());
        }

        Ok(())
    }
}

/// Corrupt `model` with random gains for every term of `context`, applied in
/// context order. Phase-only terms get no amplitude errors.
fn corrupt(
    model: &BlockVisibility,
    context: &str,
    controls: &CalibrationControls,
    errors: GainErrors,
    seed: u64,
) -> Result<(BlockVisibility, IndexMap<char, GainTable>), SimulateSelfcalArgsError> {
    let mut data = model.clone();
    let mut true_gains = IndexMap::new();
    for (i, term) in CalibrationContext::parse(context, controls)?.iter().enumerate() {
        let c = controls[term];
        let term_errors = GainErrors {
            amplitude: if c.phase_only { 0.0 } else { errors.amplitude },
            ..errors
        };
        let table = simulate_gain_table(
            model,
            c.time_slice,
            c.shape,
            term_errors,
            seed.wrapping_add(i as u64),
        )?;
        data = apply_gaintable(&data, &table, false, Some(c.time_slice));
        true_gains.insert(term, table);
    }
    Ok((data, true_gains))
}

fn residual_sums(a: &BlockVisibility, b: &BlockVisibility) -> (f64, usize) {
    a.vis()
        .iter()
        .zip(b.vis().iter())
        .fold((0.0, 0), |(sum, count), (a, b)| {
            (sum + (a - b).norm_sqr(), count + 1)
        })
}

fn residual_rms(a: &BlockVisibility, b: &BlockVisibility) -> f64 {
    let (sum, count) = residual_sums(a, b);
    (sum / count as f64).sqrt()
}

fn partitions_rms(corrected: &[BlockVisibility], partitions: &[Partition]) -> f64 {
    let (sum, count) = corrected
        .iter()
        .zip(partitions)
        .map(|(c, p)| residual_sums(c, &p.model))
        .fold((0.0, 0), |(sum, count), (s, c)| (sum + s, count + c));
    (sum / count as f64).sqrt()
}

fn max_identity_deviation(table: &GainTable) -> f64 {
    let identity = Jones::<f64>::identity();
    table
        .gains()
        .iter()
        .zip(table.weights().iter())
        .filter(|(_, &w)| w > 0.0)
        .map(|(&g, _)| {
            let diff = g - identity;
            (0..4).map(|i| diff[i].norm()).fold(0.0, f64::max)
        })
        .fold(0.0, f64::max)
}

/// The serialisable form of a [`GainTable`]. Each gain is its four complex
/// elements as `[re, im]` pairs, in `[xx, xy, yx, yy]` order.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct GainTableRecord {
    pub(super) shape: JonesShape,
    pub(super) time_slice: TimeSlice,
    pub(super) polarisations: Polarisations,
    pub(super) frequencies: Vec<f64>,
    pub(super) slice_centres: Vec<f64>,
    pub(super) slice_intervals: Vec<f64>,
    pub(super) converged: bool,
    pub(super) max_sweeps: u32,
    /// Indexed by slice, antenna, then channel.
    pub(super) gains: Vec<Vec<Vec<[f64; 8]>>>,
    pub(super) weights: Vec<Vec<Vec<f64>>>,
}

impl From<&GainTable> for GainTableRecord {
    fn from(table: &GainTable) -> Self {
        let gains = table
            .gains()
            .outer_iter()
            .map(|slice| {
                slice
                    .outer_iter()
                    .map(|ant| ant.iter().copied().map(jones_to_floats).collect())
                    .collect()
            })
            .collect();
        let weights = table
            .weights()
            .outer_iter()
            .map(|slice| slice.outer_iter().map(|ant| ant.to_vec()).collect())
            .collect();
        GainTableRecord {
            shape: table.shape(),
            time_slice: table.time_slice(),
            polarisations: table.polarisations(),
            frequencies: table.frequencies().to_vec(),
            slice_centres: table.slice_centres().to_vec(),
            slice_intervals: table.slice_intervals().to_vec(),
            converged: table.is_converged(),
            max_sweeps: table.qa().max_sweeps,
            gains,
            weights,
        }
    }
}

fn jones_to_floats(j: Jones<f64>) -> [f64; 8] {
    [
        j[0].re, j[0].im, j[1].re, j[1].im, j[2].re, j[2].im, j[3].re, j[3].im,
    ]
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct PartitionRecord {
    pub(super) channels: Range<usize>,
    pub(super) terms: IndexMap<String, GainTableRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct SelfcalRecord {
    pub(super) context: String,
    pub(super) iterations: u32,
    pub(super) partitions: Vec<PartitionRecord>,
}

fn write_gain_tables(
    file: &Path,
    output_type: GainOutputType,
    context: &str,
    iterations: u32,
    partitions: &[Partition],
    tables: &[IndexMap<char, GainTable>],
) -> Result<(), SimulateSelfcalArgsError> {
    let record = SelfcalRecord {
        context: context.to_string(),
        iterations,
        partitions: partitions
            .iter()
            .zip(tables)
            .map(|(p, t)| PartitionRecord {
                channels: p.channels.clone(),
                terms: t
                    .iter()
                    .map(|(term, table)| (term.to_string(), GainTableRecord::from(table)))
                    .collect(),
            })
            .collect(),
    };

    let f = BufWriter::new(File::create(file)?);
    let result = match output_type {
        GainOutputType::Json => serde_json::to_writer_pretty(f, &record).map_err(|e| e.to_string()),
        GainOutputType::Yaml => serde_yaml::to_writer(f, &record).map_err(|e| e.to_string()),
    };
    result.map_err(|err| SimulateSelfcalArgsError::Write {
        file: file.to_path_buf(),
        err,
    })
}
