// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Self-calibration control.
//!
//! A calibration context (e.g. "TGB") names the terms to solve, in order.
//! Each term's [`TermControls`] say how it's parameterised and from which
//! self-calibration iteration onwards it's solved. The three entry points
//! share the same decisions about which terms are active:
//!
//! - [`solve_calibrate`] solves every active term against the same
//!   visibilities and returns a gain table for every term in the context;
//! - [`calibrate`] solves the active terms in order, removing each term's
//!   gains from a working copy of the visibilities before solving the next;
//! - [`apply_calibration`] applies already-solved gain tables.
//!
//! All of them accept either visibility representation and hand back the
//! representation they were given. Inputs are never modified.

mod controls;
mod error;
#[cfg(test)]
mod tests;

pub use controls::{
    parse_term_keys, CalibrationContext, CalibrationControls, TermControls, TermOverrides,
};
pub use error::{CalibrationError, ControlsError};

use std::borrow::Cow;

use indexmap::IndexMap;
use log::debug;

use crate::{
    apply::apply_gaintable,
    gain_table::{build_gain_table, GainTable},
    solver::solve_gaintable,
    vis::{BlockVisibility, VisRepresentation},
};

/// Use the supplied controls, or the defaults if there aren't any.
fn resolve_controls(controls: Option<&CalibrationControls>) -> Cow<CalibrationControls> {
    match controls {
        Some(c) => Cow::Borrowed(c),
        None => Cow::Owned(CalibrationControls::default()),
    }
}

/// Fail if `vis` and `model` are the very same value.
fn check_aliasing<V, M>(vis: &V, model: &M) -> Result<(), CalibrationError> {
    if std::ptr::eq(vis as *const V as *const (), model as *const M as *const ()) {
        return Err(CalibrationError::AliasedVisibilities);
    }
    Ok(())
}

fn check_shapes(vis: &BlockVisibility, model: &BlockVisibility) -> Result<(), CalibrationError> {
    if !vis.same_shape(model) {
        return Err(CalibrationError::ShapeMismatch {
            vis: vis.vis().shape().to_vec(),
            model: model.vis().shape().to_vec(),
        });
    }
    Ok(())
}

/// Solve every term of `context` that is active at `iteration`, each against
/// the same observed and model visibilities.
///
/// A gain table is returned for every term in `context`, in context order.
/// Terms that aren't active yet, or that can't be solved because `vis` has
/// no non-zero weights or `model` has no non-zero samples, get identity
/// tables. `controls` defaults to [`CalibrationControls::default`]; the
/// conventional tolerance is [`crate::DEFAULT_SOLVE_TOLERANCE`].
pub fn solve_calibrate<V, M>(
    vis: &V,
    model: &M,
    context: &str,
    controls: Option<&CalibrationControls>,
    iteration: u32,
    tol: f64,
) -> Result<IndexMap<char, GainTable>, CalibrationError>
where
    V: VisRepresentation,
    M: VisRepresentation,
{
    check_aliasing(vis, model)?;
    let controls = resolve_controls(controls);
    let context = CalibrationContext::parse(context, &controls)?;
    let avis = vis.to_block();
    let amvis = model.to_block();
    check_shapes(&avis, &amvis)?;

    let solvable = avis.max_abs_weight() > 0.0 && amvis.max_abs_vis() > 0.0;
    let mut gaintables = IndexMap::with_capacity(controls.len());
    for term in context.iter() {
        let c = controls[term];
        let table = if iteration < c.first_selfcal {
            debug!("solve_calibrate: Jones matrix {term} not solved, iteration {iteration}");
            build_gain_table(&avis, c.time_slice, c.shape)
        } else if !solvable {
            debug!("solve_calibrate: Jones matrix {term} not solved; no usable weights or model, iteration {iteration}");
            build_gain_table(&avis, c.time_slice, c.shape)
        } else {
            let table = solve_gaintable(
                &avis,
                Some(&*amvis),
                c.time_slice,
                c.shape,
                c.phase_only,
                c.shape.crosspol(),
                tol,
            );
            debug!("Jones matrix {term}, iteration {iteration}: {}", table.qa());
            table
        };
        gaintables.insert(term, table);
    }

    Ok(gaintables)
}

/// Calibrate `vis` against `model` with the terms of `context` that are
/// active at `iteration`.
///
/// Active terms are solved in context order; after each solve, that term's
/// gains are removed from a working copy of `vis`, so later terms are solved
/// against what earlier terms left behind. Returns the corrected
/// visibilities and the gain tables of the terms that were solved.
///
/// If no term is active, `vis` is handed back as-is (borrowed) with no gain
/// tables. The conventional tolerance is
/// [`crate::DEFAULT_CALIBRATE_TOLERANCE`].
pub fn calibrate<'a, V, M>(
    vis: &'a V,
    model: &M,
    context: &str,
    controls: Option<&CalibrationControls>,
    iteration: u32,
    tol: f64,
) -> Result<(Cow<'a, V>, IndexMap<char, GainTable>), CalibrationError>
where
    V: VisRepresentation,
    M: VisRepresentation,
{
    check_aliasing(vis, model)?;
    let controls = resolve_controls(controls);
    let context = CalibrationContext::parse(context, &controls)?;
    let mut gaintables = IndexMap::new();

    if !context
        .iter()
        .any(|term| iteration >= controls[term].first_selfcal)
    {
        debug!("calibrate: no terms active at iteration {iteration}");
        return Ok((Cow::Borrowed(vis), gaintables));
    }

    let mut avis = vis.to_block().into_owned();
    let amvis = model.to_block();
    check_shapes(&avis, &amvis)?;

    for term in context.iter() {
        let c = controls[term];
        if iteration < c.first_selfcal {
            debug!("calibrate: Jones matrix {term} not solved, iteration {iteration}");
            continue;
        }
        let table = solve_gaintable(
            &avis,
            Some(&*amvis),
            c.time_slice,
            c.shape,
            c.phase_only,
            c.shape.crosspol(),
            tol,
        );
        debug!("calibrate: Jones matrix {term}, iteration {iteration}");
        debug!("{}", table.qa());
        avis = apply_gaintable(&avis, &table, true, Some(c.time_slice));
        gaintables.insert(term, table);
    }

    Ok((Cow::Owned(V::from_block(avis)), gaintables))
}

/// Apply already-solved gain tables to `vis`.
///
/// Each term of `context` that is active at `iteration` and has a table in
/// `gaintables` is applied (not inverted), in context order. If no term
/// qualifies, `vis` is handed back as-is (borrowed).
pub fn apply_calibration<'a, V>(
    vis: &'a V,
    gaintables: &IndexMap<char, GainTable>,
    context: &str,
    controls: Option<&CalibrationControls>,
    iteration: u32,
) -> Result<Cow<'a, V>, CalibrationError>
where
    V: VisRepresentation,
{
    let controls = resolve_controls(controls);
    let context = CalibrationContext::parse(context, &controls)?;

    let qualifying: Vec<(char, &GainTable)> = context
        .iter()
        .filter(|&term| iteration >= controls[term].first_selfcal)
        .filter_map(|term| match gaintables.get(&term) {
            Some(table) => Some((term, table)),
            None => {
                debug!("apply_calibration: no gain table for Jones matrix {term}");
                None
            }
        })
        .collect();
    if qualifying.is_empty() {
        debug!("apply_calibration: nothing to apply at iteration {iteration}");
        return Ok(Cow::Borrowed(vis));
    }

    let mut avis = vis.to_block().into_owned();
    for &(term, table) in &qualifying {
        if table.num_antennas() != avis.num_antennas() {
            return Err(CalibrationError::AntennaMismatch {
                term,
                table: table.num_antennas(),
                vis: avis.num_antennas(),
            });
        }
    }
    for (term, table) in qualifying {
        debug!("apply_calibration: applying Jones matrix {term}, iteration {iteration}");
        avis = apply_gaintable(&avis, table, false, Some(controls[term].time_slice));
    }

    Ok(Cow::Owned(V::from_block(avis)))
}
