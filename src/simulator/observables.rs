//! Observable evaluation.
//!
//! Observables are weighted sums over the species state, produced by the
//! external pattern matcher as index/coefficient/volume triples. Recorded
//! output is always in amounts; the ODE engine additionally evaluates
//! observables from concentrations when building functional-rate contexts.

use crate::exprs::RateContext;
use crate::network::{Observable, ObservableKind};
use std::collections::HashMap;

fn weight(obs: &Observable, i: usize) -> f64 {
    match obs.kind {
        ObservableKind::Molecules => obs.coefficients.get(i).copied().unwrap_or(1.0),
        // Species observables count matching species once, whatever the
        // match multiplicity.
        ObservableKind::Species => 1.0,
    }
}

fn volume(obs: &Observable, i: usize) -> f64 {
    obs.volumes.get(i).copied().unwrap_or(1.0)
}

/// Observable value over an amounts (copy-number) state vector.
pub fn value_from_amounts(obs: &Observable, amounts: &[f64]) -> f64 {
    obs.indices
        .iter()
        .enumerate()
        .map(|(i, &s)| weight(obs, i) * amounts.get(s).copied().unwrap_or(0.0))
        .sum()
}

/// Observable value over a concentration state vector. Each contribution is
/// scaled back to an amount by its compartment volume.
pub fn value_from_concentrations(obs: &Observable, conc: &[f64]) -> f64 {
    obs.indices
        .iter()
        .enumerate()
        .map(|(i, &s)| weight(obs, i) * conc.get(s).copied().unwrap_or(0.0) * volume(obs, i))
        .sum()
}

/// Parameters plus observable values over an amounts state, the base of a
/// functional-rate context. Engines extend it with raw species values and
/// `ridx{j}` aliases.
pub fn amounts_context(
    parameters: &HashMap<String, f64>,
    observables: &[Observable],
    amounts: &[f64],
) -> RateContext {
    let mut ctx: RateContext = parameters.clone();
    for obs in observables {
        ctx.insert(obs.name.clone(), value_from_amounts(obs, amounts));
    }
    ctx
}
