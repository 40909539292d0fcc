//! Reaction compilation.
//!
//! Turns the name-based [Network](crate::network::Network) into index-based
//! records the engines iterate over. Compilation is deterministic: the same
//! network always yields the same records in the same order.

use crate::error::SimulatorError;
use crate::exprs::{contains_call_syntax, RateEvaluator};
use crate::network::{Network, Reaction};
use std::collections::{HashMap, HashSet};

/// How a reaction's rate is obtained at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum RateSpec {
    /// Fixed numeric rate constant, resolved at compile time.
    Constant(f64),
    /// Expression re-evaluated against the live context on every use.
    Functional(String),
}

impl RateSpec {
    pub fn is_functional(&self) -> bool {
        matches!(self, RateSpec::Functional(_))
    }
}

/// One reaction in index form.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledReaction {
    /// Reactant species indices, with multiplicity.
    pub reactants: Vec<usize>,
    /// Product species indices, parallel to `stoichiometries`.
    pub products: Vec<usize>,
    pub stoichiometries: Vec<f64>,
    pub rate: RateSpec,
    pub propensity_factor: f64,
    pub degeneracy: f64,
    /// Anchor volume for compartment scaling.
    pub volume: f64,
    /// Display name used in diagnostics and DIN output.
    pub name: String,
}

/// The compiled network shared by the ODE and SSA engines.
#[derive(Debug, Clone, Default)]
pub struct CompiledNetwork {
    pub reactions: Vec<CompiledReaction>,
    /// Species name to index, exact names as given.
    pub species_index: HashMap<String, usize>,
    /// Compartment volume per species index.
    pub species_volumes: Vec<f64>,
    /// Constant-species mask per species index.
    pub constant: Vec<bool>,
    /// Diagnostics produced during compilation.
    pub warnings: Vec<String>,
}

impl CompiledNetwork {
    /// True when every reaction rate is a resolved constant.
    pub fn is_pure_mass_action(&self) -> bool {
        self.reactions.iter().all(|r| !r.rate.is_functional())
    }

    /// Map of species index to the reactions whose propensity depends on it.
    /// Functional-rate reactions depend on every species.
    pub fn dependency_map(&self) -> Vec<Vec<usize>> {
        let n = self.species_volumes.len();
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (ridx, rxn) in self.reactions.iter().enumerate() {
            if rxn.rate.is_functional() {
                for d in deps.iter_mut() {
                    d.push(ridx);
                }
                continue;
            }
            let mut seen = HashSet::new();
            for &s in &rxn.reactants {
                if seen.insert(s) {
                    deps[s].push(ridx);
                }
            }
        }
        deps
    }
}

/// Reacting volume for compartment scaling: the smallest compartment among
/// the reactants, falling back to products, then to unit volume. A declared
/// positive scaling volume always wins.
fn reacting_volume(network: &Network, rxn: &Reaction) -> f64 {
    if let Some(v) = rxn.scaling_volume {
        if v.is_finite() && v > 0.0 {
            return v;
        }
    }
    let min_over = |names: &[String]| -> Option<f64> {
        names
            .iter()
            .map(|n| network.species_volume(n))
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    };
    min_over(&rxn.reactants)
        .or_else(|| min_over(&rxn.products))
        .unwrap_or(1.0)
}

/// Classify a rate string. Functional when it reads any observable, user
/// function, or parameter scheduled to change; a failed dependency
/// extraction falls back to scanning for call syntax.
fn is_functional_rate(
    rate: &str,
    evaluator: &RateEvaluator,
    network: &Network,
    changing_parameters: &HashSet<String>,
) -> bool {
    if rate.trim().parse::<f64>().is_ok() {
        return false;
    }
    let expanded_source = evaluator.expand(rate);
    match evaluator.backend().referenced_variables(&expanded_source) {
        Ok(vars) => vars.iter().any(|v| {
            network.observables.iter().any(|o| o.name == *v)
                || network.functions.iter().any(|f| f.name == *v)
                || changing_parameters.contains(v)
        }),
        Err(_) => contains_call_syntax(rate),
    }
}

/// Resolve a non-functional rate string to a number using the parameter
/// table. Non-finite results become a zero rate plus a warning.
fn resolve_constant_rate(
    rate: &str,
    evaluator: &RateEvaluator,
    parameters: &HashMap<String, f64>,
    name: &str,
    warnings: &mut Vec<String>,
) -> f64 {
    if let Ok(v) = rate.trim().parse::<f64>() {
        return v;
    }
    if let Some(v) = parameters.get(rate.trim()) {
        return *v;
    }
    let expanded = evaluator.expand(rate);
    let value = match evaluator.backend().compile(&expanded, &collect_keys(parameters)) {
        Ok(compiled) => compiled.eval(parameters).unwrap_or(f64::NAN),
        Err(_) => f64::NAN,
    };
    if value.is_finite() {
        value
    } else {
        warnings.push(format!(
            "rate \"{rate}\" of reaction {name} did not evaluate to a finite constant; using 0"
        ));
        log::warn!("constant rate \"{rate}\" of {name} is non-finite, forcing 0");
        0.0
    }
}

fn collect_keys(map: &HashMap<String, f64>) -> Vec<String> {
    map.keys().cloned().collect()
}

/// Compile the network against the current parameter table.
///
/// Called once up front and again whenever a scheduled parameter change can
/// alter a constant rate.
pub fn compile_network(
    network: &Network,
    evaluator: &RateEvaluator,
    changing_parameters: &HashSet<String>,
) -> Result<CompiledNetwork, SimulatorError> {
    let species_index: HashMap<String, usize> = network
        .species
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.clone(), i))
        .collect();
    let species_volumes: Vec<f64> = network
        .species
        .iter()
        .map(|s| network.species_volume(&s.name))
        .collect();
    let constant: Vec<bool> = network.species.iter().map(|s| s.constant).collect();

    let mut warnings = Vec::new();
    let mut reactions = Vec::with_capacity(network.reactions.len());
    for (idx, rxn) in network.reactions.iter().enumerate() {
        let resolve = |names: &[String], role: &'static str| -> Result<Vec<usize>, SimulatorError> {
            names
                .iter()
                .map(|n| {
                    species_index
                        .get(n)
                        .copied()
                        .ok_or_else(|| SimulatorError::UnknownSpecies {
                            name: n.clone(),
                            role,
                        })
                })
                .collect()
        };
        let reactants = resolve(&rxn.reactants, "reactant")?;
        let products = resolve(&rxn.products, "product")?;
        let stoichiometries = if rxn.product_stoichiometries.is_empty() {
            vec![1.0; products.len()]
        } else {
            rxn.product_stoichiometries.clone()
        };
        let name = rxn
            .rule_name
            .clone()
            .unwrap_or_else(|| format!("R{}", idx + 1));

        let rate = if is_functional_rate(&rxn.rate, evaluator, network, changing_parameters) {
            if !evaluator.functional_rates_enabled() {
                return Err(SimulatorError::FunctionalRatesDisabled);
            }
            RateSpec::Functional(rxn.rate.clone())
        } else {
            RateSpec::Constant(resolve_constant_rate(
                &rxn.rate,
                evaluator,
                &network.parameters,
                &name,
                &mut warnings,
            ))
        };

        reactions.push(CompiledReaction {
            reactants,
            products,
            stoichiometries,
            rate,
            propensity_factor: rxn.propensity_factor,
            degeneracy: rxn.degeneracy,
            volume: reacting_volume(network, rxn),
            name,
        });
    }

    Ok(CompiledNetwork {
        reactions,
        species_index,
        species_volumes,
        constant,
        warnings,
    })
}
