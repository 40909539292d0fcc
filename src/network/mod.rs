//! Input data model for the simulation engine.
//!
//! A [Network] is the fully expanded form of a rule-based model: concrete
//! species, concrete reactions, compiled observables and the simulation
//! schedule. It is produced by out-of-scope collaborators (parser, pattern
//! matcher, network expansion) and consumed read-only by the engine, which
//! deep-copies it per run.

pub mod phase;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use phase::{
    ChangeMode, ChangeValue, ConcentrationChange, ParameterChange, SimMethod, SimulationPhase,
};

/// A concrete species of the expanded network.
///
/// The compartment is encoded in the canonical name, either as an `@Comp:`
/// prefix or a `@Comp` suffix; species without compartment decoration live in
/// an implicit unit-volume compartment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    pub name: String,
    /// Initial amount in copy numbers (converted to concentration for ODE).
    #[serde(default)]
    pub initial_amount: f64,
    /// Constant species are excluded from derivative and delta updates.
    #[serde(default)]
    pub constant: bool,
}

impl Species {
    pub fn new(name: impl Into<String>, initial_amount: f64) -> Self {
        Species {
            name: name.into(),
            initial_amount,
            constant: false,
        }
    }

    /// Compartment name parsed from the species name, if any.
    pub fn compartment(&self) -> Option<&str> {
        parse_compartment(&self.name)
    }

    /// The species name with compartment decoration stripped.
    pub fn bare_name(&self) -> &str {
        strip_compartment(&self.name)
    }
}

/// Parse the compartment out of a decorated species name.
///
/// Prefix notation `@Comp:Species` takes precedence over the suffix
/// notation `Species@Comp`.
pub(crate) fn parse_compartment(name: &str) -> Option<&str> {
    if let Some(rest) = name.strip_prefix('@') {
        if let Some(colon) = rest.find(':') {
            if colon > 0 {
                return Some(&rest[..colon]);
            }
        }
    }
    match name.rfind('@') {
        Some(at) if at > 0 && at + 1 < name.len() => Some(name[at + 1..].trim()),
        _ => None,
    }
}

pub(crate) fn strip_compartment(name: &str) -> &str {
    if let Some(rest) = name.strip_prefix('@') {
        if let Some(colon) = rest.find(':') {
            return &rest[colon + 1..];
        }
    }
    match name.rfind('@') {
        Some(at) if at > 0 => &name[..at],
        _ => name,
    }
}

/// A concrete reaction between species of the network.
///
/// `rate` is a rate-law string: either a numeric literal, a parameter
/// reference, or a functional expression over observables, parameters and
/// user functions. The reaction compiler classifies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub reactants: Vec<String>,
    pub products: Vec<String>,
    pub rate: String,
    /// Per-product stoichiometry, parallel to `products`. Empty means all 1.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub product_stoichiometries: Vec<f64>,
    /// Statistical (degeneracy-correction) factor applied to the rate.
    #[serde(default = "one")]
    pub propensity_factor: f64,
    /// Symmetry degeneracy of the generating rule.
    #[serde(default = "one")]
    pub degeneracy: f64,
    /// Declared compartment scaling volume; overrides the derived
    /// reacting volume when positive and finite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_volume: Option<f64>,
    /// Name of the generating rule, used in diagnostics and DIN output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
}

fn one() -> f64 {
    1.0
}

impl Reaction {
    pub fn new(
        reactants: Vec<&str>,
        products: Vec<&str>,
        rate: impl Into<String>,
    ) -> Self {
        Reaction {
            reactants: reactants.into_iter().map(String::from).collect(),
            products: products.into_iter().map(String::from).collect(),
            rate: rate.into(),
            product_stoichiometries: Vec::new(),
            propensity_factor: 1.0,
            degeneracy: 1.0,
            scaling_volume: None,
            rule_name: None,
        }
    }
}

/// Observable kind. `Molecules` observables sum molecule counts (weighted by
/// match multiplicity); `Species` observables count whole matching species.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObservableKind {
    #[default]
    Molecules,
    Species,
}

/// A compiled observable: a weighted sum over species state.
///
/// The index/coefficient/volume arrays are produced by the external pattern
/// matcher; the engine only evaluates the weighted sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observable {
    pub name: String,
    #[serde(default)]
    pub kind: ObservableKind,
    /// Indices of contributing species.
    pub indices: Vec<usize>,
    /// Match multiplicity per contribution; non-negative integers.
    pub coefficients: Vec<f64>,
    /// Compartment volume per contribution; empty means all 1.0.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<f64>,
}

/// A compartment with a resolved volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compartment {
    pub name: String,
    #[serde(default = "three")]
    pub dimension: u8,
    #[serde(default = "one")]
    pub volume: f64,
}

fn three() -> u8 {
    3
}

/// A user-defined function. Zero-argument functions can be printed per
/// output row when function printing is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFunction {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub expression: String,
}

/// The expanded reaction network plus its simulation schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub name: String,
    pub species: Vec<Species>,
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub observables: Vec<Observable>,
    #[serde(default)]
    pub compartments: Vec<Compartment>,
    #[serde(default)]
    pub functions: Vec<UserFunction>,
    /// Current numeric parameter values.
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
    /// Parameters defined by expressions of other parameters; re-evaluated
    /// after scheduled parameter changes.
    #[serde(default)]
    pub parameter_expressions: HashMap<String, String>,
    /// Scheduled phases. Empty means a single phase built from the options.
    #[serde(default)]
    pub phases: Vec<SimulationPhase>,
    #[serde(default)]
    pub parameter_changes: Vec<ParameterChange>,
    #[serde(default)]
    pub concentration_changes: Vec<ConcentrationChange>,
}

impl Network {
    /// Volume of the compartment a species name resolves to, default 1.0.
    pub fn species_volume(&self, name: &str) -> f64 {
        parse_compartment(name)
            .and_then(|c| self.compartments.iter().find(|k| k.name == c))
            .map(|k| k.volume)
            .unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compartment_prefix_notation() {
        assert_eq!(parse_compartment("@EC:L(r)"), Some("EC"));
        assert_eq!(strip_compartment("@EC:L(r)"), "L(r)");
    }

    #[test]
    fn compartment_suffix_notation() {
        assert_eq!(parse_compartment("L(r)@PM"), Some("PM"));
        assert_eq!(strip_compartment("L(r)@PM"), "L(r)");
    }

    #[test]
    fn undecorated_name_has_no_compartment() {
        assert_eq!(parse_compartment("A(b~P)"), None);
        assert_eq!(strip_compartment("A(b~P)"), "A(b~P)");
    }

    #[test]
    fn species_volume_defaults_to_unit() {
        let mut net = Network::default();
        net.compartments.push(Compartment {
            name: "EC".into(),
            dimension: 3,
            volume: 2.5,
        });
        assert_eq!(net.species_volume("@EC:L"), 2.5);
        assert_eq!(net.species_volume("L"), 1.0);
    }
}
