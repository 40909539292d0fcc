//! Simulation phases and scheduled edits.
//!
//! A multi-phase run is a sequence of phases, each with its own method,
//! horizon and tolerances. Parameter and concentration changes are keyed to
//! "after phase N" and applied exactly once at the phase boundary before the
//! target phase begins integrating.

use serde::{Deserialize, Serialize};

/// Numerical method of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SimMethod {
    /// Resolve to the engine default (ODE).
    #[default]
    Default,
    Ode,
    Ssa,
    /// Network-free stochastic simulation, delegated to an external engine.
    Nf,
}

/// One scheduled simulation phase.
///
/// Phases are immutable once scheduled; the only state that crosses a phase
/// boundary is the species state plus any scheduled edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationPhase {
    #[serde(default)]
    pub method: SimMethod,
    /// Absolute start time; `None` means "the running clock" when
    /// `continue_` is set, otherwise 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_start: Option<f64>,
    /// Absolute end time in the phase's own time frame.
    pub t_end: f64,
    pub n_steps: usize,
    /// Whether this phase continues the running clock instead of resetting.
    #[serde(default, rename = "continue")]
    pub continue_: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atol: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtol: Option<f64>,
    /// Force (or forbid) the sparse-Jacobian solver for this phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse: Option<bool>,
    /// Stop the phase early once the derivative norm falls below atol.
    #[serde(default)]
    pub steady_state: bool,
    /// Append zero-argument user function values to each output row.
    #[serde(default)]
    pub print_functions: bool,
    /// Network-free universal traversal limit, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utl: Option<u32>,
    /// Network-free global molecule limit, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gml: Option<u64>,
    /// Ask the network-free engine to equilibrate before sampling.
    #[serde(default)]
    pub equilibrate: bool,
}

impl SimulationPhase {
    pub fn new(method: SimMethod, t_end: f64, n_steps: usize) -> Self {
        SimulationPhase {
            method,
            t_start: None,
            t_end,
            n_steps,
            continue_: false,
            atol: None,
            rtol: None,
            sparse: None,
            steady_state: false,
            print_functions: false,
            utl: None,
            gml: None,
            equilibrate: false,
        }
    }

    pub fn continued(mut self) -> Self {
        self.continue_ = true;
        self
    }
}

/// A scheduled edit value: a literal, or an expression evaluated against the
/// current parameters (and observables, for parameter changes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangeValue {
    Literal(f64),
    Expression(String),
}

/// A pending parameter edit applied after phase `after_phase_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterChange {
    pub parameter: String,
    pub value: ChangeValue,
    /// The change applies before phase `after_phase_index + 1` integrates.
    pub after_phase_index: i64,
}

/// How a concentration change combines with the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChangeMode {
    #[default]
    Set,
    Add,
}

/// A pending species amount edit applied after phase `after_phase_index`.
///
/// The target is resolved by exact species name first, then by matching the
/// compartment-stripped name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationChange {
    pub species: String,
    pub value: ChangeValue,
    #[serde(default)]
    pub mode: ChangeMode,
    pub after_phase_index: i64,
}
