//! Simulation engines and the phase scheduler.

pub mod compile;
pub mod grid;
pub mod nf;
pub mod observables;
pub mod ode;
pub mod scheduler;
pub mod ssa;

use crate::simulator::ssa::influence::InfluenceSeries;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use scheduler::{SimOptions, Simulator};

/// Concrete solver identity, resolved before integration starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SolverId {
    /// BDF with a sparsity-aware reaction-wise Jacobian product.
    BdfSparseJacobian,
    /// BDF with a materialized dense analytic Jacobian.
    BdfAnalyticJacobian,
    /// BDF with a finite-difference Jacobian.
    BdfNumericJacobian,
    /// Fixed-step explicit RK4.
    FixedRk4,
}

/// Solver request carried on the options; `Auto` resolves deterministically
/// from the stiffness profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverHint {
    #[default]
    Auto,
    Fixed(SolverId),
}

/// Cooperative cancellation shared between the host and a running
/// simulation. Checked at least once per solver sub-step and per stochastic
/// event.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The assembled output of a multi-phase run.
///
/// `rows` is the observable table on the output grid (`headers` names its
/// columns, `time` first); `species_rows` is the parallel species-level
/// state in amounts. Times are monotonically non-decreasing across phases.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationResult {
    pub headers: Vec<String>,
    pub times: Vec<f64>,
    pub rows: Vec<Vec<f64>>,
    pub species_names: Vec<String>,
    pub species_rows: Vec<Vec<f64>>,
    pub reaction_names: Vec<String>,
    pub warnings: Vec<String>,
    /// Present when influence tracking was requested and a stochastic phase
    /// ran.
    pub influence: Option<InfluenceSeries>,
    /// Phases that stopped early on steady-state detection.
    pub steady_state_phases: Vec<usize>,
    pub final_amounts: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
