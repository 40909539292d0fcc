//! Network-free simulation dispatch.
//!
//! Network-free engines operate on rules directly and never see the
//! expanded reaction list, so they live behind an injected capability. The
//! scheduler hands off the current state, time-shifts the returned rows and
//! resumes from the returned final state.

use crate::error::SimulatorError;
use crate::network::Network;

/// Pass-through settings for one network-free phase.
#[derive(Debug, Clone)]
pub struct NfPhaseSpec {
    pub t_start: f64,
    pub duration: f64,
    pub n_steps: usize,
    /// Universal traversal limit, forwarded verbatim.
    pub utl: Option<u32>,
    /// Global molecule limit, forwarded verbatim.
    pub gml: Option<u64>,
    pub equilibrate: bool,
    pub seed: Option<u64>,
}

/// Phase output returned by a network-free engine.
///
/// `observable_rows` is one row per grid time, in the order of the
/// network's observables. `species_rows`, when the engine can produce
/// them, are parallel species amounts; otherwise the scheduler pads with
/// the final state.
#[derive(Debug, Clone)]
pub struct NfPhaseOutput {
    pub times: Vec<f64>,
    pub observable_rows: Vec<Vec<f64>>,
    pub species_rows: Option<Vec<Vec<f64>>>,
    pub final_amounts: Vec<f64>,
    pub warnings: Vec<String>,
}

/// External network-free simulation capability.
pub trait NetworkFreeEngine {
    fn simulate(
        &self,
        network: &Network,
        amounts: &[f64],
        spec: &NfPhaseSpec,
    ) -> Result<NfPhaseOutput, SimulatorError>;
}
