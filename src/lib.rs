//! Simulation engine for expanded rule-based biochemical reaction networks.
//!
//! The crate takes a fully expanded [network::Network] (concrete species,
//! concrete reactions, compiled observables) plus a simulation schedule and
//! produces a time-series of observable values, by deterministic ODE
//! integration, by Gillespie stochastic simulation with optional influence
//! tracking, or through an injected network-free engine.
//!
//! ```no_run
//! use bngsim::network::{Network, Reaction, Species};
//! use bngsim::prelude::*;
//!
//! let mut net = Network::default();
//! net.species.push(Species::new("A", 1000.0));
//! net.species.push(Species::new("B", 0.0));
//! net.reactions.push(Reaction::new(vec!["A"], vec!["B"], "0.5"));
//!
//! let result = Simulator::new(&net, SimOptions::default()).run().unwrap();
//! for (t, row) in result.times.iter().zip(&result.species_rows) {
//!     println!("{t}\t{row:?}");
//! }
//! ```

pub mod error;
pub mod exprs;
pub mod network;
pub mod simulator;

pub use error::SimulatorError;
pub use simulator::{SimOptions, SimulationResult, Simulator};

pub mod prelude {
    pub use crate::error::SimulatorError;
    pub use crate::exprs::{EvaluatorConfig, ExpressionEvaluator};
    pub use crate::network::{
        ChangeMode, ChangeValue, ConcentrationChange, Network, Observable, ParameterChange,
        Reaction, SimMethod, SimulationPhase, Species,
    };
    pub use crate::simulator::nf::{NetworkFreeEngine, NfPhaseOutput, NfPhaseSpec};
    pub use crate::simulator::ssa::influence::InfluenceSeries;
    pub use crate::simulator::{
        CancelToken, SimOptions, SimulationResult, Simulator, SolverHint, SolverId,
    };
}
