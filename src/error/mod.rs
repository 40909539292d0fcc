use thiserror::Error;

/// Fixed diagnostic emitted when a functional rate is requested while the
/// evaluator feature flag is off. Hosts match on this message.
pub const FUNCTIONAL_RATES_DISABLED: &str = "functional rates are disabled by configuration";

/// Crate-level error type.
///
/// Configuration errors are fatal and abort the run. Numerical problems are
/// recovered locally where possible and surface as warnings on the
/// [crate::simulator::SimulationResult] instead of as errors.
#[derive(Error, Debug)]
pub enum SimulatorError {
    /// A reaction references a species name that is not in the species list.
    #[error("{role} species \"{name}\" not found in species list")]
    UnknownSpecies { name: String, role: &'static str },

    /// A concentration change targets a species that cannot be resolved.
    #[error("concentration change targets unknown species \"{0}\"")]
    UnknownChangeTarget(String),

    /// Functional rates were requested while disabled by configuration.
    #[error("{FUNCTIONAL_RATES_DISABLED}")]
    FunctionalRatesDisabled,

    /// A propensity evaluated to NaN or infinity, usually caused by an
    /// undefined parameter or a volume scaling error.
    #[error("non-finite propensity for reaction {index} ({name}); check for undefined parameters")]
    InvalidPropensity { index: usize, name: String },

    /// A phase requested network-free simulation but no engine was provided.
    #[error("phase {0} requests network-free simulation but no network-free engine is configured")]
    MissingNetworkFreeEngine(usize),

    /// The network-free engine reported a failure for a phase.
    #[error("network-free simulation failed in phase {phase}: {message}")]
    NetworkFreeFailed { phase: usize, message: String },

    /// Expression parsing or evaluation failed in a context where a value is
    /// required (e.g. a scheduled parameter change).
    #[error("expression error: {0}")]
    Expression(String),

    /// Error bubbled up from the diffsol solver machinery while constructing
    /// a problem or stepping.
    #[error("ODE solver error: {0}")]
    OdeSolver(#[from] diffsol::error::DiffsolError),

    /// The host cancelled the run.
    #[error("simulation cancelled")]
    Cancelled,
}
