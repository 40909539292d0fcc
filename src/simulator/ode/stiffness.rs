//! Stiffness classification and solver selection.
//!
//! The spread of the rate constants is a cheap but reliable stiffness proxy
//! for mass-action networks: widely separated time scales force implicit
//! solvers into small steps unless tolerances and Jacobian handling are
//! adjusted up front.

use crate::simulator::compile::{CompiledNetwork, RateSpec};
use crate::simulator::{SolverHint, SolverId};

/// Ratio thresholds between the fastest and slowest non-zero rate constant.
const MODERATE_RATIO: f64 = 1e3;
const SEVERE_RATIO: f64 = 1e6;
const EXTREME_RATIO: f64 = 1e9;

/// Species count above which a sparsity-aware Jacobian pays off.
const SPARSE_SPECIES_THRESHOLD: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StiffnessCategory {
    Mild,
    Moderate,
    Severe,
    Extreme,
}

/// Static stiffness features of a compiled network.
#[derive(Debug, Clone)]
pub struct StiffnessProfile {
    pub category: StiffnessCategory,
    /// max/min over the non-zero constant rates; 1.0 when fewer than two.
    pub rate_ratio: f64,
    pub has_functional_rates: bool,
    pub n_species: usize,
    pub n_reactions: usize,
    pub multi_phase: bool,
}

/// Classify a compiled network. The category follows the constant-rate
/// spread alone; functional rates are recorded as a profile feature.
pub fn analyze(compiled: &CompiledNetwork, n_phases: usize) -> StiffnessProfile {
    let mut min_rate = f64::INFINITY;
    let mut max_rate: f64 = 0.0;
    let mut has_functional = false;
    for rxn in &compiled.reactions {
        match &rxn.rate {
            RateSpec::Constant(k) => {
                let k = k.abs();
                if k > 0.0 && k.is_finite() {
                    min_rate = min_rate.min(k);
                    max_rate = max_rate.max(k);
                }
            }
            RateSpec::Functional(_) => has_functional = true,
        }
    }
    let rate_ratio = if max_rate > 0.0 && min_rate.is_finite() {
        max_rate / min_rate
    } else {
        1.0
    };
    let category = if rate_ratio >= EXTREME_RATIO {
        StiffnessCategory::Extreme
    } else if rate_ratio >= SEVERE_RATIO {
        StiffnessCategory::Severe
    } else if rate_ratio >= MODERATE_RATIO {
        StiffnessCategory::Moderate
    } else {
        StiffnessCategory::Mild
    };
    StiffnessProfile {
        category,
        rate_ratio,
        has_functional_rates: has_functional,
        n_species: compiled.species_volumes.len(),
        n_reactions: compiled.reactions.len(),
        multi_phase: n_phases > 1,
    }
}

/// Solver tuning derived from a stiffness profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConfig {
    pub max_steps: usize,
    pub max_nonlinear_iters: usize,
    pub max_order: usize,
    /// Tolerances tighter than this floor are left alone; looser ones are
    /// clamped down for the stiffer categories.
    pub atol_floor: f64,
    pub stability_limit_detection: bool,
    pub prefer_sparse: bool,
    pub analytic_jacobian: bool,
}

pub fn config_for(profile: &StiffnessProfile) -> SolverConfig {
    match profile.category {
        StiffnessCategory::Mild => SolverConfig {
            max_steps: 2000,
            max_nonlinear_iters: 3,
            max_order: 5,
            atol_floor: 1e-8,
            stability_limit_detection: false,
            prefer_sparse: false,
            analytic_jacobian: false,
        },
        StiffnessCategory::Moderate => SolverConfig {
            max_steps: 5000,
            max_nonlinear_iters: 5,
            max_order: 5,
            atol_floor: 1e-8,
            stability_limit_detection: false,
            prefer_sparse: false,
            analytic_jacobian: false,
        },
        StiffnessCategory::Severe => SolverConfig {
            max_steps: 20000,
            max_nonlinear_iters: 8,
            max_order: 4,
            atol_floor: 1e-9,
            stability_limit_detection: true,
            prefer_sparse: true,
            analytic_jacobian: false,
        },
        StiffnessCategory::Extreme => SolverConfig {
            max_steps: 50000,
            max_nonlinear_iters: 10,
            max_order: 3,
            atol_floor: 1e-10,
            stability_limit_detection: true,
            prefer_sparse: true,
            analytic_jacobian: true,
        },
    }
}

/// Resolve a hint to one concrete solver before integration starts.
///
/// The resolution is a pure function of the profile and the phase's sparse
/// override, so repeated runs of the same model pick the same solver.
pub fn resolve_solver(
    hint: SolverHint,
    profile: &StiffnessProfile,
    sparse_override: Option<bool>,
    pure_mass_action: bool,
) -> SolverId {
    if let SolverHint::Fixed(id) = hint {
        return id;
    }
    let config = config_for(profile);
    if !pure_mass_action {
        // Analytic Jacobians need the folded mass-action form.
        return SolverId::BdfNumericJacobian;
    }
    let want_sparse = match sparse_override {
        Some(v) => v,
        None => config.prefer_sparse && profile.n_species > SPARSE_SPECIES_THRESHOLD,
    };
    if want_sparse {
        SolverId::BdfSparseJacobian
    } else if config.analytic_jacobian {
        SolverId::BdfAnalyticJacobian
    } else {
        SolverId::BdfNumericJacobian
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::compile::CompiledReaction;

    fn compiled_with_rates(rates: &[f64]) -> CompiledNetwork {
        let mut net = CompiledNetwork::default();
        for (i, &k) in rates.iter().enumerate() {
            net.reactions.push(CompiledReaction {
                reactants: vec![0],
                products: vec![],
                stoichiometries: vec![],
                rate: RateSpec::Constant(k),
                propensity_factor: 1.0,
                degeneracy: 1.0,
                volume: 1.0,
                name: format!("R{}", i + 1),
            });
        }
        net.species_volumes = vec![1.0];
        net.constant = vec![false];
        net
    }

    #[test]
    fn rate_spread_sets_the_category() {
        let cases = [
            (vec![1.0, 10.0], StiffnessCategory::Mild),
            (vec![1.0, 1e4], StiffnessCategory::Moderate),
            (vec![1e-3, 1e4], StiffnessCategory::Severe),
            (vec![1e-3, 1e7], StiffnessCategory::Extreme),
        ];
        for (rates, expected) in cases {
            let profile = analyze(&compiled_with_rates(&rates), 1);
            assert_eq!(profile.category, expected, "rates {rates:?}");
        }
    }

    #[test]
    fn zero_rates_are_ignored_in_the_spread() {
        let profile = analyze(&compiled_with_rates(&[0.0, 2.0]), 1);
        assert_eq!(profile.rate_ratio, 1.0);
        assert_eq!(profile.category, StiffnessCategory::Mild);
    }

    #[test]
    fn functional_rates_are_a_feature_not_a_category() {
        let mut net = compiled_with_rates(&[1.0, 2.0]);
        net.reactions[0].rate = RateSpec::Functional("k * X".into());
        let profile = analyze(&net, 1);
        assert!(profile.has_functional_rates);
        assert_eq!(profile.category, StiffnessCategory::Mild);
    }

    #[test]
    fn fixed_hint_wins() {
        let profile = analyze(&compiled_with_rates(&[1.0]), 1);
        let id = resolve_solver(
            SolverHint::Fixed(SolverId::FixedRk4),
            &profile,
            None,
            true,
        );
        assert_eq!(id, SolverId::FixedRk4);
    }

    #[test]
    fn auto_resolution_is_deterministic() {
        let profile = analyze(&compiled_with_rates(&[1e-3, 1e7]), 1);
        let a = resolve_solver(SolverHint::Auto, &profile, None, true);
        let b = resolve_solver(SolverHint::Auto, &profile, None, true);
        assert_eq!(a, b);
        assert_eq!(a, SolverId::BdfAnalyticJacobian);
    }

    #[test]
    fn functional_rates_force_the_numeric_jacobian() {
        let mut net = compiled_with_rates(&[1e-3, 1e7]);
        net.reactions[0].rate = RateSpec::Functional("k * X".into());
        let profile = analyze(&net, 1);
        let id = resolve_solver(SolverHint::Auto, &profile, Some(true), false);
        assert_eq!(id, SolverId::BdfNumericJacobian);
    }
}
