//! Stochastic simulation (Gillespie direct method).
//!
//! State is integer copy numbers held in f64 storage. Output rows are
//! sampled on the same fixed grid as the ODE engine whenever simulated time
//! crosses a grid point, so the two methods emit identically shaped tables.

pub mod influence;

use crate::error::SimulatorError;
use crate::exprs::{RateContext, RateEvaluator};
use crate::network::Observable;
use crate::simulator::compile::{CompiledNetwork, RateSpec};
use crate::simulator::grid;
use crate::simulator::observables::amounts_context;
use crate::simulator::CancelToken;
use influence::InfluenceTracker;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Exp};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Runaway-phase guard: events per phase before giving up with a warning.
pub const DEFAULT_MAX_EVENTS: u64 = 100_000_000;

/// Borrowed inputs shared by all SSA phases of a run.
pub struct SsaInputs<'a> {
    pub compiled: &'a Arc<CompiledNetwork>,
    pub observables: &'a [Observable],
    pub parameters: &'a HashMap<String, f64>,
    pub species_names: &'a [String],
    pub evaluator: &'a Rc<RateEvaluator>,
}

/// Per-phase settings.
pub struct SsaPhaseSpec {
    pub t_start: f64,
    pub duration: f64,
    pub n_steps: usize,
    pub max_events: u64,
}

/// Result of one stochastic phase, grid-shaped like the ODE output.
#[derive(Debug)]
pub struct SsaPhaseOutput {
    pub times: Vec<f64>,
    pub rows: Vec<Vec<f64>>,
    pub final_counts: Vec<f64>,
    /// Propensities vanished before the phase horizon.
    pub depleted: bool,
    pub warnings: Vec<String>,
}

struct PropensityEval<'a> {
    compiled: &'a CompiledNetwork,
    observables: &'a [Observable],
    parameters: &'a HashMap<String, f64>,
    species_names: &'a [String],
    evaluator: &'a Rc<RateEvaluator>,
    has_functional: bool,
}

impl<'a> PropensityEval<'a> {
    fn new(inputs: &'a SsaInputs) -> Self {
        Self {
            compiled: inputs.compiled,
            observables: inputs.observables,
            parameters: inputs.parameters,
            species_names: inputs.species_names,
            evaluator: inputs.evaluator,
            has_functional: inputs
                .compiled
                .reactions
                .iter()
                .any(|r| r.rate.is_functional()),
        }
    }

    /// Parameters, observables and raw counts keyed by name, rebuilt lazily
    /// only when functional rates exist.
    fn context(&self, counts: &[f64]) -> Option<RateContext> {
        if !self.has_functional {
            return None;
        }
        let mut ctx = amounts_context(self.parameters, self.observables, counts);
        for (i, name) in self.species_names.iter().enumerate() {
            ctx.insert(name.clone(), counts[i]);
        }
        Some(ctx)
    }

    /// Propensity of one reaction against the current counts.
    ///
    /// Volume power scaling follows the reaction order `n`: zero-order
    /// sources scale up by V, bimolecular and higher scale down by
    /// V^(n-1).
    fn propensity(
        &self,
        idx: usize,
        counts: &[f64],
        ctx: Option<&mut RateContext>,
        eval_failed: &mut bool,
    ) -> f64 {
        let rxn = &self.compiled.reactions[idx];
        let rate = match (&rxn.rate, ctx) {
            (RateSpec::Constant(k), _) => *k,
            (RateSpec::Functional(expr), Some(ctx)) => {
                for (j, &r) in rxn.reactants.iter().enumerate() {
                    ctx.insert(format!("ridx{j}"), counts[r]);
                }
                match self.evaluator.evaluate(expr, ctx) {
                    Ok(v) => v,
                    Err(_) => {
                        *eval_failed = true;
                        0.0
                    }
                }
            }
            (RateSpec::Functional(_), None) => 0.0,
        };
        let v = rxn.volume;
        let order = rxn.reactants.len();
        let scaling = match order {
            0 => v,
            1 => 1.0,
            n => v.powi(-(n as i32 - 1)),
        };
        let mut a = rate * rxn.propensity_factor * scaling;
        for &r in &rxn.reactants {
            a *= counts[r];
        }
        a
    }

    fn all(
        &self,
        counts: &[f64],
        out: &mut [f64],
        eval_failed: &mut bool,
    ) -> Result<f64, SimulatorError> {
        let mut ctx = self.context(counts);
        let mut total = 0.0;
        for idx in 0..self.compiled.reactions.len() {
            let a = self.propensity(idx, counts, ctx.as_mut(), eval_failed);
            if !a.is_finite() {
                return Err(SimulatorError::InvalidPropensity {
                    index: idx,
                    name: self.compiled.reactions[idx].name.clone(),
                });
            }
            out[idx] = a.max(0.0);
            total += out[idx];
        }
        Ok(total)
    }
}

/// Run one stochastic phase from integral `counts`.
///
/// The influence tracker, when present, spans the whole run; this function
/// only feeds it.
pub fn run_phase(
    inputs: &SsaInputs,
    counts: &[f64],
    spec: &SsaPhaseSpec,
    rng: &mut StdRng,
    mut tracker: Option<&mut InfluenceTracker>,
    cancel: &CancelToken,
) -> Result<SsaPhaseOutput, SimulatorError> {
    let n_reactions = inputs.compiled.reactions.len();
    let constant = &inputs.compiled.constant;
    let eval = PropensityEval::new(inputs);
    let deps = inputs.compiled.dependency_map();

    let times = grid::phase_grid(spec.t_start, spec.duration, spec.n_steps);
    let t_end = *times.last().unwrap_or(&spec.t_start);
    let mut counts = counts.to_vec();
    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(times.len());
    rows.push(counts.clone());
    let mut next_idx = 1;
    let mut warnings = Vec::new();
    let mut depleted = false;
    let mut eval_failed = false;

    let mut propensities = vec![0.0; n_reactions];
    let mut t = spec.t_start;
    let mut events: u64 = 0;

    'events: loop {
        if cancel.is_cancelled() {
            return Err(SimulatorError::Cancelled);
        }
        let total = eval.all(&counts, &mut propensities, &mut eval_failed)?;
        if total <= 0.0 {
            depleted = true;
            break;
        }
        let exp = match Exp::new(total) {
            Ok(exp) => exp,
            Err(_) => {
                depleted = true;
                break;
            }
        };
        let tau = exp.sample(rng);
        let t_next = t + tau;
        if t_next > t_end {
            break;
        }

        // Sample every grid point the waiting time jumped over; the state
        // is constant on [t, t_next).
        while next_idx < times.len() && times[next_idx] < t_next {
            rows.push(counts.clone());
            next_idx += 1;
        }

        // Cumulative-sum selection; ties and float dust fall through to the
        // last reaction.
        let target = rng.random::<f64>() * total;
        let mut acc = 0.0;
        let mut chosen = n_reactions - 1;
        for (idx, &a) in propensities.iter().enumerate() {
            acc += a;
            if target < acc {
                chosen = idx;
                break;
            }
        }

        // Influence bookkeeping brackets the state delta: dependents of the
        // species the firing reaction touches, before and after.
        let mut touched: Vec<usize> = Vec::new();
        if tracker.is_some() {
            let rxn = &inputs.compiled.reactions[chosen];
            for &s in rxn.reactants.iter().chain(rxn.products.iter()) {
                for &d in &deps[s] {
                    if !touched.contains(&d) {
                        touched.push(d);
                    }
                }
            }
        }
        let old: Vec<f64> = touched.iter().map(|&d| propensities[d]).collect();

        {
            let rxn = &inputs.compiled.reactions[chosen];
            for &r in &rxn.reactants {
                if !constant[r] {
                    counts[r] -= 1.0;
                }
            }
            for (&p, &st) in rxn.products.iter().zip(&rxn.stoichiometries) {
                if !constant[p] {
                    counts[p] += st;
                }
            }
        }
        t = t_next;

        if let Some(tracker) = tracker.as_deref_mut() {
            tracker.record_firing(t, chosen);
            let mut ctx = eval.context(&counts);
            for (&d, &before) in touched.iter().zip(&old) {
                let after = eval.propensity(d, &counts, ctx.as_mut(), &mut eval_failed);
                if after.is_finite() {
                    tracker.record_delta(t, chosen, d, after - before);
                }
            }
        }

        events += 1;
        if events >= spec.max_events {
            warnings.push(format!(
                "stochastic phase exceeded {} events at t={t}; stopping early",
                spec.max_events
            ));
            log::warn!("SSA event cap hit at t={t}");
            break 'events;
        }
    }

    // Trailing grid rows carry the final state.
    while rows.len() < times.len() {
        rows.push(counts.clone());
    }

    if eval_failed {
        warnings.push(
            "one or more functional rate evaluations failed; affected rates were forced to 0"
                .to_string(),
        );
    }

    Ok(SsaPhaseOutput {
        times,
        rows,
        final_counts: counts,
        depleted,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exprs::{EvalexprEvaluator, EvaluatorConfig};
    use crate::network::{Network, Reaction, Species};
    use crate::simulator::compile::compile_network;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn decay_setup(n0: f64, k: f64) -> (Arc<CompiledNetwork>, Vec<String>, HashMap<String, f64>) {
        let mut net = Network::default();
        net.species.push(Species::new("A", n0));
        net.reactions
            .push(Reaction::new(vec!["A"], vec![], k.to_string()));
        let evaluator = RateEvaluator::new(
            Arc::new(EvalexprEvaluator),
            EvaluatorConfig::default(),
            vec![],
        );
        let compiled = compile_network(&net, &evaluator, &HashSet::new()).unwrap();
        let names = net.species.iter().map(|s| s.name.clone()).collect();
        (Arc::new(compiled), names, net.parameters.clone())
    }

    fn evaluator_rc() -> Rc<RateEvaluator> {
        Rc::new(RateEvaluator::new(
            Arc::new(EvalexprEvaluator),
            EvaluatorConfig::default(),
            vec![],
        ))
    }

    #[test]
    fn depletion_stops_early_and_fills_the_grid() {
        let (compiled, names, params) = decay_setup(5.0, 10.0);
        let evaluator = evaluator_rc();
        let inputs = SsaInputs {
            compiled: &compiled,
            observables: &[],
            parameters: &params,
            species_names: &names,
            evaluator: &evaluator,
        };
        let spec = SsaPhaseSpec {
            t_start: 0.0,
            duration: 100.0,
            n_steps: 10,
            max_events: DEFAULT_MAX_EVENTS,
        };
        let mut rng = StdRng::seed_from_u64(7);
        let out = run_phase(&inputs, &[5.0], &spec, &mut rng, None, &CancelToken::new()).unwrap();
        assert!(out.depleted);
        assert_eq!(out.rows.len(), 11);
        assert_eq!(*out.final_counts.first().unwrap(), 0.0);
        assert_eq!(*out.rows.last().unwrap().first().unwrap(), 0.0);
    }

    #[test]
    fn counts_stay_integral_and_monotone_for_pure_decay() {
        let (compiled, names, params) = decay_setup(50.0, 0.5);
        let evaluator = evaluator_rc();
        let inputs = SsaInputs {
            compiled: &compiled,
            observables: &[],
            parameters: &params,
            species_names: &names,
            evaluator: &evaluator,
        };
        let spec = SsaPhaseSpec {
            t_start: 0.0,
            duration: 5.0,
            n_steps: 20,
            max_events: DEFAULT_MAX_EVENTS,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let out = run_phase(&inputs, &[50.0], &spec, &mut rng, None, &CancelToken::new()).unwrap();
        let mut prev = f64::INFINITY;
        for row in &out.rows {
            let a = row[0];
            assert_eq!(a.fract(), 0.0);
            assert!(a <= prev);
            prev = a;
        }
    }

    #[test]
    fn waiting_times_past_the_phase_end_fire_no_event() {
        let (compiled, names, params) = decay_setup(50.0, 0.5);
        let evaluator = evaluator_rc();
        let inputs = SsaInputs {
            compiled: &compiled,
            observables: &[],
            parameters: &params,
            species_names: &names,
            evaluator: &evaluator,
        };
        let spec = SsaPhaseSpec {
            t_start: 0.0,
            duration: 2.0,
            n_steps: 4,
            max_events: DEFAULT_MAX_EVENTS,
        };
        let mut rng = StdRng::seed_from_u64(11);
        let out = run_phase(&inputs, &[50.0], &spec, &mut rng, None, &CancelToken::new()).unwrap();
        assert!(!out.depleted);
        assert_eq!(out.rows.len(), 5);
        // The padded tail carries the state of the last accepted event.
        assert_eq!(out.rows.last().unwrap(), &out.final_counts);
        assert!(out.final_counts[0] < 50.0);
    }

    #[test]
    fn influence_deltas_match_propensity_differences() {
        // A -> B, B -> A: firing R1 changes both propensities by exactly k.
        let mut net = Network::default();
        net.species.push(Species::new("A", 10.0));
        net.species.push(Species::new("B", 0.0));
        net.reactions.push(Reaction::new(vec!["A"], vec!["B"], "1.0"));
        net.reactions.push(Reaction::new(vec!["B"], vec!["A"], "2.0"));
        let evaluator = evaluator_rc();
        let compiled = Arc::new(
            compile_network(&net, &evaluator, &HashSet::new()).unwrap(),
        );
        let names: Vec<String> = net.species.iter().map(|s| s.name.clone()).collect();
        let inputs = SsaInputs {
            compiled: &compiled,
            observables: &[],
            parameters: &net.parameters,
            species_names: &names,
            evaluator: &evaluator,
        };
        let spec = SsaPhaseSpec {
            t_start: 0.0,
            duration: 1.0,
            n_steps: 5,
            max_events: 1, // single event, so the delta is exact
        };
        let mut tracker = InfluenceTracker::new(2, 0.0, 1.0, 4);
        let mut rng = StdRng::seed_from_u64(3);
        run_phase(
            &inputs,
            &[10.0, 0.0],
            &spec,
            &mut rng,
            Some(&mut tracker),
            &CancelToken::new(),
        )
        .unwrap();
        let series = tracker.finish(vec!["R1".into(), "R2".into()]);
        // Only R1 can fire from (10, 0). It lowers its own propensity by 1.0
        // and raises R2's by 2.0.
        assert_eq!(series.global_firings[0], 1);
        assert_eq!(series.global[[0, 0]], -1.0);
        assert_eq!(series.global[[0, 1]], 2.0);
    }

    #[test]
    fn nan_rate_is_a_fatal_propensity_error() {
        let (compiled, names, params) = decay_setup(5.0, f64::NAN);
        let evaluator = evaluator_rc();
        let inputs = SsaInputs {
            compiled: &compiled,
            observables: &[],
            parameters: &params,
            species_names: &names,
            evaluator: &evaluator,
        };
        let spec = SsaPhaseSpec {
            t_start: 0.0,
            duration: 1.0,
            n_steps: 2,
            max_events: DEFAULT_MAX_EVENTS,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let err =
            run_phase(&inputs, &[5.0], &spec, &mut rng, None, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, SimulatorError::InvalidPropensity { index: 0, .. }));
    }

    #[test]
    fn zero_order_scales_up_by_volume() {
        let mut net = Network::default();
        net.compartments.push(crate::network::Compartment {
            name: "C".into(),
            dimension: 3,
            volume: 4.0,
        });
        net.species.push(Species::new("@C:A", 0.0));
        net.reactions.push(Reaction::new(vec![], vec!["@C:A"], "2.0"));
        let evaluator = evaluator_rc();
        let compiled = compile_network(&net, &evaluator, &HashSet::new()).unwrap();
        let inputs = SsaInputs {
            compiled: &Arc::new(compiled),
            observables: &[],
            parameters: &net.parameters,
            species_names: &["@C:A".to_string()],
            evaluator: &evaluator,
        };
        let eval = PropensityEval::new(&inputs);
        let mut failed = false;
        let a = eval.propensity(0, &[0.0], None, &mut failed);
        assert_eq!(a, 8.0);
    }
}
