//! The phase scheduler.
//!
//! Owns a private deep copy of the network and drives the scheduled phases
//! in order: apply boundary edits, dispatch to the right engine, stitch the
//! output rows onto a monotone output clock, carry the final state forward.

use crate::error::SimulatorError;
use crate::exprs::{
    EvalexprEvaluator, EvaluatorConfig, ExpressionEvaluator, RateContext, RateEvaluator,
};
use crate::network::{
    ChangeMode, ChangeValue, Network, SimMethod, SimulationPhase, UserFunction,
};
use crate::simulator::compile::{compile_network, CompiledNetwork};
use crate::simulator::nf::{NetworkFreeEngine, NfPhaseSpec};
use crate::simulator::observables::{amounts_context, value_from_amounts};
use crate::simulator::ode::{self, stiffness, OdeInputs, OdePhaseSpec};
use crate::simulator::ssa::{self, influence::InfluenceTracker, SsaInputs, SsaPhaseSpec};
use crate::simulator::{CancelToken, SimulationResult, SolverHint};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

/// Bounded pass count for the dependent-parameter fixed point.
const MAX_PARAMETER_PASSES: usize = 10;

/// Run-wide options. Phase-level settings on the network override these.
#[derive(Clone)]
pub struct SimOptions {
    /// Engine used when a phase says `Default` (and for the implicit single
    /// phase when the network schedules none).
    pub method: SimMethod,
    pub t_end: f64,
    pub n_steps: usize,
    pub atol: f64,
    pub rtol: f64,
    pub solver: SolverHint,
    pub max_events: u64,
    pub steady_state: bool,
    pub include_influence: bool,
    pub influence_windows: usize,
    pub print_functions: bool,
    pub seed: Option<u64>,
    /// First phase index whose rows are recorded. 0 records every phase.
    pub record_from_phase: usize,
    pub evaluator: EvaluatorConfig,
    /// Expression backend; the bundled evalexpr backend when `None`.
    pub backend: Option<Arc<dyn ExpressionEvaluator>>,
    pub nf_engine: Option<Rc<dyn NetworkFreeEngine>>,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            method: SimMethod::Default,
            t_end: 100.0,
            n_steps: 100,
            atol: 1e-8,
            rtol: 1e-8,
            solver: SolverHint::Auto,
            max_events: ssa::DEFAULT_MAX_EVENTS,
            steady_state: false,
            include_influence: false,
            influence_windows: ssa::influence::DEFAULT_WINDOWS,
            print_functions: false,
            seed: None,
            record_from_phase: 0,
            evaluator: EvaluatorConfig::default(),
            backend: None,
            nf_engine: None,
        }
    }
}

struct PlannedPhase {
    phase: SimulationPhase,
    local_start: f64,
    duration: f64,
    /// Output-clock time of the phase's first grid point.
    output_offset: f64,
}

/// One isolated simulation run.
pub struct Simulator {
    network: Network,
    options: SimOptions,
    evaluator: Rc<RateEvaluator>,
    cancel: CancelToken,
}

impl Simulator {
    /// Deep-copies the network; later host edits to it do not affect the
    /// run.
    pub fn new(network: &Network, options: SimOptions) -> Self {
        let backend = options
            .backend
            .clone()
            .unwrap_or_else(|| Arc::new(EvalexprEvaluator));
        let evaluator = Rc::new(RateEvaluator::new(
            backend,
            options.evaluator,
            network.functions.clone(),
        ));
        Simulator {
            network: network.clone(),
            options,
            evaluator,
            cancel: CancelToken::new(),
        }
    }

    /// Clone of the cancellation token for the host to keep.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn scheduled_phases(&self) -> Vec<SimulationPhase> {
        if !self.network.phases.is_empty() {
            return self.network.phases.clone();
        }
        let mut phase = SimulationPhase::new(
            self.options.method,
            self.options.t_end,
            self.options.n_steps,
        );
        phase.steady_state = self.options.steady_state;
        vec![phase]
    }

    fn plan(&self, phases: &[SimulationPhase]) -> Vec<PlannedPhase> {
        let mut running = 0.0;
        let mut output = 0.0;
        let mut planned = Vec::with_capacity(phases.len());
        for phase in phases {
            let local_start = phase.t_start.unwrap_or(if phase.continue_ {
                running
            } else {
                0.0
            });
            let duration = phase.t_end - local_start;
            planned.push(PlannedPhase {
                phase: phase.clone(),
                local_start,
                duration,
                output_offset: output,
            });
            if duration > 0.0 {
                running = phase.t_end;
                output += duration;
            }
        }
        planned
    }

    fn resolve_method(&self, method: SimMethod) -> SimMethod {
        let resolved = match method {
            SimMethod::Default => self.options.method,
            m => m,
        };
        match resolved {
            SimMethod::Default => SimMethod::Ode,
            m => m,
        }
    }

    /// Compile and evaluate an expression against an explicit context.
    fn eval_expr(&self, expr: &str, ctx: &RateContext) -> Result<f64, SimulatorError> {
        let expanded = self.evaluator.expand(expr);
        let allowed: Vec<String> = ctx.keys().cloned().collect();
        let compiled = self.evaluator.backend().compile(&expanded, &allowed)?;
        compiled.eval(ctx)
    }

    /// Parameters plus current observable values, the context boundary
    /// edits are evaluated against.
    fn boundary_context(&self, amounts: &[f64]) -> RateContext {
        amounts_context(&self.network.parameters, &self.network.observables, amounts)
    }

    fn apply_parameter_changes(
        &mut self,
        phase_idx: usize,
        amounts: &[f64],
    ) -> Result<bool, SimulatorError> {
        let due: Vec<_> = self
            .network
            .parameter_changes
            .iter()
            .filter(|c| c.after_phase_index == phase_idx as i64 - 1)
            .cloned()
            .collect();
        if due.is_empty() {
            return Ok(false);
        }
        let ctx = self.boundary_context(amounts);
        for change in due {
            let value = match &change.value {
                ChangeValue::Literal(v) => *v,
                ChangeValue::Expression(expr) => self.eval_expr(expr, &ctx)?,
            };
            log::debug!("parameter {} set to {value} before phase {phase_idx}", change.parameter);
            self.network.parameters.insert(change.parameter.clone(), value);
            // An explicit set severs the defining expression.
            self.network.parameter_expressions.remove(&change.parameter);
        }
        self.reevaluate_parameter_expressions();
        self.evaluator.invalidate_caches();
        Ok(true)
    }

    /// Re-evaluate expression-defined parameters to a fixed point with a
    /// bounded pass count, accepting the last computed values on
    /// non-convergence.
    fn reevaluate_parameter_expressions(&mut self) {
        let exprs: Vec<(String, String)> = self
            .network
            .parameter_expressions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if exprs.is_empty() {
            return;
        }
        for _ in 0..MAX_PARAMETER_PASSES {
            let mut changed = false;
            for (name, expr) in &exprs {
                let ctx = self.network.parameters.clone();
                if let Ok(v) = self.eval_expr(expr, &ctx) {
                    if v.is_finite() && self.network.parameters.get(name) != Some(&v) {
                        self.network.parameters.insert(name.clone(), v);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn apply_concentration_changes(
        &mut self,
        phase_idx: usize,
        compiled: &CompiledNetwork,
        amounts: &mut [f64],
    ) -> Result<(), SimulatorError> {
        let due: Vec<_> = self
            .network
            .concentration_changes
            .iter()
            .filter(|c| c.after_phase_index == phase_idx as i64 - 1)
            .cloned()
            .collect();
        if due.is_empty() {
            return Ok(());
        }
        let ctx = self.boundary_context(amounts);
        for change in due {
            let idx = match compiled.species_index.get(&change.species) {
                Some(&i) => i,
                None => {
                    // Fall back to a compartment-stripped match.
                    let bare = crate::network::strip_compartment(&change.species);
                    self.network
                        .species
                        .iter()
                        .position(|s| s.bare_name() == bare)
                        .ok_or_else(|| {
                            SimulatorError::UnknownChangeTarget(change.species.clone())
                        })?
                }
            };
            let value = match &change.value {
                ChangeValue::Literal(v) => *v,
                ChangeValue::Expression(expr) => self.eval_expr(expr, &ctx)?,
            };
            match change.mode {
                ChangeMode::Set => amounts[idx] = value,
                ChangeMode::Add => amounts[idx] += value,
            }
            if amounts[idx] < 0.0 {
                amounts[idx] = 0.0;
            }
        }
        Ok(())
    }

    /// Zero-argument functions, printable per output row.
    fn printable_functions(&self) -> Vec<UserFunction> {
        self.network
            .functions
            .iter()
            .filter(|f| f.args.is_empty())
            .cloned()
            .collect()
    }

    /// Run all scheduled phases to completion.
    pub fn run(mut self) -> Result<SimulationResult, SimulatorError> {
        let phases = self.scheduled_phases();
        let planned = self.plan(&phases);
        let changing: HashSet<String> = self
            .network
            .parameter_changes
            .iter()
            .map(|c| c.parameter.clone())
            .collect();

        let mut compiled = Arc::new(compile_network(&self.network, &self.evaluator, &changing)?);
        let mut warnings = compiled.warnings.clone();
        let species_names: Vec<String> = self
            .network
            .species
            .iter()
            .map(|s| s.name.clone())
            .collect();
        let reaction_names: Vec<String> = compiled
            .reactions
            .iter()
            .map(|r| r.name.clone())
            .collect();
        let mut amounts: Vec<f64> = self
            .network
            .species
            .iter()
            .map(|s| s.initial_amount)
            .collect();

        let horizon: f64 = planned
            .iter()
            .map(|p| p.duration.max(0.0))
            .sum();
        let mut tracker = if self.options.include_influence {
            Some(InfluenceTracker::new(
                compiled.reactions.len(),
                0.0,
                horizon.max(f64::MIN_POSITIVE),
                self.options.influence_windows,
            ))
        } else {
            None
        };
        let mut rng = StdRng::seed_from_u64(self.options.seed.unwrap_or_else(rand::random));

        let print_fns = self.options.print_functions || phases.iter().any(|p| p.print_functions);
        let printable = if print_fns {
            self.printable_functions()
        } else {
            Vec::new()
        };
        let mut headers = vec!["time".to_string()];
        headers.extend(self.network.observables.iter().map(|o| o.name.clone()));
        headers.extend(printable.iter().map(|f| f.name.clone()));

        let mut result = SimulationResult {
            headers,
            species_names: species_names.clone(),
            reaction_names: reaction_names.clone(),
            ..Default::default()
        };

        for (idx, plan) in planned.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(SimulatorError::Cancelled);
            }

            if self.apply_parameter_changes(idx, &amounts)? {
                compiled =
                    Arc::new(compile_network(&self.network, &self.evaluator, &changing)?);
                warnings.extend(compiled.warnings.clone());
            }
            self.apply_concentration_changes(idx, &compiled, &mut amounts)?;

            if plan.duration < 0.0 {
                warnings.push(format!(
                    "phase {idx} has negative duration ({}); skipped",
                    plan.duration
                ));
                log::warn!("skipping phase {idx} with negative duration");
                continue;
            }

            let phase = &plan.phase;
            let method = self.resolve_method(phase.method);
            let (times, species_rows, obs_rows): (Vec<f64>, Vec<Vec<f64>>, Option<Vec<Vec<f64>>>) =
                match method {
                    SimMethod::Ode | SimMethod::Default => {
                        let profile = stiffness::analyze(&compiled, planned.len());
                        let solver = stiffness::resolve_solver(
                            self.options.solver,
                            &profile,
                            phase.sparse,
                            compiled.is_pure_mass_action(),
                        );
                        log::debug!(
                            "phase {idx}: ODE, solver {solver:?}, stiffness {:?}",
                            profile.category
                        );
                        let spec = OdePhaseSpec {
                            t_start: plan.local_start,
                            duration: plan.duration,
                            n_steps: phase.n_steps,
                            atol: phase.atol.unwrap_or(self.options.atol),
                            rtol: phase.rtol.unwrap_or(self.options.rtol),
                            steady_state: phase.steady_state,
                            solver,
                        };
                        let inputs = OdeInputs {
                            compiled: &compiled,
                            observables: &self.network.observables,
                            parameters: &self.network.parameters,
                            species_names: &species_names,
                            evaluator: &self.evaluator,
                        };
                        let out = ode::integrate_phase(&inputs, &amounts, &spec, &self.cancel)?;
                        warnings.extend(out.warnings);
                        if out.reached_steady_state {
                            result.steady_state_phases.push(idx);
                        }
                        amounts = out.final_amounts;
                        (out.times, out.rows, None)
                    }
                    SimMethod::Ssa => {
                        for a in amounts.iter_mut() {
                            *a = a.round().max(0.0);
                        }
                        if let Some(tracker) = tracker.as_mut() {
                            tracker.set_time_offset(plan.output_offset - plan.local_start);
                        }
                        let spec = SsaPhaseSpec {
                            t_start: plan.local_start,
                            duration: plan.duration,
                            n_steps: phase.n_steps,
                            max_events: self.options.max_events,
                        };
                        let inputs = SsaInputs {
                            compiled: &compiled,
                            observables: &self.network.observables,
                            parameters: &self.network.parameters,
                            species_names: &species_names,
                            evaluator: &self.evaluator,
                        };
                        let out = ssa::run_phase(
                            &inputs,
                            &amounts,
                            &spec,
                            &mut rng,
                            tracker.as_mut(),
                            &self.cancel,
                        )?;
                        warnings.extend(out.warnings);
                        if out.depleted {
                            log::debug!("phase {idx}: propensities depleted before the horizon");
                        }
                        amounts = out.final_counts;
                        (out.times, out.rows, None)
                    }
                    SimMethod::Nf => {
                        let engine = self
                            .options
                            .nf_engine
                            .clone()
                            .ok_or(SimulatorError::MissingNetworkFreeEngine(idx))?;
                        let spec = NfPhaseSpec {
                            t_start: plan.local_start,
                            duration: plan.duration,
                            n_steps: phase.n_steps,
                            utl: phase.utl,
                            gml: phase.gml,
                            equilibrate: phase.equilibrate,
                            seed: self.options.seed,
                        };
                        let out = engine
                            .simulate(&self.network, &amounts, &spec)
                            .map_err(|e| SimulatorError::NetworkFreeFailed {
                                phase: idx,
                                message: e.to_string(),
                            })?;
                        warnings.extend(out.warnings);
                        let species_rows = out.species_rows.unwrap_or_else(|| {
                            vec![out.final_amounts.clone(); out.times.len()]
                        });
                        amounts = out.final_amounts;
                        (out.times, species_rows, Some(out.observable_rows))
                    }
                };

            if idx < self.options.record_from_phase {
                continue;
            }
            // A continuing phase starts on the row the previous phase already
            // emitted; a fresh phase re-emits its start so scheduled state
            // edits show up in the output.
            let skip_first = !result.times.is_empty() && plan.phase.continue_;
            for (row_idx, t) in times.iter().enumerate() {
                if row_idx == 0 && skip_first {
                    continue;
                }
                let out_t = plan.output_offset + (t - plan.local_start);
                let state = &species_rows[row_idx.min(species_rows.len() - 1)];
                let mut row: Vec<f64> = match &obs_rows {
                    Some(rows) => rows[row_idx.min(rows.len() - 1)].clone(),
                    None => self
                        .network
                        .observables
                        .iter()
                        .map(|o| value_from_amounts(o, state))
                        .collect(),
                };
                if !printable.is_empty() {
                    let mut ctx = self.network.parameters.clone();
                    for (obs, v) in self.network.observables.iter().zip(&row) {
                        ctx.insert(obs.name.clone(), *v);
                    }
                    for func in &printable {
                        row.push(self.eval_expr(&func.expression, &ctx).unwrap_or(0.0));
                    }
                }
                result.times.push(out_t);
                result.rows.push(row);
                result.species_rows.push(state.clone());
            }
        }

        result.warnings = warnings;
        result.final_amounts = amounts;
        result.influence = tracker.map(|t| t.finish(reaction_names));
        Ok(result)
    }
}
