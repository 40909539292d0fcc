//! Deterministic ODE integration of the compiled network.
//!
//! Concentrations are the working representation: amounts are divided by
//! compartment volumes on entry and multiplied back on every recorded row.

mod closure;
pub mod rk4;
pub mod stiffness;

use crate::error::SimulatorError;
use crate::exprs::{RateContext, RateEvaluator};
use crate::network::Observable;
use crate::simulator::compile::{CompiledNetwork, RateSpec};
use crate::simulator::grid;
use crate::simulator::observables::value_from_concentrations;
use crate::simulator::{CancelToken, SolverId};
use closure::{JacobianMode, NetProblem};
use diffsol::{
    error::OdeSolverError, ode_solver::method::OdeSolverMethod, Bdf, NewtonNonlinearSolver,
    OdeBuilder, OdeSolverStopReason,
};
use nalgebra::DVector;
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

type M = nalgebra::DMatrix<f64>;

/// Smallest concentration treated as non-zero in Jacobian partials.
const JAC_EPSILON: f64 = 1e-100;

/// Right-hand-side strategy of the ODE system.
///
/// Two interchangeable implementations exist: an interpreted walk over the
/// compiled reactions that supports functional rates, and a folded
/// mass-action form with an analytic Jacobian. Both must produce identical
/// derivatives on pure mass-action networks.
pub trait Derivatives {
    /// Derivative of the concentration vector at time `t`, written to `out`.
    fn dydt(&self, y: &DVector<f64>, t: f64, out: &mut DVector<f64>);

    /// Jacobian-vector product `out = J(y) v`. The default is a directional
    /// finite difference of [Derivatives::dydt].
    fn jac_mul(&self, y: &DVector<f64>, t: f64, v: &DVector<f64>, out: &mut DVector<f64>) {
        let eps = 1e-8 * (1.0 + y.norm());
        let shifted = y + v * eps;
        let mut f0 = DVector::zeros(y.len());
        self.dydt(y, t, &mut f0);
        self.dydt(&shifted, t, out);
        out.axpy(-1.0 / eps, &f0, 1.0 / eps);
    }

    /// Jacobian-vector product through a materialized dense Jacobian.
    fn jac_mul_dense(&self, y: &DVector<f64>, t: f64, v: &DVector<f64>, out: &mut DVector<f64>) {
        self.jac_mul(y, t, v, out);
    }

    /// Whether any functional rate evaluation failed since construction.
    fn evaluation_failed(&self) -> bool {
        false
    }
}

/// Interpreted strategy: walks the compiled reactions on every call and
/// evaluates functional rates against the live context.
pub struct InterpretedDerivatives {
    compiled: Arc<CompiledNetwork>,
    observables: Vec<Observable>,
    parameters: HashMap<String, f64>,
    species_names: Vec<String>,
    evaluator: Rc<RateEvaluator>,
    has_functional: bool,
    eval_failed: Cell<bool>,
}

impl InterpretedDerivatives {
    pub fn new(
        compiled: Arc<CompiledNetwork>,
        observables: Vec<Observable>,
        parameters: HashMap<String, f64>,
        species_names: Vec<String>,
        evaluator: Rc<RateEvaluator>,
    ) -> Self {
        let has_functional = compiled.reactions.iter().any(|r| r.rate.is_functional());
        Self {
            compiled,
            observables,
            parameters,
            species_names,
            evaluator,
            has_functional,
            eval_failed: Cell::new(false),
        }
    }

    /// Parameters, observables (in amount units) and raw concentrations,
    /// keyed by name. `ridx{j}` aliases are inserted per reaction.
    fn context(&self, y: &DVector<f64>) -> RateContext {
        let mut ctx = self.parameters.clone();
        for obs in &self.observables {
            ctx.insert(obs.name.clone(), value_from_concentrations(obs, y.as_slice()));
        }
        for (i, name) in self.species_names.iter().enumerate() {
            ctx.insert(name.clone(), y[i]);
        }
        ctx
    }
}

impl Derivatives for InterpretedDerivatives {
    fn dydt(&self, y: &DVector<f64>, _t: f64, out: &mut DVector<f64>) {
        out.fill(0.0);
        let vols = &self.compiled.species_volumes;
        let constant = &self.compiled.constant;
        let mut ctx = if self.has_functional {
            Some(self.context(y))
        } else {
            None
        };
        for rxn in &self.compiled.reactions {
            let rate = match (&rxn.rate, ctx.as_mut()) {
                (RateSpec::Constant(k), _) => *k,
                (RateSpec::Functional(expr), Some(ctx)) => {
                    for (j, &r) in rxn.reactants.iter().enumerate() {
                        ctx.insert(format!("ridx{j}"), y[r]);
                    }
                    match self.evaluator.evaluate(expr, ctx) {
                        Ok(v) if v.is_finite() => v,
                        _ => {
                            self.eval_failed.set(true);
                            0.0
                        }
                    }
                }
                (RateSpec::Functional(_), None) => 0.0,
            };
            let va = rxn.volume;
            let mut vel = rate * rxn.propensity_factor * rxn.degeneracy * va;
            for &r in &rxn.reactants {
                vel *= y[r] * vols[r] / va;
            }
            if vel == 0.0 {
                continue;
            }
            for &r in &rxn.reactants {
                if !constant[r] {
                    out[r] -= vel / vols[r];
                }
            }
            for (&p, &st) in rxn.products.iter().zip(&rxn.stoichiometries) {
                if !constant[p] {
                    out[p] += st * vel / vols[p];
                }
            }
        }
    }

    fn evaluation_failed(&self) -> bool {
        self.eval_failed.get()
    }
}

struct MassActionTerm {
    reactants: Vec<usize>,
    products: Vec<(usize, f64)>,
    /// Rate constant with the statistical factors folded in.
    rate: f64,
    /// Compartment anchor volume.
    anchor: f64,
}

/// Folded mass-action strategy with an analytic, degeneracy-aware Jacobian.
pub struct MassActionDerivatives {
    terms: Vec<MassActionTerm>,
    volumes: Vec<f64>,
    constant: Vec<bool>,
}

impl MassActionDerivatives {
    /// `None` when any rate is functional.
    pub fn try_new(compiled: &CompiledNetwork) -> Option<Self> {
        let mut terms = Vec::with_capacity(compiled.reactions.len());
        for rxn in &compiled.reactions {
            let k = match &rxn.rate {
                RateSpec::Constant(k) => *k,
                RateSpec::Functional(_) => return None,
            };
            terms.push(MassActionTerm {
                reactants: rxn.reactants.clone(),
                products: rxn
                    .products
                    .iter()
                    .zip(&rxn.stoichiometries)
                    .map(|(&p, &s)| (p, s))
                    .collect(),
                rate: k * rxn.propensity_factor * rxn.degeneracy,
                anchor: rxn.volume,
            });
        }
        Some(Self {
            terms,
            volumes: compiled.species_volumes.clone(),
            constant: compiled.constant.clone(),
        })
    }

    fn velocity(&self, term: &MassActionTerm, y: &DVector<f64>) -> f64 {
        let mut vel = term.rate * term.anchor;
        for &r in &term.reactants {
            vel *= y[r] * self.volumes[r] / term.anchor;
        }
        vel
    }

    /// d(velocity)/dy_k for a reactant of the given kinetic order. At the
    /// origin the power rule degenerates; order-1 reactants get the exact
    /// partial-product limit, higher orders have a zero derivative there.
    fn partial(&self, term: &MassActionTerm, y: &DVector<f64>, k: usize, order: usize) -> f64 {
        let yk = y[k];
        if yk > JAC_EPSILON {
            let vel = self.velocity(term, y);
            return order as f64 * vel / yk;
        }
        if order != 1 {
            return 0.0;
        }
        let mut dv = term.rate * term.anchor * (self.volumes[k] / term.anchor);
        let mut skipped = false;
        for &r in &term.reactants {
            if r == k && !skipped {
                skipped = true;
                continue;
            }
            dv *= y[r] * self.volumes[r] / term.anchor;
        }
        dv
    }

    fn distinct_orders(term: &MassActionTerm) -> Vec<(usize, usize)> {
        let mut orders: Vec<(usize, usize)> = Vec::with_capacity(term.reactants.len());
        for &r in &term.reactants {
            match orders.iter_mut().find(|(k, _)| *k == r) {
                Some((_, o)) => *o += 1,
                None => orders.push((r, 1)),
            }
        }
        orders
    }

    /// Dense Jacobian in row-major order, `buf.len() == n*n`.
    pub fn fill_row_major(&self, y: &DVector<f64>, buf: &mut [f64]) {
        self.fill_dense(y, buf, |row, col, n| row * n + col);
    }

    /// Dense Jacobian in column-major order, `buf.len() == n*n`.
    pub fn fill_column_major(&self, y: &DVector<f64>, buf: &mut [f64]) {
        self.fill_dense(y, buf, |row, col, n| col * n + row);
    }

    fn fill_dense(&self, y: &DVector<f64>, buf: &mut [f64], index: fn(usize, usize, usize) -> usize) {
        let n = y.len();
        buf.fill(0.0);
        for term in &self.terms {
            for (k, order) in Self::distinct_orders(term) {
                let dv = self.partial(term, y, k, order);
                if dv == 0.0 {
                    continue;
                }
                for &r in &term.reactants {
                    if !self.constant[r] {
                        buf[index(r, k, n)] -= dv / self.volumes[r];
                    }
                }
                for &(p, st) in &term.products {
                    if !self.constant[p] {
                        buf[index(p, k, n)] += st * dv / self.volumes[p];
                    }
                }
            }
        }
    }
}

impl Derivatives for MassActionDerivatives {
    fn dydt(&self, y: &DVector<f64>, _t: f64, out: &mut DVector<f64>) {
        out.fill(0.0);
        for term in &self.terms {
            let vel = self.velocity(term, y);
            if vel == 0.0 {
                continue;
            }
            for &r in &term.reactants {
                if !self.constant[r] {
                    out[r] -= vel / self.volumes[r];
                }
            }
            for &(p, st) in &term.products {
                if !self.constant[p] {
                    out[p] += st * vel / self.volumes[p];
                }
            }
        }
    }

    fn jac_mul(&self, y: &DVector<f64>, _t: f64, v: &DVector<f64>, out: &mut DVector<f64>) {
        out.fill(0.0);
        for term in &self.terms {
            let mut s = 0.0;
            for (k, order) in Self::distinct_orders(term) {
                let dv = self.partial(term, y, k, order);
                s += dv * v[k];
            }
            if s == 0.0 {
                continue;
            }
            for &r in &term.reactants {
                if !self.constant[r] {
                    out[r] -= s / self.volumes[r];
                }
            }
            for &(p, st) in &term.products {
                if !self.constant[p] {
                    out[p] += st * s / self.volumes[p];
                }
            }
        }
    }

    fn jac_mul_dense(&self, y: &DVector<f64>, _t: f64, v: &DVector<f64>, out: &mut DVector<f64>) {
        let n = y.len();
        let mut jac = vec![0.0; n * n];
        self.fill_row_major(y, &mut jac);
        for row in 0..n {
            let mut acc = 0.0;
            for col in 0..n {
                acc += jac[row * n + col] * v[col];
            }
            out[row] = acc;
        }
    }
}

/// Borrowed inputs shared by all ODE phases of a run.
pub struct OdeInputs<'a> {
    pub compiled: &'a Arc<CompiledNetwork>,
    pub observables: &'a [Observable],
    pub parameters: &'a HashMap<String, f64>,
    pub species_names: &'a [String],
    pub evaluator: &'a Rc<RateEvaluator>,
}

/// Per-phase integration settings, already resolved to one concrete solver.
pub struct OdePhaseSpec {
    pub t_start: f64,
    pub duration: f64,
    pub n_steps: usize,
    pub atol: f64,
    pub rtol: f64,
    pub steady_state: bool,
    pub solver: SolverId,
}

/// Result of one integrated phase. `rows` holds the full species state in
/// amounts at every grid time, early stops padded with the last state.
#[derive(Debug)]
pub struct OdePhaseOutput {
    pub times: Vec<f64>,
    pub rows: Vec<Vec<f64>>,
    pub final_amounts: Vec<f64>,
    pub reached_steady_state: bool,
    pub warnings: Vec<String>,
}

/// Pick the derivative strategy for a compiled network.
pub fn build_derivatives(inputs: &OdeInputs) -> Rc<dyn Derivatives> {
    match MassActionDerivatives::try_new(inputs.compiled) {
        Some(ma) => Rc::new(ma),
        None => Rc::new(InterpretedDerivatives::new(
            Arc::clone(inputs.compiled),
            inputs.observables.to_vec(),
            inputs.parameters.clone(),
            inputs.species_names.to_vec(),
            Rc::clone(inputs.evaluator),
        )),
    }
}

fn amounts_row(y: &DVector<f64>, volumes: &[f64]) -> Vec<f64> {
    y.iter().zip(volumes).map(|(c, v)| c * v).collect()
}

/// Integrate one phase starting from `amounts`, sampling on the phase grid.
pub fn integrate_phase(
    inputs: &OdeInputs,
    amounts: &[f64],
    spec: &OdePhaseSpec,
    cancel: &CancelToken,
) -> Result<OdePhaseOutput, SimulatorError> {
    let n = amounts.len();
    let volumes = &inputs.compiled.species_volumes;
    let y0 = DVector::from_iterator(n, amounts.iter().zip(volumes).map(|(a, v)| a / v));
    let deriv = build_derivatives(inputs);
    let times = grid::phase_grid(spec.t_start, spec.duration, spec.n_steps);
    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(times.len());
    rows.push(amounts.to_vec());
    let mut warnings = Vec::new();
    let mut reached_steady_state = false;

    match spec.solver {
        SolverId::FixedRk4 => {
            let mut y = y0.clone();
            let mut sc = rk4::Rk4Scratch::new(n);
            let mut scratch = DVector::zeros(n);
            'grid: for idx in 1..times.len() {
                let t0 = times[idx - 1];
                let t1 = times[idx];
                let h = (t1 - t0) / rk4::SUBSTEPS_PER_INTERVAL as f64;
                let mut t = t0;
                for _ in 0..rk4::SUBSTEPS_PER_INTERVAL {
                    if cancel.is_cancelled() {
                        return Err(SimulatorError::Cancelled);
                    }
                    rk4::step(deriv.as_ref(), t, h, &mut y, &mut sc);
                    t += h;
                }
                rows.push(amounts_row(&y, volumes));
                if spec.steady_state {
                    deriv.dydt(&y, t1, &mut scratch);
                    if scratch.norm() / (n as f64) < spec.atol {
                        reached_steady_state = true;
                        break 'grid;
                    }
                }
            }
        }
        _ => {
            let mode = match spec.solver {
                SolverId::BdfSparseJacobian => JacobianMode::ReactionWise,
                SolverId::BdfAnalyticJacobian => JacobianMode::Dense,
                _ => JacobianMode::FiniteDifference,
            };
            let problem = OdeBuilder::<M>::new()
                .atol(vec![spec.atol; n])
                .rtol(spec.rtol)
                .t0(spec.t_start)
                .h0(1e-3)
                .build_from_eqn(NetProblem::new(Rc::clone(&deriv), y0.clone(), mode))?;
            let mut solver: Bdf<'_, NetProblem, NewtonNonlinearSolver<M, diffsol::NalgebraLU<f64>>> =
                problem.bdf::<diffsol::NalgebraLU<f64>>()?;
            let mut scratch = DVector::zeros(n);
            'outer: for idx in 1..times.len() {
                let target = times[idx];
                match solver.set_stop_time(target) {
                    Ok(()) => loop {
                        if cancel.is_cancelled() {
                            return Err(SimulatorError::Cancelled);
                        }
                        match solver.step() {
                            Ok(OdeSolverStopReason::InternalTimestep) => continue,
                            Ok(OdeSolverStopReason::TstopReached) => break,
                            Err(diffsol::error::DiffsolError::OdeSolverError(
                                OdeSolverError::StepSizeTooSmall { .. },
                            )) => {
                                warnings.push(format!(
                                    "ODE step size collapsed near t={target}; stopping phase at the last converged state"
                                ));
                                break 'outer;
                            }
                            Err(err) => {
                                warnings.push(format!(
                                    "ODE solver failed near t={target}: {err}; stopping phase"
                                ));
                                break 'outer;
                            }
                            Ok(reason) => {
                                warnings.push(format!(
                                    "unexpected solver stop {reason:?} near t={target}; stopping phase"
                                ));
                                break 'outer;
                            }
                        }
                    },
                    Err(diffsol::error::DiffsolError::OdeSolverError(
                        OdeSolverError::StopTimeAtCurrentTime,
                    )) => {}
                    Err(e) => return Err(e.into()),
                }
                let y = solver.state().y;
                rows.push(amounts_row(y, volumes));
                if spec.steady_state {
                    deriv.dydt(y, target, &mut scratch);
                    if scratch.norm() / (n as f64) < spec.atol {
                        reached_steady_state = true;
                        break 'outer;
                    }
                }
            }
        }
    }

    // Early stops keep the grid shape: pad with the last state.
    while rows.len() < times.len() {
        let last = rows.last().cloned().unwrap_or_else(|| amounts.to_vec());
        rows.push(last);
    }

    if deriv.evaluation_failed() {
        log::warn!("one or more functional rate evaluations failed; affected rates were forced to 0");
        warnings.push(
            "one or more functional rate evaluations failed; affected rates were forced to 0"
                .to_string(),
        );
    }

    let final_amounts = rows.last().cloned().unwrap_or_else(|| amounts.to_vec());
    Ok(OdePhaseOutput {
        times,
        rows,
        final_amounts,
        reached_steady_state,
        warnings,
    })
}
