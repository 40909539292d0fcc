//! End-to-end simulation tests over the public API.

use bngsim::network::{
    ChangeValue, Network, Observable, ParameterChange, Reaction, SimMethod, SimulationPhase,
    Species,
};
use bngsim::prelude::*;

const REL_TOL: f64 = 1e-4;

fn decay_network(k: &str) -> Network {
    let mut net = Network::default();
    net.species.push(Species::new("A", 1000.0));
    net.species.push(Species::new("B", 0.0));
    net.reactions.push(Reaction::new(vec!["A"], vec!["B"], k));
    net.observables.push(Observable {
        name: "Atot".into(),
        kind: Default::default(),
        indices: vec![0],
        coefficients: vec![1.0],
        volumes: vec![],
    });
    net.observables.push(Observable {
        name: "Btot".into(),
        kind: Default::default(),
        indices: vec![1],
        coefficients: vec![1.0],
        volumes: vec![],
    });
    net
}

fn ode_options(t_end: f64, n_steps: usize) -> SimOptions {
    SimOptions {
        method: SimMethod::Ode,
        t_end,
        n_steps,
        ..Default::default()
    }
}

#[test]
fn ode_decay_matches_closed_form() {
    let net = decay_network("0.5");
    let result = Simulator::new(&net, ode_options(4.0, 40)).run().unwrap();
    assert_eq!(result.times.len(), 41);
    for (t, row) in result.times.iter().zip(&result.rows) {
        let exact_a = 1000.0 * (-0.5 * t).exp();
        let rel = (row[0] - exact_a).abs() / exact_a.max(1e-9);
        assert!(rel < REL_TOL, "t={t}: Atot {} vs {exact_a}", row[0]);
        // Mass conservation: A + B constant.
        let total = row[0] + row[1];
        assert!((total - 1000.0).abs() < 1e-3, "t={t}: total {total}");
    }
}

#[test]
fn repeated_runs_are_identical_for_ode() {
    let net = decay_network("0.3");
    let a = Simulator::new(&net, ode_options(2.0, 20)).run().unwrap();
    let b = Simulator::new(&net, ode_options(2.0, 20)).run().unwrap();
    assert_eq!(a.times, b.times);
    assert_eq!(a.rows, b.rows);
}

#[test]
fn ssa_depletion_still_emits_trailing_rows() {
    let mut net = decay_network("10.0");
    net.species[0].initial_amount = 3.0;
    let options = SimOptions {
        method: SimMethod::Ssa,
        t_end: 50.0,
        n_steps: 25,
        seed: Some(11),
        ..Default::default()
    };
    let result = Simulator::new(&net, options).run().unwrap();
    assert_eq!(result.times.len(), 26);
    let last = result.rows.last().unwrap();
    assert_eq!(last[0], 0.0);
    assert_eq!(last[1], 3.0);
}

#[test]
fn multi_phase_output_times_are_monotone() {
    let mut net = decay_network("0.5");
    net.phases.push(SimulationPhase::new(SimMethod::Ode, 1.0, 10));
    let mut second = SimulationPhase::new(SimMethod::Ode, 3.0, 10).continued();
    second.t_start = Some(1.0);
    net.phases.push(second);
    // Third phase resets its local clock and, not being a continuation,
    // re-emits its start row; output times must keep climbing.
    net.phases.push(SimulationPhase::new(SimMethod::Ode, 1.0, 5));
    let result = Simulator::new(&net, SimOptions::default()).run().unwrap();
    for pair in result.times.windows(2) {
        assert!(pair[1] >= pair[0], "times went backward: {pair:?}");
    }
    assert_eq!(result.times.len(), 11 + 10 + 6);
    assert!((result.times.last().unwrap() - 4.0).abs() < 1e-9);
}

#[test]
fn continued_phase_carries_state_across_the_boundary() {
    let mut net = decay_network("0.5");
    net.phases.push(SimulationPhase::new(SimMethod::Ode, 1.0, 10));
    let mut second = SimulationPhase::new(SimMethod::Ode, 2.0, 10).continued();
    second.t_start = Some(1.0);
    net.phases.push(second);
    let split = Simulator::new(&net, SimOptions::default()).run().unwrap();
    let whole = Simulator::new(&decay_network("0.5"), ode_options(2.0, 20))
        .run()
        .unwrap();
    assert_eq!(split.times.len(), whole.times.len());
    for (a, b) in split.rows.iter().zip(&whole.rows) {
        let rel = (a[0] - b[0]).abs() / b[0].max(1e-9);
        assert!(rel < 1e-3, "split {} vs whole {}", a[0], b[0]);
    }
}

#[test]
fn parameter_change_after_phase_zero_spares_phase_zero() {
    let mut net = decay_network("k1");
    net.parameters.insert("k1".into(), 0.5);
    net.phases.push(SimulationPhase::new(SimMethod::Ode, 1.0, 10));
    let mut second = SimulationPhase::new(SimMethod::Ode, 2.0, 10).continued();
    second.t_start = Some(1.0);
    net.phases.push(second);
    net.parameter_changes.push(ParameterChange {
        parameter: "k1".into(),
        value: ChangeValue::Literal(0.0),
        after_phase_index: 0,
    });

    let changed = Simulator::new(&net, SimOptions::default()).run().unwrap();
    let mut unchanged_net = net.clone();
    unchanged_net.parameter_changes.clear();
    let unchanged = Simulator::new(&unchanged_net, SimOptions::default())
        .run()
        .unwrap();

    // Phase 0 (rows 0..=10) agrees to solver tolerance; the scheduled
    // change makes the rate functional, so the two runs take different
    // evaluation paths even before the change applies.
    for i in 0..=10 {
        let rel = (changed.rows[i][0] - unchanged.rows[i][0]).abs()
            / unchanged.rows[i][0].max(1e-9);
        assert!(rel < 1e-5, "row {i} differs in phase 0");
    }
    let frozen = changed.rows[10][0];
    let rel = (changed.rows.last().unwrap()[0] - frozen).abs() / frozen;
    assert!(rel < 1e-6, "phase 1 should be frozen after the change");
    assert!(unchanged.rows.last().unwrap()[0] < frozen * 0.7);
}

#[test]
fn expression_valued_parameter_change_sees_observables() {
    let mut net = decay_network("k1");
    net.parameters.insert("k1".into(), 0.5);
    net.phases.push(SimulationPhase::new(SimMethod::Ode, 1.0, 5));
    let mut second = SimulationPhase::new(SimMethod::Ode, 2.0, 5).continued();
    second.t_start = Some(1.0);
    net.phases.push(second);
    // New rate proportional to how much A is left at the boundary.
    net.parameter_changes.push(ParameterChange {
        parameter: "k1".into(),
        value: ChangeValue::Expression("Atot / Atot * 0.25".into()),
        after_phase_index: 0,
    });
    let result = Simulator::new(&net, SimOptions::default()).run().unwrap();
    // Phase 1 decays at 0.25 from the boundary value.
    let boundary = result.rows[5][0];
    let end = result.rows.last().unwrap()[0];
    let exact = boundary * (-0.25_f64 * 1.0).exp();
    let rel = (end - exact).abs() / exact;
    assert!(rel < 1e-3, "end {end} vs {exact}");
}

#[test]
fn influence_global_matrix_sums_its_windows() {
    let mut net = decay_network("1.0");
    net.reactions.push(Reaction::new(vec!["B"], vec!["A"], "0.5"));
    let options = SimOptions {
        method: SimMethod::Ssa,
        t_end: 5.0,
        n_steps: 10,
        seed: Some(21),
        include_influence: true,
        ..Default::default()
    };
    let result = Simulator::new(&net, options).run().unwrap();
    let influence = result.influence.expect("influence requested");
    assert_eq!(influence.windows.len(), 20);
    for fired in 0..2 {
        for dep in 0..2 {
            let sum: f64 = influence
                .windows
                .iter()
                .map(|w| w.matrix[[fired, dep]])
                .sum();
            let diff = (influence.global[[fired, dep]] - sum).abs();
            assert!(diff < 1e-9, "global[{fired},{dep}] != window sum");
        }
    }
    let total_firings: u64 = influence.global_firings.iter().sum();
    assert!(total_firings > 0);

    // Hosts export the influence network as JSON.
    let json = serde_json::to_value(&influence).unwrap();
    assert_eq!(json["reaction_names"][0], "R1");
    assert!(json["windows"].as_array().unwrap().len() == 20);
}

#[test]
fn functional_rates_disabled_is_a_hard_error() {
    let mut net = decay_network("k1 * Atot");
    net.parameters.insert("k1".into(), 0.001);
    let options = SimOptions {
        evaluator: EvaluatorConfig {
            functional_rates_enabled: false,
        },
        ..ode_options(1.0, 5)
    };
    let err = Simulator::new(&net, options).run().unwrap_err();
    assert!(matches!(err, SimulatorError::FunctionalRatesDisabled));
    assert_eq!(
        err.to_string(),
        "functional rates are disabled by configuration"
    );
}

#[test]
fn functional_rate_ode_matches_equivalent_constant_rate() {
    // k1 * Atot / Atot is identically k1; the interpreted path must agree
    // with the folded mass-action path.
    let mut functional = decay_network("k1 * Atot / Atot");
    functional.parameters.insert("k1".into(), 0.5);
    let constant = decay_network("0.5");
    let a = Simulator::new(&functional, ode_options(2.0, 20)).run().unwrap();
    let b = Simulator::new(&constant, ode_options(2.0, 20)).run().unwrap();
    for (ra, rb) in a.rows.iter().zip(&b.rows) {
        let rel = (ra[0] - rb[0]).abs() / rb[0].max(1e-9);
        assert!(rel < 1e-4, "functional {} vs constant {}", ra[0], rb[0]);
    }
}

#[test]
fn fixed_step_solver_tracks_the_adaptive_one() {
    let net = decay_network("0.5");
    let fixed = SimOptions {
        solver: SolverHint::Fixed(SolverId::FixedRk4),
        ..ode_options(2.0, 20)
    };
    let a = Simulator::new(&net, fixed).run().unwrap();
    let b = Simulator::new(&net, ode_options(2.0, 20)).run().unwrap();
    for (ra, rb) in a.rows.iter().zip(&b.rows) {
        let rel = (ra[0] - rb[0]).abs() / rb[0].max(1e-9);
        assert!(rel < 1e-5, "rk4 {} vs bdf {}", ra[0], rb[0]);
    }
}

#[test]
fn cancel_token_aborts_a_run() {
    let net = decay_network("0.5");
    let sim = Simulator::new(&net, ode_options(10.0, 100));
    let token = sim.cancel_token();
    token.cancel();
    let err = sim.run().unwrap_err();
    assert!(matches!(err, SimulatorError::Cancelled));
}

struct EchoNfEngine;

impl NetworkFreeEngine for EchoNfEngine {
    fn simulate(
        &self,
        network: &Network,
        amounts: &[f64],
        spec: &NfPhaseSpec,
    ) -> Result<NfPhaseOutput, SimulatorError> {
        // Hold the state flat across the phase.
        let n_rows = spec.n_steps + 1;
        let dt = spec.duration / spec.n_steps as f64;
        let obs_row: Vec<f64> = network
            .observables
            .iter()
            .map(|o| {
                o.indices
                    .iter()
                    .zip(&o.coefficients)
                    .map(|(&i, c)| c * amounts[i])
                    .sum()
            })
            .collect();
        Ok(NfPhaseOutput {
            times: (0..n_rows).map(|i| spec.t_start + i as f64 * dt).collect(),
            observable_rows: vec![obs_row; n_rows],
            species_rows: None,
            final_amounts: amounts.to_vec(),
            warnings: vec![],
        })
    }
}

#[test]
fn network_free_phases_dispatch_to_the_injected_engine() {
    let mut net = decay_network("0.5");
    net.phases.push(SimulationPhase::new(SimMethod::Nf, 1.0, 4));
    let mut second = SimulationPhase::new(SimMethod::Ode, 2.0, 4).continued();
    second.t_start = Some(1.0);
    net.phases.push(second);
    let options = SimOptions {
        nf_engine: Some(std::rc::Rc::new(EchoNfEngine)),
        ..Default::default()
    };
    let result = Simulator::new(&net, options).run().unwrap();
    assert_eq!(result.times.len(), 5 + 4);
    // The echo engine held Atot constant through phase 0.
    for i in 0..5 {
        assert_eq!(result.rows[i][0], 1000.0);
    }
    // The ODE phase then resumed from the handed-back state.
    assert!(result.rows.last().unwrap()[0] < 1000.0);
}
