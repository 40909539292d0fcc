//! Fixed-step RK4 integrator.
//!
//! Serves the explicitly requested fixed-step offload path. No error
//! control: the caller chooses the substep count per output interval.
//! Non-finite or negative concentrations are clamped to zero after each
//! step to stop NaN propagation.

use super::Derivatives;
use nalgebra::DVector;

/// Substeps per output interval.
pub const SUBSTEPS_PER_INTERVAL: usize = 10;

/// Scratch buffers for RK4, reused across steps.
pub struct Rk4Scratch {
    k1: DVector<f64>,
    k2: DVector<f64>,
    k3: DVector<f64>,
    k4: DVector<f64>,
    tmp: DVector<f64>,
}

impl Rk4Scratch {
    pub fn new(n: usize) -> Self {
        Self {
            k1: DVector::zeros(n),
            k2: DVector::zeros(n),
            k3: DVector::zeros(n),
            k4: DVector::zeros(n),
            tmp: DVector::zeros(n),
        }
    }
}

/// Advance `y` in place by one step of width `dt` starting at time `t`.
pub fn step(deriv: &dyn Derivatives, t: f64, dt: f64, y: &mut DVector<f64>, sc: &mut Rk4Scratch) {
    let n = y.len();
    let half_dt = 0.5 * dt;
    let dt_over_6 = dt / 6.0;

    deriv.dydt(y, t, &mut sc.k1);

    for i in 0..n {
        sc.tmp[i] = y[i] + half_dt * sc.k1[i];
    }
    deriv.dydt(&sc.tmp, t + half_dt, &mut sc.k2);

    for i in 0..n {
        sc.tmp[i] = y[i] + half_dt * sc.k2[i];
    }
    deriv.dydt(&sc.tmp, t + half_dt, &mut sc.k3);

    for i in 0..n {
        sc.tmp[i] = y[i] + dt * sc.k3[i];
    }
    deriv.dydt(&sc.tmp, t + dt, &mut sc.k4);

    for i in 0..n {
        let incr = dt_over_6 * (sc.k1[i] + 2.0 * sc.k2[i] + 2.0 * sc.k3[i] + sc.k4[i]);
        let val = y[i] + incr;
        y[i] = if val.is_finite() && val > 0.0 { val } else { 0.0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay;

    impl Derivatives for Decay {
        fn dydt(&self, y: &DVector<f64>, _t: f64, out: &mut DVector<f64>) {
            out[0] = -0.5 * y[0];
        }
    }

    #[test]
    fn matches_exponential_decay() {
        let deriv = Decay;
        let mut y = DVector::from_vec(vec![1.0]);
        let mut sc = Rk4Scratch::new(1);
        let dt = 0.01;
        let mut t = 0.0;
        for _ in 0..100 {
            step(&deriv, t, dt, &mut y, &mut sc);
            t += dt;
        }
        let exact = (-0.5_f64).exp();
        assert!((y[0] - exact).abs() < 1e-8, "got {} want {exact}", y[0]);
    }
}
