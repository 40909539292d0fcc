//! Directed influence tracking for stochastic runs.
//!
//! Every fired reaction perturbs the propensities of the reactions that
//! share species with it. The signed propensity differences, accumulated
//! fired-row by dependent-column, form a directed influence network: a
//! run-global matrix plus a fixed number of equal time windows spanning the
//! whole multi-phase horizon.

use ndarray::Array2;
use serde::Serialize;

/// Default number of equal time windows.
pub const DEFAULT_WINDOWS: usize = 20;

/// One closed (or still accumulating) time window.
#[derive(Debug, Clone, Serialize)]
pub struct InfluenceWindow {
    pub t_start: f64,
    pub t_end: f64,
    /// `matrix[[fired, dependent]]` is the accumulated signed propensity
    /// delta inflicted by `fired` on `dependent` inside this window.
    pub matrix: Array2<f64>,
    /// Reaction firings observed in this window.
    pub firings: Vec<u64>,
}

/// Finished influence time-series attached to a simulation result.
#[derive(Debug, Clone, Serialize)]
pub struct InfluenceSeries {
    pub reaction_names: Vec<String>,
    pub windows: Vec<InfluenceWindow>,
    pub global: Array2<f64>,
    pub global_firings: Vec<u64>,
}

/// Run-long accumulator. Created once per run, fed by every SSA phase.
#[derive(Debug, Clone)]
pub struct InfluenceTracker {
    n_reactions: usize,
    global: Array2<f64>,
    global_firings: Vec<u64>,
    windows: Vec<InfluenceWindow>,
    active: usize,
    /// Added to every recorded time; maps phase-local clocks onto the run
    /// output clock.
    time_offset: f64,
}

impl InfluenceTracker {
    /// `t_start..t_end` must cover the whole multi-phase run so the window
    /// boundaries stay fixed across phases.
    pub fn new(n_reactions: usize, t_start: f64, t_end: f64, n_windows: usize) -> Self {
        let n_windows = n_windows.max(1);
        let span = (t_end - t_start).max(f64::MIN_POSITIVE);
        let width = span / n_windows as f64;
        let windows = (0..n_windows)
            .map(|i| InfluenceWindow {
                t_start: t_start + i as f64 * width,
                t_end: t_start + (i + 1) as f64 * width,
                matrix: Array2::zeros((n_reactions, n_reactions)),
                firings: vec![0; n_reactions],
            })
            .collect();
        Self {
            n_reactions,
            global: Array2::zeros((n_reactions, n_reactions)),
            global_firings: vec![0; n_reactions],
            windows,
            active: 0,
            time_offset: 0.0,
        }
    }

    pub fn n_reactions(&self) -> usize {
        self.n_reactions
    }

    /// Set the offset mapping the next phase's local clock onto the run
    /// output clock.
    pub fn set_time_offset(&mut self, offset: f64) {
        self.time_offset = offset;
    }

    /// Move the active window forward until it contains `t`.
    fn advance_to(&mut self, t: f64) {
        while self.active + 1 < self.windows.len() && t >= self.windows[self.active].t_end {
            self.active += 1;
        }
    }

    /// Record one firing of `fired` at phase-local time `t`.
    pub fn record_firing(&mut self, t: f64, fired: usize) {
        let t = t + self.time_offset;
        self.advance_to(t);
        self.global_firings[fired] += 1;
        self.windows[self.active].firings[fired] += 1;
    }

    /// Record the signed propensity delta `fired` inflicted on `dependent`.
    pub fn record_delta(&mut self, t: f64, fired: usize, dependent: usize, delta: f64) {
        if delta == 0.0 || !delta.is_finite() {
            return;
        }
        let t = t + self.time_offset;
        self.advance_to(t);
        self.global[[fired, dependent]] += delta;
        self.windows[self.active].matrix[[fired, dependent]] += delta;
    }

    /// Consume the tracker into a serializable series.
    pub fn finish(self, reaction_names: Vec<String>) -> InfluenceSeries {
        InfluenceSeries {
            reaction_names,
            windows: self.windows,
            global: self.global,
            global_firings: self.global_firings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_land_in_the_window_containing_t() {
        let mut tracker = InfluenceTracker::new(2, 0.0, 10.0, 5);
        tracker.record_delta(0.5, 0, 1, 2.0);
        tracker.record_delta(9.5, 1, 0, -1.0);
        let series = tracker.finish(vec!["R1".into(), "R2".into()]);
        assert_eq!(series.windows[0].matrix[[0, 1]], 2.0);
        assert_eq!(series.windows[4].matrix[[1, 0]], -1.0);
        assert_eq!(series.global[[0, 1]], 2.0);
        assert_eq!(series.global[[1, 0]], -1.0);
    }

    #[test]
    fn global_is_the_sum_of_windows() {
        let mut tracker = InfluenceTracker::new(1, 0.0, 4.0, 4);
        for i in 0..4 {
            tracker.record_delta(i as f64 + 0.5, 0, 0, 1.0);
        }
        let series = tracker.finish(vec!["R1".into()]);
        let sum: f64 = series.windows.iter().map(|w| w.matrix[[0, 0]]).sum();
        assert_eq!(series.global[[0, 0]], sum);
    }

    #[test]
    fn times_past_the_horizon_stay_in_the_last_window() {
        let mut tracker = InfluenceTracker::new(1, 0.0, 1.0, 2);
        tracker.record_delta(5.0, 0, 0, 1.0);
        let series = tracker.finish(vec!["R1".into()]);
        assert_eq!(series.windows[1].matrix[[0, 0]], 1.0);
    }
}
