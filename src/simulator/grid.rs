//! Output time grid.
//!
//! Grid times accumulate the raw step width; only the emitted value is
//! quantized, to 13 significant digits. Both engines sample on the exact
//! same times, so the accumulation must not be replaced with
//! `start + idx * dt`.

/// Quantize a time value to 13 significant digits.
pub fn quantize(t: f64) -> f64 {
    if !t.is_finite() || t == 0.0 {
        return t;
    }
    format!("{t:.12e}").parse().unwrap_or(t)
}

/// The `idx`-th output time of a phase grid (`idx` in `0..=n_steps`).
pub fn grid_time(start: f64, duration: f64, n_steps: usize, idx: usize) -> f64 {
    if n_steps == 0 || idx == 0 {
        return quantize(start);
    }
    let dt = duration / n_steps as f64;
    let mut t = start;
    for _ in 0..idx {
        t += dt;
    }
    quantize(t)
}

/// All `n_steps + 1` output times of a phase.
pub fn phase_grid(start: f64, duration: f64, n_steps: usize) -> Vec<f64> {
    let dt = if n_steps == 0 {
        0.0
    } else {
        duration / n_steps as f64
    };
    let mut times = Vec::with_capacity(n_steps + 1);
    times.push(quantize(start));
    let mut t = start;
    for _ in 0..n_steps {
        t += dt;
        times.push(quantize(t));
    }
    times
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_keeps_thirteen_significant_digits() {
        assert_eq!(quantize(0.1 + 0.2), 0.3);
        assert_eq!(quantize(0.0), 0.0);
        assert_eq!(quantize(123.45678901234567), 123.4567890123);
    }

    #[test]
    fn grid_accumulates_rather_than_multiplies() {
        let times = phase_grid(0.0, 10.0, 100);
        assert_eq!(times.len(), 101);
        assert_eq!(times[0], 0.0);
        assert_eq!(*times.last().unwrap(), 10.0);
        // Accumulation matches the per-index helper.
        for (idx, t) in times.iter().enumerate() {
            assert_eq!(*t, grid_time(0.0, 10.0, 100, idx));
        }
    }

    #[test]
    fn non_decimal_step_widths_quantize_only_on_emission() {
        // dt = 1/7; the raw sum is quantized once per grid point.
        assert_eq!(grid_time(0.0, 1.0, 7, 1), 0.1428571428571);
        assert_eq!(grid_time(0.0, 1.0, 7, 3), 0.4285714285714);
        assert_eq!(grid_time(0.0, 1.0, 7, 7), 1.0);
        let times = phase_grid(0.0, 1.0, 7);
        assert_eq!(times[1], 0.1428571428571);
        assert_eq!(times[3], 0.4285714285714);
    }

    #[test]
    fn zero_step_grid_is_the_start_time() {
        assert_eq!(phase_grid(3.0, 5.0, 0), vec![3.0]);
    }
}
