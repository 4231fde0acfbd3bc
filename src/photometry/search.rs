//! Bisection over one photometric parameter
//!
//! The search is a pure state machine: it proposes the next parameter value
//! and is told the brightness that value produced. Grabbing frames and
//! writing to the device stay with the caller, so the search can be driven
//! by a model in tests.
//!
//! Brightness is assumed monotone non-decreasing in the parameter.

use crate::config::Bounds;
use serde::Serialize;

/// Current bracket `[low, high]` on the searched parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchInterval {
    pub low: f64,
    pub high: f64,
}

impl SearchInterval {
    pub fn midpoint(&self) -> f64 {
        self.low + (self.high - self.low) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

impl From<Bounds> for SearchInterval {
    fn from(b: Bounds) -> Self {
        Self {
            low: b.min,
            high: b.max,
        }
    }
}

/// Narrow `interval` after `probe` produced `reading`.
///
/// A reading below `target` moves the lower edge up to the probe, anything
/// else moves the upper edge down. Edges only ever move inwards.
pub fn narrow(interval: SearchInterval, probe: f64, reading: f64, target: f64) -> SearchInterval {
    if reading < target {
        SearchInterval {
            low: interval.low.max(probe.min(interval.high)),
            high: interval.high,
        }
    } else {
        SearchInterval {
            low: interval.low,
            high: interval.high.min(probe.max(interval.low)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchStatus {
    Continue,
    /// Reading within tolerance of the target
    Converged,
    /// Iteration budget spent or bracket collapsed without converging
    Exhausted,
}

/// One evaluated parameter value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Probe {
    pub value: f64,
    pub brightness: f64,
}

#[derive(Debug, Clone)]
pub struct BrightnessSearch {
    interval: SearchInterval,
    target: f64,
    tolerance: f64,
    max_iterations: u32,
    min_width: f64,
    iterations: u32,
    best: Option<Probe>,
    last: Option<Probe>,
    status: SearchStatus,
}

impl BrightnessSearch {
    /// `min_width` is the parameter resolution below which the bracket counts as collapsed
    pub fn new(
        bounds: Bounds,
        target: f64,
        tolerance: f64,
        max_iterations: u32,
        min_width: f64,
    ) -> Self {
        Self {
            interval: bounds.into(),
            target,
            tolerance,
            max_iterations,
            min_width: min_width.max(0.0),
            iterations: 0,
            best: None,
            last: None,
            status: if max_iterations == 0 {
                SearchStatus::Exhausted
            } else {
                SearchStatus::Continue
            },
        }
    }

    /// Next value to try, or `None` once the search has terminated
    pub fn next_probe(&self) -> Option<f64> {
        match self.status {
            SearchStatus::Continue => Some(self.interval.midpoint()),
            _ => None,
        }
    }

    /// Record the brightness produced by `value` (the reached, not the requested, value)
    pub fn observe(&mut self, value: f64, brightness: f64) -> SearchStatus {
        if self.status != SearchStatus::Continue {
            return self.status;
        }

        self.iterations += 1;
        let probe = Probe { value, brightness };
        let error = (brightness - self.target).abs();
        if self
            .best
            .map_or(true, |b| error < (b.brightness - self.target).abs())
        {
            self.best = Some(probe);
        }
        self.last = Some(probe);

        self.status = if error <= self.tolerance {
            SearchStatus::Converged
        } else {
            self.interval = narrow(self.interval, value, brightness, self.target);
            if self.iterations >= self.max_iterations || self.interval.width() <= self.min_width {
                SearchStatus::Exhausted
            } else {
                SearchStatus::Continue
            }
        };
        self.status
    }

    pub fn status(&self) -> SearchStatus {
        self.status
    }

    pub fn interval(&self) -> SearchInterval {
        self.interval
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Probe whose brightness came closest to the target
    pub fn best(&self) -> Option<Probe> {
        self.best
    }

    pub fn last(&self) -> Option<Probe> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(search: &mut BrightnessSearch, model: impl Fn(f64) -> f64) {
        while let Some(value) = search.next_probe() {
            search.observe(value, model(value));
        }
    }

    #[test]
    fn test_narrow_moves_edges_inwards() {
        let i = SearchInterval { low: 0.0, high: 100.0 };
        assert_eq!(narrow(i, 50.0, 10.0, 20.0), SearchInterval { low: 50.0, high: 100.0 });
        assert_eq!(narrow(i, 50.0, 30.0, 20.0), SearchInterval { low: 0.0, high: 50.0 });
        // A probe outside the bracket never widens it
        assert_eq!(narrow(i, 150.0, 10.0, 20.0), SearchInterval { low: 100.0, high: 100.0 });
    }

    #[test]
    fn test_converges_on_linear_model() {
        let mut search = BrightnessSearch::new(Bounds::new(0.0, 1000.0), 42.0, 1.0, 10, 0.0);
        run(&mut search, |x| x * 255.0 / 1000.0);
        assert_eq!(search.status(), SearchStatus::Converged);
        assert!(search.iterations() <= 10);
        assert!((search.last().unwrap().brightness - 42.0).abs() <= 1.0);
    }

    #[test]
    fn test_exhausts_when_target_unreachable() {
        // Saturates at 100: a target of 250 can never be met
        let mut search = BrightnessSearch::new(Bounds::new(0.0, 1000.0), 250.0, 1.0, 10, 0.0);
        run(&mut search, |x| (x * 0.1).min(100.0));
        assert_eq!(search.status(), SearchStatus::Exhausted);
        assert_eq!(search.iterations(), 10);
        let best = search.best().unwrap();
        assert!(best.brightness < 250.0);
        assert!(best.value > 990.0);
    }

    #[test]
    fn test_collapsed_bracket_stops_early() {
        let mut search = BrightnessSearch::new(Bounds::new(0.0, 16.0), 200.0, 1.0, 50, 1.0);
        run(&mut search, |_| 0.0);
        assert_eq!(search.status(), SearchStatus::Exhausted);
        assert!(search.iterations() < 50);
    }

    #[test]
    fn test_zero_budget_never_probes() {
        let search = BrightnessSearch::new(Bounds::new(0.0, 1.0), 1.0, 1.0, 0, 0.0);
        assert_eq!(search.next_probe(), None);
    }

    #[test]
    fn test_observe_after_termination_is_ignored() {
        let mut search = BrightnessSearch::new(Bounds::new(0.0, 100.0), 50.0, 1.0, 5, 0.0);
        assert_eq!(search.observe(50.0, 50.0), SearchStatus::Converged);
        assert_eq!(search.observe(10.0, 3.0), SearchStatus::Converged);
        assert_eq!(search.iterations(), 1);
    }
}
