//! Oversubscription reconciliation primitives.
//!
//! This library provides the building blocks the subset manager uses to
//! converge each subset's oversubscription ratio toward observed load:
//!
//! - **Smoothing window**: the last N pressure readings of a subset.
//! - **Ratio policy**: step size, water marks and the decision function.
//! - **Retry tracking**: bounded failure accounting for side effects
//!   (monitoring savers) that must never block the control loop.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same window and bounds
//! - A decision never crosses the supplied floor or ceiling
//! - A single decision moves the ratio by at most one step

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReconcileError {
    /// The policy parameters are inconsistent.
    #[error("invalid ratio policy: {0}")]
    InvalidPolicy(String),
}

/// Default number of consecutive ticks a condition must hold.
pub const DEFAULT_SMOOTHING_TICKS: usize = 5;

/// Default ratio adjustment per decision.
pub const DEFAULT_RATIO_STEP: f64 = 0.1;

/// Default pressure below which a subset counts as under-used.
pub const DEFAULT_LOW_WATER: f64 = 0.5;

/// Default pressure above which a subset counts as saturated.
pub const DEFAULT_HIGH_WATER: f64 = 0.9;

/// Default retry limit per saver.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(60);

/// Ratios are kept on a 1e-4 grid so repeated steps do not drift.
fn quantize(ratio: f64) -> f64 {
    (ratio * 10_000.0).round() / 10_000.0
}

// =============================================================================
// Smoothing Window
// =============================================================================

/// Fixed-size window over the most recent pressure readings of one subset.
#[derive(Debug, Clone)]
pub struct SmoothingWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl SmoothingWindow {
    /// Create an empty window holding at most `capacity` readings.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a reading, evicting the oldest one when full.
    pub fn push(&mut self, pressure: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(pressure);
    }

    /// Whether the window holds `capacity` readings.
    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of the readings, `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Most recent reading.
    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// True when the window is full and every reading exceeds `threshold`.
    pub fn all_above(&self, threshold: f64) -> bool {
        self.is_full() && self.samples.iter().all(|p| *p > threshold)
    }

    /// True when the window is full and every reading is below `threshold`.
    pub fn all_below(&self, threshold: f64) -> bool {
        self.is_full() && self.samples.iter().all(|p| *p < threshold)
    }

    /// Forget all readings (after acting on them).
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

// =============================================================================
// Ratio Policy
// =============================================================================

/// Outcome of one ratio decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RatioDecision {
    /// Keep the current ratio.
    Hold,

    /// Lower the ratio to the given value.
    Lower(f64),

    /// Raise the ratio to the given value.
    Raise(f64),
}

impl RatioDecision {
    /// The new ratio, if the decision changes it.
    pub fn target(&self) -> Option<f64> {
        match self {
            Self::Hold => None,
            Self::Lower(r) | Self::Raise(r) => Some(*r),
        }
    }
}

/// Parameters of the sustained-load ratio controller.
///
/// Pressure is live utilization divided by the raw (physical) capacity
/// of the subset.
#[derive(Debug, Clone, PartialEq)]
pub struct RatioPolicy {
    /// Consecutive ticks a condition must hold before acting.
    pub window: usize,

    /// Maximum ratio change per decision.
    pub step: f64,

    /// Pressure below which the ratio may be raised.
    pub low_water: f64,

    /// Pressure above which the ratio is lowered.
    pub high_water: f64,
}

impl Default for RatioPolicy {
    fn default() -> Self {
        Self {
            window: DEFAULT_SMOOTHING_TICKS,
            step: DEFAULT_RATIO_STEP,
            low_water: DEFAULT_LOW_WATER,
            high_water: DEFAULT_HIGH_WATER,
        }
    }
}

impl RatioPolicy {
    /// Check parameter consistency.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.window == 0 {
            return Err(ReconcileError::InvalidPolicy(
                "window must be at least one tick".to_string(),
            ));
        }
        if !self.step.is_finite() || self.step <= 0.0 {
            return Err(ReconcileError::InvalidPolicy(format!(
                "step must be positive, got {}",
                self.step
            )));
        }
        if !(0.0..self.high_water).contains(&self.low_water) {
            return Err(ReconcileError::InvalidPolicy(format!(
                "expected 0 <= low_water < high_water, got {} / {}",
                self.low_water, self.high_water
            )));
        }
        Ok(())
    }

    /// Create a window sized for this policy.
    pub fn new_window(&self) -> SmoothingWindow {
        SmoothingWindow::new(self.window)
    }

    /// Decide the next ratio for a subset.
    ///
    /// `floor` is the lowest ratio that still covers the configured demand;
    /// `ceiling` is the highest ratio the subset may reach.
    pub fn decide(
        &self,
        window: &SmoothingWindow,
        current: f64,
        floor: f64,
        ceiling: f64,
    ) -> RatioDecision {
        if window.all_above(self.high_water) {
            let target = quantize((current - self.step).max(floor));
            if target < current {
                return RatioDecision::Lower(target);
            }
            return RatioDecision::Hold;
        }

        if window.all_below(self.low_water) {
            let target = quantize((current + self.step).min(ceiling));
            if target > current {
                return RatioDecision::Raise(target);
            }
        }

        RatioDecision::Hold
    }
}

// =============================================================================
// Retry Tracker
// =============================================================================

/// Retry tracker for failed side effects.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }
}
