//! Health checks run during early generation.
//!
//! The runner feeds every execution of the generate phase into a [`HealthCheckState`] until either
//! enough valid examples have been seen (the test is healthy) or a threshold is breached. Health
//! checking stops for good once a failure has been found.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::data::{ConjectureResult, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheck {
    /// A single run went on past the hung test limit
    HungTest,
    /// Too many executions overran the buffer
    DataTooLarge,
    /// Too many executions were rejected as invalid
    FilterTooMuch,
    /// Drawing data took too long
    TooSlow,
    /// The simplest possible example is already too large
    LargeBaseExample,
}

impl HealthCheck {
    pub fn all() -> [HealthCheck; 5] {
        [
            HealthCheck::HungTest,
            HealthCheck::DataTooLarge,
            HealthCheck::FilterTooMuch,
            HealthCheck::TooSlow,
            HealthCheck::LargeBaseExample,
        ]
    }
}

impl fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthCheck::HungTest => "hung_test",
            HealthCheck::DataTooLarge => "data_too_large",
            HealthCheck::FilterTooMuch => "filter_too_much",
            HealthCheck::TooSlow => "too_slow",
            HealthCheck::LargeBaseExample => "large_base_example",
        };
        f.write_str(name)
    }
}

/// Limits the generate phase is checked against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckThresholds {
    /// Valid examples after which the test is considered healthy
    pub max_valid_draws: usize,
    pub max_invalid_draws: usize,
    pub max_overrun_draws: usize,
    /// Cumulative draw time allowed before the test counts as too slow
    pub max_draw_time: Duration,
}

impl Default for HealthCheckThresholds {
    fn default() -> Self {
        HealthCheckThresholds {
            max_valid_draws: 10,
            max_invalid_draws: 50,
            max_overrun_draws: 20,
            max_draw_time: Duration::from_secs(1),
        }
    }
}

/// Outcome of feeding one execution into the health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Keep checking
    Pending,
    /// Enough valid examples were seen; stop checking
    Healthy,
    Failed(HealthCheck, String),
}

#[derive(Debug, Clone, Default)]
pub struct HealthCheckState {
    pub valid_examples: usize,
    pub invalid_examples: usize,
    pub overrun_examples: usize,
    pub draw_time: Duration,
}

impl HealthCheckState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        result: &ConjectureResult,
        thresholds: &HealthCheckThresholds,
    ) -> HealthVerdict {
        self.draw_time += result.draw_times.iter().sum::<Duration>();
        match result.status {
            Status::Valid => self.valid_examples += 1,
            Status::Invalid => self.invalid_examples += 1,
            Status::Overrun => self.overrun_examples += 1,
            Status::Interesting => {}
        }

        if self.valid_examples >= thresholds.max_valid_draws {
            return HealthVerdict::Healthy;
        }
        if self.overrun_examples >= thresholds.max_overrun_draws {
            return HealthVerdict::Failed(
                HealthCheck::DataTooLarge,
                format!(
                    "Examples routinely exceeded the max allowable size ({} overruns, {} valid)",
                    self.overrun_examples, self.valid_examples
                ),
            );
        }
        if self.invalid_examples >= thresholds.max_invalid_draws {
            return HealthVerdict::Failed(
                HealthCheck::FilterTooMuch,
                format!(
                    "It looks like your test is filtering out a lot of data ({} invalid, {} valid)",
                    self.invalid_examples, self.valid_examples
                ),
            );
        }
        if self.draw_time > thresholds.max_draw_time {
            return HealthVerdict::Failed(
                HealthCheck::TooSlow,
                format!(
                    "Data generation is extremely slow: {:.2?} to draw {} valid examples",
                    self.draw_time, self.valid_examples
                ),
            );
        }
        HealthVerdict::Pending
    }
}
