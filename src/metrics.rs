//! Performance metrics for a single multiplication and their aggregation.
//!
//! Speed-up compares the engine against the direct triple loop on the same
//! inputs. Both runs are timed once, so the numbers are indicative only.

use std::time::Instant;

use tracing::debug;

use crate::engine;
use crate::error::Result;
use crate::matrix::Matrix;

/// Timing results reported with every product.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    /// Wall time of the engine run, in nanoseconds.
    pub execution_time_ns: u64,
    /// `baseline_time_ns / execution_time_ns`.
    pub speed_up: f64,
    /// `speed_up / processing_units`.
    pub efficiency: f64,
}

impl Metrics {
    /// Derive metrics from two timings of the same inputs.
    ///
    /// An engine time of zero is clamped to 1 ns and zero processing units
    /// are treated as one, so both ratios stay finite.
    pub fn from_timings(engine_time_ns: u64, baseline_time_ns: u64, processing_units: usize) -> Self {
        let speed_up = baseline_time_ns as f64 / engine_time_ns.max(1) as f64;
        let efficiency = speed_up / processing_units.max(1) as f64;
        Self {
            execution_time_ns: engine_time_ns,
            speed_up,
            efficiency,
        }
    }

    /// Run the engine and the baseline on `a` and `b`, returning the engine's
    /// product together with its metrics.
    pub fn measure(a: &Matrix, b: &Matrix, processing_units: usize) -> Result<(Matrix, Metrics)> {
        let start = Instant::now();
        let product = engine::multiply(a, b)?;
        let engine_time_ns = elapsed_ns(start);

        let start = Instant::now();
        std::hint::black_box(engine::multiply_direct(a, b)?);
        let baseline_time_ns = elapsed_ns(start);

        let metrics = Metrics::from_timings(engine_time_ns, baseline_time_ns, processing_units);
        debug!(
            engine_time_ns,
            baseline_time_ns,
            speed_up = metrics.speed_up,
            "Measured multiplication"
        );
        Ok((product, metrics))
    }
}

fn elapsed_ns(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Number of parallel execution units on this host (at least 1).
pub fn processing_units() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Arithmetic means over a set of per-session metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSummary {
    pub sessions: usize,
    pub mean_execution_time_ns: u64,
    pub mean_speed_up: f64,
    pub mean_efficiency: f64,
}

impl MetricsSummary {
    /// Average the given metrics. Returns `None` when there are none.
    pub fn from_metrics<'a>(metrics: impl IntoIterator<Item = &'a Metrics>) -> Option<Self> {
        let mut sessions = 0usize;
        let mut total_time: u128 = 0;
        let mut total_speed_up = 0.0;
        let mut total_efficiency = 0.0;

        for m in metrics {
            sessions += 1;
            total_time += u128::from(m.execution_time_ns);
            total_speed_up += m.speed_up;
            total_efficiency += m.efficiency;
        }

        if sessions == 0 {
            return None;
        }

        let n = sessions as f64;
        Some(Self {
            sessions,
            mean_execution_time_ns: (total_time / sessions as u128) as u64,
            mean_speed_up: total_speed_up / n,
            mean_efficiency: total_efficiency / n,
        })
    }
}
