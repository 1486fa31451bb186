//! Gauge reporting for the engine loop and the streams.
//!
//! Emission is an external concern; the engine only talks to a
//! [`MetricsReporter`]. The default reporter turns each gauge into a
//! structured `tracing` event.

use parking_lot::Mutex;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GaugeMetric {
    /// Streams still queued after scheduling.
    WaitQueueSize,
    /// Streams executed in one iteration.
    BatchSize,
    /// Wall-clock cost of one iteration, in ms.
    IterateLatency,
    /// Time between admission and first scheduling, in ms.
    WaitTime,
    /// Time between admission and the first produced token, in ms.
    FirstTokenRt,
    /// Emitted once before a fatal process exit.
    ErrorExit,
}

impl GaugeMetric {
    pub fn name(&self) -> &'static str {
        match self {
            GaugeMetric::WaitQueueSize => "async_wait_query_size",
            GaugeMetric::BatchSize => "async_batch_size",
            GaugeMetric::IterateLatency => "async_iterate_latency_ms",
            GaugeMetric::WaitTime => "async_wait_wait_time_ms",
            GaugeMetric::FirstTokenRt => "first_token_rt_ms",
            GaugeMetric::ErrorExit => "error_exit",
        }
    }
}

impl fmt::Display for GaugeMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait MetricsReporter: Send + Sync {
    fn report(&self, metric: GaugeMetric, value: f64);

    /// Push anything buffered to the sink. Called before a fatal exit.
    fn flush(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl MetricsReporter for TracingReporter {
    fn report(&self, metric: GaugeMetric, value: f64) {
        tracing::debug!(target: "candle_serve::metrics", metric = metric.name(), value);
    }

    fn flush(&self) {
        tracing::info!(target: "candle_serve::metrics", "metrics flushed");
    }
}

/// Keeps every reported gauge in memory; handy for assertions.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    records: Mutex<Vec<(GaugeMetric, f64)>>,
    flushes: Mutex<usize>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self, metric: GaugeMetric) -> Vec<f64> {
        self.records
            .lock()
            .iter()
            .filter(|(m, _)| *m == metric)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn flush_count(&self) -> usize {
        *self.flushes.lock()
    }
}

impl MetricsReporter for RecordingReporter {
    fn report(&self, metric: GaugeMetric, value: f64) {
        self.records.lock().push((metric, value));
    }

    fn flush(&self) {
        *self.flushes.lock() += 1;
    }
}
