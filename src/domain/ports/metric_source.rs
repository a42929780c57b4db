//! Metric Source Ports
//!
//! Sampling functions feeding the performance monitor, and the read-only
//! view the autoscaler uses to inspect recorded metrics.

/// A zero-argument sampler invoked on a collector's interval.
pub trait MetricSource: Send + Sync {
    fn sample(&self) -> f64;
}

impl<F> MetricSource for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn sample(&self) -> f64 {
        self()
    }
}

/// Read access to the most recent value of a metric.
pub trait MetricsView: Send + Sync {
    /// Latest recorded value, or None if the metric has no samples.
    fn latest(&self, metric: &str) -> Option<f64>;
}
