mod health_probe;
mod metric_source;

pub use health_probe::HealthProbe;
pub use metric_source::{MetricSource, MetricsView};
