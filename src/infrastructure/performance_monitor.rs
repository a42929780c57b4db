//! Performance Monitor
//!
//! Bounded metric series, threshold alerts, a health score and the
//! mitigation signals raised on critical breaches.

use crate::domain::entities::{epoch_millis, Alert};
use crate::domain::ports::{MetricSource, MetricsView};
use crate::domain::value_objects::{metric, AlertSeverity, AlertStatus, HealthGrade, MitigationSignal};
use crate::infrastructure::shutdown::ShutdownController;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Samples kept per metric.
pub const MAX_SAMPLES: usize = 1000;

/// Alerts kept in the log.
pub const MAX_ALERTS: usize = 1000;

/// Window used for report statistics.
pub const REPORT_WINDOW: Duration = Duration::from_secs(300);

/// Warning and critical levels for one metric. A value at or above a
/// level breaches it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    fn severity(&self, value: f64) -> Option<AlertSeverity> {
        if value >= self.critical {
            Some(AlertSeverity::Critical)
        } else if value >= self.warning {
            Some(AlertSeverity::Warning)
        } else {
            None
        }
    }
}

/// Thresholds installed on every new monitor.
pub fn default_thresholds() -> HashMap<String, Threshold> {
    HashMap::from([
        (metric::RESPONSE_TIME.to_string(), Threshold::new(1000.0, 3000.0)),
        (metric::CPU_USAGE.to_string(), Threshold::new(70.0, 90.0)),
        (metric::MEMORY_USAGE.to_string(), Threshold::new(80.0, 95.0)),
        (metric::ERROR_RATE.to_string(), Threshold::new(5.0, 10.0)),
        (metric::ACTIVE_CONNECTIONS.to_string(), Threshold::new(800.0, 1000.0)),
    ])
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    value: f64,
}

/// Summary of a metric over a time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricStats {
    pub current: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

struct Collector {
    name: String,
    interval: Duration,
    source: Arc<dyn MetricSource>,
}

/// Metric store and alert engine.
pub struct PerformanceMonitor {
    series: DashMap<String, VecDeque<Sample>>,
    thresholds: DashMap<String, Threshold>,
    alerts: Mutex<VecDeque<Alert>>,
    collectors: Mutex<Vec<Collector>>,
    mitigation_tx: Option<mpsc::UnboundedSender<MitigationSignal>>,
}

impl PerformanceMonitor {
    /// Create a monitor with the default thresholds and no signal sink.
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            thresholds: default_thresholds().into_iter().collect(),
            alerts: Mutex::new(VecDeque::new()),
            collectors: Mutex::new(Vec::new()),
            mitigation_tx: None,
        }
    }

    /// Send mitigation signals for critical breaches to `tx`.
    pub fn with_mitigation(mut self, tx: mpsc::UnboundedSender<MitigationSignal>) -> Self {
        self.mitigation_tx = Some(tx);
        self
    }

    /// Install or replace the thresholds for a metric.
    pub fn set_threshold(&self, name: &str, warning: f64, critical: f64) {
        self.thresholds
            .insert(name.to_string(), Threshold::new(warning, critical));
    }

    pub fn threshold(&self, name: &str) -> Option<Threshold> {
        self.thresholds.get(name).map(|t| *t)
    }

    /// Register a sampler polled every `interval` once collectors start.
    pub fn register_collector<S>(&self, name: &str, interval: Duration, source: S)
    where
        S: MetricSource + 'static,
    {
        tracing::debug!(metric = %name, interval_ms = interval.as_millis() as u64, "registered collector");
        self.collectors.lock().push(Collector {
            name: name.to_string(),
            interval,
            source: Arc::new(source),
        });
    }

    /// Record one sample and evaluate its thresholds.
    pub fn record_metric(&self, name: &str, value: f64) {
        {
            let mut series = self.series.entry(name.to_string()).or_default();
            series.push_back(Sample {
                at: Instant::now(),
                value,
            });
            while series.len() > MAX_SAMPLES {
                series.pop_front();
            }
        }

        let Some(threshold) = self.threshold(name) else {
            return;
        };

        match threshold.severity(value) {
            Some(severity) => {
                let level = match severity {
                    AlertSeverity::Critical => threshold.critical,
                    AlertSeverity::Warning => threshold.warning,
                };
                self.raise_alert(Alert::new(name, value, severity, level));

                if severity == AlertSeverity::Critical {
                    self.signal(name, value);
                }
            }
            None => self.resolve_alerts(name),
        }
    }

    /// Statistics over samples younger than `window`.
    pub fn metric_stats(&self, name: &str, window: Duration) -> Option<MetricStats> {
        let now = Instant::now();
        let series = self.series.get(name)?;

        let values: Vec<f64> = series
            .iter()
            .filter(|s| now.duration_since(s.at) <= window)
            .map(|s| s.value)
            .collect();

        let current = *values.last()?;
        let count = values.len();

        Some(MetricStats {
            current,
            average: values.iter().sum::<f64>() / count as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            count,
        })
    }

    /// Names of every metric with at least one sample.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    /// Full alert log, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.is_active())
            .cloned()
            .collect()
    }

    /// `100 - 20 * critical - 10 * warning` over active alerts, floored at 0.
    pub fn health_score(&self) -> u32 {
        let (critical, warning) = self.active_counts();
        100u32.saturating_sub(20 * critical as u32 + 10 * warning as u32)
    }

    pub fn generate_report(&self) -> PerformanceReport {
        let score = self.health_score();
        let (critical, warning) = self.active_counts();

        let metrics: BTreeMap<String, MetricStats> = self
            .metric_names()
            .into_iter()
            .filter_map(|name| {
                let stats = self.metric_stats(&name, REPORT_WINDOW)?;
                Some((name, stats))
            })
            .collect();

        let recommendations = metrics
            .iter()
            .filter_map(|(name, stats)| {
                let threshold = self.threshold(name)?;
                (stats.average >= threshold.warning).then(|| recommendation(name, stats.average, &threshold))
            })
            .collect();

        PerformanceReport {
            health_score: score,
            grade: HealthGrade::from_score(score),
            active_alerts: critical + warning,
            critical_alerts: critical,
            warning_alerts: warning,
            total_alerts: self.alerts.lock().len(),
            metrics,
            recommendations,
            generated_at_ms: epoch_millis(),
        }
    }

    /// Spawn one sampling task per registered collector.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_collectors(self: &Arc<Self>, shutdown: &ShutdownController) -> Vec<JoinHandle<()>> {
        let collectors = self.collectors.lock();

        collectors
            .iter()
            .map(|collector| {
                let monitor = self.clone();
                let name = collector.name.clone();
                let source = collector.source.clone();
                shutdown.spawn_periodic("metric_collector", collector.interval, move || {
                    monitor.record_metric(&name, source.sample());
                    std::future::ready(())
                })
            })
            .collect()
    }

    fn raise_alert(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Critical => tracing::warn!(
                metric = %alert.metric,
                value = alert.value,
                threshold = alert.threshold,
                "critical alert"
            ),
            AlertSeverity::Warning => tracing::info!(
                metric = %alert.metric,
                value = alert.value,
                threshold = alert.threshold,
                "warning alert"
            ),
        }

        let mut alerts = self.alerts.lock();
        alerts.push_back(alert);

        if alerts.len() > MAX_ALERTS {
            match alerts.iter().position(|a| !a.is_active()) {
                Some(pos) => {
                    alerts.remove(pos);
                }
                None => {
                    alerts.pop_front();
                }
            }
        }
    }

    fn resolve_alerts(&self, name: &str) {
        let mut resolved = 0;
        for alert in self.alerts.lock().iter_mut() {
            if alert.metric == name && alert.is_active() {
                alert.status = AlertStatus::Resolved;
                resolved += 1;
            }
        }

        if resolved > 0 {
            tracing::info!(metric = %name, resolved, "alerts resolved");
        }
    }

    fn signal(&self, name: &str, value: f64) {
        let signal = match name {
            metric::RESPONSE_TIME | metric::CPU_USAGE | metric::MEMORY_USAGE => MitigationSignal::ScaleUp {
                metric: name.to_string(),
                value,
            },
            metric::ERROR_RATE => MitigationSignal::TripCircuit { value },
            metric::ACTIVE_CONNECTIONS => MitigationSignal::EngageRateLimit { value },
            _ => return,
        };

        if let Some(tx) = &self.mitigation_tx {
            if tx.send(signal).is_err() {
                tracing::debug!(metric = %name, "mitigation receiver gone, signal dropped");
            }
        }
    }

    fn active_counts(&self) -> (usize, usize) {
        let alerts = self.alerts.lock();
        let critical = alerts
            .iter()
            .filter(|a| a.is_active() && a.severity == AlertSeverity::Critical)
            .count();
        let warning = alerts
            .iter()
            .filter(|a| a.is_active() && a.severity == AlertSeverity::Warning)
            .count();
        (critical, warning)
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsView for PerformanceMonitor {
    fn latest(&self, name: &str) -> Option<f64> {
        self.series.get(name)?.back().map(|s| s.value)
    }
}

fn recommendation(name: &str, average: f64, threshold: &Threshold) -> String {
    match name {
        metric::RESPONSE_TIME => format!(
            "Average response time {:.0}ms exceeds {:.0}ms: cache hot paths or add capacity",
            average, threshold.warning
        ),
        metric::CPU_USAGE => format!(
            "Average CPU usage {:.1}% exceeds {:.0}%: scale out or profile hot code paths",
            average, threshold.warning
        ),
        metric::MEMORY_USAGE => format!(
            "Average memory usage {:.1}% exceeds {:.0}%: check for leaks or raise instance memory",
            average, threshold.warning
        ),
        metric::ERROR_RATE => format!(
            "Average error rate {:.1}% exceeds {:.0}%: inspect failing targets and recent deploys",
            average, threshold.warning
        ),
        metric::ACTIVE_CONNECTIONS => format!(
            "Average active connections {:.0} exceeds {:.0}: raise pool limits or add targets",
            average, threshold.warning
        ),
        _ => format!(
            "Average {} {:.2} exceeds warning threshold {:.2}",
            name, average, threshold.warning
        ),
    }
}

/// Point-in-time performance summary.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub health_score: u32,
    pub grade: HealthGrade,
    pub active_alerts: usize,
    pub critical_alerts: usize,
    pub warning_alerts: usize,
    pub total_alerts: usize,
    /// Per-metric statistics over the last five minutes
    pub metrics: BTreeMap<String, MetricStats>,
    pub recommendations: Vec<String>,
    pub generated_at_ms: u64,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_thresholds() {
        let monitor = PerformanceMonitor::new();
        assert_eq!(monitor.threshold("response_time"), Some(Threshold::new(1000.0, 3000.0)));
        assert_eq!(monitor.threshold("cpu_usage"), Some(Threshold::new(70.0, 90.0)));
        assert_eq!(monitor.threshold("memory_usage"), Some(Threshold::new(80.0, 95.0)));
        assert_eq!(monitor.threshold("error_rate"), Some(Threshold::new(5.0, 10.0)));
        assert_eq!(monitor.threshold("active_connections"), Some(Threshold::new(800.0, 1000.0)));
        assert_eq!(monitor.threshold("queue_depth"), None);
    }

    #[test]
    fn test_series_bounded() {
        let monitor = PerformanceMonitor::new();
        for i in 0..(MAX_SAMPLES + 50) {
            monitor.record_metric("queue_depth", i as f64);
        }

        let stats = monitor.metric_stats("queue_depth", Duration::from_secs(60)).unwrap();
        assert_eq!(stats.count, MAX_SAMPLES);
        assert_eq!(stats.min, 50.0);
        assert_eq!(stats.current, (MAX_SAMPLES + 49) as f64);
    }

    #[test]
    fn test_metric_stats() {
        let monitor = PerformanceMonitor::new();
        for v in [10.0, 30.0, 20.0] {
            monitor.record_metric("cpu_usage", v);
        }

        let stats = monitor.metric_stats("cpu_usage", Duration::from_secs(60)).unwrap();
        assert_eq!(
            stats,
            MetricStats {
                current: 20.0,
                average: 20.0,
                min: 10.0,
                max: 30.0,
                count: 3
            }
        );
        assert!(monitor.metric_stats("unknown", Duration::from_secs(60)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metric_stats_window() {
        let monitor = PerformanceMonitor::new();
        monitor.record_metric("cpu_usage", 50.0);
        tokio::time::advance(Duration::from_secs(120)).await;
        monitor.record_metric("cpu_usage", 10.0);

        let recent = monitor.metric_stats("cpu_usage", Duration::from_secs(60)).unwrap();
        assert_eq!(recent.count, 1);
        assert_eq!(recent.average, 10.0);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(monitor.metric_stats("cpu_usage", Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_alert_severity_levels() {
        let monitor = PerformanceMonitor::new();
        monitor.record_metric("cpu_usage", 50.0);
        assert!(monitor.alerts().is_empty());

        monitor.record_metric("cpu_usage", 70.0);
        monitor.record_metric("cpu_usage", 90.0);

        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(alerts[0].threshold, 70.0);
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);
        assert_eq!(alerts[1].threshold, 90.0);
    }

    #[test]
    fn test_duplicate_alerts_not_suppressed() {
        let monitor = PerformanceMonitor::new();
        for _ in 0..3 {
            monitor.record_metric("memory_usage", 85.0);
        }
        assert_eq!(monitor.active_alerts().len(), 3);
    }

    #[test]
    fn test_sample_below_warning_resolves() {
        let monitor = PerformanceMonitor::new();
        monitor.record_metric("cpu_usage", 95.0);
        monitor.record_metric("memory_usage", 96.0);
        assert_eq!(monitor.active_alerts().len(), 2);

        monitor.record_metric("cpu_usage", 40.0);

        let active = monitor.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].metric, "memory_usage");
        assert_eq!(monitor.alerts().len(), 2);
    }

    #[test]
    fn test_health_score_and_grade() {
        let monitor = PerformanceMonitor::new();
        assert_eq!(monitor.health_score(), 100);

        monitor.record_metric("cpu_usage", 95.0);
        monitor.record_metric("memory_usage", 85.0);
        assert_eq!(monitor.health_score(), 70);
        assert_eq!(monitor.generate_report().grade, HealthGrade::C);

        for _ in 0..5 {
            monitor.record_metric("error_rate", 50.0);
        }
        assert_eq!(monitor.health_score(), 0);
        assert_eq!(monitor.generate_report().grade, HealthGrade::F);
    }

    #[test]
    fn test_set_threshold() {
        let monitor = PerformanceMonitor::new();
        monitor.set_threshold("queue_depth", 10.0, 20.0);
        monitor.record_metric("queue_depth", 25.0);

        let alerts = monitor.active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_mitigation_signals() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = PerformanceMonitor::new().with_mitigation(tx);

        monitor.record_metric("cpu_usage", 95.0);
        monitor.record_metric("error_rate", 12.0);
        monitor.record_metric("active_connections", 1500.0);
        monitor.record_metric("memory_usage", 85.0);
        monitor.set_threshold("queue_depth", 1.0, 2.0);
        monitor.record_metric("queue_depth", 5.0);

        assert_eq!(
            rx.try_recv().unwrap(),
            MitigationSignal::ScaleUp {
                metric: "cpu_usage".to_string(),
                value: 95.0
            }
        );
        assert_eq!(rx.try_recv().unwrap(), MitigationSignal::TripCircuit { value: 12.0 });
        assert_eq!(rx.try_recv().unwrap(), MitigationSignal::EngageRateLimit { value: 1500.0 });
        // Warnings and unmapped metrics emit nothing
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_signal_without_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let monitor = PerformanceMonitor::new().with_mitigation(tx);
        monitor.record_metric("response_time", 5000.0);
        assert_eq!(monitor.active_alerts().len(), 1);
    }

    #[test]
    fn test_alert_log_bounded_drops_resolved_first() {
        let monitor = PerformanceMonitor::new();
        monitor.record_metric("memory_usage", 99.0);
        monitor.record_metric("memory_usage", 10.0);
        let resolved_id = monitor.alerts()[0].id.clone();

        for _ in 0..MAX_ALERTS {
            monitor.record_metric("cpu_usage", 95.0);
        }

        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), MAX_ALERTS);
        assert!(alerts.iter().all(|a| a.id != resolved_id));
        assert!(alerts.iter().all(|a| a.is_active()));
    }

    #[test]
    fn test_report_recommendations() {
        let monitor = PerformanceMonitor::new();
        monitor.record_metric("cpu_usage", 85.0);
        monitor.record_metric("cpu_usage", 75.0);
        monitor.record_metric("memory_usage", 40.0);

        let report = monitor.generate_report();
        assert_eq!(report.metrics.len(), 2);
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].contains("CPU"));
        assert_eq!(report.total_alerts, 2);
    }

    #[test]
    fn test_latest_view() {
        let monitor = PerformanceMonitor::new();
        assert_eq!(monitor.latest("cpu_usage"), None);
        monitor.record_metric("cpu_usage", 12.0);
        monitor.record_metric("cpu_usage", 34.0);
        assert_eq!(monitor.latest("cpu_usage"), Some(34.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collectors_sample_on_interval() {
        let monitor = Arc::new(PerformanceMonitor::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        monitor.register_collector("cpu_usage", Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst) as f64
        });

        let shutdown = ShutdownController::new();
        let handles = monitor.start_collectors(&shutdown);
        assert_eq!(handles.len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        shutdown.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.latest("cpu_usage"), Some(2.0));
    }
}
