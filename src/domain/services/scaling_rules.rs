//! Scaling Rules
//!
//! Pure decision logic for the autoscaler: compares the latest metric
//! values against a policy's targets.

use crate::domain::value_objects::metric;

/// Response time above which a tracked policy always asks for capacity.
pub const RESPONSE_TIME_CEILING_MS: f64 = 1000.0;

/// Fraction of the CPU/memory target below which capacity is released.
pub const SCALE_DOWN_FRACTION: f64 = 0.3;

/// A scaling decision for a single policy.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingDecision {
    /// Add capacity, with a human-readable reason.
    Up(String),
    /// Remove capacity, with a human-readable reason.
    Down(String),
    /// No change needed.
    NoChange,
}

pub struct ScalingRules;

impl ScalingRules {
    /// Decide the direction for one policy.
    ///
    /// Scale up when any tracked metric exceeds its target. Scale down only
    /// when every tracked CPU/memory metric has a value below
    /// [`SCALE_DOWN_FRACTION`] of its target. Untracked or unsampled metrics
    /// never trigger a decision.
    pub fn decide<F>(
        tracked: &[String],
        target_cpu: f64,
        target_memory: f64,
        latest: F,
    ) -> ScalingDecision
    where
        F: Fn(&str) -> Option<f64>,
    {
        let limit_for = |name: &str| match name {
            metric::CPU_USAGE => Some(target_cpu),
            metric::MEMORY_USAGE => Some(target_memory),
            metric::RESPONSE_TIME => Some(RESPONSE_TIME_CEILING_MS),
            _ => None,
        };

        for name in tracked {
            if let (Some(limit), Some(value)) = (limit_for(name), latest(name)) {
                if value > limit {
                    return ScalingDecision::Up(format!(
                        "{} {:.1} above target {:.1}",
                        name, value, limit
                    ));
                }
            }
        }

        let resource_metrics: Vec<&String> = tracked
            .iter()
            .filter(|n| n.as_str() == metric::CPU_USAGE || n.as_str() == metric::MEMORY_USAGE)
            .collect();

        if resource_metrics.is_empty() {
            return ScalingDecision::NoChange;
        }

        let all_low = resource_metrics.iter().all(|name| {
            match (limit_for(name), latest(name)) {
                (Some(limit), Some(value)) => value < limit * SCALE_DOWN_FRACTION,
                _ => false,
            }
        });

        if all_low {
            ScalingDecision::Down(format!(
                "resource usage below {:.0}% of target",
                SCALE_DOWN_FRACTION * 100.0
            ))
        } else {
            ScalingDecision::NoChange
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tracked(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn view(values: &[(&str, f64)]) -> HashMap<String, f64> {
        values.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_scale_up_on_cpu() {
        let metrics = view(&[("cpu_usage", 85.0), ("memory_usage", 40.0)]);
        let decision = ScalingRules::decide(
            &tracked(&["cpu_usage", "memory_usage"]),
            70.0,
            80.0,
            |n| metrics.get(n).copied(),
        );
        assert!(matches!(decision, ScalingDecision::Up(reason) if reason.contains("cpu_usage")));
    }

    #[test]
    fn test_scale_up_on_response_time() {
        let metrics = view(&[("response_time", 1500.0), ("cpu_usage", 10.0)]);
        let decision = ScalingRules::decide(
            &tracked(&["cpu_usage", "response_time"]),
            70.0,
            80.0,
            |n| metrics.get(n).copied(),
        );
        assert!(matches!(decision, ScalingDecision::Up(_)));
    }

    #[test]
    fn test_untracked_metric_ignored() {
        let metrics = view(&[("cpu_usage", 99.0)]);
        let decision = ScalingRules::decide(
            &tracked(&["memory_usage"]),
            70.0,
            80.0,
            |n| metrics.get(n).copied(),
        );
        assert_eq!(decision, ScalingDecision::NoChange);
    }

    #[test]
    fn test_scale_down_requires_all_low() {
        let low = view(&[("cpu_usage", 10.0), ("memory_usage", 20.0)]);
        let decision = ScalingRules::decide(
            &tracked(&["cpu_usage", "memory_usage"]),
            70.0,
            80.0,
            |n| low.get(n).copied(),
        );
        assert!(matches!(decision, ScalingDecision::Down(_)));

        // memory at 30/80 is not below 24
        let mixed = view(&[("cpu_usage", 10.0), ("memory_usage", 30.0)]);
        let decision = ScalingRules::decide(
            &tracked(&["cpu_usage", "memory_usage"]),
            70.0,
            80.0,
            |n| mixed.get(n).copied(),
        );
        assert_eq!(decision, ScalingDecision::NoChange);
    }

    #[test]
    fn test_scale_down_needs_samples() {
        let metrics = view(&[("cpu_usage", 5.0)]);
        let decision = ScalingRules::decide(
            &tracked(&["cpu_usage", "memory_usage"]),
            70.0,
            80.0,
            |n| metrics.get(n).copied(),
        );
        assert_eq!(decision, ScalingDecision::NoChange);
    }

    #[test]
    fn test_no_metrics_no_change() {
        let decision = ScalingRules::decide(&tracked(&[]), 70.0, 80.0, |_| Some(100.0));
        assert_eq!(decision, ScalingDecision::NoChange);
    }
}
