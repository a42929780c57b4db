//! Autoscaler
//!
//! Named scaling policies that move a tracked instance count within its
//! bounds. Actions are cooldown-gated and complete asynchronously after a
//! provisioning delay.

use crate::domain::entities::{epoch_millis, ScalingAction};
use crate::domain::error::FabricError;
use crate::domain::ports::MetricsView;
use crate::domain::services::{ScalingDecision, ScalingRules};
use crate::domain::value_objects::{metric, ActionStatus, ScaleDirection};
use crate::infrastructure::shutdown::ShutdownController;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Time between recording an action and treating it as provisioned.
pub const DEFAULT_PROVISIONING_DELAY: Duration = Duration::from_secs(5);

/// Actions kept per policy.
const MAX_HISTORY: usize = 100;

/// Scaling policy configuration.
#[derive(Debug, Clone)]
pub struct ScalingPolicyConfig {
    pub enabled: bool,
    pub min_instances: u32,
    pub max_instances: u32,
    /// CPU percentage above which to scale up
    pub target_cpu: f64,
    /// Memory percentage above which to scale up
    pub target_memory: f64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    /// Metric names consulted by `evaluate`
    pub metrics: Vec<String>,
    /// Instances added or removed per action
    pub step: u32,
}

impl Default for ScalingPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_instances: 1,
            max_instances: 10,
            target_cpu: 70.0,
            target_memory: 80.0,
            scale_up_cooldown: Duration::from_secs(300),
            scale_down_cooldown: Duration::from_secs(600),
            metrics: vec![
                metric::CPU_USAGE.to_string(),
                metric::MEMORY_USAGE.to_string(),
                metric::RESPONSE_TIME.to_string(),
            ],
            step: 1,
        }
    }
}

struct PolicyState {
    config: ScalingPolicyConfig,
    /// Provisioned instances
    current: u32,
    /// Instances requested by the latest action
    desired: u32,
    last_action: Option<ScalingAction>,
    history: VecDeque<ScalingAction>,
    next_sequence: u64,
}

impl PolicyState {
    fn new(config: ScalingPolicyConfig) -> Self {
        let initial = config.min_instances;
        Self {
            config,
            current: initial,
            desired: initial,
            last_action: None,
            history: VecDeque::new(),
            next_sequence: 0,
        }
    }

    fn cooldown(&self, direction: ScaleDirection) -> Duration {
        match direction {
            ScaleDirection::Up => self.config.scale_up_cooldown,
            ScaleDirection::Down => self.config.scale_down_cooldown,
        }
    }

    fn complete(&mut self, sequence: u64) {
        let Some(action) = self.history.iter_mut().find(|a| a.sequence == sequence) else {
            return;
        };
        action.status = ActionStatus::Completed;
        self.current = action.to;

        if let Some(last) = self.last_action.as_mut().filter(|a| a.sequence == sequence) {
            last.status = ActionStatus::Completed;
        }
    }

    fn stats(&self, name: &str) -> PolicyStats {
        PolicyStats {
            name: name.to_string(),
            enabled: self.config.enabled,
            min_instances: self.config.min_instances,
            max_instances: self.config.max_instances,
            current_instances: self.current,
            desired_instances: self.desired,
            scaling_in_progress: self.current != self.desired,
            last_action: self.last_action.clone(),
            total_actions: self.history.len(),
        }
    }
}

/// Policy-driven instance count controller.
pub struct Autoscaler {
    policies: Arc<Mutex<BTreeMap<String, PolicyState>>>,
    metrics: Arc<dyn MetricsView>,
    provisioning_delay: Duration,
}

impl Autoscaler {
    /// Create an autoscaler reading metrics from `metrics`.
    pub fn new(metrics: Arc<dyn MetricsView>) -> Self {
        Self {
            policies: Arc::new(Mutex::new(BTreeMap::new())),
            metrics,
            provisioning_delay: DEFAULT_PROVISIONING_DELAY,
        }
    }

    pub fn with_provisioning_delay(mut self, delay: Duration) -> Self {
        self.provisioning_delay = delay;
        self
    }

    /// Create or replace a policy. The instance count starts at the minimum.
    pub fn create_policy(&self, name: &str, mut config: ScalingPolicyConfig) {
        if config.max_instances < config.min_instances {
            tracing::warn!(policy = %name, "max_instances below min_instances, raising to min");
            config.max_instances = config.min_instances;
        }

        tracing::info!(
            policy = %name,
            min = config.min_instances,
            max = config.max_instances,
            "created scaling policy"
        );

        if self
            .policies
            .lock()
            .insert(name.to_string(), PolicyState::new(config))
            .is_some()
        {
            tracing::warn!(policy = %name, "replaced existing scaling policy");
        }
    }

    /// Request a scaling step for `policy`.
    ///
    /// Returns `Ok(None)` when the policy is disabled, still cooling down,
    /// or already at its bound.
    pub fn trigger_scaling(
        &self,
        direction: ScaleDirection,
        reason: &str,
        policy: &str,
    ) -> Result<Option<ScalingAction>, FabricError> {
        let now = Instant::now();
        let action = {
            let mut policies = self.policies.lock();
            let state = policies
                .get_mut(policy)
                .ok_or_else(|| FabricError::PolicyNotFound(policy.to_string()))?;

            if !state.config.enabled {
                return Ok(None);
            }

            if let Some(last) = &state.last_action {
                let cooldown = state.cooldown(direction);
                if now.duration_since(last.at) < cooldown {
                    tracing::debug!(policy = %policy, direction = %direction, "scaling suppressed by cooldown");
                    return Ok(None);
                }
            }

            let from = state.desired;
            let to = match direction {
                ScaleDirection::Up => from.saturating_add(state.config.step),
                ScaleDirection::Down => from.saturating_sub(state.config.step),
            }
            .clamp(state.config.min_instances, state.config.max_instances);

            if to == from {
                tracing::debug!(policy = %policy, direction = %direction, instances = from, "already at scaling bound");
                return Ok(None);
            }

            let action = ScalingAction {
                sequence: state.next_sequence,
                direction,
                from,
                to,
                reason: reason.to_string(),
                status: ActionStatus::InProgress,
                timestamp_ms: epoch_millis(),
                at: now,
            };
            state.next_sequence += 1;
            state.desired = to;
            state.last_action = Some(action.clone());
            state.history.push_back(action.clone());
            while state.history.len() > MAX_HISTORY {
                state.history.pop_front();
            }

            action
        };

        tracing::info!(
            policy = %policy,
            direction = %direction,
            from = action.from,
            to = action.to,
            reason = %reason,
            "scaling action started"
        );

        self.schedule_completion(policy, action.sequence);
        Ok(Some(action))
    }

    /// Evaluate every enabled policy against the latest metrics and trigger
    /// the resulting actions.
    pub fn evaluate(&self) -> Vec<ScalingAction> {
        let candidates: Vec<(String, ScalingPolicyConfig)> = self
            .policies
            .lock()
            .iter()
            .filter(|(_, s)| s.config.enabled)
            .map(|(name, s)| (name.clone(), s.config.clone()))
            .collect();

        let mut actions = Vec::new();
        for (name, config) in candidates {
            let decision = ScalingRules::decide(&config.metrics, config.target_cpu, config.target_memory, |m| {
                self.metrics.latest(m)
            });

            let (direction, reason) = match decision {
                ScalingDecision::Up(reason) => (ScaleDirection::Up, reason),
                ScalingDecision::Down(reason) => (ScaleDirection::Down, reason),
                ScalingDecision::NoChange => continue,
            };

            match self.trigger_scaling(direction, &reason, &name) {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => {}
                Err(e) => tracing::warn!(policy = %name, "evaluation failed: {}", e),
            }
        }

        actions
    }

    /// State of one policy.
    pub fn policy(&self, name: &str) -> Option<PolicyStats> {
        self.policies.lock().get(name).map(|s| s.stats(name))
    }

    /// Recorded actions for a policy, oldest first.
    pub fn history(&self, name: &str) -> Result<Vec<ScalingAction>, FabricError> {
        self.policies
            .lock()
            .get(name)
            .map(|s| s.history.iter().cloned().collect())
            .ok_or_else(|| FabricError::PolicyNotFound(name.to_string()))
    }

    pub fn stats(&self) -> AutoscalerStats {
        AutoscalerStats {
            policies: self
                .policies
                .lock()
                .iter()
                .map(|(name, state)| state.stats(name))
                .collect(),
        }
    }

    /// Start the periodic evaluation loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_evaluation(self: &Arc<Self>, interval: Duration, shutdown: &ShutdownController) -> JoinHandle<()> {
        let autoscaler = self.clone();
        shutdown.spawn_periodic("autoscale_evaluation", interval, move || {
            autoscaler.evaluate();
            std::future::ready(())
        })
    }

    /// Mark the action completed after the provisioning delay. Outside a
    /// runtime the action completes immediately.
    fn schedule_completion(&self, policy: &str, sequence: u64) {
        let policies = self.policies.clone();
        let name = policy.to_string();

        let complete = move || {
            if let Some(state) = policies.lock().get_mut(&name) {
                state.complete(sequence);
                tracing::info!(policy = %name, instances = state.current, "scaling action completed");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let delay = self.provisioning_delay;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    complete();
                });
            }
            Err(_) => complete(),
        }
    }
}

/// State of one scaling policy.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyStats {
    pub name: String,
    pub enabled: bool,
    pub min_instances: u32,
    pub max_instances: u32,
    pub current_instances: u32,
    pub desired_instances: u32,
    pub scaling_in_progress: bool,
    pub last_action: Option<ScalingAction>,
    pub total_actions: usize,
}

/// Autoscaler statistics, one entry per policy sorted by name.
#[derive(Debug, Clone, Serialize)]
pub struct AutoscalerStats {
    pub policies: Vec<PolicyStats>,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FixedMetrics {
        values: Mutex<HashMap<String, f64>>,
    }

    impl FixedMetrics {
        fn set(&self, name: &str, value: f64) {
            self.values.lock().insert(name.to_string(), value);
        }
    }

    impl MetricsView for FixedMetrics {
        fn latest(&self, metric: &str) -> Option<f64> {
            self.values.lock().get(metric).copied()
        }
    }

    fn autoscaler() -> (Autoscaler, Arc<FixedMetrics>) {
        let metrics = Arc::new(FixedMetrics::default());
        let autoscaler = Autoscaler::new(metrics.clone());
        autoscaler.create_policy(
            "web",
            ScalingPolicyConfig {
                min_instances: 2,
                max_instances: 4,
                ..Default::default()
            },
        );
        (autoscaler, metrics)
    }

    #[test]
    fn test_policy_starts_at_min() {
        let (autoscaler, _) = autoscaler();
        let stats = autoscaler.policy("web").unwrap();
        assert_eq!(stats.current_instances, 2);
        assert_eq!(stats.desired_instances, 2);
        assert!(stats.last_action.is_none());
    }

    #[test]
    fn test_unknown_policy() {
        let (autoscaler, _) = autoscaler();
        assert_eq!(
            autoscaler.trigger_scaling(ScaleDirection::Up, "test", "api").unwrap_err(),
            FabricError::PolicyNotFound("api".to_string())
        );
        assert!(autoscaler.history("api").is_err());
    }

    #[test]
    fn test_trigger_without_runtime_completes_immediately() {
        let (autoscaler, _) = autoscaler();
        let action = autoscaler
            .trigger_scaling(ScaleDirection::Up, "load", "web")
            .unwrap()
            .unwrap();
        assert_eq!((action.from, action.to), (2, 3));

        let stats = autoscaler.policy("web").unwrap();
        assert_eq!(stats.current_instances, 3);
        assert_eq!(stats.last_action.unwrap().status, ActionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_allows_one_change() {
        let (autoscaler, _) = autoscaler();

        let first = autoscaler.trigger_scaling(ScaleDirection::Up, "a", "web").unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = autoscaler.trigger_scaling(ScaleDirection::Up, "b", "web").unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(autoscaler.history("web").unwrap().len(), 1);
        assert_eq!(autoscaler.policy("web").unwrap().desired_instances, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_per_direction() {
        let (autoscaler, _) = autoscaler();
        autoscaler.trigger_scaling(ScaleDirection::Up, "a", "web").unwrap();

        // Up cooldown (300s) elapsed, down cooldown (600s) not
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(autoscaler.trigger_scaling(ScaleDirection::Down, "b", "web").unwrap().is_none());
        assert!(autoscaler.trigger_scaling(ScaleDirection::Up, "c", "web").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_completion() {
        let (autoscaler, _) = autoscaler();
        let action = autoscaler
            .trigger_scaling(ScaleDirection::Up, "load", "web")
            .unwrap()
            .unwrap();
        assert_eq!(action.status, ActionStatus::InProgress);

        let stats = autoscaler.policy("web").unwrap();
        assert_eq!(stats.current_instances, 2);
        assert_eq!(stats.desired_instances, 3);
        assert!(stats.scaling_in_progress);

        tokio::time::sleep(DEFAULT_PROVISIONING_DELAY + Duration::from_millis(1)).await;

        let stats = autoscaler.policy("web").unwrap();
        assert_eq!(stats.current_instances, 3);
        assert!(!stats.scaling_in_progress);
        assert_eq!(stats.last_action.unwrap().status, ActionStatus::Completed);
        assert_eq!(autoscaler.history("web").unwrap()[0].status, ActionStatus::Completed);
    }

    #[test]
    fn test_clamped_at_bounds() {
        let metrics = Arc::new(FixedMetrics::default());
        let autoscaler = Autoscaler::new(metrics);
        autoscaler.create_policy(
            "web",
            ScalingPolicyConfig {
                min_instances: 1,
                max_instances: 2,
                scale_up_cooldown: Duration::ZERO,
                scale_down_cooldown: Duration::ZERO,
                step: 5,
                ..Default::default()
            },
        );

        assert!(autoscaler.trigger_scaling(ScaleDirection::Down, "x", "web").unwrap().is_none());

        let up = autoscaler.trigger_scaling(ScaleDirection::Up, "x", "web").unwrap().unwrap();
        assert_eq!(up.to, 2);
        assert!(autoscaler.trigger_scaling(ScaleDirection::Up, "x", "web").unwrap().is_none());

        let down = autoscaler.trigger_scaling(ScaleDirection::Down, "x", "web").unwrap().unwrap();
        assert_eq!(down.to, 1);
    }

    #[test]
    fn test_disabled_policy_ignored() {
        let metrics = Arc::new(FixedMetrics::default());
        metrics.set("cpu_usage", 99.0);
        let autoscaler = Autoscaler::new(metrics);
        autoscaler.create_policy(
            "web",
            ScalingPolicyConfig {
                enabled: false,
                ..Default::default()
            },
        );

        assert!(autoscaler.trigger_scaling(ScaleDirection::Up, "x", "web").unwrap().is_none());
        assert!(autoscaler.evaluate().is_empty());
    }

    #[test]
    fn test_evaluate_scales_up_on_cpu() {
        let (autoscaler, metrics) = autoscaler();
        metrics.set("cpu_usage", 85.0);
        metrics.set("memory_usage", 50.0);

        let actions = autoscaler.evaluate();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].direction, ScaleDirection::Up);
        assert!(actions[0].reason.contains("cpu_usage"));
    }

    #[test]
    fn test_evaluate_scales_down_when_idle() {
        let metrics = Arc::new(FixedMetrics::default());
        let autoscaler = Autoscaler::new(metrics.clone());
        autoscaler.create_policy(
            "web",
            ScalingPolicyConfig {
                min_instances: 1,
                scale_up_cooldown: Duration::ZERO,
                scale_down_cooldown: Duration::ZERO,
                ..Default::default()
            },
        );
        autoscaler.trigger_scaling(ScaleDirection::Up, "seed", "web").unwrap();
        autoscaler.trigger_scaling(ScaleDirection::Up, "seed", "web").unwrap();

        metrics.set("cpu_usage", 5.0);
        metrics.set("memory_usage", 10.0);

        let actions = autoscaler.evaluate();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].direction, ScaleDirection::Down);
        assert_eq!((actions[0].from, actions[0].to), (3, 2));
    }

    #[test]
    fn test_evaluate_at_minimum_is_noop() {
        let (autoscaler, metrics) = autoscaler();
        metrics.set("cpu_usage", 5.0);
        metrics.set("memory_usage", 10.0);
        assert!(autoscaler.evaluate().is_empty());
    }

    #[test]
    fn test_evaluate_no_metrics() {
        let (autoscaler, _) = autoscaler();
        assert!(autoscaler.evaluate().is_empty());
    }

    #[test]
    fn test_stats_sorted_by_name() {
        let (autoscaler, _) = autoscaler();
        autoscaler.create_policy("api", ScalingPolicyConfig::default());
        let names: Vec<String> = autoscaler.stats().policies.into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["api", "web"]);
    }
}
