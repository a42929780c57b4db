mod load_balancer;
mod scaling_rules;

pub use load_balancer::LoadBalancer;
pub use scaling_rules::{ScalingDecision, ScalingRules, RESPONSE_TIME_CEILING_MS, SCALE_DOWN_FRACTION};
