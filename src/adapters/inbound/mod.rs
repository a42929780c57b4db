mod admin_api;

pub use admin_api::{router, AdminApi};

// Re-export for external use (e.g., integration tests)
#[allow(unused_imports)]
pub use admin_api::{HealthResponse, MetricResponse};
