//! service-fabric Library
//!
//! Load balancing, tiered caching, connection pooling, performance
//! monitoring and autoscaling behind one facade.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{ScalabilityReport, ServiceFabric};
pub use config::{load_config, Config, Topology};
pub use domain::entities::{Connection, ProbeOutcome, RouteRequest, Target};
pub use domain::error::FabricError;
pub use domain::ports::{HealthProbe, MetricSource, MetricsView};
pub use domain::value_objects::{Algorithm, MitigationSignal};
