//! Application Layer
//!
//! The fabric facade that wires the components together.

pub mod fabric;
pub mod report;

pub use fabric::{FabricIntervals, ServiceFabric, COLLECTOR_INTERVAL};
pub use report::ScalabilityReport;
