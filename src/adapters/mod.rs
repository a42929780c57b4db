//! Adapters
//!
//! Inbound: the admin HTTP API. Outbound: health probe implementations.

pub mod inbound;
pub mod outbound;
