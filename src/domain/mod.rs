//! Domain Layer
//!
//! Entities, value objects, ports and pure services. No I/O.

pub mod entities;
pub mod error;
pub mod ports;
pub mod services;
pub mod value_objects;

pub use error::FabricError;
