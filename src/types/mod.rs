//! Core shared types: identifiers, errors, configuration.

pub mod config;
pub mod errors;
pub mod ids;

pub use config::{Config, ObservabilityConfig, QueueConfig};
pub use errors::{Error, Result, StartError, TaskCancelled};
pub use ids::{EventId, EventTypeHash, InterceptorId, InterfaceHash, ManagerId, PromiseId, ServiceId};
