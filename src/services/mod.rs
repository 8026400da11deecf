//! Bundled collaborator services built entirely on the core's public API.

pub mod logging;
pub mod serialization;
pub mod statistics;
pub mod timer;

pub use logging::{CoutLogger, LogLevel, LogOrigin, Logger, LoggerFactory, NullLogger};
pub use serialization::{deserialize, serialize, JsonSerializer, Serializer};
pub use statistics::{EventStatisticsService, EventStatisticsSource, EventTypeStats};
pub use timer::{Timer, TimerEvent};
