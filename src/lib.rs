/// Error types for the collector manager
pub mod error;

/// Metric data model
pub mod metric;

/// Configuration management
pub mod config;

/// Collector contract and factory seam
pub mod collector;

/// Built-in collector implementations
pub mod collectors;

/// Named collector store
pub mod registry;

/// Collection statistics
pub mod stats;

/// Health probing across collectors
pub mod health;

/// Bounded sink for collector errors
pub mod error_sink;

/// Flush loop delivering metric batches
pub mod pipeline;

/// Lifecycle controller and public facade
pub mod manager;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use collector::{Collector, CollectorFactory, CollectorSpec, SharedCollector};
pub use config::{CategoryConfig, ManagerConfig};
pub use error::{
    CollectError, CollectOnceError, CollectorError, ConfigError, HealthCheckError, ManagerError,
};
pub use manager::{Manager, ManagerState};
pub use metric::{Category, Metric, MetricKind};
pub use stats::{CollectorStats, HealthStatus, ManagerStats};
