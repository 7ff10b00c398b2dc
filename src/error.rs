use crate::metric::Metric;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by collector implementations from `collect`, `start`,
/// `stop` and `health`
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("collection timed out after {0:?}")]
    Timeout(Duration),

    #[error("collection cancelled")]
    Cancelled,

    #[error("collection failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Which collector behaviour produced a [`CollectorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorStage {
    Collect,
    Start,
}

impl fmt::Display for CollectorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorStage::Collect => write!(f, "collect"),
            CollectorStage::Start => write!(f, "start"),
        }
    }
}

/// A collector failure tagged with the collector that produced it
///
/// These are routed to the error sink and never stop the manager.
#[derive(Error, Debug)]
#[error("collector {collector} {stage} error: {source}")]
pub struct CollectorError {
    pub collector: String,
    pub stage: CollectorStage,
    #[source]
    pub source: CollectError,
}

impl CollectorError {
    pub fn collect(collector: impl Into<String>, source: CollectError) -> Self {
        Self {
            collector: collector.into(),
            stage: CollectorStage::Collect,
            source,
        }
    }

    pub fn start(collector: impl Into<String>, source: CollectError) -> Self {
        Self {
            collector: collector.into(),
            stage: CollectorStage::Start,
            source,
        }
    }
}

/// Aggregated result of a health probe across every enabled collector
#[derive(Error, Debug, Clone, PartialEq)]
#[error("health check failed: {}", format_failures(.failures))]
pub struct HealthCheckError {
    /// `(collector name, diagnostic)` pairs, sorted by collector name
    pub failures: Vec<(String, String)>,
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, message)| format!("collector {}: {}", name, message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Partial outcome of a one-shot collection pass where at least one collector failed
#[derive(Error, Debug)]
#[error("collect errors: {}", join_errors(.failures))]
pub struct CollectOnceError {
    /// Batches of every collector that succeeded
    pub collected: HashMap<String, Vec<Metric>>,
    /// One entry per failing collector
    pub failures: Vec<CollectorError>,
}

fn join_errors(failures: &[CollectorError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Lifecycle step that failed during a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStep {
    Stop,
    Initialize,
    Start,
}

impl fmt::Display for RestartStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartStep::Stop => write!(f, "stop"),
            RestartStep::Initialize => write!(f, "initialize"),
            RestartStep::Start => write!(f, "start"),
        }
    }
}

/// Errors returned synchronously by the manager facade
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("collector {0} already exists")]
    DuplicateName(String),

    #[error("collector {0} not found")]
    NotFound(String),

    #[error("cannot update config while running")]
    ConfigLockedWhileRunning,

    #[error("collector manager is already running")]
    AlreadyRunning,

    #[error("failed to stop collector {name}: {source}")]
    StopFailed {
        name: String,
        #[source]
        source: CollectError,
    },

    #[error("failed to build collector for category {category}: {source}")]
    BuildFailed {
        category: String,
        #[source]
        source: CollectError,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to {step}: {source}")]
    Restart {
        step: RestartStep,
        #[source]
        source: Box<ManagerError>,
    },
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
