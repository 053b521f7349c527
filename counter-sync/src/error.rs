use std::time;

use thiserror::Error;

/// The only failure a persistence call can report. Every variant is recoverable: the batch that
/// produced it is folded back into the pending amount for its key and delivered later.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransientPersistError {
    #[error("persistence call timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("persistent store unavailable: {0}")]
    Unavailable(String),
}

/// Enumeration of errors related to initialization and running of the sync service.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("invalid simulated sink configuration: {0}")]
    SinkConfigError(String),
    #[error("failed to install metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
    #[error("failed to serve metrics: {0}")]
    ServeError(#[from] std::io::Error),
    #[error("a load generator task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
    #[error("timed out after {0:?} waiting for pending increments to be persisted")]
    QuiescenceTimeout(time::Duration),
    #[error("{key} counted {local} events locally but the store holds {persisted}")]
    ConservationViolated {
        key: String,
        local: u64,
        persisted: u64,
    },
}
