pub mod config;
pub mod drift;
pub mod emitter;
pub mod error;
pub mod handler;
pub mod key;
pub mod metrics_consts;
pub mod reconciler;
pub mod retry;
pub mod serve_metrics;
pub mod sink;
pub mod stats;
pub mod store;
