use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

use crate::key::EventName;
use crate::retry::{RetryMode, RetryModeName, RetryPolicy};
use crate::sink::SimulatedSinkConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "A,B")]
    pub event_names: EventNameList,

    // Events emitted per key by the load generator
    #[envconfig(default = "1000")]
    pub max_events: u64,

    #[envconfig(default = "20")]
    pub max_emit_delay: EnvMsDuration,

    #[envconfig(default = "10")]
    pub sink_min_latency: EnvMsDuration,

    #[envconfig(default = "200")]
    pub sink_max_latency: EnvMsDuration,

    #[envconfig(default = "0.3")]
    pub sink_failure_rate: f64,

    #[envconfig(default = "20")]
    pub stats_interval_secs: u64,

    #[envconfig(default = "30000")]
    pub quiescence_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn stats_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.stats_interval_secs)
    }

    pub fn sink_config(&self) -> SimulatedSinkConfig {
        SimulatedSinkConfig {
            min_latency: self.sink_min_latency.0,
            max_latency: self.sink_max_latency.0,
            failure_rate: self.sink_failure_rate,
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "backoff")]
    pub retry_mode: RetryModeName,

    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "10")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn retry_mode(&self) -> RetryMode {
        match self.retry_mode {
            RetryModeName::AwaitNextTrigger => RetryMode::AwaitNextTrigger,
            RetryModeName::Backoff => RetryMode::Backoff(RetryPolicy::new(
                self.backoff_coefficient,
                self.initial_interval.0,
                Some(self.maximum_interval.0),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("expected a number of milliseconds")]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Comma separated list of event names, e.g. `A,B`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNameList(pub Vec<EventName>);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid event name list entry: {0:?}")]
pub struct ParseEventNameListError(pub String);

impl FromStr for EventNameList {
    type Err = ParseEventNameListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let names = s
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                name.parse::<EventName>()
                    .map_err(|_| ParseEventNameListError(name.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if names.is_empty() {
            return Err(ParseEventNameListError(s.to_owned()));
        }
        Ok(EventNameList(names))
    }
}
