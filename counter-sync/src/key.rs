use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Identifier for an independently tracked event category.
///
/// Nothing in the crate assumes a fixed set of keys: state for a key is created the first time
/// an event for it is observed and kept for the lifetime of the process.
pub trait Key: Eq + Ord + Hash + Clone + Debug + Display + Send + Sync + 'static {}

impl<T> Key for T where T: Eq + Ord + Hash + Clone + Debug + Display + Send + Sync + 'static {}

/// The event categories driven by the bundled load scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EventName {
    A,
    B,
}

impl EventName {
    pub const ALL: [EventName; 2] = [EventName::A, EventName::B];
}

impl Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventName::A => write!(f, "A"),
            EventName::B => write!(f, "B"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown event name: {0:?}")]
pub struct UnknownEventNameError(pub String);

impl FromStr for EventName {
    type Err = UnknownEventNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(EventName::A),
            "B" | "b" => Ok(EventName::B),
            other => Err(UnknownEventNameError(other.to_owned())),
        }
    }
}
