use crate::error::EventsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A fan-out channel: one private channel per executor and one per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Channel {
    Executor(Uuid),
    User(Uuid),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Executor(id) => write!(f, "executor-{id}"),
            Channel::User(id) => write!(f, "user-{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = EventsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EventsError::InvalidChannel(s.to_string());
        if let Some(id) = s.strip_prefix("executor-") {
            return Uuid::parse_str(id).map(Channel::Executor).map_err(|_| invalid());
        }
        if let Some(id) = s.strip_prefix("user-") {
            return Uuid::parse_str(id).map(Channel::User).map_err(|_| invalid());
        }
        Err(invalid())
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

impl TryFrom<String> for Channel {
    type Error = EventsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
