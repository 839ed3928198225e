//! Identifiers and small value types shared by the protocol and the session machine.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Opaque identifier of a conversation. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mints a fresh random id for a lazily-created conversation.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the peer should answer a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    List,
    Summarize,
    Generate,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::List => write!(f, "list"),
            Mode::Summarize => write!(f, "summarize"),
            Mode::Generate => write!(f, "generate"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "list" => Ok(Mode::List),
            "summarize" => Ok(Mode::Summarize),
            "generate" => Ok(Mode::Generate),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// Domain scope a query is restricted to (a site name, or `all`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub const ALL: &'static str = "all";

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self(Self::ALL.to_string())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Someone taking part in a shared conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Wall-clock receipt time, truncated to the precision the log stores.
///
/// Live handling and replay must see the same timestamp, so everything that
/// stamps a frame goes through here.
pub fn receipt_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Summarize".parse::<Mode>(), Ok(Mode::Summarize));
        assert_eq!("list".parse::<Mode>(), Ok(Mode::List));
        assert!("shout".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Generate).unwrap(), "\"generate\"");
    }

    #[test]
    fn scope_defaults_to_all() {
        assert_eq!(Scope::default().as_str(), "all");
    }

    #[test]
    fn receipt_time_has_millisecond_precision() {
        let at = receipt_time();
        assert_eq!(at.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(ConversationId::generate(), ConversationId::generate());
    }
}
