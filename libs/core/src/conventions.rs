//! Resolved literal values for the message `direction` and `sender` columns.
//!
//! Older deployments constrain these columns to `in`/`out`, newer ones to
//! `inbound`/`outbound` (and `agent`/`contact` vs `user`). The store crate
//! introspects the live check constraints once at startup and produces an
//! immutable [`WireConventions`] value; writers receive it by injection and
//! never hard-code literals.

use crate::{Direction, SenderRole};

/// Immutable, process-wide column-literal configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireConventions {
    pub direction_in: String,
    pub direction_out: String,
    pub sender_agent: String,
    pub sender_contact: String,
}

impl Default for WireConventions {
    fn default() -> Self {
        Self {
            direction_in: "in".into(),
            direction_out: "out".into(),
            sender_agent: "agent".into(),
            sender_contact: "contact".into(),
        }
    }
}

impl WireConventions {
    /// Literal value for a logical direction.
    pub fn direction(&self, direction: Direction) -> &str {
        match direction {
            Direction::In => &self.direction_in,
            Direction::Out => &self.direction_out,
        }
    }

    /// Literal value for a logical sender role.
    pub fn sender(&self, role: SenderRole) -> &str {
        match role {
            SenderRole::Agent => &self.sender_agent,
            SenderRole::Contact => &self.sender_contact,
        }
    }

    /// Parses an `in:out`-style override pair, e.g. `inbound:outbound`.
    pub fn parse_pair(raw: &str) -> Option<(String, String)> {
        let (first, second) = raw.split_once(':')?;
        let first = first.trim();
        let second = second.trim();
        if first.is_empty() || second.is_empty() {
            return None;
        }
        Some((first.to_string(), second.to_string()))
    }
}
