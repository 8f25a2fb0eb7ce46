//! Identifiers generated by Portline.
//!
//! Units, pipelines and resources are named by callers with opaque strings.
//! Feedback loops and escalations get ULIDs so they sort by creation time.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a FeedbackLoop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoopId(Ulid);

impl LoopId {
    /// Generate a new LoopId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LoopId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LoopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for LoopId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for an Escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EscalationId(Ulid);

impl EscalationId {
    /// Generate a new EscalationId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EscalationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EscalationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for EscalationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_id_roundtrips_through_string() {
        let id = LoopId::new();
        let parsed: LoopId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_escalation_id_rejects_garbage() {
        assert!("not-a-ulid".parse::<EscalationId>().is_err());
    }
}
