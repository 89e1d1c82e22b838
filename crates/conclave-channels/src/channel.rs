use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::types::{AgentId, ChannelId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Open,
    Paused,
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Paused => "paused",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed communication path between exactly two agents.
///
/// Either endpoint may send on it, whatever its direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub source_agent_id: AgentId,
    pub target_agent_id: AgentId,
    /// Free-form tag naming what the channel is for, e.g. "assign".
    pub pattern: String,
    pub state: ChannelState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(source: AgentId, target: AgentId, pattern: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ChannelId::new(),
            source_agent_id: source,
            target_agent_id: target,
            pattern: pattern.into(),
            state: ChannelState::Open,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_endpoint(&self, agent: &AgentId) -> bool {
        &self.source_agent_id == agent || &self.target_agent_id == agent
    }

    /// The endpoint opposite `agent`, if `agent` is an endpoint.
    pub fn peer_of(&self, agent: &AgentId) -> Option<&AgentId> {
        if &self.source_agent_id == agent {
            Some(&self.target_agent_id)
        } else if &self.target_agent_id == agent {
            Some(&self.source_agent_id)
        } else {
            None
        }
    }

    /// Whether the channel joins `a` and `b`, in either direction.
    pub fn connects(&self, a: &AgentId, b: &AgentId) -> bool {
        (&self.source_agent_id == a && &self.target_agent_id == b)
            || (&self.source_agent_id == b && &self.target_agent_id == a)
    }

    /// Move to `next`. Closed is final. Returns the previous state.
    pub(crate) fn transition(&mut self, next: ChannelState) -> Result<ChannelState> {
        if self.state == ChannelState::Closed {
            return Err(ConclaveError::InvalidTransition {
                entity: "channel",
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.state;
        self.state = next;
        self.updated_at = Utc::now();
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Channel {
        Channel::new(AgentId::from("boss"), AgentId::from("worker"), "assign")
    }

    #[test]
    fn test_endpoints() {
        let ch = channel();
        let boss = AgentId::from("boss");
        let worker = AgentId::from("worker");
        let other = AgentId::from("other");

        assert!(ch.is_endpoint(&boss));
        assert!(!ch.is_endpoint(&other));
        assert_eq!(ch.peer_of(&worker), Some(&boss));
        assert_eq!(ch.peer_of(&other), None);
        assert!(ch.connects(&worker, &boss));
        assert!(!ch.connects(&boss, &other));
    }

    #[test]
    fn test_closed_is_final() {
        let mut ch = channel();
        assert_eq!(ch.transition(ChannelState::Paused).unwrap(), ChannelState::Open);
        assert_eq!(ch.transition(ChannelState::Closed).unwrap(), ChannelState::Paused);
        let err = ch.transition(ChannelState::Open).unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(ch.state, ChannelState::Closed);
    }
}
