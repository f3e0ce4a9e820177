//! Voice session lifecycle and conversation turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Session lifecycle. Exactly one terminal state is ever reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initiated,
    InProgress,
    Completed,
    Transferred,
    Failed,
    Abandoned,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Transferred | Self::Failed | Self::Abandoned
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Initiated, InProgress) => true,
            (Initiated, Abandoned) | (Initiated, Failed) => true,
            (InProgress, Completed) | (InProgress, Transferred) => true,
            (InProgress, Failed) | (InProgress, Abandoned) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initiated => "initiated",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Transferred => "transferred",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// Outcome tag assigned when a session reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    LeadQualified,
    Informational,
    Transferred,
    NoAnswer,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Speech,
    SystemEvent,
    Transfer,
    Schedule,
}

/// One ordered record within a session. Sequence numbers are dense and
/// monotonically increasing per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub sequence: u32,
    pub direction: TurnDirection,
    pub kind: TurnKind,
    pub content: String,
    /// Synthesis artifact fingerprint for outbound speech turns.
    pub audio_ref: Option<String>,
    pub processing_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// A live or finished call instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSession {
    pub id: String,
    pub tenant_id: String,
    pub agent_id: String,
    /// Telephone number, browser client id, or other caller handle.
    pub caller_id: String,
    pub language: String,
    pub state: SessionState,
    pub outcome: Option<SessionOutcome>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub turn_count: u32,
    /// Consecutive pipeline failures within this session.
    pub failure_count: u32,
}

impl VoiceSession {
    pub fn new(
        tenant_id: impl Into<String>,
        agent_id: impl Into<String>,
        caller_id: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            agent_id: agent_id.into(),
            caller_id: caller_id.into(),
            language: language.into(),
            state: SessionState::Initiated,
            outcome: None,
            started_at: Utc::now(),
            ended_at: None,
            turn_count: 0,
            failure_count: 0,
        }
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::business_rule(
                "session_state_transition",
                format!("cannot move session from {} to {}", self.state, next),
            ));
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    /// Allocate the next dense sequence number.
    pub fn next_sequence(&mut self) -> u32 {
        self.turn_count += 1;
        self.turn_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_has_one_terminal_state() {
        let mut s = VoiceSession::new("t-1", "ag-1", "+15550100", "en");
        s.transition(SessionState::InProgress).unwrap();
        s.transition(SessionState::Completed).unwrap();
        assert!(s.state.is_terminal());
        assert!(s.ended_at.is_some());
        // No transition out of a terminal state.
        assert!(s.transition(SessionState::Failed).is_err());
        assert!(s.transition(SessionState::Transferred).is_err());
    }

    #[test]
    fn transfer_is_one_way() {
        let mut s = VoiceSession::new("t-1", "ag-1", "+15550100", "en");
        s.transition(SessionState::InProgress).unwrap();
        s.transition(SessionState::Transferred).unwrap();
        assert!(s.transition(SessionState::InProgress).is_err());
    }

    #[test]
    fn sequence_numbers_are_dense() {
        let mut s = VoiceSession::new("t-1", "ag-1", "+15550100", "en");
        assert_eq!(s.next_sequence(), 1);
        assert_eq!(s.next_sequence(), 2);
        assert_eq!(s.next_sequence(), 3);
        assert_eq!(s.turn_count, 3);
    }

    #[test]
    fn duration_requires_end() {
        let mut s = VoiceSession::new("t-1", "ag-1", "+15550100", "en");
        assert!(s.duration().is_none());
        s.transition(SessionState::InProgress).unwrap();
        s.transition(SessionState::Completed).unwrap();
        assert!(s.duration().unwrap() >= chrono::Duration::zero());
    }
}
