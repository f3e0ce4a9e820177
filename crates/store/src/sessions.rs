//! Voice session and conversation turn persistence.
//!
//! Turns are clustered by sequence under their session partition, so a
//! session replay is one partition scan in order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use voxgate_core::{
    ConversationTurn, SessionOutcome, SessionState, TurnDirection, TurnKind, VoiceSession,
};

use crate::client::ScyllaClient;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert(&self, session: &VoiceSession) -> StoreResult<()>;
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<VoiceSession>>;
    async fn list_by_tenant(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<VoiceSession>>;
}

#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn append(&self, turn: &ConversationTurn) -> StoreResult<()>;
    async fn list_by_session(&self, session_id: &str) -> StoreResult<Vec<ConversationTurn>>;
    async fn count(&self, session_id: &str) -> StoreResult<u32>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<(String, String), VoiceSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn upsert(&self, session: &VoiceSession) -> StoreResult<()> {
        self.sessions.write().insert(
            (session.tenant_id.clone(), session.id.clone()),
            session.clone(),
        );
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<VoiceSession>> {
        Ok(self
            .sessions
            .read()
            .get(&(tenant_id.to_string(), id.to_string()))
            .cloned())
    }

    async fn list_by_tenant(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<VoiceSession>> {
        let mut sessions: Vec<VoiceSession> = self
            .sessions
            .read()
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, s)| s.clone())
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(limit);
        Ok(sessions)
    }
}

#[derive(Default)]
pub struct InMemoryTurnStore {
    turns: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnStore for InMemoryTurnStore {
    async fn append(&self, turn: &ConversationTurn) -> StoreResult<()> {
        let mut turns = self.turns.write();
        let list = turns.entry(turn.session_id.clone()).or_default();
        // Dense, monotonically increasing sequence is an invariant.
        let expected = list.last().map(|t| t.sequence + 1).unwrap_or(1);
        if turn.sequence != expected {
            return Err(StoreError::Conflict(format!(
                "turn sequence gap: expected {expected}, got {}",
                turn.sequence
            )));
        }
        list.push(turn.clone());
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str) -> StoreResult<Vec<ConversationTurn>> {
        Ok(self
            .turns
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn count(&self, session_id: &str) -> StoreResult<u32> {
        Ok(self
            .turns
            .read()
            .get(session_id)
            .map(|l| l.len() as u32)
            .unwrap_or(0))
    }
}

#[derive(Clone)]
pub struct ScyllaSessionStore {
    client: ScyllaClient,
}

impl ScyllaSessionStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn row_to_session(row: scylla::frame::response::result::Row) -> StoreResult<VoiceSession> {
        let (
            tenant_id,
            id,
            agent_id,
            caller_id,
            language,
            state,
            outcome,
            started_at,
            ended_at,
            turn_count,
            failure_count,
        ): (
            String,
            String,
            String,
            String,
            String,
            String,
            Option<String>,
            i64,
            Option<i64>,
            i32,
            i32,
        ) = row
            .into_typed()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(VoiceSession {
            id,
            tenant_id,
            agent_id,
            caller_id,
            language,
            state: parse_state(&state),
            outcome: outcome.as_deref().map(parse_outcome),
            started_at: DateTime::from_timestamp_millis(started_at).unwrap_or_else(Utc::now),
            ended_at: ended_at.and_then(DateTime::from_timestamp_millis),
            turn_count: turn_count.max(0) as u32,
            failure_count: failure_count.max(0) as u32,
        })
    }
}

fn parse_state(s: &str) -> SessionState {
    match s {
        "initiated" => SessionState::Initiated,
        "in_progress" => SessionState::InProgress,
        "completed" => SessionState::Completed,
        "transferred" => SessionState::Transferred,
        "abandoned" => SessionState::Abandoned,
        _ => SessionState::Failed,
    }
}

fn parse_outcome(s: &str) -> SessionOutcome {
    match s {
        "lead_qualified" => SessionOutcome::LeadQualified,
        "informational" => SessionOutcome::Informational,
        "transferred" => SessionOutcome::Transferred,
        "no_answer" => SessionOutcome::NoAnswer,
        _ => SessionOutcome::Error,
    }
}

fn outcome_str(o: SessionOutcome) -> &'static str {
    match o {
        SessionOutcome::LeadQualified => "lead_qualified",
        SessionOutcome::Informational => "informational",
        SessionOutcome::Transferred => "transferred",
        SessionOutcome::NoAnswer => "no_answer",
        SessionOutcome::Error => "error",
    }
}

const SESSION_COLUMNS: &str = "tenant_id, id, agent_id, caller_id, language, state, outcome, \
     started_at, ended_at, turn_count, failure_count";

#[async_trait]
impl SessionStore for ScyllaSessionStore {
    async fn upsert(&self, session: &VoiceSession) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO {}.voice_sessions ({SESSION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &session.tenant_id,
                    &session.id,
                    &session.agent_id,
                    &session.caller_id,
                    &session.language,
                    session.state.to_string(),
                    session.outcome.map(outcome_str),
                    session.started_at.timestamp_millis(),
                    session.ended_at.map(|t| t.timestamp_millis()),
                    session.turn_count as i32,
                    session.failure_count as i32,
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<VoiceSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM {}.voice_sessions WHERE tenant_id = ? AND id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, id))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                return Ok(Some(Self::row_to_session(row)?));
            }
        }
        Ok(None)
    }

    async fn list_by_tenant(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<VoiceSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM {}.voice_sessions WHERE tenant_id = ? LIMIT ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, limit as i32))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut sessions = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                sessions.push(Self::row_to_session(row)?);
            }
        }
        Ok(sessions)
    }
}

#[derive(Clone)]
pub struct ScyllaTurnStore {
    client: ScyllaClient,
}

impl ScyllaTurnStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn row_to_turn(row: scylla::frame::response::result::Row) -> StoreResult<ConversationTurn> {
        let (session_id, sequence, id, tenant_id, direction, kind, content, audio_ref, processing_ms, created_at): (
            String,
            i32,
            String,
            String,
            String,
            String,
            String,
            Option<String>,
            Option<i64>,
            i64,
        ) = row
            .into_typed()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(ConversationTurn {
            id,
            session_id,
            tenant_id,
            sequence: sequence.max(0) as u32,
            direction: if direction == "inbound" {
                TurnDirection::Inbound
            } else {
                TurnDirection::Outbound
            },
            kind: match kind.as_str() {
                "speech" => TurnKind::Speech,
                "transfer" => TurnKind::Transfer,
                "schedule" => TurnKind::Schedule,
                _ => TurnKind::SystemEvent,
            },
            content,
            audio_ref,
            processing_ms: processing_ms.map(|v| v.max(0) as u64),
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl TurnStore for ScyllaTurnStore {
    async fn append(&self, turn: &ConversationTurn) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO {}.conversation_turns \
             (session_id, sequence, id, tenant_id, direction, kind, content, \
              audio_ref, processing_ms, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS",
            self.client.keyspace()
        );
        let direction = match turn.direction {
            TurnDirection::Inbound => "inbound",
            TurnDirection::Outbound => "outbound",
        };
        let kind = match turn.kind {
            TurnKind::Speech => "speech",
            TurnKind::SystemEvent => "system_event",
            TurnKind::Transfer => "transfer",
            TurnKind::Schedule => "schedule",
        };

        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &turn.session_id,
                    turn.sequence as i32,
                    &turn.id,
                    &turn.tenant_id,
                    direction,
                    kind,
                    &turn.content,
                    &turn.audio_ref,
                    turn.processing_ms.map(|v| v as i64),
                    turn.created_at.timestamp_millis(),
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str) -> StoreResult<Vec<ConversationTurn>> {
        let query = format!(
            "SELECT session_id, sequence, id, tenant_id, direction, kind, content, \
             audio_ref, processing_ms, created_at \
             FROM {}.conversation_turns WHERE session_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (session_id,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut turns = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                turns.push(Self::row_to_turn(row)?);
            }
        }
        Ok(turns)
    }

    async fn count(&self, session_id: &str) -> StoreResult<u32> {
        let query = format!(
            "SELECT COUNT(*) FROM {}.conversation_turns WHERE session_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (session_id,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let count: i64 = result
            .rows
            .and_then(|rows| rows.into_iter().next())
            .map(|row| row.into_typed::<(i64,)>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?
            .map(|(c,)| c)
            .unwrap_or(0);
        Ok(count.max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(session_id: &str, sequence: u32) -> ConversationTurn {
        ConversationTurn {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            tenant_id: "t-1".into(),
            sequence,
            direction: TurnDirection::Inbound,
            kind: TurnKind::Speech,
            content: "hello".into(),
            audio_ref: None,
            processing_ms: Some(42),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn turn_count_matches_max_sequence() {
        let store = InMemoryTurnStore::new();
        for seq in 1..=5 {
            store.append(&turn("s-1", seq)).await.unwrap();
        }
        let turns = store.list_by_session("s-1").await.unwrap();
        assert_eq!(store.count("s-1").await.unwrap(), 5);
        assert_eq!(turns.last().unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn sequence_gaps_are_rejected() {
        let store = InMemoryTurnStore::new();
        store.append(&turn("s-1", 1)).await.unwrap();
        assert!(store.append(&turn("s-1", 3)).await.is_err());
        // Duplicate sequence is also a conflict.
        assert!(store.append(&turn("s-1", 1)).await.is_err());
    }

    #[tokio::test]
    async fn session_round_trip() {
        let store = InMemorySessionStore::new();
        let session = VoiceSession::new("t-1", "ag-1", "+15550100", "en");
        store.upsert(&session).await.unwrap();
        let loaded = store.get("t-1", &session.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Initiated);
    }
}
