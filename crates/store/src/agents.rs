//! Voice agent persistence. The agent configuration travels as one JSON
//! document; session statistics are denormalized columns so completion
//! updates don't rewrite the whole config.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use voxgate_core::VoiceAgent;

use crate::client::ScyllaClient;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<VoiceAgent>>;
    async fn upsert(&self, agent: &VoiceAgent) -> StoreResult<()>;
    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<VoiceAgent>>;
    /// Fold one finished session into the agent's rolling stats.
    async fn record_session(
        &self,
        tenant_id: &str,
        id: &str,
        completed: bool,
        duration_secs: u64,
    ) -> StoreResult<()>;
}

#[derive(Default)]
pub struct InMemoryAgentStore {
    agents: RwLock<HashMap<(String, String), VoiceAgent>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<VoiceAgent>> {
        Ok(self
            .agents
            .read()
            .get(&(tenant_id.to_string(), id.to_string()))
            .cloned())
    }

    async fn upsert(&self, agent: &VoiceAgent) -> StoreResult<()> {
        self.agents
            .write()
            .insert((agent.tenant_id.clone(), agent.id.clone()), agent.clone());
        Ok(())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<VoiceAgent>> {
        Ok(self
            .agents
            .read()
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn record_session(
        &self,
        tenant_id: &str,
        id: &str,
        completed: bool,
        duration_secs: u64,
    ) -> StoreResult<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(&(tenant_id.to_string(), id.to_string()))
            .ok_or_else(|| StoreError::not_found("voice_agent"))?;
        agent.stats.record_session(completed, duration_secs);
        agent.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Clone)]
pub struct ScyllaAgentStore {
    client: ScyllaClient,
}

impl ScyllaAgentStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn row_to_agent(row: scylla::frame::response::result::Row) -> StoreResult<VoiceAgent> {
        let (config_json, total_sessions, completed_sessions, total_duration_secs): (
            String,
            i64,
            i64,
            i64,
        ) = row
            .into_typed()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let mut agent: VoiceAgent = serde_json::from_str(&config_json)
            .map_err(|e| StoreError::Corrupt(format!("agent config: {e}")))?;
        agent.stats.total_sessions = total_sessions.max(0) as u64;
        agent.stats.completed_sessions = completed_sessions.max(0) as u64;
        agent.stats.total_duration_secs = total_duration_secs.max(0) as u64;
        Ok(agent)
    }
}

#[async_trait]
impl AgentStore for ScyllaAgentStore {
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<VoiceAgent>> {
        let query = format!(
            "SELECT config_json, total_sessions, completed_sessions, total_duration_secs \
             FROM {}.voice_agents WHERE tenant_id = ? AND id = ?",
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
                return Ok(Some(Self::row_to_agent(row)?));
            }
        }
        Ok(None)
    }

    async fn upsert(&self, agent: &VoiceAgent) -> StoreResult<()> {
        let config_json = serde_json::to_string(agent)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let query = format!(
            "INSERT INTO {}.voice_agents \
             (tenant_id, id, config_json, total_sessions, completed_sessions, \
              total_duration_secs, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &agent.tenant_id,
                    &agent.id,
                    config_json,
                    agent.stats.total_sessions as i64,
                    agent.stats.completed_sessions as i64,
                    agent.stats.total_duration_secs as i64,
                    Utc::now().timestamp_millis(),
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> StoreResult<Vec<VoiceAgent>> {
        let query = format!(
            "SELECT config_json, total_sessions, completed_sessions, total_duration_secs \
             FROM {}.voice_agents WHERE tenant_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id,))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut agents = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                agents.push(Self::row_to_agent(row)?);
            }
        }
        Ok(agents)
    }

    async fn record_session(
        &self,
        tenant_id: &str,
        id: &str,
        completed: bool,
        duration_secs: u64,
    ) -> StoreResult<()> {
        let mut agent = self
            .get(tenant_id, id)
            .await?
            .ok_or_else(|| StoreError::not_found("voice_agent"))?;
        agent.stats.record_session(completed, duration_secs);
        agent.updated_at = Utc::now();
        self.upsert(&agent).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stats_accumulate_across_sessions() {
        let store = InMemoryAgentStore::new();
        let agent = VoiceAgent::new("t-1", "Front desk", "voice-a");
        store.upsert(&agent).await.unwrap();

        store.record_session("t-1", &agent.id, true, 90).await.unwrap();
        store.record_session("t-1", &agent.id, false, 10).await.unwrap();

        let stored = store.get("t-1", &agent.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.total_sessions, 2);
        assert_eq!(stored.stats.completed_sessions, 1);
        assert_eq!(stored.stats.total_duration_secs, 100);
    }

    #[tokio::test]
    async fn unknown_agent_stats_update_fails() {
        let store = InMemoryAgentStore::new();
        assert!(store.record_session("t-1", "nope", true, 1).await.is_err());
    }
}
