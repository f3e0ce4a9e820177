//! Append-only audit log persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use voxgate_core::{AuditKind, AuditOutcome, AuditRecord, AuditSeverity};

use crate::client::ScyllaClient;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> StoreResult<()>;
    async fn list_recent(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AuditRecord>>;
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: every record for a tenant, oldest first.
    pub fn all_for_tenant(&self, tenant_id: &str) -> Vec<AuditRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, record: &AuditRecord) -> StoreResult<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn list_recent(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AuditRecord>> {
        let records = self.records.read();
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Clone)]
pub struct ScyllaAuditStore {
    client: ScyllaClient,
}

impl ScyllaAuditStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    pub(crate) fn insert_cql(keyspace: &str) -> String {
        format!(
            "INSERT INTO {keyspace}.audit_log \
             (tenant_id, partition_date, recorded_at, id, kind, severity, outcome, \
              principal_id, source_network, correlation_id, action, details, \
              before_json, after_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) USING TTL ?"
        )
    }

    pub(crate) fn bind_values(
        record: &AuditRecord,
    ) -> (
        String,
        String,
        i64,
        String,
        &'static str,
        &'static str,
        &'static str,
        Option<String>,
        Option<String>,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        i32,
    ) {
        (
            record.tenant_id.clone(),
            record.recorded_at.format("%Y-%m-%d").to_string(),
            record.recorded_at.timestamp_millis(),
            record.id.clone(),
            record.kind.as_str(),
            severity_str(record.severity),
            outcome_str(record.outcome),
            record.principal_id.clone(),
            record.source_network.clone(),
            record.correlation_id.clone(),
            record.action.clone(),
            record.details.to_string(),
            record.before.as_ref().map(|v| v.to_string()),
            record.after.as_ref().map(|v| v.to_string()),
            record.retention_secs() as i32,
        )
    }
}

fn severity_str(s: AuditSeverity) -> &'static str {
    match s {
        AuditSeverity::Info => "info",
        AuditSeverity::Medium => "medium",
        AuditSeverity::High => "high",
        AuditSeverity::Critical => "critical",
    }
}

fn outcome_str(o: AuditOutcome) -> &'static str {
    match o {
        AuditOutcome::Success => "success",
        AuditOutcome::Failure => "failure",
        AuditOutcome::Denied => "denied",
    }
}

fn parse_kind(s: &str) -> AuditKind {
    match s {
        "api_call" => AuditKind::ApiCall,
        "login_success" => AuditKind::LoginSuccess,
        "login_failure" => AuditKind::LoginFailure,
        "token_revoked" => AuditKind::TokenRevoked,
        "limit_exceeded" => AuditKind::LimitExceeded,
        "limit_warning" => AuditKind::LimitWarning,
        "credential_rotated" => AuditKind::CredentialRotated,
        "session_event" => AuditKind::SessionEvent,
        "counter_unavailable" => AuditKind::CounterUnavailable,
        _ => AuditKind::DataUpdate,
    }
}

#[async_trait]
impl AuditStore for ScyllaAuditStore {
    async fn append(&self, record: &AuditRecord) -> StoreResult<()> {
        let query = Self::insert_cql(self.client.keyspace());
        self.client
            .session()
            .query_unpaged(query, Self::bind_values(record))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_recent(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AuditRecord>> {
        // Today's partition; older partitions need an explicit date walk.
        let partition_date = Utc::now().format("%Y-%m-%d").to_string();
        let query = format!(
            "SELECT tenant_id, recorded_at, id, kind, severity, outcome, principal_id, \
             source_network, correlation_id, action, details, before_json, after_json \
             FROM {}.audit_log WHERE tenant_id = ? AND partition_date = ? LIMIT ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, partition_date, limit as i32))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut records = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (
                    tenant_id,
                    recorded_at,
                    id,
                    kind,
                    severity,
                    outcome,
                    principal_id,
                    source_network,
                    correlation_id,
                    action,
                    details,
                    before_json,
                    after_json,
                ): (
                    String,
                    i64,
                    String,
                    String,
                    String,
                    String,
                    Option<String>,
                    Option<String>,
                    String,
                    String,
                    String,
                    Option<String>,
                    Option<String>,
                ) = row
                    .into_typed()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;

                records.push(AuditRecord {
                    id,
                    tenant_id,
                    kind: parse_kind(&kind),
                    severity: match severity.as_str() {
                        "critical" => AuditSeverity::Critical,
                        "high" => AuditSeverity::High,
                        "medium" => AuditSeverity::Medium,
                        _ => AuditSeverity::Info,
                    },
                    outcome: match outcome.as_str() {
                        "failure" => AuditOutcome::Failure,
                        "denied" => AuditOutcome::Denied,
                        _ => AuditOutcome::Success,
                    },
                    principal_id,
                    source_network,
                    correlation_id,
                    action,
                    details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                    before: before_json.and_then(|v| serde_json::from_str(&v).ok()),
                    after: after_json.and_then(|v| serde_json::from_str(&v).ok()),
                    recorded_at: DateTime::from_timestamp_millis(recorded_at)
                        .unwrap_or_else(Utc::now),
                });
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_list() {
        let store = InMemoryAuditStore::new();
        for i in 0..3 {
            let rec = AuditRecord::new(
                "t-1",
                AuditKind::ApiCall,
                AuditSeverity::Info,
                AuditOutcome::Success,
                format!("corr-{i}"),
                "list_sessions",
            );
            store.append(&rec).await.unwrap();
        }
        let recent = store.list_recent("t-1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].correlation_id, "corr-2");
        assert!(store.list_recent("t-2", 10).await.unwrap().is_empty());
    }
}
