//! ScyllaDB connection management.
//!
//! Startup is the only place the durable store gets retried in a loop:
//! a cluster mid-rolling-restart answers within a few doubling backoffs,
//! while a real outage exhausts the attempt budget and the caller falls
//! back to in-memory storage. After that, per-call failures surface as
//! `StoreError::Unavailable` and the recorder's circuit breaker takes
//! over — the client itself never retries a query.

use std::sync::Arc;
use std::time::Duration;

use scylla::statement::Consistency;
use scylla::transport::load_balancing::DefaultPolicy;
use scylla::transport::ExecutionProfile;
use scylla::{Session, SessionBuilder};

use crate::error::{StoreError, StoreResult};
use crate::schema;

/// ScyllaDB configuration.
#[derive(Debug, Clone)]
pub struct ScyllaConfig {
    pub hosts: Vec<String>,
    pub keyspace: String,
    pub replication_factor: u8,
    /// Prefer coordinators in this datacenter; switches reads and writes
    /// to LOCAL_QUORUM so a remote DC outage doesn't stall the ledger.
    pub datacenter: Option<String>,
    /// Per-node TCP connect timeout.
    pub connect_timeout: Duration,
    /// Startup attempts before giving up on the cluster entirely.
    pub connect_attempts: u32,
}

impl Default for ScyllaConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:9042".to_string()],
            keyspace: "voxgate".to_string(),
            replication_factor: 1,
            datacenter: None,
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 4,
        }
    }
}

impl ScyllaConfig {
    /// Consistency the entity stores run at. Usage events and audit rows
    /// are the billing source of truth, so quorum is the floor; with a
    /// preferred datacenter the quorum stays local.
    pub fn consistency(&self) -> Consistency {
        if self.datacenter.is_some() {
            Consistency::LocalQuorum
        } else {
            Consistency::Quorum
        }
    }
}

/// Shared handle the entity stores query through.
#[derive(Clone)]
pub struct ScyllaClient {
    session: Arc<Session>,
    config: ScyllaConfig,
}

impl ScyllaClient {
    /// Connect with bounded, backed-off attempts, then verify the
    /// cluster actually answers a read before declaring it healthy.
    pub async fn connect(config: ScyllaConfig) -> StoreResult<Self> {
        let attempts = config.connect_attempts.max(1);
        let mut delay = Duration::from_millis(500);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = match Self::try_connect(&config).await {
                Ok(session) => probe(&session).await.map(|_| session),
                Err(e) => Err(e),
            };
            match result {
                Ok(session) => {
                    tracing::info!(
                        hosts = ?config.hosts,
                        keyspace = %config.keyspace,
                        datacenter = config.datacenter.as_deref(),
                        consistency = ?config.consistency(),
                        attempt,
                        "scylla cluster ready"
                    );
                    return Ok(Self {
                        session: Arc::new(session),
                        config,
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        tracing::warn!(
                            attempt,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "scylla not ready, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(StoreError::Unavailable(format!(
            "scylla unreachable after {attempts} attempts: {last_error}"
        )))
    }

    async fn try_connect(config: &ScyllaConfig) -> StoreResult<Session> {
        let mut policy = DefaultPolicy::builder();
        if let Some(dc) = &config.datacenter {
            policy = policy.prefer_datacenter(dc.clone());
        }
        let profile = ExecutionProfile::builder()
            .load_balancing_policy(policy.build())
            .consistency(config.consistency())
            .build();

        SessionBuilder::new()
            .known_nodes(&config.hosts)
            .connection_timeout(config.connect_timeout)
            .default_execution_profile_handle(profile.into_handle())
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Create the keyspace and tables, then wait for schema agreement so
    /// the entity stores never race freshly-issued DDL on another node.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        schema::create_keyspace(
            &self.session,
            &self.config.keyspace,
            self.config.replication_factor,
        )
        .await?;
        schema::create_tables(&self.session, &self.config.keyspace).await?;

        self.session
            .await_schema_agreement()
            .await
            .map_err(|e| StoreError::Schema(format!("schema agreement: {e}")))?;

        tracing::info!(keyspace = %self.config.keyspace, "schema ensured and agreed");
        Ok(())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn keyspace(&self) -> &str {
        &self.config.keyspace
    }
}

/// A half-open cluster accepts connections but can't serve reads;
/// round-trip a trivial query so startup treats it as not ready.
async fn probe(session: &Session) -> StoreResult<()> {
    session
        .query_unpaged("SELECT release_version FROM system.local", &[])
        .await
        .map(|_| ())
        .map_err(|e| StoreError::Unavailable(format!("liveness probe failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_goes_local_with_a_preferred_datacenter() {
        let mut config = ScyllaConfig::default();
        assert_eq!(config.consistency(), Consistency::Quorum);
        config.datacenter = Some("dc1".to_string());
        assert_eq!(config.consistency(), Consistency::LocalQuorum);
    }

    #[test]
    fn defaults_allow_at_least_one_attempt() {
        let config = ScyllaConfig::default();
        assert!(config.connect_attempts >= 1);
        assert!(!config.hosts.is_empty());
    }
}
