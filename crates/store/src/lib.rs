//! Storage layer for voxgate
//!
//! Two write paths, kept explicit:
//! - The **durable gateway** (ScyllaDB) is the source of truth: tenants,
//!   principals, credentials, agents, sessions, turns, the usage ledger,
//!   invoices, the audit log, webhook subscribers and pregeneration jobs.
//! - The **counter store** (in-memory or Redis) answers live limit
//!   decisions; it is rebuilt from the ledger by reconciliation.
//!
//! Every entity store is a trait with an in-memory implementation for
//! development/tests and a ScyllaDB implementation for production.

pub mod agents;
pub mod audit;
pub mod client;
pub mod counter;
pub mod credentials;
pub mod error;
pub mod invoices;
pub mod jobs;
pub mod principals;
#[cfg(feature = "redis")]
pub mod redis;
pub mod schema;
pub mod sessions;
pub mod tenants;
pub mod usage_events;
pub mod webhooks;

pub use agents::{AgentStore, InMemoryAgentStore, ScyllaAgentStore};
pub use audit::{AuditStore, InMemoryAuditStore, ScyllaAuditStore};
pub use client::{ScyllaClient, ScyllaConfig};
pub use counter::{
    keys, CounterBatch, CounterOp, CounterStore, InMemoryCounterStore, RetryingCounterStore,
};
pub use credentials::{CredentialStore, InMemoryCredentialStore, ScyllaCredentialStore};
pub use error::{StoreError, StoreResult};
pub use invoices::{InMemoryInvoiceStore, InvoiceStore, ScyllaInvoiceStore};
pub use jobs::{InMemoryJobStore, JobStore, ScyllaJobStore};
pub use principals::{InMemoryPrincipalStore, PrincipalStore, ScyllaPrincipalStore};
#[cfg(feature = "redis")]
pub use redis::RedisCounterStore;
pub use sessions::{
    InMemorySessionStore, InMemoryTurnStore, ScyllaSessionStore, ScyllaTurnStore, SessionStore,
    TurnStore,
};
pub use tenants::{InMemoryTenantStore, ScyllaTenantStore, TenantStore};
pub use usage_events::{InMemoryUsageLedger, ScyllaUsageLedger, UsageLedger};
pub use webhooks::{InMemorySubscriberStore, ScyllaSubscriberStore, SubscriberStore};

use std::sync::Arc;

/// Combined storage layer with all entity stores.
#[derive(Clone)]
pub struct StorageLayer {
    pub tenants: Arc<dyn TenantStore>,
    pub principals: Arc<dyn PrincipalStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub agents: Arc<dyn AgentStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub turns: Arc<dyn TurnStore>,
    pub usage: Arc<dyn UsageLedger>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub audit: Arc<dyn AuditStore>,
    pub subscribers: Arc<dyn SubscriberStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl StorageLayer {
    /// All stores in memory; for development and tests.
    pub fn in_memory() -> Self {
        let audit: Arc<dyn AuditStore> = Arc::new(InMemoryAuditStore::new());
        Self {
            tenants: Arc::new(InMemoryTenantStore::new()),
            principals: Arc::new(InMemoryPrincipalStore::new()),
            credentials: Arc::new(InMemoryCredentialStore::new()),
            agents: Arc::new(InMemoryAgentStore::new()),
            sessions: Arc::new(InMemorySessionStore::new()),
            turns: Arc::new(InMemoryTurnStore::new()),
            usage: Arc::new(InMemoryUsageLedger::new(audit.clone())),
            invoices: Arc::new(InMemoryInvoiceStore::new()),
            audit,
            subscribers: Arc::new(InMemorySubscriberStore::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
        }
    }

    /// Connect to ScyllaDB and ensure the schema exists.
    pub async fn scylla(config: ScyllaConfig) -> StoreResult<Self> {
        let client = ScyllaClient::connect(config).await?;
        client.ensure_schema().await?;

        Ok(Self {
            tenants: Arc::new(ScyllaTenantStore::new(client.clone())),
            principals: Arc::new(ScyllaPrincipalStore::new(client.clone())),
            credentials: Arc::new(ScyllaCredentialStore::new(client.clone())),
            agents: Arc::new(ScyllaAgentStore::new(client.clone())),
            sessions: Arc::new(ScyllaSessionStore::new(client.clone())),
            turns: Arc::new(ScyllaTurnStore::new(client.clone())),
            usage: Arc::new(ScyllaUsageLedger::new(client.clone())),
            invoices: Arc::new(ScyllaInvoiceStore::new(client.clone())),
            audit: Arc::new(ScyllaAuditStore::new(client.clone())),
            subscribers: Arc::new(ScyllaSubscriberStore::new(client.clone())),
            jobs: Arc::new(ScyllaJobStore::new(client)),
        })
    }
}
