//! ScyllaDB schema creation.
//!
//! DDL is idempotent; `create_tables` runs at startup. Audit rows carry a
//! 7-year default TTL (regulatory retention floor); shorter-lived rows
//! override TTL per write.

use scylla::Session;

use crate::error::{StoreError, StoreResult};

/// Create the keyspace if it doesn't exist.
pub async fn create_keyspace(
    session: &Session,
    keyspace: &str,
    replication_factor: u8,
) -> StoreResult<()> {
    let query = format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        keyspace, replication_factor
    );

    session
        .query_unpaged(query, &[])
        .await
        .map_err(|e| StoreError::Schema(format!("failed to create keyspace: {}", e)))?;

    Ok(())
}

/// Create all required tables.
pub async fn create_tables(session: &Session, keyspace: &str) -> StoreResult<()> {
    let tables: Vec<(&str, String)> = vec![
        (
            "tenants",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.tenants (
            id TEXT,
            slug TEXT,
            name TEXT,
            status TEXT,
            tier TEXT,
            allowed_networks LIST<TEXT>,
            maintenance_mode BOOLEAN,
            currency TEXT,
            discount_rate DOUBLE,
            created_at TIMESTAMP,
            updated_at TIMESTAMP,
            PRIMARY KEY (id)
        )
    "#,
                ks = keyspace
            ),
        ),
        (
            "tenants_by_slug",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.tenants_by_slug (
            slug TEXT,
            id TEXT,
            PRIMARY KEY (slug)
        )
    "#,
                ks = keyspace
            ),
        ),
        (
            "principals",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.principals (
            tenant_id TEXT,
            email TEXT,
            id TEXT,
            display_name TEXT,
            role TEXT,
            extra_permissions LIST<TEXT>,
            password_hash TEXT,
            mfa_enrolled BOOLEAN,
            active BOOLEAN,
            failed_login_attempts INT,
            locked_until TIMESTAMP,
            last_login_at TIMESTAMP,
            last_login_network TEXT,
            created_at TIMESTAMP,
            PRIMARY KEY ((tenant_id), email)
        )
    "#,
                ks = keyspace
            ),
        ),
        (
            "api_credentials",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.api_credentials (
            key_hash TEXT,
            id TEXT,
            tenant_id TEXT,
            name TEXT,
            key_prefix TEXT,
            scopes LIST<TEXT>,
            status TEXT,
            allowed_networks LIST<TEXT>,
            rate_limit_per_hour INT,
            rate_limit_per_day INT,
            expires_at TIMESTAMP,
            last_used_at TIMESTAMP,
            created_at TIMESTAMP,
            rotated_at TIMESTAMP,
            revoked_at TIMESTAMP,
            revocation_reason TEXT,
            PRIMARY KEY (key_hash)
        )
    "#,
                ks = keyspace
            ),
        ),
        (
            "api_credentials_by_tenant",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.api_credentials_by_tenant (
            tenant_id TEXT,
            id TEXT,
            key_hash TEXT,
            PRIMARY KEY ((tenant_id), id)
        )
    "#,
                ks = keyspace
            ),
        ),
        (
            "voice_agents",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.voice_agents (
            tenant_id TEXT,
            id TEXT,
            config_json TEXT,
            total_sessions BIGINT,
            completed_sessions BIGINT,
            total_duration_secs BIGINT,
            updated_at TIMESTAMP,
            PRIMARY KEY ((tenant_id), id)
        )
    "#,
                ks = keyspace
            ),
        ),
        (
            "voice_sessions",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.voice_sessions (
            tenant_id TEXT,
            id TEXT,
            agent_id TEXT,
            caller_id TEXT,
            language TEXT,
            state TEXT,
            outcome TEXT,
            started_at TIMESTAMP,
            ended_at TIMESTAMP,
            turn_count INT,
            failure_count INT,
            PRIMARY KEY ((tenant_id), id)
        )
    "#,
                ks = keyspace
            ),
        ),
        (
            "conversation_turns",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.conversation_turns (
            session_id TEXT,
            sequence INT,
            id TEXT,
            tenant_id TEXT,
            direction TEXT,
            kind TEXT,
            content TEXT,
            audio_ref TEXT,
            processing_ms BIGINT,
            created_at TIMESTAMP,
            PRIMARY KEY ((session_id), sequence)
        ) WITH CLUSTERING ORDER BY (sequence ASC)
    "#,
                ks = keyspace
            ),
        ),
        (
            "usage_events",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.usage_events (
            tenant_id TEXT,
            billing_period TEXT,
            recorded_at TIMESTAMP,
            id TEXT,
            metric TEXT,
            quantity DOUBLE,
            unit TEXT,
            cost TEXT,
            metadata_json TEXT,
            PRIMARY KEY ((tenant_id, billing_period), recorded_at, id)
        ) WITH CLUSTERING ORDER BY (recorded_at DESC, id DESC)
    "#,
                ks = keyspace
            ),
        ),
        (
            "billing_totals",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.billing_totals (
            tenant_id TEXT,
            billing_period TEXT,
            total_micros COUNTER,
            PRIMARY KEY ((tenant_id), billing_period)
        )
    "#,
                ks = keyspace
            ),
        ),
        (
            "invoices",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.invoices (
            tenant_id TEXT,
            period TEXT,
            id TEXT,
            invoice_json TEXT,
            status TEXT,
            updated_at TIMESTAMP,
            PRIMARY KEY ((tenant_id), period)
        )
    "#,
                ks = keyspace
            ),
        ),
        // 7 year default retention for the audit log.
        (
            "audit_log",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.audit_log (
            tenant_id TEXT,
            partition_date TEXT,
            recorded_at TIMESTAMP,
            id TEXT,
            kind TEXT,
            severity TEXT,
            outcome TEXT,
            principal_id TEXT,
            source_network TEXT,
            correlation_id TEXT,
            action TEXT,
            details TEXT,
            before_json TEXT,
            after_json TEXT,
            PRIMARY KEY ((tenant_id, partition_date), recorded_at, id)
        ) WITH CLUSTERING ORDER BY (recorded_at DESC, id DESC)
        AND default_time_to_live = 220752000
    "#,
                ks = keyspace
            ),
        ),
        (
            "webhook_subscribers",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.webhook_subscribers (
            tenant_id TEXT,
            id TEXT,
            subscriber_json TEXT,
            status TEXT,
            updated_at TIMESTAMP,
            PRIMARY KEY ((tenant_id), id)
        )
    "#,
                ks = keyspace
            ),
        ),
        (
            "pregen_jobs",
            format!(
                r#"
        CREATE TABLE IF NOT EXISTS {ks}.pregen_jobs (
            tenant_id TEXT,
            id TEXT,
            agent_id TEXT,
            language TEXT,
            texts LIST<TEXT>,
            checkpoint INT,
            status TEXT,
            created_at TIMESTAMP,
            updated_at TIMESTAMP,
            PRIMARY KEY ((tenant_id), id)
        )
    "#,
                ks = keyspace
            ),
        ),
    ];

    for (name, ddl) in tables {
        session
            .query_unpaged(ddl, &[])
            .await
            .map_err(|e| StoreError::Schema(format!("failed to create {name} table: {e}")))?;
    }

    tracing::info!("all tables created");
    Ok(())
}
