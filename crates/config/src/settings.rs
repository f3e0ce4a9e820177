//! Main settings module.
//!
//! Settings layer a TOML file under `VOXGATE_*` environment variables via
//! the `config` crate. Every section carries serde defaults so a bare
//! deployment starts with sane values, and `validate()` rejects
//! configurations that cannot work before the server binds.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ConfigError;

/// Runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

/// Main application settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub synthesis_cache: SynthesisCacheConfig,

    #[serde(default)]
    pub counters: CounterConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub billing: BillingConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub providers: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle seconds before a streaming connection is closed.
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_sessions() -> usize {
    500
}
fn default_session_idle_timeout_secs() -> u64 {
    300
}
fn default_cors_origins() -> Vec<String> {
    vec![]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_sessions: default_max_sessions(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            cors_origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_access_token_lifetime_minutes")]
    pub access_token_lifetime_minutes: i64,
    #[serde(default = "default_refresh_token_lifetime_days")]
    pub refresh_token_lifetime_days: i64,
    #[serde(default = "default_max_failed_logins")]
    pub max_failed_logins: u32,
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: i64,
    #[serde(default = "default_login_rate_limit_per_minute")]
    pub login_rate_limit_per_minute: u32,
    /// HS256 shared secret; RS256 key paths take precedence when set.
    #[serde(default)]
    pub token_secret: String,
    #[serde(default)]
    pub rsa_private_key_path: Option<String>,
    #[serde(default)]
    pub rsa_public_key_path: Option<String>,
    /// Root key for the credential vault, hex-encoded 32 bytes.
    #[serde(default)]
    pub vault_root_key_hex: String,
}

fn default_access_token_lifetime_minutes() -> i64 {
    30
}
fn default_refresh_token_lifetime_days() -> i64 {
    7
}
fn default_max_failed_logins() -> u32 {
    5
}
fn default_lockout_minutes() -> i64 {
    15
}
fn default_login_rate_limit_per_minute() -> u32 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token_lifetime_minutes: default_access_token_lifetime_minutes(),
            refresh_token_lifetime_days: default_refresh_token_lifetime_days(),
            max_failed_logins: default_max_failed_logins(),
            lockout_minutes: default_lockout_minutes(),
            login_rate_limit_per_minute: default_login_rate_limit_per_minute(),
            token_secret: String::new(),
            rsa_private_key_path: None,
            rsa_public_key_path: None,
            vault_root_key_hex: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_stt_budget_ms")]
    pub stt_budget_ms: u64,
    #[serde(default = "default_llm_budget_ms")]
    pub llm_budget_ms: u64,
    #[serde(default = "default_tts_budget_ms")]
    pub tts_budget_ms: u64,
    /// Hard cap on a whole turn; past this the fallback message wins.
    #[serde(default = "default_total_turn_hard_cap_ms")]
    pub total_turn_hard_cap_ms: u64,
    /// Pipeline failures tolerated per session before it is failed.
    #[serde(default = "default_max_turn_failures")]
    pub max_turn_failures: u32,
}

fn default_stt_budget_ms() -> u64 {
    50
}
fn default_llm_budget_ms() -> u64 {
    100
}
fn default_tts_budget_ms() -> u64 {
    80
}
fn default_total_turn_hard_cap_ms() -> u64 {
    2000
}
fn default_max_turn_failures() -> u32 {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stt_budget_ms: default_stt_budget_ms(),
            llm_budget_ms: default_llm_budget_ms(),
            tts_budget_ms: default_tts_budget_ms(),
            total_turn_hard_cap_ms: default_total_turn_hard_cap_ms(),
            max_turn_failures: default_max_turn_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisCacheConfig {
    #[serde(default = "default_cache_capacity_bytes")]
    pub capacity_bytes: u64,
    #[serde(default = "default_cache_entry_ttl_secs")]
    pub entry_ttl_secs: u64,
}

fn default_cache_capacity_bytes() -> u64 {
    256 * 1024 * 1024
}
fn default_cache_entry_ttl_secs() -> u64 {
    24 * 3600
}

impl Default for SynthesisCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: default_cache_capacity_bytes(),
            entry_ttl_secs: default_cache_entry_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    #[serde(default = "default_counter_day_ttl_secs")]
    pub day_ttl_secs: u64,
    #[serde(default = "default_counter_month_ttl_secs")]
    pub month_ttl_secs: u64,
    /// Interval for rebuilding counters from durable events.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

fn default_counter_day_ttl_secs() -> u64 {
    7 * 24 * 3600
}
fn default_counter_month_ttl_secs() -> u64 {
    13 * 30 * 24 * 3600
}
fn default_reconcile_interval_secs() -> u64 {
    900
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            day_ttl_secs: default_counter_day_ttl_secs(),
            month_ttl_secs: default_counter_month_ttl_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_webhook_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    /// Net failures before a subscriber is disabled.
    #[serde(default = "default_webhook_failure_disable_threshold")]
    pub failure_disable_threshold: u32,
    #[serde(default = "default_webhook_in_flight_cap")]
    pub in_flight_cap: usize,
}

fn default_webhook_max_attempts() -> u32 {
    3
}
fn default_webhook_retry_delay_secs() -> u64 {
    60
}
fn default_webhook_timeout_secs() -> u64 {
    30
}
fn default_webhook_failure_disable_threshold() -> u32 {
    10
}
fn default_webhook_in_flight_cap() -> usize {
    4
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_webhook_max_attempts(),
            retry_delay_secs: default_webhook_retry_delay_secs(),
            timeout_secs: default_webhook_timeout_secs(),
            failure_disable_threshold: default_webhook_failure_disable_threshold(),
            in_flight_cap: default_webhook_in_flight_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Flat tax rate applied at invoicing, e.g. 0.08 for 8%.
    #[serde(default = "default_tax_rate")]
    pub tax_rate: f64,
}

fn default_tax_rate() -> f64 {
    0.08
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            tax_rate: default_tax_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Enable ScyllaDB persistence (false = in-memory only).
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_scylla_hosts")]
    pub scylla_hosts: Vec<String>,
    #[serde(default = "default_scylla_keyspace")]
    pub keyspace: String,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u8,
    /// Preferred ScyllaDB datacenter for multi-DC clusters.
    #[serde(default)]
    pub scylla_datacenter: Option<String>,
    /// Redis URL for the counter store; empty = in-memory counters.
    #[serde(default)]
    pub redis_url: String,
}

fn default_scylla_hosts() -> Vec<String> {
    std::env::var("SCYLLA_HOSTS")
        .map(|s| s.split(',').map(|h| h.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["127.0.0.1:9042".to_string()])
}

fn default_scylla_keyspace() -> String {
    std::env::var("SCYLLA_KEYSPACE").unwrap_or_else(|_| "voxgate".to_string())
}

fn default_replication_factor() -> u8 {
    1
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scylla_hosts: default_scylla_hosts(),
            keyspace: default_scylla_keyspace(),
            replication_factor: default_replication_factor(),
            scylla_datacenter: None,
            redis_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub stt_endpoint: String,
    #[serde(default)]
    pub llm_endpoint: String,
    #[serde(default)]
    pub tts_endpoint: String,
    #[serde(default)]
    pub provider_api_key: String,
    /// Per-call timeout for provider round-trips.
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_provider_timeout_ms() -> u64 {
    5000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            stt_endpoint: String::new(),
            llm_endpoint: String::new(),
            tts_endpoint: String::new(),
            provider_api_key: String::new(),
            timeout_ms: default_provider_timeout_ms(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file (optional) layered under `VOXGATE_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(Environment::with_prefix("VOXGATE").separator("__"))
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_pipeline()?;
        self.validate_auth()?;
        self.validate_webhook()?;
        Ok(())
    }

    fn validate_pipeline(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.total_turn_hard_cap_ms < 200 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.total_turn_hard_cap_ms".to_string(),
                message: "hard cap too low (minimum 200ms)".to_string(),
            });
        }
        if p.total_turn_hard_cap_ms > 10_000 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.total_turn_hard_cap_ms".to_string(),
                message: "hard cap too high (maximum 10000ms)".to_string(),
            });
        }
        let soft_total = p.stt_budget_ms + p.llm_budget_ms + p.tts_budget_ms;
        if soft_total > p.total_turn_hard_cap_ms {
            return Err(ConfigError::InvalidValue {
                field: "pipeline".to_string(),
                message: format!(
                    "stage budgets ({soft_total}ms) exceed the hard cap ({}ms)",
                    p.total_turn_hard_cap_ms
                ),
            });
        }
        Ok(())
    }

    fn validate_auth(&self) -> Result<(), ConfigError> {
        let a = &self.auth;
        if a.access_token_lifetime_minutes <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "auth.access_token_lifetime_minutes".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if a.refresh_token_lifetime_days <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "auth.refresh_token_lifetime_days".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.environment.is_strict() {
            let has_hs = !a.token_secret.is_empty();
            let has_rs = a.rsa_private_key_path.is_some() && a.rsa_public_key_path.is_some();
            if !has_hs && !has_rs {
                return Err(ConfigError::InvalidValue {
                    field: "auth.token_secret".to_string(),
                    message: "a signing secret or RSA key pair is required outside development"
                        .to_string(),
                });
            }
            if a.vault_root_key_hex.len() != 64 {
                return Err(ConfigError::InvalidValue {
                    field: "auth.vault_root_key_hex".to_string(),
                    message: "must be 32 bytes hex-encoded".to_string(),
                });
            }
        }
        Ok(())
    }

    fn validate_webhook(&self) -> Result<(), ConfigError> {
        if self.webhook.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "webhook.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
