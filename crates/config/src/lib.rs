//! Configuration for voxgate: layered settings, tier defaults, pricing.

pub mod pricing;
pub mod settings;
pub mod tiers;

pub use pricing::{builtin_pricing, PriceEntry, PricingTable};
pub use settings::{
    AuthConfig, BillingConfig, CounterConfig, PersistenceConfig, PipelineConfig, ProviderConfig,
    RuntimeEnvironment, ServerConfig, Settings, SynthesisCacheConfig, WebhookConfig,
};
pub use tiers::{builtin_tiers, MetricLimits, TierDefaults, TierFeatures, TierTable};

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
