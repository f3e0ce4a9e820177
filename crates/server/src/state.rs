//! Shared application state.
//!
//! One `AppState` wires every subsystem together at startup: storage,
//! counters, auth, usage accounting, billing, the voice pipeline, and
//! webhook fan-out. Handlers reach everything through this struct.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use voxgate_auth::{
    ApiKeyManager, CredentialVault, LoginConfig, LoginService, RoleTable, TenantResolver,
    TokenKeys, TokenService,
};
use voxgate_billing::InvoiceBuilder;
use voxgate_config::{PricingTable, Settings, TierTable};
use voxgate_core::{EventSink, LanguageModel, SpeechToText, TextToSpeech};
use voxgate_store::{CounterStore, StorageLayer, TenantStore};
use voxgate_usage::{
    CostCalculator, CounterTtls, QuotaEvaluator, Reconciler, UsageRecorder,
};
use voxgate_voice::{
    PipelineBudgets, PregenConfig, PregenWorkerPool, SessionManagerConfig, SynthesisCache,
    TurnPipeline, VoiceSessionManager,
};
use voxgate_webhook::{DispatcherConfig, SecretCipher, WebhookDispatcher};

/// Provider trio injected at startup.
pub struct Providers {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
}

/// Webhook secrets rest encrypted in the vault; hex framing keeps the
/// sealed value a plain string column.
struct VaultSecretCipher(Arc<CredentialVault>);

impl SecretCipher for VaultSecretCipher {
    fn seal(&self, tenant_id: &str, secret: &str) -> voxgate_core::Result<String> {
        Ok(hex::encode(self.0.wrap(tenant_id, secret.as_bytes())?))
    }

    fn open(&self, tenant_id: &str, sealed: &str) -> voxgate_core::Result<String> {
        let framed = hex::decode(sealed).map_err(|_| {
            voxgate_core::Error::Internal("sealed secret is not hex".to_string())
        })?;
        let plain = self.0.unwrap(tenant_id, &framed)?;
        String::from_utf8(plain)
            .map_err(|_| voxgate_core::Error::Internal("sealed secret is not utf-8".to_string()))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<RwLock<Settings>>,
    pub storage: StorageLayer,
    pub counters: Arc<dyn CounterStore>,
    pub secret_cipher: Arc<dyn SecretCipher>,
    pub tokens: Arc<TokenService>,
    pub roles: RoleTable,
    pub api_keys: Arc<ApiKeyManager>,
    pub resolver: Arc<TenantResolver>,
    pub login: Arc<LoginService>,
    pub recorder: Arc<UsageRecorder>,
    pub quota: Arc<QuotaEvaluator>,
    pub invoices: Arc<InvoiceBuilder>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub sessions: Arc<VoiceSessionManager>,
    pub pregen: Arc<PregenWorkerPool>,
}

impl AppState {
    /// Wire the full application graph from settings, storage, counters
    /// and the provider trio.
    pub fn build(
        settings: Settings,
        storage: StorageLayer,
        counters: Arc<dyn CounterStore>,
        providers: Providers,
        transport: Arc<dyn voxgate_webhook::DeliveryTransport>,
    ) -> Self {
        let roles = RoleTable::builtin();
        let tiers = TierTable::builtin();
        let pricing = PricingTable::builtin();

        let vault = Arc::new(if settings.auth.vault_root_key_hex.is_empty() {
            // Development fallback; strict environments reject this in
            // Settings::validate.
            CredentialVault::new([0u8; 32])
        } else {
            CredentialVault::from_hex(&settings.auth.vault_root_key_hex)
                .expect("vault key validated at startup")
        });

        let token_keys = if settings.auth.token_secret.is_empty() {
            TokenKeys::hmac("voxgate-development-secret")
        } else {
            TokenKeys::hmac(settings.auth.token_secret.clone())
        };
        let tokens = Arc::new(TokenService::new(
            token_keys,
            settings.auth.access_token_lifetime_minutes,
            settings.auth.refresh_token_lifetime_days,
            counters.clone(),
        ));

        let api_keys = Arc::new(ApiKeyManager::new(
            storage.credentials.clone(),
            counters.clone(),
            storage.audit.clone(),
            settings.environment.is_production(),
        ));

        let resolver = Arc::new(TenantResolver::new(
            storage.tenants.clone(),
            storage.principals.clone(),
            storage.audit.clone(),
            tokens.clone(),
            api_keys.clone(),
            roles.clone(),
        ));

        let login = Arc::new(LoginService::new(
            storage.tenants.clone(),
            storage.principals.clone(),
            counters.clone(),
            storage.audit.clone(),
            tokens.clone(),
            roles.clone(),
            LoginConfig {
                max_failed_logins: settings.auth.max_failed_logins,
                lockout_minutes: settings.auth.lockout_minutes,
                rate_limit_per_minute: settings.auth.login_rate_limit_per_minute,
            },
        ));

        let quota = Arc::new(QuotaEvaluator::new(
            counters.clone(),
            storage.audit.clone(),
            tiers,
        ));
        let recorder = Arc::new(UsageRecorder::new(
            storage.usage.clone(),
            counters.clone(),
            storage.audit.clone(),
            quota.clone(),
            CostCalculator::new(pricing),
            CounterTtls {
                day: Duration::from_secs(settings.counters.day_ttl_secs),
                month: Duration::from_secs(settings.counters.month_ttl_secs),
            },
        ));

        let invoices = Arc::new(InvoiceBuilder::new(
            storage.usage.clone(),
            storage.invoices.clone(),
            storage.tenants.clone(),
            settings.billing.tax_rate,
        ));

        let secret_cipher: Arc<dyn SecretCipher> = Arc::new(VaultSecretCipher(vault.clone()));
        let dispatcher = Arc::new(WebhookDispatcher::new(
            storage.subscribers.clone(),
            transport,
            secret_cipher.clone(),
            DispatcherConfig {
                max_attempts: settings.webhook.max_attempts,
                retry_delay: Duration::from_secs(settings.webhook.retry_delay_secs),
                timeout: Duration::from_secs(settings.webhook.timeout_secs),
                failure_disable_threshold: settings.webhook.failure_disable_threshold,
                in_flight_cap: settings.webhook.in_flight_cap,
            },
        ));
        let events: Arc<dyn EventSink> = dispatcher.clone();

        let cache = SynthesisCache::new(
            settings.synthesis_cache.capacity_bytes,
            Duration::from_secs(settings.synthesis_cache.entry_ttl_secs),
        );
        let pipeline = Arc::new(TurnPipeline::new(
            providers.stt,
            providers.llm,
            providers.tts,
            cache,
            PipelineBudgets::from(&settings.pipeline),
        ));

        let sessions = Arc::new(VoiceSessionManager::new(
            storage.sessions.clone(),
            storage.turns.clone(),
            storage.agents.clone(),
            pipeline.clone(),
            recorder.clone(),
            events,
            SessionManagerConfig {
                max_sessions: settings.server.max_sessions,
                max_turn_failures: settings.pipeline.max_turn_failures,
                idle_timeout: Duration::from_secs(settings.server.session_idle_timeout_secs),
                cleanup_interval: Duration::from_secs(60),
            },
        ));

        let pregen = PregenWorkerPool::new(
            storage.jobs.clone(),
            storage.agents.clone(),
            pipeline,
            PregenConfig::default(),
        );

        Self {
            settings: Arc::new(RwLock::new(settings)),
            storage,
            counters,
            secret_cipher,
            tokens,
            roles,
            api_keys,
            resolver,
            login,
            recorder,
            quota,
            invoices,
            dispatcher,
            sessions,
            pregen,
        }
    }

    /// Background reconciler over all active tenants.
    pub fn start_reconciler(&self) -> tokio::sync::watch::Sender<bool> {
        let settings = self.settings.read();
        let reconciler = Arc::new(Reconciler::new(
            self.storage.usage.clone(),
            self.counters.clone(),
            Duration::from_secs(settings.counters.month_ttl_secs),
        ));
        let interval = Duration::from_secs(settings.counters.reconcile_interval_secs);
        drop(settings);

        let storage = self.storage.clone();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let tx_clone = tx.clone();
        tokio::spawn(async move {
            let tenants = storage
                .tenants
                .list_by_status(voxgate_core::TenantStatus::Active)
                .await
                .unwrap_or_default();
            let ids: Vec<String> = tenants.into_iter().map(|t| t.id).collect();
            let inner_tx = reconciler.start(ids, interval);
            // Propagate shutdown to the inner loop.
            let mut rx = rx;
            if rx.changed().await.is_ok() {
                let _ = inner_tx.send(true);
            }
        });
        tx_clone
    }
}
