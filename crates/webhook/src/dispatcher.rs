//! Webhook dispatcher: event fan-out with signed payloads, bounded
//! retries, and subscriber health tracking.
//!
//! Delivery goes through the [`DeliveryTransport`] seam; production uses
//! reqwest, tests use a scripted transport. Retries apply to 5xx,
//! timeouts and transport errors with exponential backoff and jitter
//! capped at 60 s. A subscriber that accumulates ten net failures
//! without an intervening success moves to `failed` and receives no
//! further traffic until an operator reactivates it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Semaphore;

use voxgate_core::{DomainEvent, Error, EventKind, EventSink, Result, WebhookSubscriber};
use voxgate_store::SubscriberStore;

use crate::canonical::{canonical_json, sign};

/// Outcome of one HTTP delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx.
    Success,
    /// 5xx, timeout, or transport error: retryable.
    Retryable,
    /// Any other status: counts as a failure, no retry.
    Rejected,
}

/// Transport seam for webhook POSTs.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        timeout: Duration,
    ) -> AttemptOutcome;
}

/// At-rest protection for subscriber shared secrets. Stored secrets pass
/// through `seal` on write and `open` before signing; the plaintext never
/// lands in the durable store.
pub trait SecretCipher: Send + Sync {
    fn seal(&self, tenant_id: &str, secret: &str) -> Result<String>;
    fn open(&self, tenant_id: &str, sealed: &str) -> Result<String>;
}

/// Identity cipher for development and tests.
pub struct PlainSecrets;

impl SecretCipher for PlainSecrets {
    fn seal(&self, _tenant_id: &str, secret: &str) -> Result<String> {
        Ok(secret.to_string())
    }

    fn open(&self, _tenant_id: &str, sealed: &str) -> Result<String> {
        Ok(sealed.to_string())
    }
}

/// Production transport on reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        timeout: Duration,
    ) -> AttemptOutcome {
        let mut request = self
            .client
            .post(url)
            .timeout(timeout)
            .header("content-type", "application/json")
            .body(body.to_string());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => AttemptOutcome::Success,
            Ok(response) if response.status().is_server_error() => AttemptOutcome::Retryable,
            Ok(_) => AttemptOutcome::Rejected,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "webhook transport error");
                AttemptOutcome::Retryable
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub failure_disable_threshold: u32,
    pub in_flight_cap: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_disable_threshold: 10,
            in_flight_cap: 4,
        }
    }
}

/// Exponential backoff with jitter, capped at 60 s.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt));
    let capped = exponential.min(Duration::from_secs(60));
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64 / 4);
    capped + Duration::from_millis(jitter_ms)
}

pub struct WebhookDispatcher {
    subscribers: Arc<dyn SubscriberStore>,
    transport: Arc<dyn DeliveryTransport>,
    cipher: Arc<dyn SecretCipher>,
    config: DispatcherConfig,
    /// Per-subscriber in-flight caps.
    in_flight: DashMap<String, Arc<Semaphore>>,
}

impl WebhookDispatcher {
    pub fn new(
        subscribers: Arc<dyn SubscriberStore>,
        transport: Arc<dyn DeliveryTransport>,
        cipher: Arc<dyn SecretCipher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            subscribers,
            transport,
            cipher,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Build the delivery envelope for an event and subscriber.
    fn envelope(event: &DomainEvent, webhook_id: &str) -> serde_json::Value {
        serde_json::json!({
            "event": event.kind.as_str(),
            "timestamp": event.occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "webhook-id": webhook_id,
            "data": event.data.clone(),
        })
    }

    /// Fan an event out to every matching active subscriber of its tenant.
    /// Returns the number of subscribers dispatched to.
    pub async fn dispatch(&self, event: &DomainEvent) -> Result<usize> {
        let subscribers = self
            .subscribers
            .list_active(&event.tenant_id)
            .await
            .map_err(Error::from)?;
        let matching: Vec<WebhookSubscriber> = subscribers
            .into_iter()
            .filter(|s| s.events.matches(event.kind))
            .collect();

        for subscriber in &matching {
            self.deliver_with_retries(subscriber.clone(), event).await;
        }
        Ok(matching.len())
    }

    /// Send a `webhook_test` event to one subscriber regardless of its
    /// event selection.
    pub async fn send_test(&self, tenant_id: &str, subscriber_id: &str) -> Result<bool> {
        let subscriber = self
            .subscribers
            .get(tenant_id, subscriber_id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found("webhook_subscriber"))?;

        let event = DomainEvent::new(
            EventKind::WebhookTest,
            tenant_id,
            serde_json::json!({ "subscriber_id": subscriber_id }),
        );
        Ok(self.deliver_with_retries(subscriber, &event).await)
    }

    fn semaphore_for(&self, subscriber_id: &str) -> Arc<Semaphore> {
        self.in_flight
            .entry(subscriber_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.in_flight_cap)))
            .clone()
    }

    /// One delivery (with retries) to one subscriber; returns success.
    async fn deliver_with_retries(
        &self,
        mut subscriber: WebhookSubscriber,
        event: &DomainEvent,
    ) -> bool {
        let semaphore = self.semaphore_for(&subscriber.id);
        let _permit = semaphore
            .acquire()
            .await
            .expect("dispatcher semaphore is never closed");

        let secret = match self.cipher.open(&subscriber.tenant_id, &subscriber.secret) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::error!(
                    subscriber_id = %subscriber.id,
                    error = %e,
                    "subscriber secret unusable, delivery skipped"
                );
                subscriber.record_failure(self.config.failure_disable_threshold);
                if let Err(e) = self.subscribers.upsert(&subscriber).await {
                    tracing::warn!(error = %e, "failed to persist subscriber stats");
                }
                return false;
            }
        };

        let payload = canonical_json(&Self::envelope(event, &subscriber.id));
        let mut headers: Vec<(String, String)> = subscriber.custom_headers.clone();
        headers.push((
            "X-Webhook-Signature".to_string(),
            sign(&payload, &secret),
        ));

        let max_attempts = subscriber.retry_policy.max_attempts.max(1);
        let base_delay = Duration::from_secs(subscriber.retry_policy.delay_secs);
        let timeout = Duration::from_secs(subscriber.timeout_secs.max(1));

        let mut delivered = false;
        for attempt in 0..max_attempts {
            let outcome = self
                .transport
                .post(&subscriber.url, &headers, &payload, timeout)
                .await;

            match outcome {
                AttemptOutcome::Success => {
                    delivered = true;
                    break;
                }
                AttemptOutcome::Rejected => break,
                AttemptOutcome::Retryable => {
                    if attempt + 1 < max_attempts {
                        let delay = backoff_delay(base_delay, attempt);
                        tracing::warn!(
                            subscriber_id = %subscriber.id,
                            url = %subscriber.url,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "webhook delivery failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        if delivered {
            subscriber.record_success();
            tracing::debug!(
                subscriber_id = %subscriber.id,
                event = %event.kind,
                "webhook delivered"
            );
        } else {
            let disabled = subscriber.record_failure(self.config.failure_disable_threshold);
            tracing::warn!(
                subscriber_id = %subscriber.id,
                event = %event.kind,
                consecutive_failures = subscriber.stats.consecutive_failures,
                disabled,
                "webhook delivery failed permanently"
            );
        }

        if let Err(e) = self.subscribers.upsert(&subscriber).await {
            tracing::warn!(error = %e, "failed to persist subscriber stats");
        }
        delivered
    }
}

/// EventSink implementation so domain code publishes without knowing
/// about webhooks.
#[async_trait]
impl EventSink for WebhookDispatcher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.dispatch(&event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use voxgate_core::EventSelection;
    use voxgate_store::InMemorySubscriberStore;

    /// Scripted transport: pops one outcome per attempt, records calls.
    struct ScriptedTransport {
        script: Mutex<Vec<AttemptOutcome>>,
        calls: Mutex<Vec<(String, Vec<(String, String)>, String)>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<AttemptOutcome>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DeliveryTransport for ScriptedTransport {
        async fn post(
            &self,
            url: &str,
            headers: &[(String, String)],
            body: &str,
            _timeout: Duration,
        ) -> AttemptOutcome {
            self.calls
                .lock()
                .push((url.to_string(), headers.to_vec(), body.to_string()));
            let mut script = self.script.lock();
            if script.is_empty() {
                AttemptOutcome::Success
            } else {
                script.remove(0)
            }
        }
    }

    async fn fixture(
        script: Vec<AttemptOutcome>,
        events: EventSelection,
    ) -> (
        WebhookDispatcher,
        Arc<InMemorySubscriberStore>,
        Arc<ScriptedTransport>,
        WebhookSubscriber,
    ) {
        let store = Arc::new(InMemorySubscriberStore::new());
        let transport = Arc::new(ScriptedTransport::new(script));
        let mut subscriber =
            WebhookSubscriber::new("t-1", "https://hooks.acme.test/voxgate", "S", events);
        // Fast retries for tests.
        subscriber.retry_policy.delay_secs = 0;
        store.upsert(&subscriber).await.unwrap();

        let dispatcher = WebhookDispatcher::new(
            store.clone(),
            transport.clone(),
            Arc::new(PlainSecrets),
            DispatcherConfig {
                retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
        );
        (dispatcher, store, transport, subscriber)
    }

    fn session_ended() -> DomainEvent {
        DomainEvent::new(
            EventKind::SessionEnded,
            "t-1",
            serde_json::json!({ "session_id": "s-1", "outcome": "completed" }),
        )
    }

    #[tokio::test]
    async fn delivers_signed_canonical_payload() {
        let (dispatcher, store, transport, subscriber) = fixture(
            vec![AttemptOutcome::Success],
            EventSelection::Kinds(vec![EventKind::SessionEnded]),
        )
        .await;

        let delivered = dispatcher.dispatch(&session_ended()).await.unwrap();
        assert_eq!(delivered, 1);

        let calls = transport.calls.lock();
        let (url, headers, body) = &calls[0];
        assert_eq!(url, "https://hooks.acme.test/voxgate");

        // Payload is canonical and the signature verifies against it.
        let value: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(canonical_json(&value), *body);
        assert_eq!(value["event"], "session_ended");
        assert_eq!(value["webhook-id"], subscriber.id);

        let signature = headers
            .iter()
            .find(|(name, _)| name == "X-Webhook-Signature")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(crate::canonical::verify(body, &signature, "S"));

        let stored = store.get("t-1", &subscriber.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.success, 1);
        assert!(stored.stats.last_success_at.is_some());
    }

    #[tokio::test]
    async fn retries_on_server_error_then_succeeds() {
        let (dispatcher, store, transport, subscriber) = fixture(
            vec![AttemptOutcome::Retryable, AttemptOutcome::Success],
            EventSelection::All,
        )
        .await;

        dispatcher.dispatch(&session_ended()).await.unwrap();
        assert_eq!(transport.calls.lock().len(), 2);

        let stored = store.get("t-1", &subscriber.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.success, 1);
        assert_eq!(stored.stats.failure, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_count_one_net_failure() {
        let (dispatcher, store, transport, subscriber) = fixture(
            vec![
                AttemptOutcome::Retryable,
                AttemptOutcome::Retryable,
                AttemptOutcome::Retryable,
            ],
            EventSelection::All,
        )
        .await;

        dispatcher.dispatch(&session_ended()).await.unwrap();
        // Default policy: 3 attempts.
        assert_eq!(transport.calls.lock().len(), 3);

        let stored = store.get("t-1", &subscriber.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.failure, 1);
        assert_eq!(stored.stats.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn rejected_is_not_retried() {
        let (dispatcher, _, transport, _) =
            fixture(vec![AttemptOutcome::Rejected], EventSelection::All).await;
        dispatcher.dispatch(&session_ended()).await.unwrap();
        assert_eq!(transport.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn non_matching_subscriber_is_skipped() {
        let (dispatcher, _, transport, _) = fixture(
            vec![],
            EventSelection::Kinds(vec![EventKind::LeadCreated]),
        )
        .await;
        let delivered = dispatcher.dispatch(&session_ended()).await.unwrap();
        assert_eq!(delivered, 0);
        assert!(transport.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_subscriber_receives_no_traffic() {
        let (dispatcher, store, transport, mut subscriber) =
            fixture(vec![], EventSelection::All).await;
        subscriber.status = voxgate_core::SubscriberStatus::Failed;
        store.upsert(&subscriber).await.unwrap();

        let delivered = dispatcher.dispatch(&session_ended()).await.unwrap();
        assert_eq!(delivered, 0);
        assert!(transport.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_event_ignores_selection() {
        let (dispatcher, _, transport, subscriber) = fixture(
            vec![AttemptOutcome::Success],
            EventSelection::Kinds(vec![EventKind::SessionEnded]),
        )
        .await;
        let delivered = dispatcher.send_test("t-1", &subscriber.id).await.unwrap();
        assert!(delivered);
        let calls = transport.calls.lock();
        assert!(calls[0].2.contains("webhook_test"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(10);
        let first = backoff_delay(base, 0);
        assert!(first >= Duration::from_secs(10));
        let fourth = backoff_delay(base, 3);
        // 10 * 2^3 = 80 caps at 60 (plus jitter up to 15s).
        assert!(fourth >= Duration::from_secs(60));
        assert!(fourth <= Duration::from_secs(75));
    }
}
