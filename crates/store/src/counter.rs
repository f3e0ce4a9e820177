//! Ephemeral counter store client.
//!
//! Atomic float increments, TTL'd keys, multi-key reads, and pipelined
//! batches. Keys are opaque strings chosen by callers; the well-known
//! usage/cost layouts live in [`keys`]. The client performs at most one
//! immediate retry of a failed round-trip and otherwise surfaces
//! `StoreError::CounterUnavailable` so callers can fail open or closed
//! per policy.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{StoreError, StoreResult};

/// One operation inside a pipelined batch.
#[derive(Debug, Clone)]
pub enum CounterOp {
    IncrByFloat { key: String, delta: f64 },
    Expire { key: String, ttl: Duration },
    SetWithTtl { key: String, value: f64, ttl: Duration },
}

/// A batch of counter operations executed in one round-trip.
#[derive(Debug, Clone, Default)]
pub struct CounterBatch {
    pub ops: Vec<CounterOp>,
}

impl CounterBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_by_float(mut self, key: impl Into<String>, delta: f64) -> Self {
        self.ops.push(CounterOp::IncrByFloat {
            key: key.into(),
            delta,
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.ops.push(CounterOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Atomic counter store over opaque string keys.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` to `key`, returning the new value.
    async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64>;

    /// Set `key` to `value` with a TTL.
    async fn set_with_ttl(&self, key: &str, value: f64, ttl: Duration) -> StoreResult<()>;

    /// Read several keys at once; missing keys read as `None`.
    async fn multi_get(&self, keys: &[String]) -> StoreResult<Vec<Option<f64>>>;

    /// Execute a pipelined batch in one round-trip.
    async fn execute(&self, batch: CounterBatch) -> StoreResult<()>;

    /// Attach a TTL to an existing key; no-op when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete a key. Used by reconciliation before rebuilds.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Well-known key layouts for usage and cost counters.
pub mod keys {
    use voxgate_core::UsageMetric;

    pub fn usage_daily(tenant: &str, metric: UsageMetric, day: &str) -> String {
        format!("usage:{tenant}:{metric}:daily:{day}")
    }

    pub fn usage_monthly(tenant: &str, metric: UsageMetric, month: &str) -> String {
        format!("usage:{tenant}:{metric}:monthly:{month}")
    }

    pub fn usage_total(tenant: &str, metric: UsageMetric) -> String {
        format!("usage:{tenant}:{metric}:total")
    }

    pub fn cost_daily(tenant: &str, metric: UsageMetric, day: &str) -> String {
        format!("cost:{tenant}:{metric}:daily:{day}")
    }

    pub fn cost_monthly(tenant: &str, metric: UsageMetric, month: &str) -> String {
        format!("cost:{tenant}:{metric}:monthly:{month}")
    }

    pub fn cost_total(tenant: &str) -> String {
        format!("cost:{tenant}:total")
    }

    /// One-shot marker so a soft-limit warning fires once per crossing.
    pub fn soft_warning_marker(tenant: &str, metric: UsageMetric, month: &str) -> String {
        format!("warn:{tenant}:{metric}:monthly:{month}")
    }

    pub fn rate_limit(scope: &str, subject: &str) -> String {
        format!("rate_limit:{scope}:{subject}")
    }

    pub fn token_revoked(jti: &str) -> String {
        format!("revoked:{jti}")
    }
}

#[derive(Debug)]
struct Cell {
    value: f64,
    expires_at: Option<Instant>,
}

/// In-memory counter store: the default backend for development and tests.
/// Per-key atomicity comes from the shard lock dashmap takes on entry
/// access; TTLs are enforced lazily on read and write.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    cells: DashMap<String, Cell>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(cell: &Cell) -> Option<f64> {
        match cell.expires_at {
            Some(at) if Instant::now() >= at => None,
            _ => Some(cell.value),
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64> {
        let mut entry = self.cells.entry(key.to_string()).or_insert(Cell {
            value: 0.0,
            expires_at: None,
        });
        if Self::live_value(&entry).is_none() {
            entry.value = 0.0;
            entry.expires_at = None;
        }
        entry.value += delta;
        Ok(entry.value)
    }

    async fn set_with_ttl(&self, key: &str, value: f64, ttl: Duration) -> StoreResult<()> {
        self.cells.insert(
            key.to_string(),
            Cell {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn multi_get(&self, keys: &[String]) -> StoreResult<Vec<Option<f64>>> {
        Ok(keys
            .iter()
            .map(|key| self.cells.get(key).and_then(|cell| Self::live_value(&cell)))
            .collect())
    }

    async fn execute(&self, batch: CounterBatch) -> StoreResult<()> {
        for op in batch.ops {
            match op {
                CounterOp::IncrByFloat { key, delta } => {
                    self.incr_by_float(&key, delta).await?;
                }
                CounterOp::Expire { key, ttl } => {
                    self.expire(&key, ttl).await?;
                }
                CounterOp::SetWithTtl { key, value, ttl } => {
                    self.set_with_ttl(&key, value, ttl).await?;
                }
            }
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        if let Some(mut cell) = self.cells.get_mut(key) {
            cell.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.cells.remove(key);
        Ok(())
    }
}

/// Wrapper applying the single-immediate-retry policy to another backend.
pub struct RetryingCounterStore<S> {
    inner: S,
}

impl<S: CounterStore> RetryingCounterStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    async fn retry_once<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        match op().await {
            Err(StoreError::CounterUnavailable(_)) => op().await,
            other => other,
        }
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for RetryingCounterStore<S> {
    async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64> {
        self.retry_once(|| self.inner.incr_by_float(key, delta)).await
    }

    async fn set_with_ttl(&self, key: &str, value: f64, ttl: Duration) -> StoreResult<()> {
        self.retry_once(|| self.inner.set_with_ttl(key, value, ttl))
            .await
    }

    async fn multi_get(&self, keys: &[String]) -> StoreResult<Vec<Option<f64>>> {
        self.retry_once(|| self.inner.multi_get(keys)).await
    }

    async fn execute(&self, batch: CounterBatch) -> StoreResult<()> {
        self.retry_once(|| self.inner.execute(batch.clone())).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.retry_once(|| self.inner.expire(key, ttl)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.retry_once(|| self.inner.delete(key)).await
    }
}
