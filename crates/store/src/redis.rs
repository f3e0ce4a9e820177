//! Redis-backed counter store.
//!
//! Production backend for live limit decisions: INCRBYFLOAT for atomic
//! increments, EXPIRE for horizon TTLs, MGET for multi-key reads, and a
//! pipeline for the batched usage/cost updates.

use std::time::Duration;

use async_trait::async_trait;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::prelude::*;

use crate::counter::{CounterBatch, CounterOp, CounterStore};
use crate::error::{StoreError, StoreResult};

pub struct RedisCounterStore {
    client: RedisClient,
}

impl RedisCounterStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let config = RedisConfig::from_url(url)
            .map_err(|e| StoreError::CounterUnavailable(e.to_string()))?;
        let client = Builder::from_config(config)
            .build()
            .map_err(|e| StoreError::CounterUnavailable(e.to_string()))?;
        client
            .init()
            .await
            .map_err(|e| StoreError::CounterUnavailable(e.to_string()))?;
        tracing::info!(url = %url, "connected to redis counter store");
        Ok(Self { client })
    }

    fn map_err(e: RedisError) -> StoreError {
        StoreError::CounterUnavailable(e.to_string())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64> {
        self.client
            .incr_by_float(key, delta)
            .await
            .map_err(Self::map_err)
    }

    async fn set_with_ttl(&self, key: &str, value: f64, ttl: Duration) -> StoreResult<()> {
        self.client
            .set(
                key,
                value,
                Some(Expiration::EX(ttl.as_secs() as i64)),
                None,
                false,
            )
            .await
            .map_err(Self::map_err)
    }

    async fn multi_get(&self, keys: &[String]) -> StoreResult<Vec<Option<f64>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<f64>> = self
            .client
            .mget(keys.to_vec())
            .await
            .map_err(Self::map_err)?;
        Ok(values)
    }

    async fn execute(&self, batch: CounterBatch) -> StoreResult<()> {
        let pipeline = self.client.pipeline();
        for op in &batch.ops {
            match op {
                CounterOp::IncrByFloat { key, delta } => {
                    let _: () = pipeline
                        .incr_by_float(key.as_str(), *delta)
                        .await
                        .map_err(Self::map_err)?;
                }
                CounterOp::Expire { key, ttl } => {
                    let _: () = pipeline
                        .expire(key.as_str(), ttl.as_secs() as i64)
                        .await
                        .map_err(Self::map_err)?;
                }
                CounterOp::SetWithTtl { key, value, ttl } => {
                    let _: () = pipeline
                        .set(
                            key.as_str(),
                            *value,
                            Some(Expiration::EX(ttl.as_secs() as i64)),
                            None,
                            false,
                        )
                        .await
                        .map_err(Self::map_err)?;
                }
            }
        }
        pipeline.all::<()>().await.map_err(Self::map_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let _: bool = self
            .client
            .expire(key, ttl.as_secs() as i64)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let _: u64 = self.client.del(key).await.map_err(Self::map_err)?;
        Ok(())
    }
}
