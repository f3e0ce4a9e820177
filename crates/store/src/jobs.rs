//! Pregeneration job queue persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use voxgate_core::{JobStatus, PregenJob};

use crate::client::ScyllaClient;
use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: &PregenJob) -> StoreResult<()>;
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<PregenJob>>;
    /// Claim one pending (or interrupted running) job, marking it running.
    async fn claim(&self) -> StoreResult<Option<PregenJob>>;
    /// Persist progress so an interrupted job resumes without repeating
    /// provider calls.
    async fn checkpoint(&self, tenant_id: &str, id: &str, checkpoint: u32) -> StoreResult<()>;
    async fn finish(&self, tenant_id: &str, id: &str, status: JobStatus) -> StoreResult<()>;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<(String, String), PregenJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: &PregenJob) -> StoreResult<()> {
        self.jobs
            .lock()
            .insert((job.tenant_id.clone(), job.id.clone()), job.clone());
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<PregenJob>> {
        Ok(self
            .jobs
            .lock()
            .get(&(tenant_id.to_string(), id.to_string()))
            .cloned())
    }

    async fn claim(&self) -> StoreResult<Option<PregenJob>> {
        let mut jobs = self.jobs.lock();
        // Oldest pending first, so queue order is roughly FIFO.
        let key = jobs
            .iter()
            .filter(|(_, j)| j.status == JobStatus::Pending)
            .min_by_key(|(_, j)| j.created_at)
            .map(|(k, _)| k.clone());
        if let Some(key) = key {
            let job = jobs.get_mut(&key).expect("key just found");
            job.status = JobStatus::Running;
            job.updated_at = Utc::now();
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    async fn checkpoint(&self, tenant_id: &str, id: &str, checkpoint: u32) -> StoreResult<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&(tenant_id.to_string(), id.to_string()))
            .ok_or_else(|| StoreError::not_found("pregen_job"))?;
        job.checkpoint = checkpoint;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn finish(&self, tenant_id: &str, id: &str, status: JobStatus) -> StoreResult<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&(tenant_id.to_string(), id.to_string()))
            .ok_or_else(|| StoreError::not_found("pregen_job"))?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Clone)]
pub struct ScyllaJobStore {
    client: ScyllaClient,
}

impl ScyllaJobStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    fn row_to_job(row: scylla::frame::response::result::Row) -> StoreResult<PregenJob> {
        let (tenant_id, id, agent_id, language, texts, checkpoint, status, created_at, updated_at): (
            String,
            String,
            String,
            String,
            Option<Vec<String>>,
            i32,
            String,
            i64,
            i64,
        ) = row
            .into_typed()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(PregenJob {
            id,
            tenant_id,
            agent_id,
            language,
            texts: texts.unwrap_or_default(),
            checkpoint: checkpoint.max(0) as u32,
            status: match status.as_str() {
                "pending" => JobStatus::Pending,
                "running" => JobStatus::Running,
                "completed" => JobStatus::Completed,
                _ => JobStatus::Failed,
            },
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp_millis(updated_at).unwrap_or_else(Utc::now),
        })
    }
}

const JOB_COLUMNS: &str =
    "tenant_id, id, agent_id, language, texts, checkpoint, status, created_at, updated_at";

#[async_trait]
impl JobStore for ScyllaJobStore {
    async fn enqueue(&self, job: &PregenJob) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO {}.pregen_jobs ({JOB_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &job.tenant_id,
                    &job.id,
                    &job.agent_id,
                    &job.language,
                    &job.texts,
                    job.checkpoint as i32,
                    job.status.as_str(),
                    job.created_at.timestamp_millis(),
                    job.updated_at.timestamp_millis(),
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<PregenJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM {}.pregen_jobs WHERE tenant_id = ? AND id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (tenant_id, id))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                return Ok(Some(Self::row_to_job(row)?));
            }
        }
        Ok(None)
    }

    async fn claim(&self) -> StoreResult<Option<PregenJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM {}.pregen_jobs WHERE status = 'pending' \
             LIMIT 1 ALLOW FILTERING",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, &[])
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let mut job = Self::row_to_job(row)?;
                job.status = JobStatus::Running;
                job.updated_at = Utc::now();
                self.enqueue(&job).await?;
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn checkpoint(&self, tenant_id: &str, id: &str, checkpoint: u32) -> StoreResult<()> {
        let query = format!(
            "UPDATE {}.pregen_jobs SET checkpoint = ?, updated_at = ? \
             WHERE tenant_id = ? AND id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                query,
                (
                    checkpoint as i32,
                    Utc::now().timestamp_millis(),
                    tenant_id,
                    id,
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn finish(&self, tenant_id: &str, id: &str, status: JobStatus) -> StoreResult<()> {
        let query = format!(
            "UPDATE {}.pregen_jobs SET status = ?, updated_at = ? \
             WHERE tenant_id = ? AND id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                query,
                (
                    status.as_str(),
                    Utc::now().timestamp_millis(),
                    tenant_id,
                    id,
                ),
            )
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_marks_running_and_is_fifo() {
        let store = InMemoryJobStore::new();
        let mut first = PregenJob::new("t-1", "ag-1", "en", vec!["a".into()]);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = PregenJob::new("t-1", "ag-1", "en", vec!["b".into()]);
        store.enqueue(&second).await.unwrap();
        store.enqueue(&first).await.unwrap();

        let claimed = store.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);

        // Claimed jobs are not claimed twice.
        let next = store.claim().await.unwrap().unwrap();
        assert_eq!(next.id, second.id);
        assert!(store.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_persists() {
        let store = InMemoryJobStore::new();
        let job = PregenJob::new("t-1", "ag-1", "en", vec!["a".into(), "b".into()]);
        store.enqueue(&job).await.unwrap();
        store.checkpoint("t-1", &job.id, 1).await.unwrap();
        let loaded = store.get("t-1", &job.id).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint, 1);
    }
}
