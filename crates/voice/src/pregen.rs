//! Pregeneration workers: bulk synthesis and cache warming.
//!
//! A pool of workers drains the durable job queue. Every synthesized
//! text advances the job's checkpoint, so a worker dying mid-job never
//! repeats provider calls on resume — completed fingerprints hit the
//! cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use voxgate_core::{CallContext, Error, JobStatus, PregenJob, Result};
use voxgate_store::{AgentStore, JobStore};

use crate::pipeline::TurnPipeline;

#[derive(Debug, Clone)]
pub struct PregenConfig {
    pub workers: usize,
    pub poll_interval: Duration,
}

impl Default for PregenConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(5),
        }
    }
}

pub struct PregenWorkerPool {
    jobs: Arc<dyn JobStore>,
    agents: Arc<dyn AgentStore>,
    pipeline: Arc<TurnPipeline>,
    config: PregenConfig,
}

impl PregenWorkerPool {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        agents: Arc<dyn AgentStore>,
        pipeline: Arc<TurnPipeline>,
        config: PregenConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            agents,
            pipeline,
            config,
        })
    }

    /// Enqueue a job for an agent. `texts` defaults to the agent's
    /// canonical lines (greeting and fallback) when empty.
    pub async fn enqueue(
        &self,
        tenant_id: &str,
        agent_id: &str,
        language: Option<&str>,
        texts: Vec<String>,
    ) -> Result<PregenJob> {
        let agent = self
            .agents
            .get(tenant_id, agent_id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found("voice_agent"))?;

        let texts = if texts.is_empty() {
            vec![agent.greeting.clone(), agent.fallback_message.clone()]
        } else {
            texts
        };
        let language = language.unwrap_or(&agent.language);

        let job = PregenJob::new(tenant_id, agent_id, language, texts);
        self.jobs.enqueue(&job).await.map_err(Error::from)?;
        tracing::info!(
            tenant_id = %tenant_id,
            agent_id = %agent_id,
            job_id = %job.id,
            texts = job.texts.len(),
            "pregeneration job enqueued"
        );
        Ok(job)
    }

    /// Process one job to completion, checkpointing after every text.
    pub async fn process_job(&self, mut job: PregenJob) -> Result<()> {
        let agent = self
            .agents
            .get(&job.tenant_id, &job.agent_id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::not_found("voice_agent"))?;

        let start = job.checkpoint as usize;
        for (offset, text) in job.texts[start.min(job.texts.len())..].iter().enumerate() {
            let ctx = CallContext::with_timeout(Duration::from_secs(30));
            let outcome = self
                .pipeline
                .synthesize(&ctx, &agent, &job.language, text)
                .await;

            match outcome {
                Ok(synthesis) => {
                    self.pipeline.cache().pin(&synthesis.artifact.fingerprint);
                    job.checkpoint = (start + offset + 1) as u32;
                    self.jobs
                        .checkpoint(&job.tenant_id, &job.id, job.checkpoint)
                        .await
                        .map_err(Error::from)?;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "pregeneration synthesis failed");
                    self.jobs
                        .finish(&job.tenant_id, &job.id, JobStatus::Failed)
                        .await
                        .map_err(Error::from)?;
                    return Err(e);
                }
            }
        }

        self.jobs
            .finish(&job.tenant_id, &job.id, JobStatus::Completed)
            .await
            .map_err(Error::from)?;
        tracing::info!(job_id = %job.id, texts = job.texts.len(), "pregeneration job completed");
        Ok(())
    }

    /// Start the worker pool. Returns a shutdown sender.
    pub fn start(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for worker in 0..self.config.workers {
            let pool = Arc::clone(self);
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                tracing::info!(worker, "pregeneration worker started");
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(pool.config.poll_interval) => {
                            match pool.jobs.claim().await {
                                Ok(Some(job)) => {
                                    let job_id = job.id.clone();
                                    if let Err(e) = pool.process_job(job).await {
                                        tracing::warn!(worker, job_id = %job_id, error = %e, "job failed");
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    tracing::warn!(worker, error = %e, "job claim failed");
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                tracing::info!(worker, "pregeneration worker shutting down");
                                break;
                            }
                        }
                    }
                }
            });
        }

        shutdown_tx
    }
}
