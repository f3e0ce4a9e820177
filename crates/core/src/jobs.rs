//! Pregeneration jobs: bulk synthesis work items with resume checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One bulk-synthesis job. `checkpoint` is the count of texts already
/// synthesized; a resumed job continues from that index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PregenJob {
    pub id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub language: String,
    pub texts: Vec<String>,
    pub checkpoint: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PregenJob {
    pub fn new(
        tenant_id: impl Into<String>,
        agent_id: impl Into<String>,
        language: impl Into<String>,
        texts: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            agent_id: agent_id.into(),
            language: language.into(),
            texts,
            checkpoint: 0,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> &[String] {
        let done = (self.checkpoint as usize).min(self.texts.len());
        &self.texts[done..]
    }

    pub fn is_done(&self) -> bool {
        self.checkpoint as usize >= self.texts.len()
    }
}
