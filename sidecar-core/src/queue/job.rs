use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};

use crate::envelope::{JobEnvelope, Priority, RequestMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A job, mutated only by the queue manager. Lives in the active job map
/// until it reaches a terminal status, at which point it is converted into
/// a `JobEnvelope` and moved to the result cache.
pub struct JobRecord {
    pub job_id: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub cancel_requested: bool,
    pub request_meta: RequestMeta,
    pub waiters: Vec<oneshot::Sender<JobEnvelope>>,
    /// Cancellation token for the in-flight upstream call, set only while running.
    pub abort: Option<Arc<Notify>>,
}

impl JobRecord {
    pub fn take_waiters(&mut self) -> Vec<oneshot::Sender<JobEnvelope>> {
        std::mem::take(&mut self.waiters)
    }
}

/// Three FIFO lanes keyed by priority. A job id appears in at most one
/// lane, never while running or in a terminal status.
#[derive(Default)]
pub struct Lanes {
    pub interactive: VecDeque<String>,
    pub retry: VecDeque<String>,
    pub batch: VecDeque<String>,
}

impl Lanes {
    pub fn push(&mut self, priority: &Priority, job_id: String) {
        match priority {
            Priority::Interactive => self.interactive.push_back(job_id),
            Priority::Retry => self.retry.push_back(job_id),
            Priority::Batch => self.batch.push_back(job_id),
        }
    }

    /// Pop the next job in fixed precedence order: interactive > retry > batch.
    pub fn pop_next(&mut self) -> Option<String> {
        self.interactive
            .pop_front()
            .or_else(|| self.retry.pop_front())
            .or_else(|| self.batch.pop_front())
    }

    pub fn remove(&mut self, job_id: &str) -> bool {
        let before = self.len();
        self.interactive.retain(|id| id != job_id);
        self.retry.retain(|id| id != job_id);
        self.batch.retain(|id| id != job_id);
        self.len() != before
    }

    pub fn len(&self) -> usize {
        self.interactive.len() + self.retry.len() + self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn depth_by_priority(&self) -> (usize, usize, usize) {
        (self.interactive.len(), self.retry.len(), self.batch.len())
    }
}
