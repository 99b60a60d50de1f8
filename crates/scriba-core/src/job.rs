//! Job data model: identity, lifecycle stage, and lease.
//!
//! A job is one uploaded audio file. The coordinator is the only writer
//! of job records; workers mutate them indirectly through the RPCs in
//! the protocol module. Stage transitions are monotone along the graph:
//!
//! ```text
//! pending ──claim──▶ running ──complete──▶ completed (terminal)
//!    ▲                  │
//!    │                  ├─fail(retryable, retry<max)──▶ failed_retryable ──claim──▶ running
//!    │                  └─fail(else)──▶ failed (terminal)
//!    └──────────────────┘   (lease timeout: running → failed_retryable)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Pending,
    Running,
    FailedRetryable,
    Completed,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::FailedRetryable => "failed_retryable",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal stages accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> to` is a legal edge of the stage graph.
    pub fn can_transition(&self, to: JobStage) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::FailedRetryable, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::FailedRetryable)
        )
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Original file name as uploaded by the submitter.
    pub name: String,
    /// Blob key of the uploaded audio, set at creation.
    pub audio_key: String,
    /// Blob key of the gzip text artifact, set on completion.
    pub text_key: Option<String>,
    /// Blob key of the gzip segments artifact, set on completion.
    pub segments_key: Option<String>,
    /// Derived summary, set on completion when the summarizer produced one.
    pub summary: Option<String>,
    pub stage: JobStage,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub lease_acquired_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Wall-clock seconds the completing worker spent on the job.
    pub processing_seconds: Option<f64>,
}

impl JobRecord {
    /// Create a fresh pending record.
    pub fn new_pending(id: JobId, name: impl Into<String>, audio_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            audio_key: audio_key.into(),
            text_key: None,
            segments_key: None,
            summary: None,
            stage: JobStage::Pending,
            lease_holder: None,
            lease_expires_at: None,
            lease_acquired_at: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failure_reason: None,
            processing_seconds: None,
        }
    }

    /// A job is leased iff it has a holder and the lease has not expired.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        match (&self.lease_holder, self.lease_expires_at) {
            (Some(_), Some(expiry)) => expiry > now,
            _ => false,
        }
    }

    /// Whether `worker` currently holds a live lease on this job.
    pub fn lease_held_by(&self, worker: &str, now: DateTime<Utc>) -> bool {
        self.is_leased(now) && self.lease_holder.as_deref() == Some(worker)
    }

    /// Clear all lease fields.
    pub fn clear_lease(&mut self) {
        self.lease_holder = None;
        self.lease_expires_at = None;
        self.lease_acquired_at = None;
    }
}
