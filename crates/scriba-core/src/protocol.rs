//! Wire types for the coordinator HTTP surface.
//!
//! All RPCs are JSON over HTTP. Instants travel as unix milliseconds so
//! workers never parse calendar formats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobRecord, JobStage};

/// Response to `POST /jobs` (submitter surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: JobId,
}

/// Response to `GET /jobs/next` when a job was claimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextJobResponse {
    pub id: JobId,
    pub audio_key: String,
    pub lease_expiry_unix_ms: i64,
}

/// Body of `POST /jobs/{id}/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker: String,
}

/// Response to a successful heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub lease_expiry_unix_ms: i64,
}

/// Body of `POST /jobs/{id}/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub worker: String,
    pub text_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub processing_seconds: f64,
}

/// Body of `POST /jobs/{id}/fail`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub worker: String,
    pub reason: String,
    pub retryable: bool,
}

/// Status view returned by `GET /jobs/{id}` and `GET /jobs`.
///
/// No artifact content is exposed here; submitters read blobs only once
/// the stage is `completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub id: JobId,
    pub name: String,
    pub stage: JobStage,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_unix_ms: i64,
    pub updated_unix_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_unix_ms: Option<i64>,
}

pub fn unix_ms(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

impl From<&JobRecord> for JobStatusResponse {
    fn from(job: &JobRecord) -> Self {
        let completed = job.stage == JobStage::Completed;
        Self {
            id: job.id,
            name: job.name.clone(),
            stage: job.stage,
            retry_count: job.retry_count,
            failure_reason: job.failure_reason.clone(),
            // Artifact keys become visible only on completion.
            text_key: completed.then(|| job.text_key.clone()).flatten(),
            segments_key: completed.then(|| job.segments_key.clone()).flatten(),
            summary: completed.then(|| job.summary.clone()).flatten(),
            created_unix_ms: unix_ms(job.created_at),
            updated_unix_ms: unix_ms(job.updated_at),
            completed_unix_ms: job.completed_at.map(unix_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_request_omits_absent_optionals() {
        let req = CompleteRequest {
            worker: "w1".into(),
            text_key: "k.txt.gz".into(),
            segments_key: None,
            summary: None,
            processing_seconds: 12.5,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("segments_key"));
        assert!(!json.contains("summary"));
    }

    #[test]
    fn status_hides_artifacts_before_completion() {
        let mut job = JobRecord::new_pending(JobId::new(), "talk.wav", "k.audio.wav");
        job.text_key = Some("k.txt.gz".into());
        let status = JobStatusResponse::from(&job);
        assert!(status.text_key.is_none());

        job.stage = JobStage::Completed;
        let status = JobStatusResponse::from(&job);
        assert_eq!(status.text_key.as_deref(), Some("k.txt.gz"));
    }
}
