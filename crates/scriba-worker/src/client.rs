//! HTTP client for the coordinator.
//!
//! Every RPC is safe to retry: `next`, `heartbeat`, blob reads and
//! deletes are idempotent by nature; `complete` and `fail` are
//! idempotent by construction (job id + lease-holder predicate). A 409
//! from heartbeat/complete/fail maps to `LeaseLost`, which is always
//! fatal to the current attempt.

use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use scriba_core::job::JobId;
use scriba_core::protocol::{
    CompleteRequest, FailRequest, HeartbeatRequest, HeartbeatResponse, NextJobResponse,
};
use scriba_core::{Result, ScribaError, verbose};

/// Backoff configuration for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Base delay in milliseconds (doubles with each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 16000,
        }
    }
}

impl RetryConfig {
    /// Delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Check if an HTTP status code is worth retrying.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

/// Check if a reqwest error is transient.
pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

pub struct CoordinatorClient {
    http: reqwest::Client,
    /// Separate client for blob transfers: a whole-request timeout would
    /// kill multi-hour audio downloads, so this one only bounds connect.
    blob_http: reqwest::Client,
    base: String,
    worker_id: String,
    retry: RetryConfig,
}

impl CoordinatorClient {
    pub fn new(base_url: &str, worker_id: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScribaError::Http(format!("building HTTP client: {e}")))?;
        let blob_http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ScribaError::Http(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            blob_http,
            base: base_url.trim_end_matches('/').to_string(),
            worker_id,
            retry: RetryConfig::default(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Send a request, retrying transient failures with exponential
    /// backoff. Requests with streaming bodies cannot be cloned and get
    /// a single attempt.
    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let this_try = match builder.try_clone() {
                Some(clone) => clone,
                None => {
                    return builder
                        .send()
                        .await
                        .map_err(|e| ScribaError::Http(e.to_string()));
                }
            };
            match this_try.send().await {
                Ok(resp) if is_retryable_status(resp.status()) && attempt < self.retry.max_retries => {
                    verbose!("retrying after status {} (attempt {})", resp.status(), attempt + 1);
                }
                Ok(resp) => return Ok(resp),
                Err(e) if is_retryable_error(&e) && attempt < self.retry.max_retries => {
                    verbose!("retrying after error: {e} (attempt {})", attempt + 1);
                }
                Err(e) => return Err(ScribaError::Http(e.to_string())),
            }
            tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    /// `GET /jobs/next`: `None` means the queue is empty (204).
    pub async fn next_job(&self) -> Result<Option<NextJobResponse>> {
        let builder = self
            .http
            .get(self.url("/jobs/next"))
            .query(&[("worker", self.worker_id.as_str())]);
        let resp = self.execute(builder).await?;
        match resp.status() {
            StatusCode::NO_CONTENT => Ok(None),
            s if s.is_success() => {
                let job = resp
                    .json::<NextJobResponse>()
                    .await
                    .map_err(|e| ScribaError::Http(format!("parsing next response: {e}")))?;
                Ok(Some(job))
            }
            s => Err(ScribaError::Http(format!("next returned {s}"))),
        }
    }

    /// `POST /jobs/{id}/heartbeat`: returns the new expiry, or
    /// `LeaseLost` on 409.
    pub async fn heartbeat(&self, id: JobId) -> Result<i64> {
        let body = HeartbeatRequest {
            worker: self.worker_id.clone(),
        };
        let builder = self
            .http
            .post(self.url(&format!("/jobs/{id}/heartbeat")))
            .json(&body);
        let resp = self.execute(builder).await?;
        match resp.status() {
            StatusCode::CONFLICT => Err(ScribaError::LeaseLost),
            s if s.is_success() => {
                let hb = resp
                    .json::<HeartbeatResponse>()
                    .await
                    .map_err(|e| ScribaError::Http(format!("parsing heartbeat response: {e}")))?;
                Ok(hb.lease_expiry_unix_ms)
            }
            s => Err(ScribaError::Http(format!("heartbeat returned {s}"))),
        }
    }

    /// `POST /jobs/{id}/complete`: `LeaseLost` on 409.
    pub async fn complete(&self, id: JobId, request: &CompleteRequest) -> Result<()> {
        let builder = self
            .http
            .post(self.url(&format!("/jobs/{id}/complete")))
            .json(request);
        let resp = self.execute(builder).await?;
        match resp.status() {
            StatusCode::CONFLICT => Err(ScribaError::LeaseLost),
            s if s.is_success() => Ok(()),
            s => Err(ScribaError::Http(format!("complete returned {s}"))),
        }
    }

    /// `POST /jobs/{id}/fail`: `LeaseLost` on 409.
    pub async fn fail(&self, id: JobId, reason: &str, retryable: bool) -> Result<()> {
        let body = FailRequest {
            worker: self.worker_id.clone(),
            reason: reason.to_string(),
            retryable,
        };
        let builder = self
            .http
            .post(self.url(&format!("/jobs/{id}/fail")))
            .json(&body);
        let resp = self.execute(builder).await?;
        match resp.status() {
            StatusCode::CONFLICT => Err(ScribaError::LeaseLost),
            s if s.is_success() => Ok(()),
            s => Err(ScribaError::Http(format!("fail returned {s}"))),
        }
    }

    /// Stream `GET /blobs/{key}` to a local file.
    pub async fn download_blob(&self, key: &str, dest: &Path) -> Result<u64> {
        use futures_util::TryStreamExt;

        let builder = self.blob_http.get(self.url(&format!("/blobs/{key}")));
        let resp = self.execute(builder).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Err(ScribaError::NotFound(key.to_string())),
            s if s.is_success() => {}
            s => return Err(ScribaError::Http(format!("blob download returned {s}"))),
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut total = 0u64;
        loop {
            let chunk = stream
                .try_next()
                .await
                .map_err(|e| ScribaError::Http(format!("blob download stream: {e}")))?;
            let Some(chunk) = chunk else { break };
            total += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(total)
    }

    /// Stream a local file into `PUT /blobs/{key}`.
    ///
    /// The body cannot be replayed, so retries reopen the file.
    pub async fn upload_blob(&self, key: &str, path: &Path) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.try_upload(key, path).await {
                Ok(()) => return Ok(()),
                Err(ScribaError::Http(msg)) if attempt < self.retry.max_retries => {
                    verbose!("retrying upload of {key}: {msg} (attempt {})", attempt + 1);
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_upload(&self, key: &str, path: &Path) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let resp = self
            .blob_http
            .put(self.url(&format!("/blobs/{key}")))
            .body(body)
            .send()
            .await
            .map_err(|e| ScribaError::Http(format!("blob upload: {e}")))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::BAD_REQUEST => Err(ScribaError::Config(format!(
                "coordinator rejected blob key {key}"
            ))),
            s => Err(ScribaError::Http(format!("blob upload returned {s}"))),
        }
    }

    /// Best-effort `DELETE /blobs/{key}`.
    pub async fn delete_blob(&self, key: &str) -> Result<()> {
        let builder = self.http.delete(self.url(&format!("/blobs/{key}")));
        let resp = self.execute(builder).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ScribaError::Http(format!(
                "blob delete returned {}",
                resp.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_millis(16000));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::CONFLICT));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }
}
