//! Orphan artifact sweeper.
//!
//! A worker whose `complete` commit was rejected may have already
//! written artifact blobs; once the job reaches terminal `failed` those
//! blobs are dangling. Artifact keys are job-scoped, so sweeping is a
//! lookup at the canonical keys. Eventually consistent and off the hot
//! path.

use std::sync::Arc;
use std::time::Duration;

use scriba_core::blob::{self, BlobStore};
use scriba_core::{verbose, warn};

use crate::store::MetadataStore;

/// How often the sweeper scans terminal failures.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(300);

pub async fn run(store: Arc<MetadataStore>, blobs: Arc<BlobStore>) {
    let mut ticker = tokio::time::interval(SWEEP_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep_once(&store, &blobs).await;
    }
}

/// One sweep pass; separated out for tests.
pub async fn sweep_once(store: &MetadataStore, blobs: &BlobStore) {
    for job in store.sweep_candidates() {
        for key in [blob::text_key(job.id), blob::segments_key(job.id)] {
            if blobs.exists(&key).await {
                match blobs.delete(&key).await {
                    Ok(()) => verbose!("swept dangling artifact {key}"),
                    Err(e) => warn!("failed to sweep {key}: {e}"),
                }
            }
        }
    }
}
