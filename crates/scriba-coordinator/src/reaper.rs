//! Lease reaper: the crash-recovery mechanism for dead workers.
//!
//! A worker that stops heartbeating leaves its job `running` with a
//! lease that eventually expires. This task returns such jobs to the
//! queue. Runs at lease_duration/3 so a lost lease is reclaimed well
//! within one lease window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use scriba_core::{info, verbose, warn};

use crate::store::MetadataStore;

pub async fn run(store: Arc<MetadataStore>, period: Duration) {
    info!("reaper running every {period:?}");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match store.reap_expired(Utc::now()) {
            Ok(0) => verbose!("reaper: no expired leases"),
            Ok(n) => info!("reaper returned {n} expired lease(s) to the queue"),
            Err(e) => warn!("reaper pass failed: {e}"),
        }
    }
}
