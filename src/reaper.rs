use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

/// Background task that flips lapsed registration holds to CANCELLED, freeing
/// their seats. Every read path already excludes lapsed holds, so the sweep
/// only has to catch up eventually.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let lapsed = engine.collect_lapsed_holds(crate::engine::now_ms());
        for (reg_id, _event_id) in lapsed {
            match engine.expire_registration(reg_id).await {
                Ok(true) => {
                    metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(1);
                    info!("expired registration hold {reg_id}");
                }
                // Confirmed or cancelled between scan and lock
                Ok(false) => tracing::debug!("reaper skip {reg_id}: no longer lapsed"),
                Err(e) => tracing::debug!("reaper skip {reg_id}: {e}"),
            }
        }
    }
}

/// Background task that rewrites the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
