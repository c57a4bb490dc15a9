use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Background task that rewrites the WAL once enough appends have piled up
/// since the last compaction, and drops notification channels nobody listens to.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        engine.notify.prune();
        compact_if_due(&engine, threshold).await;
    }
}

/// One compaction check. Returns true if the WAL was rewritten.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compaction not due: {appends}/{threshold} appends");
        return false;
    }
    match engine.compact_wal().await {
        Ok(kept) => {
            info!("compacted WAL: {appends} appends folded into {kept} events");
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            // Retried on the next tick.
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
