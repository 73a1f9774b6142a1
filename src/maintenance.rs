use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL once `threshold` events have been appended since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appended = engine.wal_appends_since_compact().await;
    if appended < threshold {
        debug!("WAL compaction not due ({appended}/{threshold} appends)");
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        match compact_if_due(&engine, threshold).await {
            Ok(true) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            }
            Ok(false) => {}
            Err(e) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
                warn!("WAL compaction failed: {e}");
            }
        }
    }
}
