use tracing::debug;

use crate::engine::Engine;

/// Compact when at least `threshold` events were logged since the last
/// compaction. Returns whether it compacted.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, crate::Error> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        debug!(appends, threshold, "compaction not due");
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}
