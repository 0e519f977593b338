use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether a compaction ran and succeeded.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends since last compaction, below {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            info!("compactor: compacted after {appends} appends");
            true
        }
        Err(e) => {
            metrics::counter!(crate::observability::COMPACTIONS_TOTAL, "status" => "error").increment(1);
            error!("compactor: compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("interviewd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), SchedulerConfig::default()).unwrap();

        let iid = Ulid::new();
        engine.create_interviewer(iid, None).await.unwrap();
        for _ in 0..3 {
            let id = Ulid::new();
            engine.add_rule(id, iid, 0, (8, 0), (12, 0)).await.unwrap();
            engine.remove_rule(id).await.unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 7);

        assert!(!compact_if_needed(&engine, 100).await);
        assert_eq!(engine.wal_appends_since_compact().await, 7);

        assert!(compact_if_needed(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // only the interviewer survives
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }
}
