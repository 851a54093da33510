use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability;

/// One sweep: expire lapsed pending reservations, then complete confirmed
/// ones whose range has ended. Returns `(expired, completed)`.
pub async fn sweep(engine: &Engine) -> (usize, usize) {
    let now = engine.now_ms();
    let expired = match engine.reap_expired(now).await {
        Ok(ids) => {
            for id in &ids {
                debug!("expired pending reservation {id}");
            }
            ids.len()
        }
        Err(e) => {
            warn!("reaper: expiry sweep failed: {e}");
            0
        }
    };
    let completed = match engine.complete_elapsed(now).await {
        Ok(ids) => ids.len(),
        Err(e) => {
            warn!("reaper: completion sweep failed: {e}");
            0
        }
    };
    if expired > 0 || completed > 0 {
        info!("reaper: {expired} expired, {completed} completed");
        metrics::counter!(observability::REAPER_EXPIRED_TOTAL).increment(expired as u64);
    }
    (expired, completed)
}

/// Background task that sweeps every `every`.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep(&engine).await;
    }
}

/// Background task that compacts the WAL once enough appends piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{to_unix_ms, wall_clock, Clock, ManualClock};
    use crate::engine::EngineSettings;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::{NaiveDate, Offset, Utc};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_expires_and_completes() {
        let monday = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let sunday_noon = to_unix_ms(wall_clock(monday.pred_opt().unwrap(), 720), Utc.fix());
        let clock = Arc::new(ManualClock::new(sunday_noon));
        let settings = EngineSettings {
            pending_ttl_ms: 60_000,
            ..EngineSettings::default()
        };
        let engine = Engine::with_settings(
            test_wal_path("sweep.wal"),
            Arc::new(NotifyHub::new()),
            settings,
            clock.clone(),
        )
        .unwrap();

        let court = Ulid::new();
        let owner = Ulid::new();
        engine.create_court(court, owner, None, 1000).await.unwrap();
        engine.create_rule(Ulid::new(), court, 1, 540, 1080, None).await.unwrap();
        let held = engine
            .reserve(Ulid::new(), court, monday, 600, 660, Ulid::new())
            .await
            .unwrap();
        let played = engine
            .reserve(Ulid::new(), court, monday, 720, 780, Ulid::new())
            .await
            .unwrap();
        engine.confirm(played.id, owner).await.unwrap();

        assert_eq!(sweep(&engine).await, (0, 0));

        clock.advance(60_001);
        assert_eq!(sweep(&engine).await, (1, 0));
        assert_eq!(
            engine.get_reservation(held.id).await.unwrap().status,
            ReservationStatus::Expired
        );

        clock.set(to_unix_ms(wall_clock(monday, 800), Utc.fix()));
        assert_eq!(clock.now_ms(), engine.now_ms());
        assert_eq!(sweep(&engine).await, (0, 1));
        assert_eq!(
            engine.get_reservation(played.id).await.unwrap().status,
            ReservationStatus::Completed
        );
        assert_eq!(sweep(&engine).await, (0, 0));
    }
}
