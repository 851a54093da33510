use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::SystemClock;
use crate::engine::{Engine, EngineSettings};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Per-facility engines. Each facility gets its own Engine, WAL, reaper and
/// compactor. Facility = database name of the pgwire connection.
pub struct FacilityManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    settings: EngineSettings,
    reaper_interval: Duration,
}

impl FacilityManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        settings: EngineSettings,
        reaper_interval: Duration,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            settings,
            reaper_interval,
        }
    }

    /// Get or lazily open the engine for a facility.
    pub fn get_or_create(&self, facility: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(facility) {
            return Ok(engine.value().clone());
        }
        if facility.len() > MAX_FACILITY_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "facility name too long",
            ));
        }
        if self.engines.len() >= MAX_FACILITIES {
            return Err(std::io::Error::other("too many facilities"));
        }

        // The name becomes a file name; keep it to a safe alphabet.
        let safe_name: String = facility
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty facility name",
            ));
        }

        // Two connections may race to open the same facility; the entry
        // lock makes sure only one engine owns the WAL file.
        let entry = self.engines.entry(facility.to_string());
        let engine = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::with_settings(
                    wal_path,
                    Arc::new(NotifyHub::new()),
                    self.settings,
                    Arc::new(SystemClock),
                )?);
                v.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reaper::run_reaper(engine.clone(), self.reaper_interval));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        tracing::info!("opened facility {facility:?}");
        metrics::gauge!(crate::observability::FACILITIES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtd_test_facility").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> FacilityManager {
        FacilityManager::new(dir, 1000, EngineSettings::default(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn facility_isolation() {
        let fm = manager(test_data_dir("isolation"));
        let a = fm.get_or_create("club_a").unwrap();
        let b = fm.get_or_create("club_b").unwrap();

        let court = Ulid::new();
        a.create_court(court, Ulid::new(), None, 1000).await.unwrap();
        b.create_court(court, Ulid::new(), None, 1000).await.unwrap();
        a.create_rule(Ulid::new(), court, 1, 540, 1080, None).await.unwrap();

        assert_eq!(a.list_rules(court, true).await.unwrap().len(), 1);
        assert!(b.list_rules(court, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn facility_lazy_creation() {
        let dir = test_data_dir("lazy");
        let fm = manager(dir.clone());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _engine = fm.get_or_create("riverside").unwrap();
        assert!(dir.join("riverside.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let fm = manager(test_data_dir("same_engine"));
        let e1 = fm.get_or_create("foo").unwrap();
        let e2 = fm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&e1, &e2));
    }

    #[tokio::test]
    async fn facility_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let fm = manager(dir.clone());
        let _engine = fm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(fm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn facility_name_too_long() {
        let fm = manager(test_data_dir("too_long"));
        let err = fm
            .get_or_create(&"x".repeat(MAX_FACILITY_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("facility name too long"));
    }
}
