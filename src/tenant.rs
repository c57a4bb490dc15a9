use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::{Engine, EngineSettings};
use crate::limits::*;
use crate::notify::NotifyHub;

/// Manages per-site engines. Each site gets its own Engine + WAL + compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Serializes opening sites so one WAL file is never opened twice.
    /// Lookups of open sites never take it.
    opening: Mutex<()>,
    data_dir: PathBuf,
    compact_threshold: u64,
    settings: EngineSettings,
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, settings: EngineSettings) -> Self {
        Self {
            engines: DashMap::new(),
            opening: Mutex::new(()),
            data_dir,
            compact_threshold,
            settings,
        }
    }

    /// Get or lazily create the engine for the given site.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "site name too long",
            ));
        }
        let safe_name = sanitize(tenant);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty site name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }

        let _opening = self.opening.lock().unwrap_or_else(|e| e.into_inner());
        // Another caller may have opened it while we waited.
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many sites"));
        }

        // Replay happens here, outside any map shard lock. Keyed by the
        // sanitized name so "a/b" and "ab" share one WAL file and one engine.
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.settings)?);
        self.engines.insert(safe_name.clone(), engine.clone());

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        info!("opened site {safe_name}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn site_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, Weekday};
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, EngineSettings::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let eng_a = tm.get_or_create("clinic_a").unwrap();
        let eng_b = tm.get_or_create("clinic_b").unwrap();

        let rid = Ulid::new();
        let resource = Resource::new(
            rid,
            None,
            vec![WorkingWindow::new(Weekday::Mon, hm(9, 0), hm(10, 0), 20)],
        );
        eng_a.load_resource(resource.clone()).await.unwrap();
        eng_b.load_resource(resource).await.unwrap();

        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let span = Span::new(hm(9, 0), hm(9, 20));
        eng_a.reserve(rid, monday, span, "alice").await.unwrap();

        assert!(!eng_a.is_free(rid, monday, &span));
        assert!(eng_b.is_free(rid, monday, &span));
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _eng = tm.get_or_create("my_site").unwrap();
        assert!(dir.join("my_site.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
        assert_eq!(tm.site_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_open_yields_one_engine() {
        let tm = Arc::new(manager(test_data_dir("concurrent_open")));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tm = tm.clone();
            handles.push(tokio::task::spawn_blocking(move || tm.get_or_create("busy").unwrap()));
        }
        let mut engines = Vec::new();
        for h in handles {
            engines.push(h.await.unwrap());
        }
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
        assert_eq!(tm.site_count(), 1);
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let evil = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        // Same file, same engine.
        let plain = tm.get_or_create("evil").unwrap();
        assert!(Arc::ptr_eq(&evil, &plain));

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("site name too long"));
    }

    #[tokio::test]
    async fn tenant_reopens_from_wal() {
        let dir = test_data_dir("reopen");
        let rid = Ulid::new();
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let span = Span::new(hm(9, 0), hm(9, 20));
        {
            let tm = manager(dir.clone());
            let eng = tm.get_or_create("site").unwrap();
            eng.load_resource(Resource::new(
                rid,
                None,
                vec![WorkingWindow::new(Weekday::Mon, hm(9, 0), hm(10, 0), 20)],
            ))
            .await
            .unwrap();
            eng.reserve(rid, monday, span, "alice").await.unwrap();
        }
        let tm = manager(dir);
        let eng = tm.get_or_create("site").unwrap();
        assert!(!eng.is_free(rid, monday, &span));
    }
}
