//! Embedded SQLite persistence: production cache, config cache, and metric
//! samples (spec §4.7). Uses runtime-checked `sqlx::query`/`query_as`
//! calls rather than the `sqlx::query!` compile-time macro, since the
//! macro needs either a live database or an offline query cache at build
//! time.
//!
//! Every data-path method degrades silently on failure: it logs at ERROR
//! and returns an empty/default value rather than propagating, so the
//! pipeline keeps running on an in-memory cache if the database is
//! unavailable (spec §7 "Persistence failure").

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::error;

pub struct PersistenceStore {
    pool: Option<Pool<Sqlite>>,
    database_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub tags: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub database_path: String,
    pub database_size_bytes: u64,
    pub production_cache_entries: i64,
    pub config_cache_entries: i64,
    pub metrics_entries: i64,
}

impl PersistenceStore {
    /// Opens (and migrates) the database at `database_path`. When
    /// `enabled` is false, or opening fails, returns a store with no pool
    /// — every method becomes a silent no-op, matching spec §7's
    /// "persistence silently disabled" failure kind.
    pub async fn open(database_path: &str, enabled: bool) -> Self {
        if !enabled {
            return Self {
                pool: None,
                database_path: database_path.to_string(),
            };
        }

        match Self::connect_and_migrate(database_path).await {
            Ok(pool) => Self {
                pool: Some(pool),
                database_path: database_path.to_string(),
            },
            Err(e) => {
                error!(error = %e, database_path, "persistence disabled: failed to open database");
                Self {
                    pool: None,
                    database_path: database_path.to_string(),
                }
            }
        }
    }

    async fn connect_and_migrate(database_path: &str) -> anyhow::Result<Pool<Sqlite>> {
        use anyhow::Context;

        let options = SqliteConnectOptions::from_str(database_path)
            .with_context(|| format!("invalid sqlite connection string: {database_path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {database_path}"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;

        Ok(pool)
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    // -- production cache ----------------------------------------------

    pub async fn save_production_cache(
        &self,
        serial: &str,
        port: u8,
        today_wh: u32,
        total_wh: u32,
        updated: DateTime<Utc>,
    ) {
        let Some(pool) = &self.pool else { return };
        let res = sqlx::query(
            "INSERT INTO production_cache (serial, port, today, total, updated) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(serial, port) DO UPDATE SET \
               today = excluded.today, total = excluded.total, updated = excluded.updated",
        )
        .bind(serial)
        .bind(port as i64)
        .bind(today_wh as i64)
        .bind(total_wh as i64)
        .bind(updated.to_rfc3339())
        .execute(pool)
        .await;

        if let Err(e) = res {
            error!(error = %e, serial, port, "failed to save production cache entry");
        }
    }

    pub async fn load_production_cache(&self) -> HashMap<(String, u8), (u32, u32)> {
        let Some(pool) = &self.pool else {
            return HashMap::new();
        };
        match sqlx::query("SELECT serial, port, today, total FROM production_cache")
            .fetch_all(pool)
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .map(|r| {
                    let serial: String = r.get("serial");
                    let port: i64 = r.get("port");
                    let today: i64 = r.get("today");
                    let total: i64 = r.get("total");
                    ((serial, port as u8), (today as u32, total as u32))
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "failed to load production cache");
                HashMap::new()
            }
        }
    }

    pub async fn clear_today_production(&self) {
        let Some(pool) = &self.pool else { return };
        if let Err(e) = sqlx::query("UPDATE production_cache SET today = 0")
            .execute(pool)
            .await
        {
            error!(error = %e, "failed to clear today production in persistence");
        }
    }

    // -- config cache -----------------------------------------------------

    pub async fn save_config(&self, key: &str, value: &serde_json::Value) {
        let Some(pool) = &self.pool else { return };
        let payload = value.to_string();
        let now = Utc::now().to_rfc3339();
        let res = sqlx::query(
            "INSERT INTO config_cache (key, value, updated) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated = excluded.updated",
        )
        .bind(key)
        .bind(payload)
        .bind(now)
        .execute(pool)
        .await;

        if let Err(e) = res {
            error!(error = %e, key, "failed to save config cache entry");
        }
    }

    pub async fn load_config(&self, key: &str) -> Option<serde_json::Value> {
        let pool = self.pool.as_ref()?;
        match sqlx::query("SELECT value FROM config_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await
        {
            Ok(Some(row)) => {
                let raw: String = row.get("value");
                serde_json::from_str(&raw).ok()
            }
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, key, "failed to load config cache entry");
                None
            }
        }
    }

    // -- metric samples ---------------------------------------------------

    pub async fn record_metric(&self, name: &str, value: f64, tags: Option<&str>) {
        let Some(pool) = &self.pool else { return };
        let now = Utc::now().to_rfc3339();
        let res = sqlx::query("INSERT INTO metrics (timestamp, name, value, tags) VALUES (?, ?, ?, ?)")
            .bind(now)
            .bind(name)
            .bind(value)
            .bind(tags)
            .execute(pool)
            .await;

        if let Err(e) = res {
            error!(error = %e, name, "failed to record metric sample");
        }
    }

    pub async fn metrics_since(&self, since: Option<DateTime<Utc>>, limit: i64) -> Vec<MetricSample> {
        let Some(pool) = &self.pool else {
            return Vec::new();
        };

        let result = match since {
            Some(since) => {
                sqlx::query("SELECT timestamp, name, value, tags FROM metrics WHERE timestamp >= ? ORDER BY timestamp DESC LIMIT ?")
                    .bind(since.to_rfc3339())
                    .bind(limit)
                    .fetch_all(pool)
                    .await
            }
            None => {
                sqlx::query("SELECT timestamp, name, value, tags FROM metrics ORDER BY timestamp DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(pool)
                    .await
            }
        };

        match result {
            Ok(rows) => rows
                .into_iter()
                .map(|r| MetricSample {
                    timestamp: r.get("timestamp"),
                    name: r.get("name"),
                    value: r.get("value"),
                    tags: r.get("tags"),
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "failed to query metric samples");
                Vec::new()
            }
        }
    }

    /// Deletes metric samples older than `days`. Returns the number of
    /// rows removed (0 on failure or when persistence is disabled).
    pub async fn cleanup_old_metrics(&self, days: i64) -> u64 {
        let Some(pool) = &self.pool else { return 0 };
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        match sqlx::query("DELETE FROM metrics WHERE timestamp < ?")
            .bind(cutoff)
            .execute(pool)
            .await
        {
            Ok(result) => result.rows_affected(),
            Err(e) => {
                error!(error = %e, "failed to clean up old metrics");
                0
            }
        }
    }

    // -- maintenance -------------------------------------------------------

    /// Produces a consistent copy of the database at `dest_path` using
    /// `VACUUM INTO`, written to a temp file and atomically renamed so a
    /// crash mid-write never corrupts a prior good backup.
    pub async fn backup(&self, dest_path: &str) -> anyhow::Result<()> {
        use anyhow::Context;

        let Some(pool) = &self.pool else {
            tracing::warn!(dest_path, "backup requested but persistence is disabled, skipping");
            return Ok(());
        };

        if let Some(parent) = std::path::Path::new(dest_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create backup dir {}", parent.display()))?;
        }

        let tmp_path = format!("{dest_path}.tmp");
        let _ = tokio::fs::remove_file(&tmp_path).await;

        let escaped = tmp_path.replace('\'', "''");
        sqlx::query(&format!("VACUUM INTO '{escaped}'"))
            .execute(pool)
            .await
            .with_context(|| format!("VACUUM INTO '{tmp_path}' failed"))?;

        tokio::fs::rename(&tmp_path, dest_path)
            .await
            .with_context(|| format!("rename '{tmp_path}' -> '{dest_path}' failed"))?;

        Ok(())
    }

    pub async fn vacuum(&self) {
        let Some(pool) = &self.pool else { return };
        if let Err(e) = sqlx::query("VACUUM").execute(pool).await {
            error!(error = %e, "VACUUM failed");
        }
    }

    pub async fn statistics(&self) -> Statistics {
        let database_size_bytes = tokio::fs::metadata(&self.database_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let Some(pool) = &self.pool else {
            return Statistics {
                database_path: self.database_path.clone(),
                database_size_bytes,
                production_cache_entries: 0,
                config_cache_entries: 0,
                metrics_entries: 0,
            };
        };

        async fn count(pool: &Pool<Sqlite>, table: &str) -> i64 {
            sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
                .fetch_one(pool)
                .await
                .map(|r| r.get::<i64, _>("n"))
                .unwrap_or_else(|e| {
                    error!(error = %e, table, "failed to count rows");
                    0
                })
        }

        Statistics {
            database_path: self.database_path.clone(),
            database_size_bytes,
            production_cache_entries: count(pool, "production_cache").await,
            config_cache_entries: count(pool, "config_cache").await,
            metrics_entries: count(pool, "metrics").await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_store_is_a_silent_no_op() {
        let store = PersistenceStore::open("sqlite::memory:", false).await;
        assert!(!store.is_enabled());
        store.save_production_cache("A", 1, 100, 200, Utc::now()).await;
        assert!(store.load_production_cache().await.is_empty());
    }

    #[tokio::test]
    async fn production_cache_round_trips() {
        let store = PersistenceStore::open("sqlite::memory:", true).await;
        assert!(store.is_enabled());
        let now = Utc::now();
        store.save_production_cache("A", 1, 1000, 50_000, now).await;
        store.save_production_cache("A", 2, 200, 5_000, now).await;

        let loaded = store.load_production_cache().await;
        assert_eq!(loaded.get(&("A".to_string(), 1)), Some(&(1000, 50_000)));
        assert_eq!(loaded.get(&("A".to_string(), 2)), Some(&(200, 5_000)));
    }

    #[tokio::test]
    async fn clear_today_production_zeroes_today_only() {
        let store = PersistenceStore::open("sqlite::memory:", true).await;
        let now = Utc::now();
        store.save_production_cache("A", 1, 1000, 50_000, now).await;

        store.clear_today_production().await;

        let loaded = store.load_production_cache().await;
        assert_eq!(loaded.get(&("A".to_string(), 1)), Some(&(0, 50_000)));
    }

    #[tokio::test]
    async fn config_cache_round_trips_json() {
        let store = PersistenceStore::open("sqlite::memory:", true).await;
        let value = serde_json::json!({"mi_entities": ["grid_voltage", "temperature"]});
        store.save_config("entity_filter", &value).await;

        let loaded = store.load_config("entity_filter").await;
        assert_eq!(loaded, Some(value));
    }

    #[tokio::test]
    async fn missing_config_key_returns_none() {
        let store = PersistenceStore::open("sqlite::memory:", true).await;
        assert_eq!(store.load_config("nope").await, None);
    }

    #[tokio::test]
    async fn metrics_round_trip_and_cleanup() {
        let store = PersistenceStore::open("sqlite::memory:", true).await;
        store.record_metric("query_duration_seconds", 0.42, Some("dtu=roof")).await;

        let samples = store.metrics_since(None, 10).await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "query_duration_seconds");

        // Everything just inserted is newer than "now", so nothing is cleaned up.
        let removed = store.cleanup_old_metrics(30).await;
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn statistics_reports_row_counts() {
        let store = PersistenceStore::open("sqlite::memory:", true).await;
        store.save_production_cache("A", 1, 100, 200, Utc::now()).await;
        store.save_config("k", &serde_json::json!(1)).await;
        store.record_metric("m", 1.0, None).await;

        let stats = store.statistics().await;
        assert_eq!(stats.production_cache_entries, 1);
        assert_eq!(stats.config_cache_entries, 1);
        assert_eq!(stats.metrics_entries, 1);
    }

    #[tokio::test]
    async fn backup_produces_a_file_with_identical_content() {
        let dir = std::env::temp_dir().join(format!("hoymiles_backup_test_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let db_path = dir.join("bridge.db");
        let backup_path = dir.join("backup.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let store = PersistenceStore::open(&db_url, true).await;
        store.save_production_cache("A", 1, 111, 222, Utc::now()).await;

        store.backup(backup_path.to_str().unwrap()).await.unwrap();
        assert!(backup_path.exists());

        let restored = PersistenceStore::open(backup_path.to_str().unwrap(), true).await;
        let loaded = restored.load_production_cache().await;
        assert_eq!(loaded.get(&("A".to_string(), 1)), Some(&(111, 222)));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
