//! Monotonic per-`(serial, port)` production-value cache with a
//! once-per-day reset. Process-wide and shared by every `DtuPollJob`
//! (spec §3 "Ownership & lifecycle").

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::dtu::InverterReading;
use crate::persistence::PersistenceStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheEntry {
    pub today_wh: u32,
    pub total_wh: u32,
}

pub struct ProductionCache {
    entries: Mutex<HashMap<(String, u8), CacheEntry>>,
    persistence: Arc<PersistenceStore>,
}

impl ProductionCache {
    /// Builds a cache pre-populated from whatever the persistence layer
    /// already has on disk (survives process restarts).
    pub async fn load(persistence: Arc<PersistenceStore>) -> Self {
        let loaded = persistence.load_production_cache().await;
        let entries = loaded
            .into_iter()
            .map(|((serial, port), (today_wh, total_wh))| {
                ((serial, port), CacheEntry { today_wh, total_wh })
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
            persistence,
        }
    }

    /// Applies one inverter's port reading against the cache, mutating
    /// the reading in place so downstream consumers (DiscoveryBuilder)
    /// see the clamped value (spec §4.3, §9 "Cache ownership").
    ///
    /// Returns the cache's entry after this call. If `operating_status ==
    /// 0` the cache is left untouched (spec §8 testable property) and the
    /// pre-existing (possibly zero-initialized) entry is returned without
    /// mutating `reading`.
    pub async fn apply(&self, reading: &mut InverterReading, now: DateTime<Utc>) -> CacheEntry {
        let key = (reading.serial.clone(), reading.port);
        let mut entries = self.entries.lock().await;
        let existing = *entries.entry(key.clone()).or_default();

        if reading.operating_status == 0 {
            return existing;
        }

        let mut updated = existing;

        if reading.today_wh >= existing.today_wh {
            updated.today_wh = reading.today_wh;
        } else {
            warn!(
                serial = %key.0,
                port = key.1,
                cached = existing.today_wh,
                reported = reading.today_wh,
                "today production regressed, clamping to cached value"
            );
            reading.today_wh = existing.today_wh;
        }

        if reading.total_wh >= existing.total_wh {
            updated.total_wh = reading.total_wh;
        } else {
            warn!(
                serial = %key.0,
                port = key.1,
                cached = existing.total_wh,
                reported = reading.total_wh,
                "total production regressed, clamping to cached value"
            );
            reading.total_wh = existing.total_wh;
        }

        entries.insert(key.clone(), updated);
        drop(entries);

        self.persistence
            .save_production_cache(&key.0, key.1, updated.today_wh, updated.total_wh, now)
            .await;

        updated
    }

    /// Sum of cached `(today_wh, total_wh)` across exactly the given keys
    /// — used to recompute a DTU-level aggregate as the sum of its own
    /// ports' cache values (spec §4.3 "Aggregation").
    pub async fn sum_for_keys(&self, keys: &[(String, u8)]) -> (u32, u32) {
        let entries = self.entries.lock().await;
        keys.iter().fold((0u32, 0u32), |(today, total), key| {
            let e = entries.get(key).copied().unwrap_or_default();
            (today.saturating_add(e.today_wh), total.saturating_add(e.total_wh))
        })
    }

    /// Zeroes `today_wh` for every cached entry; `total_wh` is untouched.
    pub async fn clear_today(&self) {
        let mut entries = self.entries.lock().await;
        for entry in entries.values_mut() {
            entry.today_wh = 0;
        }
        let snapshot: Vec<_> = entries
            .iter()
            .map(|((serial, port), entry)| (serial.clone(), *port, *entry))
            .collect();
        drop(entries);

        let now = Utc::now();
        for (serial, port, entry) in snapshot {
            self.persistence
                .save_production_cache(&serial, port, entry.today_wh, entry.total_wh, now)
                .await;
        }
        self.persistence.clear_today_production().await;
        tracing::info!("daily production counters reset");
    }
}
