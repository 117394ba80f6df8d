//! Fans out one poll per configured DTU each tick and runs the
//! once-per-day production-counter reset (spec §4.2).

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono_tz::Tz;
use tokio::task::JoinSet;
use tracing::info;

use crate::cache::ProductionCache;
use crate::clock::Clock;
use crate::poll_job::{DtuPollJob, JobOutcome};

pub struct Coordinator {
    jobs: Vec<Arc<DtuPollJob>>,
    cache: Arc<ProductionCache>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    reset_hour: u32,
    last_reset_day: StdMutex<Option<u32>>,
}

impl Coordinator {
    pub fn new(jobs: Vec<Arc<DtuPollJob>>, cache: Arc<ProductionCache>, clock: Arc<dyn Clock>, timezone: Tz, reset_hour: u32) -> Self {
        Self {
            jobs,
            cache,
            clock,
            timezone,
            reset_hour,
            last_reset_day: StdMutex::new(None),
        }
    }

    /// Runs `day_boundary_check` then fans out every job concurrently,
    /// joining before returning (spec §4.2 / §5 ordering guarantees).
    pub async fn execute_all(&self) -> Vec<(String, JobOutcome)> {
        self.day_boundary_check().await;

        let mut set = JoinSet::new();
        for job in &self.jobs {
            let job = job.clone();
            set.spawn(async move {
                let outcome = job.execute().await;
                (job.name().to_string(), outcome)
            });
        }

        let mut results = Vec::with_capacity(self.jobs.len());
        while let Some(joined) = set.join_next().await {
            if let Ok(pair) = joined {
                results.push(pair);
            }
        }
        results
    }

    /// Exactly-once-per-day reset in the configured zone (spec §4.2):
    /// fires on the first tick whose local hour equals `reset_hour`, and
    /// is a no-op on every later tick that falls within the same hour.
    async fn day_boundary_check(&self) {
        use chrono::{Datelike, Timelike};

        let now_local = self.clock.now_in(self.timezone);
        if now_local.hour() != self.reset_hour {
            return;
        }

        let today = now_local.day();
        let already_reset = {
            let mut last = self.last_reset_day.lock().unwrap();
            if *last == Some(today) {
                true
            } else {
                *last = Some(today);
                false
            }
        };

        if !already_reset {
            info!(hour = self.reset_hour, "day boundary reached, resetting today production counters");
            self.cache.clear_today().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::ErrorRecovery;
    use crate::clock::FixedClock;
    use crate::config::{DtuConfig, MqttSettings};
    use crate::discovery::{DiscoveryBuilder, EntityFilterConfig};
    use crate::dtu::{DtuClient, DtuQueryError, InverterReading, PlantSnapshot};
    use crate::health::HealthRegistry;
    use crate::mqtt::MqttPublisher;
    use crate::persistence::PersistenceStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tokio::sync::watch;

    struct StubClient;

    #[async_trait]
    impl DtuClient for StubClient {
        async fn query(&self) -> Result<PlantSnapshot, DtuQueryError> {
            Ok(PlantSnapshot {
                dtu_serial: "DTU1".to_string(),
                pv_power_w: 10,
                today_wh: 5,
                total_wh: 500,
                alarm_flag: false,
                inverters: vec![InverterReading {
                    serial: "INV1".to_string(),
                    port: 1,
                    grid_voltage_v: 230.0,
                    grid_frequency_hz: 50.0,
                    temperature_c: 30.0,
                    operating_status: 1,
                    alarm_code: 0,
                    alarm_count: 0,
                    link_status: 1,
                    pv_voltage_v: 30.0,
                    pv_current_a: 1.0,
                    pv_power_w: 10.0,
                    today_wh: 5,
                    total_wh: 500,
                }],
            })
        }
    }

    async fn make_job(name: &str, health: Arc<HealthRegistry>) -> Arc<DtuPollJob> {
        let store = Arc::new(PersistenceStore::open("sqlite::memory:", false).await);
        let cache = Arc::new(ProductionCache::load(store).await);
        let discovery = Arc::new(DiscoveryBuilder::new("homeassistant", 0, EntityFilterConfig::default()));
        let recovery = Arc::new(ErrorRecovery::new(
            5,
            Duration::from_secs(60),
            crate::circuit_breaker::RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            false,
            Arc::new(crate::clock::SystemClock) as Arc<dyn Clock>,
        ));
        let (_tx, rx) = watch::channel(false);
        let settings = MqttSettings {
            broker: "127.0.0.1".to_string(),
            port: 18832,
            ..Default::default()
        };
        let (publisher, _d, _w) = MqttPublisher::spawn(&settings, 100, health.clone(), rx).unwrap();
        let dtu_config = DtuConfig {
            name: name.to_string(),
            host: "10.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
        };
        Arc::new(DtuPollJob::new(
            &dtu_config,
            Arc::new(StubClient),
            recovery,
            cache,
            discovery,
            publisher,
            health,
            None,
            true,
        ))
    }

    #[tokio::test]
    async fn execute_all_runs_every_job_and_reports_outcomes() {
        let health = Arc::new(HealthRegistry::new(chrono::Utc::now(), 300).unwrap());
        let job_a = make_job("a", health.clone()).await;
        let job_b = make_job("b", health.clone()).await;

        let store = Arc::new(PersistenceStore::open("sqlite::memory:", false).await);
        let cache = Arc::new(ProductionCache::load(store).await);
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()));
        let coordinator = Coordinator::new(vec![job_a, job_b], cache, clock, "UTC".parse().unwrap(), 23);

        let results = coordinator.execute_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, outcome)| *outcome == JobOutcome::Ok));
    }

    #[tokio::test]
    async fn day_boundary_check_resets_exactly_once_in_the_reset_hour() {
        let health = Arc::new(HealthRegistry::new(chrono::Utc::now(), 300).unwrap());
        let job = make_job("a", health).await;

        let store = Arc::new(PersistenceStore::open("sqlite::memory:", false).await);
        let cache = Arc::new(ProductionCache::load(store).await);

        let mut r = InverterReading {
            serial: "INV1".to_string(),
            port: 1,
            grid_voltage_v: 230.0,
            grid_frequency_hz: 50.0,
            temperature_c: 30.0,
            operating_status: 1,
            alarm_code: 0,
            alarm_count: 0,
            link_status: 1,
            pv_voltage_v: 30.0,
            pv_current_a: 1.0,
            pv_power_w: 10.0,
            today_wh: 777,
            total_wh: 999,
        };
        cache.apply(&mut r, Utc::now()).await;

        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 23, 0, 0).unwrap()));
        let coordinator = Coordinator::new(vec![job], cache.clone(), clock.clone(), "UTC".parse().unwrap(), 23);

        coordinator.execute_all().await;
        let (today, _total) = cache.sum_for_keys(&[("INV1".to_string(), 1)]).await;
        assert_eq!(today, 0, "reset hour tick clears today_wh");

        // A second tick still inside the same hour must not attempt another reset.
        let mut r2 = InverterReading {
            serial: "INV1".to_string(),
            port: 1,
            grid_voltage_v: 230.0,
            grid_frequency_hz: 50.0,
            temperature_c: 30.0,
            operating_status: 1,
            alarm_code: 0,
            alarm_count: 0,
            link_status: 1,
            pv_voltage_v: 30.0,
            pv_current_a: 1.0,
            pv_power_w: 10.0,
            today_wh: 42,
            total_wh: 999,
        };
        cache.apply(&mut r2, Utc::now()).await;
        coordinator.execute_all().await;
        let (today2, _) = cache.sum_for_keys(&[("INV1".to_string(), 1)]).await;
        assert_eq!(today2, 42, "second tick in the same hour does not reset again");
    }
}
