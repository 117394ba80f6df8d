//! One DTU's per-tick query → cache → discovery → publish pipeline
//! (spec §4.1).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::cache::ProductionCache;
use crate::circuit_breaker::{CircuitState, ErrorRecovery, RecoveryOutcome};
use crate::config::DtuConfig;
use crate::discovery::DiscoveryBuilder;
use crate::dtu::{DtuClient, DtuQueryError, PlantSnapshot};
use crate::health::HealthRegistry;
use crate::mqtt::MqttPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Ok,
    Busy,
    CircuitOpen,
    QueryFailed,
}

/// Optional hook for writing a successful snapshot to the JSON-lines dump
/// sink (spec §9 dump_data). The Supervisor wires this in; tests and
/// dry-run-only setups can omit it.
pub trait SnapshotSink: Send + Sync {
    fn record(&self, dtu: &str, snapshot: &PlantSnapshot);
}

/// Queries one DTU, applies its readings to the shared production cache,
/// and enqueues discovery/state messages. Non-reentrant: a tick that
/// arrives while the previous one is still running returns `Busy` rather
/// than queuing up (spec §4.1).
pub struct DtuPollJob {
    name: String,
    client: Arc<dyn DtuClient>,
    recovery: Arc<ErrorRecovery>,
    cache: Arc<ProductionCache>,
    discovery: Arc<DiscoveryBuilder>,
    publisher: MqttPublisher,
    health: Arc<HealthRegistry>,
    sink: Option<Arc<dyn SnapshotSink>>,
    dry_run: bool,
    running: AtomicBool,
    configured: AtomicBool,
}

impl DtuPollJob {
    pub fn new(
        dtu_config: &DtuConfig,
        client: Arc<dyn DtuClient>,
        recovery: Arc<ErrorRecovery>,
        cache: Arc<ProductionCache>,
        discovery: Arc<DiscoveryBuilder>,
        publisher: MqttPublisher,
        health: Arc<HealthRegistry>,
        sink: Option<Arc<dyn SnapshotSink>>,
        dry_run: bool,
    ) -> Self {
        Self {
            name: dtu_config.name.clone(),
            client,
            recovery,
            cache,
            discovery,
            publisher,
            health,
            sink,
            dry_run,
            running: AtomicBool::new(false),
            configured: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn execute(&self) -> JobOutcome {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(dtu = %self.name, "previous poll still in flight, skipping this tick (query_period may be too low)");
            return JobOutcome::Busy;
        }
        let outcome = self.run().await;
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run(&self) -> JobOutcome {
        let started = Instant::now();
        let breaker_name = format!("dtu_{}", self.name);

        let client = self.client.clone();
        let recovery_outcome = self
            .recovery
            .execute(&breaker_name, move || {
                let client = client.clone();
                async move { client.query().await }
            })
            .await;

        let breaker_state = self.recovery.breaker(&breaker_name).record().await;
        self.health.record_circuit_breaker_state(&self.name, breaker_state.state);

        let snapshot = match recovery_outcome {
            RecoveryOutcome::Success(snapshot) => {
                let elapsed = started.elapsed().as_secs_f64();
                self.health.record_query_success(&self.name, elapsed, chrono::Utc::now());
                snapshot
            }
            RecoveryOutcome::Rejected => {
                info!(dtu = %self.name, "circuit breaker open, skipping query");
                self.health.record_query_error(
                    &self.name,
                    "circuit_open",
                    "circuit breaker rejected the call".to_string(),
                    chrono::Utc::now(),
                );
                return JobOutcome::CircuitOpen;
            }
            RecoveryOutcome::Exhausted(err) => {
                let error_type = query_error_type(&err);
                self.health.record_query_error(&self.name, error_type, err.to_string(), chrono::Utc::now());
                return JobOutcome::QueryFailed;
            }
        };

        let mut snapshot = snapshot;
        let now = chrono::Utc::now();
        let mut keys = Vec::with_capacity(snapshot.inverters.len());
        for reading in snapshot.inverters.iter_mut() {
            self.cache.apply(reading, now).await;
            keys.push((reading.serial.clone(), reading.port));
        }
        let (today_wh, total_wh) = self.cache.sum_for_keys(&keys).await;
        snapshot.today_wh = today_wh;
        snapshot.total_wh = total_wh;

        if let Some(sink) = &self.sink {
            sink.record(&self.name, &snapshot);
        }

        for reading in &snapshot.inverters {
            self.health
                .set_inverter_gauges(&reading.serial, reading.port, reading.pv_power_w, reading.temperature_c);
        }
        self.health.set_dtu_gauges(&self.name, snapshot.pv_power_w, snapshot.today_wh, snapshot.total_wh);

        if self.dry_run {
            info!(dtu = %self.name, "dry_run enabled, not publishing to broker");
            return JobOutcome::Ok;
        }

        if !self.configured.load(Ordering::SeqCst) {
            for message in self.discovery.configs(&snapshot) {
                self.publisher.enqueue(message, &self.health);
            }
            self.configured.store(true, Ordering::SeqCst);
        }

        for message in self.discovery.states(&snapshot) {
            self.publisher.enqueue(message, &self.health);
        }

        JobOutcome::Ok
    }
}

fn query_error_type(err: &DtuQueryError) -> &'static str {
    match err {
        DtuQueryError::ConnectTimeout { .. } => "connect_timeout",
        DtuQueryError::Connect { .. } => "connect",
        DtuQueryError::Protocol(_) => "protocol",
    }
}

#[allow(dead_code)]
fn circuit_state_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntityFilterSettings, MqttSettings};
    use crate::discovery::EntityFilterConfig;
    use crate::persistence::PersistenceStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::watch;

    struct StubClient {
        calls: AtomicU32,
        fail_until: u32,
    }

    #[async_trait]
    impl DtuClient for StubClient {
        async fn query(&self) -> Result<PlantSnapshot, DtuQueryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_until {
                return Err(DtuQueryError::Protocol("stub failure".to_string()));
            }
            Ok(PlantSnapshot {
                dtu_serial: "DTU1".to_string(),
                pv_power_w: 500,
                today_wh: 1000,
                total_wh: 50_000,
                alarm_flag: false,
                inverters: vec![crate::dtu::InverterReading {
                    serial: "INV1".to_string(),
                    port: 1,
                    grid_voltage_v: 230.0,
                    grid_frequency_hz: 50.0,
                    temperature_c: 35.0,
                    operating_status: 1,
                    alarm_code: 0,
                    alarm_count: 0,
                    link_status: 1,
                    pv_voltage_v: 32.0,
                    pv_current_a: 2.0,
                    pv_power_w: 64.0,
                    today_wh: 1000,
                    total_wh: 50_000,
                }],
            })
        }
    }

    async fn harness(client: Arc<dyn DtuClient>, dry_run: bool) -> (DtuPollJob, Arc<HealthRegistry>) {
        let health = Arc::new(HealthRegistry::new(chrono::Utc::now(), 300).unwrap());
        let store = Arc::new(PersistenceStore::open("sqlite::memory:", false).await);
        let cache = Arc::new(ProductionCache::load(store).await);
        let discovery = Arc::new(DiscoveryBuilder::new("homeassistant", 0, EntityFilterConfig::default()));
        let recovery = Arc::new(ErrorRecovery::new(
            5,
            Duration::from_secs(60),
            crate::circuit_breaker::RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            false,
            Arc::new(crate::clock::SystemClock) as Arc<dyn crate::clock::Clock>,
        ));
        let (_tx, rx) = watch::channel(false);
        let settings = MqttSettings {
            broker: "127.0.0.1".to_string(),
            port: 18831,
            ..Default::default()
        };
        let (publisher, _driver, _drain) = MqttPublisher::spawn(&settings, 100, health.clone(), rx).unwrap();

        let dtu_config = DtuConfig {
            name: "roof".to_string(),
            host: "10.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
        };
        let job = DtuPollJob::new(
            &dtu_config,
            client,
            recovery,
            cache,
            discovery,
            publisher,
            health.clone(),
            None,
            dry_run,
        );
        let _ = EntityFilterSettings::default();
        (job, health)
    }

    #[tokio::test]
    async fn successful_query_aggregates_cache_and_marks_configured() {
        let client = Arc::new(StubClient {
            calls: AtomicU32::new(0),
            fail_until: 0,
        });
        let (job, health) = harness(client, true).await;

        let outcome = job.execute().await;
        assert_eq!(outcome, JobOutcome::Ok);
        assert!(job.configured.load(Ordering::SeqCst) == false, "dry_run never marks configured");

        let snap = health.snapshot(chrono::Utc::now());
        assert_eq!(snap.dtus["roof"].query_count, 1);
    }

    #[tokio::test]
    async fn concurrent_execute_returns_busy() {
        struct SlowClient(tokio::sync::Semaphore);

        #[async_trait]
        impl DtuClient for SlowClient {
            async fn query(&self) -> Result<PlantSnapshot, DtuQueryError> {
                let _permit = self.0.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(PlantSnapshot {
                    dtu_serial: "DTU1".to_string(),
                    pv_power_w: 0,
                    today_wh: 0,
                    total_wh: 0,
                    alarm_flag: false,
                    inverters: vec![],
                })
            }
        }

        let client = Arc::new(SlowClient(tokio::sync::Semaphore::new(10)));
        let (job, _health) = harness(client, true).await;
        let job = Arc::new(job);

        let j1 = job.clone();
        let first = tokio::spawn(async move { j1.execute().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = job.execute().await;

        assert_eq!(second, JobOutcome::Busy);
        assert_eq!(first.await.unwrap(), JobOutcome::Ok);
    }

    #[tokio::test]
    async fn query_failure_is_reported_as_query_failed() {
        let client = Arc::new(StubClient {
            calls: AtomicU32::new(0),
            fail_until: 100,
        });
        let (job, health) = harness(client, true).await;

        let outcome = job.execute().await;
        assert_eq!(outcome, JobOutcome::QueryFailed);

        let snap = health.snapshot(chrono::Utc::now());
        assert_eq!(snap.dtus["roof"].error_count, 1);
    }
}
