//! Process-wide health/metrics state (spec §3 "HealthSnapshot", §4.8).
//!
//! Every write goes through the registry's mutex; reads take a snapshot
//! under the lock and format it outside, so a slow JSON/Prometheus
//! serialization never extends the critical section (spec §4.8).

use chrono::{DateTime, Utc};
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::circuit_breaker::CircuitState;

#[derive(Debug, Clone, Serialize)]
pub enum DtuStatus {
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "unknown")]
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct DtuHealth {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub query_count: u64,
    pub error_count: u64,
    pub status: DtuStatus,
}

impl Default for DtuHealth {
    fn default() -> Self {
        Self {
            last_success_at: None,
            last_error: None,
            last_error_at: None,
            query_count: 0,
            error_count: 0,
            status: DtuStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MqttHealth {
    pub published: u64,
    pub failed: u64,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub dtus: HashMap<String, DtuHealth>,
    pub mqtt: MqttHealth,
    pub circuit_breakers: HashMap<String, String>,
    pub healthy: bool,
}

struct State {
    started_at: DateTime<Utc>,
    started_monotonic: Instant,
    dtus: HashMap<String, DtuHealth>,
    mqtt: MqttHealth,
    circuit_breakers: HashMap<String, CircuitState>,
}

/// Thread-safe health/metrics state backing `/health`, `/ready`,
/// `/metrics`, and the per-tick gauges DtuPollJob pushes.
pub struct HealthRegistry {
    state: Mutex<State>,
    dtu_offline_threshold: chrono::Duration,

    registry: Registry,
    queries_total: IntCounterVec,
    query_duration_seconds: HistogramVec,
    query_errors_total: IntCounterVec,
    mqtt_messages_total: IntCounterVec,
    mqtt_errors_total: IntCounterVec,
    dtu_available: IntGaugeVec,
    inverter_power_watts: IntGaugeVec,
    inverter_temperature_celsius: IntGaugeVec,
    dtu_power_watts: IntGaugeVec,
    today_production_wh: IntGaugeVec,
    total_production_wh: IntGaugeVec,
    circuit_breaker_state: IntGaugeVec,
    uptime_seconds: IntGauge,
}

impl HealthRegistry {
    pub fn new(now: DateTime<Utc>, dtu_offline_threshold_secs: i64) -> anyhow::Result<Self> {
        let registry = Registry::new();

        let queries_total = IntCounterVec::new(
            prometheus::Opts::new("queries_total", "DTU queries by outcome"),
            &["dtu", "status"],
        )?;
        let query_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("query_duration_seconds", "DTU query latency"),
            &["dtu"],
        )?;
        let query_errors_total = IntCounterVec::new(
            prometheus::Opts::new("query_errors_total", "DTU query errors by type"),
            &["dtu", "type"],
        )?;
        let mqtt_messages_total = IntCounterVec::new(
            prometheus::Opts::new("mqtt_messages_total", "MQTT messages by type"),
            &["type"],
        )?;
        let mqtt_errors_total = IntCounterVec::new(
            prometheus::Opts::new("mqtt_errors_total", "MQTT errors by type"),
            &["type"],
        )?;
        let dtu_available = IntGaugeVec::new(
            prometheus::Opts::new("dtu_available", "1 if the DTU is currently reachable"),
            &["dtu"],
        )?;
        let inverter_power_watts = IntGaugeVec::new(
            prometheus::Opts::new("inverter_power_watts", "Per-port PV power in watts"),
            &["serial", "port"],
        )?;
        let inverter_temperature_celsius = IntGaugeVec::new(
            prometheus::Opts::new("inverter_temperature_celsius", "Inverter temperature in celsius"),
            &["serial"],
        )?;
        let dtu_power_watts = IntGaugeVec::new(
            prometheus::Opts::new("dtu_power_watts", "Aggregate PV power per DTU in watts"),
            &["dtu"],
        )?;
        let today_production_wh = IntGaugeVec::new(
            prometheus::Opts::new("today_production_wh", "Today's energy production in watt-hours"),
            &["dtu"],
        )?;
        let total_production_wh = IntGaugeVec::new(
            prometheus::Opts::new("total_production_wh", "Lifetime energy production in watt-hours"),
            &["dtu"],
        )?;
        let circuit_breaker_state = IntGaugeVec::new(
            prometheus::Opts::new("circuit_breaker_state", "0=closed/half-open, 1=open"),
            &["dtu"],
        )?;
        let uptime_seconds = IntGauge::new("uptime_seconds", "Seconds since process start")?;

        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(query_duration_seconds.clone()))?;
        registry.register(Box::new(query_errors_total.clone()))?;
        registry.register(Box::new(mqtt_messages_total.clone()))?;
        registry.register(Box::new(mqtt_errors_total.clone()))?;
        registry.register(Box::new(dtu_available.clone()))?;
        registry.register(Box::new(inverter_power_watts.clone()))?;
        registry.register(Box::new(inverter_temperature_celsius.clone()))?;
        registry.register(Box::new(dtu_power_watts.clone()))?;
        registry.register(Box::new(today_production_wh.clone()))?;
        registry.register(Box::new(total_production_wh.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            state: Mutex::new(State {
                started_at: now,
                started_monotonic: Instant::now(),
                dtus: HashMap::new(),
                mqtt: MqttHealth::default(),
                circuit_breakers: HashMap::new(),
            }),
            dtu_offline_threshold: chrono::Duration::seconds(dtu_offline_threshold_secs),
            registry,
            queries_total,
            query_duration_seconds,
            query_errors_total,
            mqtt_messages_total,
            mqtt_errors_total,
            dtu_available,
            inverter_power_watts,
            inverter_temperature_celsius,
            dtu_power_watts,
            today_production_wh,
            total_production_wh,
            circuit_breaker_state,
            uptime_seconds,
        })
    }


    pub fn record_query_success(&self, dtu: &str, duration_secs: f64, now: DateTime<Utc>) {
        self.queries_total.with_label_values(&[dtu, "success"]).inc();
        self.query_duration_seconds.with_label_values(&[dtu]).observe(duration_secs);
        self.dtu_available.with_label_values(&[dtu]).set(1);

        let mut state = self.state.lock().unwrap();
        let entry = state.dtus.entry(dtu.to_string()).or_default();
        entry.last_success_at = Some(now);
        entry.query_count += 1;
        entry.status = DtuStatus::Online;
    }

    pub fn record_query_error(&self, dtu: &str, error_type: &str, message: String, now: DateTime<Utc>) {
        self.queries_total.with_label_values(&[dtu, "error"]).inc();
        self.query_errors_total.with_label_values(&[dtu, error_type]).inc();
        self.dtu_available.with_label_values(&[dtu]).set(0);

        let mut state = self.state.lock().unwrap();
        let entry = state.dtus.entry(dtu.to_string()).or_default();
        entry.last_error = Some(message);
        entry.last_error_at = Some(now);
        entry.error_count += 1;
        entry.status = DtuStatus::Error;
    }

    pub fn record_circuit_breaker_state(&self, dtu: &str, state: CircuitState) {
        let value = if matches!(state, CircuitState::Open) { 1 } else { 0 };
        self.circuit_breaker_state.with_label_values(&[dtu]).set(value);
        self.state
            .lock()
            .unwrap()
            .circuit_breakers
            .insert(dtu.to_string(), state);
    }

    pub fn record_mqtt_published(&self) {
        self.mqtt_messages_total.with_label_values(&["published"]).inc();
        self.state.lock().unwrap().mqtt.published += 1;
    }

    pub fn record_mqtt_error(&self, error_type: &str) {
        self.mqtt_errors_total.with_label_values(&[error_type]).inc();
        self.state.lock().unwrap().mqtt.failed += 1;
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.state.lock().unwrap().mqtt.connected = connected;
    }

    pub fn set_inverter_gauges(&self, serial: &str, port: u8, power_w: f32, temperature_c: f32) {
        self.inverter_power_watts
            .with_label_values(&[serial, &port.to_string()])
            .set(power_w as i64);
        self.inverter_temperature_celsius
            .with_label_values(&[serial])
            .set(temperature_c as i64);
    }

    pub fn set_dtu_gauges(&self, dtu: &str, power_w: u32, today_wh: u32, total_wh: u32) {
        self.dtu_power_watts.with_label_values(&[dtu]).set(power_w as i64);
        self.today_production_wh.with_label_values(&[dtu]).set(today_wh as i64);
        self.total_production_wh.with_label_values(&[dtu]).set(total_wh as i64);
    }

    /// `true` iff at least one DTU has had a successful query within
    /// `dtu_offline_threshold` seconds of `now` (spec §6 `/health`).
    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().unwrap();
        state.dtus.values().any(|d| {
            d.last_success_at
                .map(|t| now - t <= self.dtu_offline_threshold)
                .unwrap_or(false)
        })
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let state = self.state.lock().unwrap();
        let uptime_seconds = state.started_monotonic.elapsed().as_secs();
        self.uptime_seconds.set(uptime_seconds as i64);
        let healthy = state.dtus.values().any(|d| {
            d.last_success_at
                .map(|t| now - t <= self.dtu_offline_threshold)
                .unwrap_or(false)
        });

        HealthSnapshot {
            started_at: state.started_at,
            uptime_seconds,
            dtus: state.dtus.clone(),
            mqtt: state.mqtt.clone(),
            circuit_breakers: state
                .circuit_breakers
                .iter()
                .map(|(k, v)| (k.clone(), format!("{v:?}").to_lowercase()))
                .collect(),
            healthy,
        }
    }

    /// Prometheus text exposition of the whole registry.
    pub fn render_prometheus(&self) -> anyhow::Result<String> {
        let uptime_seconds = self.state.lock().unwrap().started_monotonic.elapsed().as_secs();
        self.uptime_seconds.set(uptime_seconds as i64);

        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_at_startup_with_no_successes() {
        let now = Utc::now();
        let registry = HealthRegistry::new(now, 60).unwrap();
        assert!(!registry.is_healthy(now));
    }

    #[test]
    fn healthy_after_success_then_unhealthy_after_threshold() {
        let now = Utc::now();
        let registry = HealthRegistry::new(now, 60).unwrap();
        registry.record_query_success("roof", 0.12, now);
        assert!(registry.is_healthy(now));

        let later = now + chrono::Duration::seconds(61);
        assert!(!registry.is_healthy(later));
    }

    #[test]
    fn snapshot_reflects_recorded_query_counts() {
        let now = Utc::now();
        let registry = HealthRegistry::new(now, 60).unwrap();
        registry.record_query_success("roof", 0.1, now);
        registry.record_query_error("garage", "timeout", "boom".to_string(), now);

        let snap = registry.snapshot(now);
        assert_eq!(snap.dtus["roof"].query_count, 1);
        assert_eq!(snap.dtus["garage"].error_count, 1);
        assert!(snap.healthy, "roof had a recent success");
    }

    #[test]
    fn prometheus_output_contains_registered_metric_names() {
        let now = Utc::now();
        let registry = HealthRegistry::new(now, 60).unwrap();
        registry.record_query_success("roof", 0.1, now);
        registry.set_dtu_gauges("roof", 500, 1000, 50_000);

        let text = registry.render_prometheus().unwrap();
        assert!(text.contains("queries_total"));
        assert!(text.contains("dtu_power_watts"));
    }

    #[test]
    fn render_prometheus_includes_uptime_gauge() {
        let now = Utc::now();
        let registry = HealthRegistry::new(now, 60).unwrap();

        let text = registry.render_prometheus().unwrap();
        assert!(text.contains("uptime_seconds"));
    }

    #[test]
    fn circuit_breaker_state_surfaces_in_snapshot() {
        let now = Utc::now();
        let registry = HealthRegistry::new(now, 60).unwrap();
        registry.record_circuit_breaker_state("roof", CircuitState::Open);

        let snap = registry.snapshot(now);
        assert_eq!(snap.circuit_breakers["roof"], "open");
    }
}
