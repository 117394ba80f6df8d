//! Supervisor entry point: loads configuration, wires every component
//! together, runs the tick loop, and shuts down gracefully on
//! SIGINT/SIGTERM (spec §4 "Supervisor", §7 error handling).

mod cache;
mod circuit_breaker;
mod clock;
mod config;
mod coordinator;
mod discovery;
mod dtu;
mod dump;
mod health;
mod mqtt;
mod persistence;
mod poll_job;
mod rotate;
mod web;

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use cache::ProductionCache;
use circuit_breaker::{ErrorRecovery, RetryPolicy};
use clock::{Clock, SystemClock};
use config::{AppConfig, ConfigError};
use coordinator::Coordinator;
use discovery::{DiscoveryBuilder, EntityFilterConfig};
use dtu::TcpDtuClient;
use dump::DumpSink;
use health::HealthRegistry;
use mqtt::MqttPublisher;
use persistence::PersistenceStore;
use poll_job::{DtuPollJob, SnapshotSink};
use web::AppState;

const CONFIG_INVALID_EXIT: u8 = 1;
const MQTT_STARTUP_FAILURE_EXIT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("usage: hoymiles-mqtt-bridge <config.toml>");
        return ExitCode::from(CONFIG_INVALID_EXIT);
    };

    let config = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(CONFIG_INVALID_EXIT);
        }
    };

    if let Err(ConfigError::Invalid(errors)) = config.validate() {
        for e in errors {
            eprintln!("config error: {e}");
        }
        return ExitCode::from(CONFIG_INVALID_EXIT);
    }

    let _log_guard = init_logging(&config.logging);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(ExitRequest::MqttStartupFailure(e)) => {
            error!(error = %e, "mqtt startup failed, exiting");
            ExitCode::from(MQTT_STARTUP_FAILURE_EXIT)
        }
        Err(ExitRequest::Other(e)) => {
            error!(error = %e, "fatal error during startup");
            ExitCode::FAILURE
        }
    }
}

enum ExitRequest {
    MqttStartupFailure(anyhow::Error),
    Other(anyhow::Error),
}

impl From<anyhow::Error> for ExitRequest {
    fn from(e: anyhow::Error) -> Self {
        ExitRequest::Other(e)
    }
}

/// Sets up `tracing` per `logging.*` (AMBIENT STACK §A): `RUST_LOG`
/// overrides `logging.level` when set; `format = "json"` switches the
/// formatter; `console`/`file` independently gate the two output layers.
///
/// The file layer writes through `tracing_appender::non_blocking`, which
/// hands bytes to a dedicated writer thread so a full `RotatingWriter`
/// flush never blocks an async task; the returned guard must be kept
/// alive for the process lifetime or buffered lines are dropped on exit.
fn init_logging(logging: &config::LoggingSettings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);

    let console_layer = logging.console.then(|| {
        if logging.format == "json" {
            tracing_subscriber::fmt::layer().json().boxed()
        } else {
            tracing_subscriber::fmt::layer().boxed()
        }
    });

    let mut guard = None;
    let file_layer = logging.file.as_ref().and_then(|path| {
        match rotate::RotatingWriter::open(path, logging.max_bytes, logging.backup_count) {
            Ok(writer) => {
                let (non_blocking, worker_guard) = tracing_appender::non_blocking(writer);
                guard = Some(worker_guard);
                let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking);
                Some(if logging.format == "json" {
                    layer.json().boxed()
                } else {
                    layer.boxed()
                })
            }
            Err(e) => {
                eprintln!("failed to open log file {}: {e}", path.display());
                None
            }
        }
    });

    registry.with(console_layer).with(file_layer).init();
    guard
}

async fn run(config: AppConfig) -> Result<(), ExitRequest> {
    let now = chrono::Utc::now();
    let timezone: chrono_tz::Tz = config
        .timing
        .timezone
        .parse()
        .map_err(|_| ExitRequest::Other(anyhow::anyhow!("invalid timezone: {}", config.timing.timezone)))?;

    let persistence = Arc::new(PersistenceStore::open(&config.persistence.database_path, config.persistence.enabled).await);
    let cache = Arc::new(ProductionCache::load(persistence.clone()).await);
    let health = Arc::new(HealthRegistry::new(now, config.health.dtu_offline_threshold).context("build health registry")?);

    let clock = Arc::new(SystemClock) as Arc<dyn Clock>;

    let retry = RetryPolicy::new(
        config.modbus.retries + 1,
        Duration::from_secs(1),
        Duration::from_secs(config.recovery.max_backoff),
    );
    let recovery = Arc::new(ErrorRecovery::new(
        config.recovery.circuit_breaker_threshold,
        Duration::from_secs(config.recovery.circuit_breaker_timeout),
        retry,
        config.recovery.exponential_backoff,
        clock.clone(),
    ));

    let discovery = Arc::new(DiscoveryBuilder::new(
        config.mqtt.topic_prefix.clone(),
        config.timing.expire_after,
        EntityFilterConfig {
            mi_entities: config.entity_filter.mi_entities.clone(),
            port_entities: config.entity_filter.port_entities.clone(),
            exclude_inverters: config.entity_filter.exclude_inverters.clone(),
            value_multipliers: config.entity_filter.value_multipliers.clone(),
            entity_friendly_names: config.entity_filter.entity_friendly_names.clone(),
        },
    ));

    let sink: Option<Arc<dyn SnapshotSink>> = if config.dump_data {
        let path = config
            .dump_data_path
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("dump.jsonl"));
        match DumpSink::open(&path, config.dump_data_max_bytes) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to open dump_data sink, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publisher = match MqttPublisher::spawn(&config.mqtt, 1000, health.clone(), shutdown_rx.clone()) {
        Ok((publisher, driver, drain)) => {
            tokio::spawn(async move {
                let _ = driver.await;
            });
            tokio::spawn(async move {
                let _ = drain.await;
            });
            publisher
        }
        Err(e) => return Err(ExitRequest::MqttStartupFailure(e)),
    };

    let mut jobs = Vec::with_capacity(config.dtus.len());
    for dtu_config in &config.dtus {
        let client = Arc::new(TcpDtuClient::new(
            dtu_config.host.clone(),
            dtu_config.port,
            dtu_config.unit_id,
            Duration::from_secs(config.modbus.timeout),
        ));
        let job = Arc::new(DtuPollJob::new(
            dtu_config,
            client,
            recovery.clone(),
            cache.clone(),
            discovery.clone(),
            publisher.clone(),
            health.clone(),
            sink.clone(),
            config.dry_run,
        ));
        jobs.push(job);
    }

    let coordinator = Coordinator::new(jobs, cache.clone(), clock.clone(), timezone, config.timing.reset_hour);

    let health_server_handle = if config.health.enabled {
        let state = AppState {
            health: health.clone(),
            persistence: persistence.clone(),
        };
        let host = config.health.host.clone();
        let port = config.health.port;
        Some(tokio::spawn(async move {
            if let Err(e) = web::serve(&host, port, state).await {
                error!(error = %e, "health server exited unexpectedly");
            }
        }))
    } else {
        None
    };

    info!(dtus = config.dtus.len(), query_period = config.timing.query_period, "supervisor started");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(anyhow::Error::from)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(config.timing.query_period));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let exit_reason = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcomes = coordinator.execute_all().await;
                for (name, outcome) in outcomes {
                    if !matches!(outcome, poll_job::JobOutcome::Ok) {
                        warn!(dtu = %name, outcome = ?outcome, "poll tick did not complete cleanly");
                    }
                }
            }
            _ = &mut ctrl_c => break "SIGINT",
            _ = sigterm.recv() => break "SIGTERM",
        }
    };

    warn!(signal = exit_reason, "shutting down");

    let _ = shutdown_tx.send(true);
    publisher.flush(Duration::from_secs(5)).await;

    if let Some(handle) = health_server_handle {
        handle.abort();
    }

    if config.persistence.enabled && config.persistence.backup_on_shutdown {
        let dest = backup_destination(&config.persistence.database_path);
        match persistence.backup(&dest).await {
            Ok(()) => info!(dest = %dest, "shutdown backup complete"),
            Err(e) => error!(error = %e, "shutdown backup failed"),
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// `{stem}_backup_{timestamp}.db` next to the live database, mirroring
/// the original implementation's default backup naming.
fn backup_destination(database_path: &str) -> String {
    let path = std::path::Path::new(database_path);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("hoymiles-mqtt");
    let parent = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    parent.join(format!("{stem}_backup_{timestamp}.db")).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_destination_derives_timestamped_sibling_path() {
        let dest = backup_destination("/data/hoymiles-mqtt.db");
        assert!(dest.starts_with("/data/hoymiles-mqtt_backup_"));
        assert!(dest.ends_with(".db"));
    }

    #[test]
    fn backup_destination_handles_relative_paths() {
        let dest = backup_destination("hoymiles.db");
        assert!(dest.starts_with("hoymiles_backup_"));
    }
}
