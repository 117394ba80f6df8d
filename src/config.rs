//! TOML configuration loading and validation (spec §6, AMBIENT STACK §C).
//!
//! Wire decoding and CLI parsing are out of scope (spec §1); what remains
//! in scope is reading the one positional config-file path, parsing it,
//! and validating it against the fatal-at-startup checks spec §7 names.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to read password file '{path}': {source}")]
    PasswordFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DtuConfig {
    #[serde(default = "default_dtu_name")]
    pub name: String,
    pub host: String,
    #[serde(default = "default_dtu_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_dtu_name() -> String {
    "DTU".to_string()
}
fn default_dtu_port() -> u16 {
    502
}
fn default_unit_id() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    pub tls: bool,
    pub tls_insecure: bool,
    pub tls_ca_cert: Option<PathBuf>,
    pub client_id: String,
    pub keepalive: u64,
    pub qos: u8,
    pub topic_prefix: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker: String::new(),
            port: 1883,
            user: None,
            password: None,
            password_file: None,
            tls: false,
            tls_insecure: false,
            tls_ca_cert: None,
            client_id: "hoymiles-mqtt".to_string(),
            keepalive: 60,
            qos: 1,
            topic_prefix: "homeassistant".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModbusSettings {
    pub timeout: u64,
    pub retries: u32,
    pub reconnect_delay: f64,
    pub reconnect_delay_max: f64,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            timeout: 3,
            retries: 3,
            reconnect_delay: 0.0,
            reconnect_delay_max: 300.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EntityFilterSettings {
    pub mi_entities: Option<HashSet<String>>,
    pub port_entities: Option<HashSet<String>>,
    pub exclude_inverters: HashSet<String>,
    pub value_multipliers: HashMap<String, f64>,
    pub entity_friendly_names: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub query_period: u64,
    pub expire_after: u32,
    pub reset_hour: u32,
    pub timezone: String,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            query_period: 60,
            expire_after: 0,
            reset_hour: 23,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub database_path: String,
    pub backup_on_shutdown: bool,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: "/data/hoymiles-mqtt.db".to_string(),
            backup_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub metrics_enabled: bool,
    pub dtu_offline_threshold: i64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
            metrics_enabled: true,
            dtu_offline_threshold: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
    pub file: Option<PathBuf>,
    pub console: bool,
    pub max_bytes: u64,
    pub backup_count: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "standard".to_string(),
            file: None,
            console: true,
            max_bytes: 10 * 1024 * 1024,
            backup_count: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub exponential_backoff: bool,
    pub max_backoff: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            exponential_backoff: true,
            max_backoff: 60,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttSettings,
    pub dtus: Vec<DtuConfig>,
    pub modbus: ModbusSettings,
    pub entity_filter: EntityFilterSettings,
    pub timing: TimingSettings,
    pub persistence: PersistenceSettings,
    pub health: HealthSettings,
    pub logging: LoggingSettings,
    pub recovery: RecoverySettings,
    pub dry_run: bool,
    pub dump_data: bool,
    pub dump_data_path: Option<PathBuf>,
    #[serde(default = "default_dump_data_max_bytes")]
    pub dump_data_max_bytes: u64,
}

fn default_dump_data_max_bytes() -> u64 {
    10 * 1024 * 1024
}

/// Reads and parses the config file at `path`. Missing/unknown keys are
/// tolerated via `#[serde(default)]` on every nested settings struct, per
/// AMBIENT STACK §C.
pub fn load(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    let mut config: AppConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })?;

    if let Some(password_file) = &config.mqtt.password_file {
        let contents = std::fs::read_to_string(password_file).map_err(|source| ConfigError::PasswordFile {
            path: password_file.display().to_string(),
            source,
        })?;
        config.mqtt.password = Some(contents.trim().to_string());
    }

    Ok(config)
}

impl AppConfig {
    /// Fatal-at-startup validation (spec §6/§7). Collects every violation
    /// rather than stopping at the first, so a misconfigured file is fixed
    /// in one pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.dtus.is_empty() {
            errors.push("at least one DTU must be configured under `dtus`".to_string());
        }
        for dtu in &self.dtus {
            if dtu.host.trim().is_empty() {
                errors.push(format!("dtu '{}': host must not be empty", dtu.name));
            }
        }

        if self.mqtt.broker.trim().is_empty() {
            errors.push("mqtt.broker must not be empty".to_string());
        }
        if self.mqtt.qos > 2 {
            errors.push(format!("mqtt.qos must be 0, 1, or 2 (got {})", self.mqtt.qos));
        }
        if self.mqtt.password.is_some() && self.mqtt.password_file.is_some() {
            errors.push("mqtt.password and mqtt.password_file are mutually exclusive".to_string());
        }
        if let Some(ca) = &self.mqtt.tls_ca_cert {
            if !ca.exists() {
                errors.push(format!("mqtt.tls_ca_cert path does not exist: {}", ca.display()));
            }
        }

        if self.timing.reset_hour > 23 {
            errors.push(format!(
                "timing.reset_hour must be 0-23 (got {})",
                self.timing.reset_hour
            ));
        }
        if self.timing.timezone.parse::<chrono_tz::Tz>().is_err() {
            errors.push(format!("timing.timezone is not a recognised zone: {}", self.timing.timezone));
        }
        if self.timing.expire_after > 0 && self.timing.expire_after as u64 <= self.timing.query_period {
            errors.push("timing.expire_after must be greater than timing.query_period when enabled".to_string());
        }

        if self.recovery.circuit_breaker_threshold == 0 {
            errors.push("recovery.circuit_breaker_threshold must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[[dtus]]
name = "roof"
host = "192.168.1.50"

[mqtt]
broker = "localhost"
"#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.dtus.len(), 1);
        assert_eq!(config.dtus[0].name, "roof");
        assert_eq!(config.dtus[0].port, 502);
        assert_eq!(config.mqtt.broker, "localhost");
        assert_eq!(config.mqtt.topic_prefix, "homeassistant");
        assert_eq!(config.timing.reset_hour, 23);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_config_fails_validation_with_no_dtus_and_no_broker() {
        let config: AppConfig = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err();
        let ConfigError::Invalid(messages) = err else {
            panic!("expected Invalid variant");
        };
        assert!(messages.iter().any(|m| m.contains("at least one DTU")));
        assert!(messages.iter().any(|m| m.contains("mqtt.broker")));
    }

    #[test]
    fn reset_hour_out_of_range_is_rejected() {
        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.timing.reset_hour = 24;
        let err = config.validate().unwrap_err();
        let ConfigError::Invalid(messages) = err else {
            panic!("expected Invalid variant");
        };
        assert!(messages.iter().any(|m| m.contains("reset_hour")));
    }

    #[test]
    fn password_and_password_file_are_mutually_exclusive() {
        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.mqtt.password = Some("hunter2".to_string());
        config.mqtt.password_file = Some(PathBuf::from("/nonexistent"));
        let err = config.validate().unwrap_err();
        let ConfigError::Invalid(messages) = err else {
            panic!("expected Invalid variant");
        };
        assert!(messages.iter().any(|m| m.contains("mutually exclusive")));
    }

    #[test]
    fn unrecognised_timezone_is_rejected() {
        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.timing.timezone = "Not/AZone".to_string();
        let err = config.validate().unwrap_err();
        let ConfigError::Invalid(messages) = err else {
            panic!("expected Invalid variant");
        };
        assert!(messages.iter().any(|m| m.contains("timezone")));
    }

    #[test]
    fn password_file_overrides_password_at_load_time() {
        let dir = std::env::temp_dir().join(format!("hoymiles_cfg_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let pw_path = dir.join("mqtt_password");
        std::fs::write(&pw_path, "from-file\n").unwrap();

        let toml_path = dir.join("config.toml");
        std::fs::write(
            &toml_path,
            format!(
                "[[dtus]]\nname = \"roof\"\nhost = \"h\"\n\n[mqtt]\nbroker = \"localhost\"\npassword_file = \"{}\"\n",
                pw_path.display()
            ),
        )
        .unwrap();

        let config = load(toml_path.to_str().unwrap()).unwrap();
        assert_eq!(config.mqtt.password.as_deref(), Some("from-file"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
