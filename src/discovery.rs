//! Home Assistant MQTT discovery/state message construction (spec §4.4).
//!
//! Entity descriptors are a closed set of tagged variants with const-like
//! methods rather than dynamic per-name dispatch (spec §9 "Dynamic dispatch
//! by entity name").

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use crate::dtu::{InverterReading, PlantSnapshot};

#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtuEntity {
    PvPower,
    TodayProduction,
    TotalProduction,
    AlarmFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiEntity {
    GridVoltage,
    GridFrequency,
    Temperature,
    OperatingStatus,
    AlarmCode,
    AlarmCount,
    LinkStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortEntity {
    PvVoltage,
    PvCurrent,
    PvPower,
    TodayProduction,
    TotalProduction,
}

impl DtuEntity {
    const ALL: [DtuEntity; 4] = [
        DtuEntity::PvPower,
        DtuEntity::TodayProduction,
        DtuEntity::TotalProduction,
        DtuEntity::AlarmFlag,
    ];

    fn key(self) -> &'static str {
        match self {
            DtuEntity::PvPower => "pv_power",
            DtuEntity::TodayProduction => "today_production",
            DtuEntity::TotalProduction => "total_production",
            DtuEntity::AlarmFlag => "alarm_flag",
        }
    }

    fn platform(self) -> &'static str {
        match self {
            DtuEntity::AlarmFlag => "binary_sensor",
            _ => "sensor",
        }
    }

    fn device_class(self) -> Option<&'static str> {
        match self {
            DtuEntity::PvPower => Some("power"),
            DtuEntity::TodayProduction | DtuEntity::TotalProduction => Some("energy"),
            DtuEntity::AlarmFlag => Some("problem"),
        }
    }

    fn unit(self) -> Option<&'static str> {
        match self {
            DtuEntity::PvPower => Some("W"),
            DtuEntity::TodayProduction | DtuEntity::TotalProduction => Some("Wh"),
            DtuEntity::AlarmFlag => None,
        }
    }

    fn state_class(self) -> Option<&'static str> {
        match self {
            DtuEntity::PvPower => Some("measurement"),
            DtuEntity::TodayProduction => Some("total_increasing"),
            DtuEntity::TotalProduction => Some("total_increasing"),
            DtuEntity::AlarmFlag => None,
        }
    }

    /// Energy totals never expire (spec §4.4 `expire_ok`).
    fn expire_ok(self) -> bool {
        !matches!(self, DtuEntity::TodayProduction | DtuEntity::TotalProduction)
    }

    fn value(self, snapshot: &PlantSnapshot) -> Value {
        match self {
            DtuEntity::PvPower => json!(snapshot.pv_power_w),
            DtuEntity::TodayProduction => json!(snapshot.today_wh),
            DtuEntity::TotalProduction => json!(snapshot.total_wh),
            DtuEntity::AlarmFlag => json!(if snapshot.alarm_flag { "ON" } else { "OFF" }),
        }
    }

    fn default_name(self) -> &'static str {
        match self {
            DtuEntity::PvPower => "PV Power",
            DtuEntity::TodayProduction => "Today Production",
            DtuEntity::TotalProduction => "Total Production",
            DtuEntity::AlarmFlag => "Alarm",
        }
    }
}

impl MiEntity {
    const ALL: [MiEntity; 7] = [
        MiEntity::GridVoltage,
        MiEntity::GridFrequency,
        MiEntity::Temperature,
        MiEntity::OperatingStatus,
        MiEntity::AlarmCode,
        MiEntity::AlarmCount,
        MiEntity::LinkStatus,
    ];

    fn key(self) -> &'static str {
        match self {
            MiEntity::GridVoltage => "grid_voltage",
            MiEntity::GridFrequency => "grid_frequency",
            MiEntity::Temperature => "temperature",
            MiEntity::OperatingStatus => "operating_status",
            MiEntity::AlarmCode => "alarm_code",
            MiEntity::AlarmCount => "alarm_count",
            MiEntity::LinkStatus => "link_status",
        }
    }

    fn device_class(self) -> Option<&'static str> {
        match self {
            MiEntity::GridVoltage => Some("voltage"),
            MiEntity::GridFrequency => Some("frequency"),
            MiEntity::Temperature => Some("temperature"),
            _ => None,
        }
    }

    fn unit(self) -> Option<&'static str> {
        match self {
            MiEntity::GridVoltage => Some("V"),
            MiEntity::GridFrequency => Some("Hz"),
            MiEntity::Temperature => Some("°C"),
            _ => None,
        }
    }

    fn state_class(self) -> Option<&'static str> {
        match self {
            MiEntity::GridVoltage | MiEntity::GridFrequency | MiEntity::Temperature => {
                Some("measurement")
            }
            _ => None,
        }
    }

    /// Most per-inverter entities are unreliable while the inverter is
    /// idle (spec §4.4 `ignore_rule`); counters still report.
    fn ignore_rule(self, reading: &InverterReading) -> bool {
        match self {
            MiEntity::OperatingStatus | MiEntity::AlarmCode | MiEntity::AlarmCount | MiEntity::LinkStatus => false,
            _ => reading.operating_status == 0,
        }
    }

    fn value(self, reading: &InverterReading) -> Value {
        match self {
            MiEntity::GridVoltage => json!(reading.grid_voltage_v),
            MiEntity::GridFrequency => json!(reading.grid_frequency_hz),
            MiEntity::Temperature => json!(reading.temperature_c),
            MiEntity::OperatingStatus => json!(reading.operating_status),
            MiEntity::AlarmCode => json!(reading.alarm_code),
            MiEntity::AlarmCount => json!(reading.alarm_count),
            MiEntity::LinkStatus => json!(reading.link_status),
        }
    }

    fn default_name(self) -> &'static str {
        match self {
            MiEntity::GridVoltage => "Grid Voltage",
            MiEntity::GridFrequency => "Grid Frequency",
            MiEntity::Temperature => "Temperature",
            MiEntity::OperatingStatus => "Operating Status",
            MiEntity::AlarmCode => "Alarm Code",
            MiEntity::AlarmCount => "Alarm Count",
            MiEntity::LinkStatus => "Link Status",
        }
    }
}

impl PortEntity {
    const ALL: [PortEntity; 5] = [
        PortEntity::PvVoltage,
        PortEntity::PvCurrent,
        PortEntity::PvPower,
        PortEntity::TodayProduction,
        PortEntity::TotalProduction,
    ];

    fn key(self) -> &'static str {
        match self {
            PortEntity::PvVoltage => "pv_voltage",
            PortEntity::PvCurrent => "pv_current",
            PortEntity::PvPower => "pv_power",
            PortEntity::TodayProduction => "today_production",
            PortEntity::TotalProduction => "total_production",
        }
    }

    fn device_class(self) -> Option<&'static str> {
        match self {
            PortEntity::PvVoltage => Some("voltage"),
            PortEntity::PvCurrent => Some("current"),
            PortEntity::PvPower => Some("power"),
            PortEntity::TodayProduction | PortEntity::TotalProduction => Some("energy"),
        }
    }

    fn unit(self) -> Option<&'static str> {
        match self {
            PortEntity::PvVoltage => Some("V"),
            PortEntity::PvCurrent => Some("A"),
            PortEntity::PvPower => Some("W"),
            PortEntity::TodayProduction | PortEntity::TotalProduction => Some("Wh"),
        }
    }

    fn state_class(self) -> Option<&'static str> {
        match self {
            PortEntity::TodayProduction | PortEntity::TotalProduction => Some("total_increasing"),
            _ => Some("measurement"),
        }
    }

    fn expire_ok(self) -> bool {
        !matches!(self, PortEntity::TodayProduction | PortEntity::TotalProduction)
    }

    fn ignore_rule(self, reading: &InverterReading) -> bool {
        reading.operating_status == 0
    }

    fn value(self, reading: &InverterReading) -> Value {
        match self {
            PortEntity::PvVoltage => json!(reading.pv_voltage_v),
            PortEntity::PvCurrent => json!(reading.pv_current_a),
            PortEntity::PvPower => json!(reading.pv_power_w),
            PortEntity::TodayProduction => json!(reading.today_wh),
            PortEntity::TotalProduction => json!(reading.total_wh),
        }
    }

    fn default_name(self) -> &'static str {
        match self {
            PortEntity::PvVoltage => "PV Voltage",
            PortEntity::PvCurrent => "PV Current",
            PortEntity::PvPower => "PV Power",
            PortEntity::TodayProduction => "Today Production",
            PortEntity::TotalProduction => "Total Production",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityFilterConfig {
    pub mi_entities: Option<HashSet<String>>,
    pub port_entities: Option<HashSet<String>>,
    pub exclude_inverters: HashSet<String>,
    pub value_multipliers: HashMap<String, f64>,
    pub entity_friendly_names: HashMap<String, String>,
}

/// Produces discovery (`configs`) and state (`states`) MQTT messages from a
/// `PlantSnapshot`, filtered by the configured entity sets (spec §4.4).
pub struct DiscoveryBuilder {
    pub topic_prefix: String,
    pub expire_after: u32,
    pub filter: EntityFilterConfig,
}

impl DiscoveryBuilder {
    pub fn new(topic_prefix: impl Into<String>, expire_after: u32, filter: EntityFilterConfig) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            expire_after,
            filter,
        }
    }

    fn friendly_name(&self, key: &str, default: &str) -> String {
        self.filter
            .entity_friendly_names
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn apply_multiplier(&self, key: &str, value: Value) -> Value {
        let Some(multiplier) = self.filter.value_multipliers.get(key) else {
            return value;
        };
        match value.as_f64() {
            Some(n) => json!(n * multiplier),
            None => value,
        }
    }

    fn mi_allowed(&self, key: &str) -> bool {
        self.filter
            .mi_entities
            .as_ref()
            .map(|set| set.contains(key))
            .unwrap_or(true)
    }

    fn port_allowed(&self, key: &str) -> bool {
        self.filter
            .port_entities
            .as_ref()
            .map(|set| set.contains(key))
            .unwrap_or(true)
    }

    fn config_topic(&self, platform: &str, serial: &str, entity_prefix: &str, key: &str) -> String {
        format!("{}/{}/{}/{}_{}/config", self.topic_prefix, platform, serial, entity_prefix, key)
    }

    fn state_topic(&self, serial: &str, port: Option<u8>) -> String {
        match port {
            Some(p) => format!("{}/hoymiles/{}/{}/state", self.topic_prefix, serial, p),
            None => format!("{}/hoymiles/{}/state", self.topic_prefix, serial),
        }
    }

    fn availability_topic(&self, serial: &str) -> String {
        format!("{}/hoymiles/{}/availability", self.topic_prefix, serial)
    }

    fn config_payload(
        &self,
        name: String,
        unique_id: String,
        state_topic: &str,
        value_key: &str,
        serial: &str,
        device_class: Option<&str>,
        unit: Option<&str>,
        state_class: Option<&str>,
        expire_ok: bool,
    ) -> Value {
        let mut payload = json!({
            "device": {"identifiers": [serial], "name": serial},
            "name": name,
            "unique_id": unique_id,
            "state_topic": state_topic,
            "value_template": format!("{{{{ value_json.{value_key} }}}}"),
            "availability_topic": self.availability_topic(serial),
            "availability_template": "{{ value }}",
        });
        let obj = payload.as_object_mut().unwrap();
        if let Some(dc) = device_class {
            obj.insert("device_class".to_string(), json!(dc));
        }
        if let Some(u) = unit {
            obj.insert("unit_of_measurement".to_string(), json!(u));
        }
        if let Some(sc) = state_class {
            obj.insert("state_class".to_string(), json!(sc));
        }
        if !expire_ok && self.expire_after > 0 {
            obj.insert("expire_after".to_string(), json!(self.expire_after));
        }
        payload
    }

    /// Retained discovery messages: one per (device, entity), skipping
    /// excluded inverter serials in both the DTU device itself -- never
    /// excluded, since `exclude_inverters` names inverter serials, not
    /// DTU serials -- and every inverter/port scope.
    pub fn configs(&self, snapshot: &PlantSnapshot) -> Vec<MqttMessage> {
        let mut out = Vec::new();
        let dtu_serial = &snapshot.dtu_serial;

        for entity in DtuEntity::ALL {
            let key = entity.key();
            let name = self.friendly_name(key, entity.default_name());
            let unique_id = format!("hoymiles_{}_dtu_{}", dtu_serial, key);
            let state_topic = self.state_topic(dtu_serial, None);
            let payload = self.config_payload(
                name,
                unique_id,
                &state_topic,
                key,
                dtu_serial,
                entity.device_class(),
                entity.unit(),
                entity.state_class(),
                entity.expire_ok(),
            );
            out.push(MqttMessage {
                topic: self.config_topic(entity.platform(), dtu_serial, "dtu", key),
                payload: payload.to_string(),
                retain: true,
            });
        }

        let mut seen_inverters = HashSet::new();
        for inverter in &snapshot.inverters {
            if self.filter.exclude_inverters.contains(&inverter.serial) {
                continue;
            }

            if seen_inverters.insert(inverter.serial.clone()) {
                for entity in MiEntity::ALL {
                    let key = entity.key();
                    if !self.mi_allowed(key) {
                        continue;
                    }
                    let name = self.friendly_name(key, entity.default_name());
                    let unique_id = format!("hoymiles_{}_mi_{}", inverter.serial, key);
                    let state_topic = self.state_topic(&inverter.serial, None);
                    let payload = self.config_payload(
                        name,
                        unique_id,
                        &state_topic,
                        key,
                        &inverter.serial,
                        entity.device_class(),
                        entity.unit(),
                        entity.state_class(),
                        true,
                    );
                    out.push(MqttMessage {
                        topic: self.config_topic("sensor", &inverter.serial, "mi", key),
                        payload: payload.to_string(),
                        retain: true,
                    });
                }
            }

            for entity in PortEntity::ALL {
                let key = entity.key();
                if !self.port_allowed(key) {
                    continue;
                }
                let name = self.friendly_name(key, entity.default_name());
                let unique_id = format!("hoymiles_{}_port{}_{}", inverter.serial, inverter.port, key);
                let state_topic = self.state_topic(&inverter.serial, Some(inverter.port));
                let entity_prefix = format!("port{}", inverter.port);
                let payload = self.config_payload(
                    name,
                    unique_id,
                    &state_topic,
                    key,
                    &inverter.serial,
                    entity.device_class(),
                    entity.unit(),
                    entity.state_class(),
                    entity.expire_ok(),
                );
                out.push(MqttMessage {
                    topic: self.config_topic("sensor", &inverter.serial, &entity_prefix, key),
                    payload: payload.to_string(),
                    retain: true,
                });
            }
        }

        out
    }

    /// Non-retained state messages: one per (device, scope), skipping
    /// excluded inverters.
    pub fn states(&self, snapshot: &PlantSnapshot) -> Vec<MqttMessage> {
        let mut out = Vec::new();
        let dtu_serial = &snapshot.dtu_serial;

        let mut dtu_payload = serde_json::Map::new();
        for entity in DtuEntity::ALL {
            let key = entity.key();
            dtu_payload.insert(key.to_string(), self.apply_multiplier(key, entity.value(snapshot)));
        }
        out.push(MqttMessage {
            topic: self.state_topic(dtu_serial, None),
            payload: Value::Object(dtu_payload).to_string(),
            retain: false,
        });

        let mut seen_inverters: HashMap<String, serde_json::Map<String, Value>> = HashMap::new();
        for inverter in &snapshot.inverters {
            if self.filter.exclude_inverters.contains(&inverter.serial) {
                continue;
            }

            let mi_payload = seen_inverters
                .entry(inverter.serial.clone())
                .or_insert_with(serde_json::Map::new);
            for entity in MiEntity::ALL {
                let key = entity.key();
                if !self.mi_allowed(key) || entity.ignore_rule(inverter) {
                    continue;
                }
                mi_payload.insert(key.to_string(), self.apply_multiplier(key, entity.value(inverter)));
            }

            let mut port_payload = serde_json::Map::new();
            for entity in PortEntity::ALL {
                let key = entity.key();
                if !self.port_allowed(key) || entity.ignore_rule(inverter) {
                    continue;
                }
                port_payload.insert(key.to_string(), self.apply_multiplier(key, entity.value(inverter)));
            }
            out.push(MqttMessage {
                topic: self.state_topic(&inverter.serial, Some(inverter.port)),
                payload: Value::Object(port_payload).to_string(),
                retain: false,
            });
        }

        for (serial, payload) in seen_inverters {
            out.push(MqttMessage {
                topic: self.state_topic(&serial, None),
                payload: Value::Object(payload).to_string(),
                retain: false,
            });
        }

        out
    }
}
