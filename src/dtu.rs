//! The plant data model and the `DtuClient` boundary.
//!
//! Decoding the DTU's binary register protocol is out of scope for this
//! crate (see spec §1: "treated as a library returning a `PlantSnapshot`").
//! [`DtuClient`] is that seam: production wiring plugs in a real decoder,
//! tests plug in a canned one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// One consistent set of readings returned by a single DTU query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlantSnapshot {
    pub dtu_serial: String,
    pub pv_power_w: u32,
    pub today_wh: u32,
    pub total_wh: u32,
    pub alarm_flag: bool,
    pub inverters: Vec<InverterReading>,
}

/// Per-microinverter, per-port reading. `port` is 1-based; the
/// per-inverter fields (`grid_voltage_v`, ...) are repeated on every port
/// row belonging to the same `serial`, matching what the DTU actually
/// reports over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InverterReading {
    pub serial: String,
    pub port: u8,

    pub grid_voltage_v: f32,
    pub grid_frequency_hz: f32,
    pub temperature_c: f32,
    pub operating_status: u16,
    pub alarm_code: u16,
    pub alarm_count: u16,
    pub link_status: u8,

    pub pv_voltage_v: f32,
    pub pv_current_a: f32,
    pub pv_power_w: f32,
    pub today_wh: u32,
    pub total_wh: u32,
}

#[derive(Debug, Error)]
pub enum DtuQueryError {
    #[error("connect to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A single operation: query one DTU and get back its current snapshot.
/// The wire exchange (connect, frame, decode registers) lives behind this
/// trait — out of scope per spec §1.
#[async_trait]
pub trait DtuClient: Send + Sync {
    async fn query(&self) -> Result<PlantSnapshot, DtuQueryError>;
}

/// TCP-backed `DtuClient`. Establishes the transport connection under the
/// configured timeout; register decoding is the named external boundary
/// and is not implemented here (see spec §1's "treated as a library").
pub struct TcpDtuClient {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout: Duration,
}

impl TcpDtuClient {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            timeout,
        }
    }
}

#[async_trait]
impl DtuClient for TcpDtuClient {
    async fn query(&self) -> Result<PlantSnapshot, DtuQueryError> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DtuQueryError::ConnectTimeout {
                host: self.host.clone(),
                port: self.port,
                timeout: self.timeout,
            })?
            .map_err(|source| DtuQueryError::Connect {
                host: self.host.clone(),
                port: self.port,
                source,
            })?;
        drop(stream);

        // Register framing/decoding is the out-of-scope external boundary
        // named in spec §1; a real deployment plugs a decoder in here.
        Err(DtuQueryError::Protocol(
            "DTU register decoding is not implemented by this crate".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reading(serial: &str, port: u8, today_wh: u32, total_wh: u32) -> InverterReading {
        InverterReading {
            serial: serial.to_string(),
            port,
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
            today_wh,
            total_wh,
        }
    }

    #[test]
    fn plant_snapshot_round_trips_through_json() {
        let snap = PlantSnapshot {
            dtu_serial: "DTU1".into(),
            pv_power_w: 500,
            today_wh: 1000,
            total_wh: 50000,
            alarm_flag: false,
            inverters: vec![sample_reading("A", 1, 1000, 50000)],
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: PlantSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
    }

    #[tokio::test]
    async fn tcp_client_connect_timeout_reports_timeout() {
        // TEST-NET-1 address, port 9: expected to hang rather than RST on
        // most CI networks, so a very short timeout reliably fires.
        let client = TcpDtuClient::new("192.0.2.1", 9, 1, Duration::from_millis(50));
        let err = client.query().await.unwrap_err();
        assert!(matches!(err, DtuQueryError::ConnectTimeout { .. }));
    }
}
