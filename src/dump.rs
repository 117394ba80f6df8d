//! JSON-lines snapshot dump sink (spec §9 Open Question, resolved via
//! `original_source/hoymiles_mqtt/runners_new.py`'s `_dump_plant_data`:
//! one line per successful query, size-rotated like the log file).

use std::io::Write;
use std::sync::Mutex;

use serde_json::json;
use tracing::error;

use crate::dtu::PlantSnapshot;
use crate::poll_job::SnapshotSink;
use crate::rotate::RotatingWriter;

pub struct DumpSink {
    writer: Mutex<RotatingWriter>,
}

impl DumpSink {
    pub fn open(path: impl Into<std::path::PathBuf>, max_bytes: u64) -> std::io::Result<Self> {
        Ok(Self {
            writer: Mutex::new(RotatingWriter::open(path, max_bytes, 5)?),
        })
    }
}

impl SnapshotSink for DumpSink {
    fn record(&self, dtu: &str, snapshot: &PlantSnapshot) {
        let line = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "dtu": dtu,
            "dtu_serial": snapshot.dtu_serial,
            "pv_power_w": snapshot.pv_power_w,
            "today_wh": snapshot.today_wh,
            "total_wh": snapshot.total_wh,
            "inverters": snapshot.inverters,
        });

        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = writeln!(writer, "{line}") {
            error!(error = %e, "failed to write dump_data line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_writes_one_json_line_per_snapshot() {
        let dir = std::env::temp_dir().join(format!("hoymiles_dump_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dump.jsonl");

        let sink = DumpSink::open(&path, 10 * 1024 * 1024).unwrap();
        let snapshot = PlantSnapshot {
            dtu_serial: "DTU1".to_string(),
            pv_power_w: 100,
            today_wh: 10,
            total_wh: 1000,
            alarm_flag: false,
            inverters: vec![],
        };
        sink.record("roof", &snapshot);
        sink.record("roof", &snapshot);
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let parsed: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["dtu"], "roof");
        assert_eq!(parsed["dtu_serial"], "DTU1");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
