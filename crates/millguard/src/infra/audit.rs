//! Audit trail for machine-affecting events.
//!
//! Every lubrication pulse, machine-off request, power transition and
//! parameter change is appended to a JSONL file together with system
//! start/stop records.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    /// Oiler started a lubrication pulse
    PumpCycle,
    /// Idle timer asserted machine-off
    MachineOffRequested,
    MachinePowerOn,
    MachinePowerOff,
    /// Servo thread acknowledged a runtime parameter write
    ParamWrite,
    /// A parameter value changed
    ConfigChange,
    /// Servo thread stopped on a watchdog trip or I/O fault
    WatchdogTimeout,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe audit logger that writes to a JSONL file
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Open (or create) the audit file in append mode.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: AuditEntry) -> std::io::Result<()> {
        // A writer poisoned by a panicking thread is still usable for appends.
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(AuditEntry {
            timestamp_us,
            unix_us,
            event_type,
            details,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PumpCycleDetails {
    pub instance: String,
    pub cause: &'static str,
    pub pump_cycles: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineOffDetails {
    pub instance: String,
    pub idle_elapsed_s: u32,
    pub timeout_s: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigChangeDetails {
    pub param: String,
    pub old_value: u32,
    pub new_value: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_audit_logger_writes_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");

        let logger = AuditLogger::new(&path).unwrap();

        logger
            .log_event(
                1000,
                1704067200000000,
                AuditEventType::SystemStart,
                serde_json::json!({"version": "0.1.0"}),
            )
            .unwrap();

        let details = PumpCycleDetails {
            instance: "oiler-trigger.0".into(),
            cause: "homing",
            pump_cycles: 1,
        };
        logger
            .log_event(
                2000,
                1704067201000000,
                AuditEventType::PumpCycle,
                serde_json::to_value(&details).unwrap(),
            )
            .unwrap();

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();

        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let entry1: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry1.timestamp_us, 1000);
        assert_eq!(entry1.event_type, AuditEventType::SystemStart);

        let entry2: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(entry2.event_type, AuditEventType::PumpCycle);
        assert_eq!(entry2.details["cause"], "homing");
        assert!(lines[1].contains("\"event_type\":\"pump_cycle\""));
    }

    #[test]
    fn appends_to_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        for ts in [1, 2] {
            let logger = AuditLogger::new(&path).unwrap();
            logger
                .log_event(ts, 0, AuditEventType::SystemShutdown, serde_json::json!({}))
                .unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
