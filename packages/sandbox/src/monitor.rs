// ABOUTME: Resource metrics and log snapshots of a sandbox
// ABOUTME: Normalizes the control plane's varying metrics and log payload shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SandboxError};

/// One resource usage sample
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SandboxMetrics {
    pub cpu_count: u32,
    pub cpu_used_pct: f64,
    pub mem_used: u64,
    pub mem_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    /// `None` only for the empty snapshot
    pub timestamp: Option<DateTime<Utc>>,
}

impl SandboxMetrics {
    /// The "no data yet" snapshot
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none()
            && self.cpu_count == 0
            && self.cpu_used_pct == 0.0
            && self.mem_used == 0
            && self.mem_total == 0
            && self.disk_used == 0
            && self.disk_total == 0
    }

    pub fn memory_used_percent(&self) -> f64 {
        if self.mem_total == 0 {
            0.0
        } else {
            self.mem_used as f64 / self.mem_total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "fatal" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxLog {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: LogLevel,
    pub message: String,
    pub source: String,
}

/// Latest sample of a metrics payload; an empty payload yields the empty snapshot
pub(crate) fn parse_metrics(value: &Value) -> Result<SandboxMetrics> {
    let sample = match value {
        Value::Null => return Ok(SandboxMetrics::empty()),
        Value::Array(samples) => match samples.last() {
            Some(sample) => sample,
            None => return Ok(SandboxMetrics::empty()),
        },
        Value::Object(obj) if obj.is_empty() => return Ok(SandboxMetrics::empty()),
        other => other,
    };

    let obj = sample.as_object().ok_or_else(|| {
        SandboxError::Transport(skiff_transport::TransportError::protocol(
            "metrics sample is not an object",
        ))
    })?;

    let int = |key: &str| obj.get(key).and_then(Value::as_u64).unwrap_or(0);

    Ok(SandboxMetrics {
        cpu_count: int("cpuCount") as u32,
        cpu_used_pct: obj.get("cpuUsedPct").and_then(Value::as_f64).unwrap_or(0.0),
        mem_used: int("memUsed"),
        mem_total: int("memTotal"),
        disk_used: int("diskUsed"),
        disk_total: int("diskTotal"),
        timestamp: parse_timestamp(obj.get("timestamp")),
    })
}

/// Structured `logEntries` first, then raw `logs` lines
pub(crate) fn parse_logs(value: &Value) -> Vec<SandboxLog> {
    let mut entries = Vec::new();

    if let Some(items) = value.get("logEntries").and_then(Value::as_array) {
        entries.extend(items.iter().filter_map(structured_log));
    }

    if let Some(items) = value.get("logs").and_then(Value::as_array) {
        entries.extend(items.iter().map(line_log));
    }

    entries
}

fn structured_log(value: &Value) -> Option<SandboxLog> {
    let obj = value.as_object()?;
    let fields = obj.get("fields").and_then(Value::as_object);
    let source = fields
        .and_then(|f| f.get("service").or_else(|| f.get("logger")))
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    Some(SandboxLog {
        timestamp: parse_timestamp(obj.get("timestamp")),
        level: LogLevel::parse(obj.get("level").and_then(Value::as_str).unwrap_or("info")),
        message: obj
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        source: source.to_string(),
    })
}

fn line_log(value: &Value) -> SandboxLog {
    let line = value.get("line").and_then(Value::as_str).unwrap_or_default();
    let timestamp = parse_timestamp(value.get("timestamp"));

    if let Some(mut log) = serde_json::from_str::<Value>(line)
        .ok()
        .as_ref()
        .and_then(structured_log)
    {
        log.timestamp = timestamp.or(log.timestamp);
        return log;
    }

    SandboxLog {
        timestamp,
        level: LogLevel::Info,
        message: line.to_string(),
        source: "log".to_string(),
    }
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
