use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }
}

/// Append-only `events.jsonl` log shared by the ladder and the agent chain.
///
/// - default fields are `type`, `session_id`, `level`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
/// - a disabled log builds the event but never touches the filesystem
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: Option<PathBuf>,
    session_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: Some(path.into()),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: None,
                session_id: String::new(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn emit_at(
        &self,
        level: EventLevel,
        event_type: &str,
        payload: EventPayload,
    ) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert(
            "level".to_string(),
            Value::String(level.as_str().to_string()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_deref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Emits without propagating I/O failures; the generation flow must not
    /// fail because the log could not be written.
    pub fn record(&self, level: EventLevel, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit_at(level, event_type, payload) {
            eprintln!("artforge: dropped event '{event_type}': {err:#}");
        }
    }
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "session-1");

        let mut payload = EventPayload::new();
        payload.insert("backend".to_string(), Value::String("sdxl".to_string()));
        let emitted = log.emit_at(EventLevel::Info, "ladder_attempt_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("ladder_attempt_started".to_string()));
        assert_eq!(parsed["session_id"], Value::String("session-1".to_string()));
        assert_eq!(parsed["level"], Value::String("info".to_string()));
        assert_eq!(parsed["backend"], Value::String("sdxl".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn warn_events_carry_warn_level() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "session-1");

        log.emit_at(EventLevel::Warn, "step_substituted", EventPayload::new())?;
        log.emit_at(EventLevel::Info, "chain_completed", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["level"], Value::String("warn".to_string()));
        assert_eq!(second["type"], Value::String("chain_completed".to_string()));
        Ok(())
    }

    #[test]
    fn disabled_log_returns_event_without_writing() -> anyhow::Result<()> {
        let log = EventLog::disabled();
        let emitted = log.emit_at(EventLevel::Info, "ladder_succeeded", EventPayload::new())?;
        assert_eq!(emitted["type"], Value::String("ladder_succeeded".to_string()));
        assert!(log.path().is_none());
        Ok(())
    }
}
