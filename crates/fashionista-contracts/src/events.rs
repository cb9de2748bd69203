use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only JSONL log of upload and render lifecycle events.
///
/// Each line carries `type`, `session_id` and `ts`; the caller payload is
/// merged last. A writer without a path builds the event but writes nothing.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    session_id: String,
    lock: Arc<Mutex<()>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: Some(path.into()),
                session_id: session_id.into(),
                lock: Arc::new(Mutex::new(())),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: None,
                session_id: String::new(),
                lock: Arc::new(Mutex::new(())),
            }),
        }
    }

    pub fn from_option(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => Self::new(path, new_session_id()),
            None => Self::disabled(),
        }
    }

    /// Same file, new session id. Writers share the file lock.
    pub fn for_session(&self, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: self.inner.path.clone(),
                session_id: session_id.into(),
                lock: Arc::clone(&self.inner.lock),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_ref() else {
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
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
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
        let writer = EventWriter::new(&path, "session-1");

        let mut payload = EventPayload::new();
        payload.insert("public_id".to_string(), Value::String("abc".to_string()));
        let emitted = writer.emit("upload_completed", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("upload_completed".to_string()));
        assert_eq!(parsed["session_id"], Value::String("session-1".to_string()));
        assert_eq!(parsed["public_id"], Value::String("abc".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn sessions_share_one_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let first = EventWriter::new(&path, "one");
        let second = first.for_session("two");

        first.emit("upload_started", EventPayload::new())?;
        second.emit("upload_started", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let sessions = content
            .lines()
            .map(|line| serde_json::from_str::<Value>(line))
            .collect::<Result<Vec<Value>, _>>()?
            .into_iter()
            .map(|event| event["session_id"].as_str().unwrap_or("").to_string())
            .collect::<Vec<String>>();
        assert_eq!(sessions, vec!["one", "two"]);
        Ok(())
    }

    #[test]
    fn disabled_writer_still_builds_events() -> anyhow::Result<()> {
        let writer = EventWriter::disabled();
        let emitted = writer.emit("render_loaded", EventPayload::new())?;
        assert!(writer.path().is_none());
        assert_eq!(emitted["type"], Value::String("render_loaded".to_string()));
        Ok(())
    }
}
