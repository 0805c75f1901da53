use crate::errors::SmonError;
use crate::log_retention::enforce_total_budget;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 4 * 1024 * 1024;

static RUN_LOG: OnceLock<Mutex<JsonlLogger>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub max_file_bytes: u64,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub ts_ms: u128,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl<'a> LogEvent<'a> {
    pub fn now(level: &'a str, event_type: &'a str, payload: Value) -> Self {
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self {
            ts_ms,
            level,
            event_type,
            payload,
        }
    }
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), SmonError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SmonError::Io(e.to_string()))?;
        }
        self.rotate_if_full()?;

        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            ts_ms: event.ts_ms,
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| SmonError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SmonError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| SmonError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| SmonError::Io(e.to_string()))?;
        Ok(())
    }

    /// Moves a full log aside as `<stem>-<unix secs>.jsonl` and prunes old
    /// rotations so the directory stays under `budget_bytes`.
    fn rotate_if_full(&self) -> Result<(), SmonError> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if len < self.max_file_bytes {
            return Ok(());
        }
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "run".to_string());
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let rotated = self.path.with_file_name(format!("{stem}-{secs}.jsonl"));
        fs::rename(&self.path, &rotated).map_err(|e| SmonError::Io(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            let _ = enforce_total_budget(parent, self.budget_bytes, Some(&self.path))?;
        }
        Ok(())
    }
}

/// Installs the process-wide run log. Later calls keep the first logger.
pub fn init_run_log(logger: JsonlLogger) -> bool {
    RUN_LOG.set(Mutex::new(logger)).is_ok()
}

/// Appends to the process-wide run log. A no-op until `init_run_log` ran;
/// write failures are swallowed so logging never takes the dashboard down.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Some(logger) = RUN_LOG.get() else {
        return;
    };
    if let Ok(logger) = logger.lock() {
        let _ = logger.append(&LogEvent::now(level, event_type, payload));
    }
}

pub fn default_log_path() -> PathBuf {
    let state_home = std::env::var_os("XDG_STATE_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(std::env::temp_dir);
    state_home.join("smon").join("run.jsonl")
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{truncate_json, JsonlLogger, LogEvent};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;

        logger
            .append(&LogEvent::now(
                "info",
                "command.started",
                json!({"text": "abcdefghijklmnopqrstuvwxyz"}),
            ))
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"command.started\""));
        assert!(text.contains("..."));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn full_log_is_rotated_before_the_next_append() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        std::fs::write(&path, vec![b'x'; 64]).expect("seed");
        let mut logger = JsonlLogger::new(&path);
        logger.max_file_bytes = 32;

        logger
            .append(&LogEvent::now("warn", "refresh.failed", json!({})))
            .expect("append");

        let current = std::fs::read_to_string(&path).expect("read");
        assert!(current.starts_with('{'));
        let rotated = std::fs::read_dir(dir.path())
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("run-"))
            .count();
        assert_eq!(rotated, 1);
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let value = truncate_json(json!({"bar": "██████████"}), 12);
        let text = value.as_str().expect("string");
        assert!(text.ends_with("..."));
    }
}
