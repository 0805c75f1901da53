use crate::config::OutputConfig;
use crate::errors::{CommandError, CommandErrorKind, SmonError};
use crate::logging::append_run_log;
use crate::runtime::FileSystem;
use crate::slurm::SlurmSource;
use crate::types::JobState;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailContent {
    Text(String),
    /// Missing, unreadable or never written. Shown as a notice, not an error.
    Unavailable(String),
}

impl DetailContent {
    pub fn as_text(&self) -> &str {
        match self {
            Self::Text(text) | Self::Unavailable(text) => text,
        }
    }
}

/// `key=value` pairs from `scontrol show job -o`. A token that does not
/// open with a key continues the previous value, which keeps
/// `Command=/x/run.sh --a b --lr=0.1` in one piece.
pub fn parse_scontrol_record(output: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let Some(line) = output.lines().find(|l| !l.trim().is_empty()) else {
        return fields;
    };
    let mut last_key: Option<String> = None;
    for part in line.split_whitespace() {
        match part.split_once('=') {
            Some((key, value)) if is_record_key(key) => {
                fields.insert(key.to_string(), value.to_string());
                last_key = Some(key.to_string());
            }
            _ => {
                if let Some(value) = last_key.as_ref().and_then(|k| fields.get_mut(k)) {
                    value.push(' ');
                    value.push_str(part);
                }
            }
        }
    }
    fields
}

/// scontrol keys look like `JobId`, `CPUs/Task` or `ReqB:S:C:T`; option
/// tokens such as `--lr=0.1` or `/x/a=b` inside a value do not.
fn is_record_key(key: &str) -> bool {
    key.starts_with(|c: char| c.is_ascii_alphabetic())
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '/'))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPaths {
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub command: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
}

impl JobPaths {
    pub fn from_record(record: &BTreeMap<String, String>) -> Self {
        let work_dir = record.get("WorkDir").and_then(|v| usable_path(v, None));
        let resolve = |key: &str| {
            record
                .get(key)
                .and_then(|v| usable_path(v, work_dir.as_deref()))
        };
        Self {
            stdout: resolve("StdOut"),
            stderr: resolve("StdErr"),
            command: record
                .get("Command")
                .and_then(|v| v.split_whitespace().next())
                .and_then(|v| usable_path(v, work_dir.as_deref())),
            work_dir: work_dir.clone(),
        }
    }
}

fn usable_path(value: &str, base: Option<&Path>) -> Option<PathBuf> {
    let value = value.trim();
    if value.is_empty() || value == "(null)" || value == "/dev/null" {
        return None;
    }
    let path = PathBuf::from(value);
    match base {
        Some(base) if path.is_relative() => Some(base.join(path)),
        _ => Some(path),
    }
}

/// Output files of running or pending jobs may still grow.
pub fn should_follow(state: JobState, follow_enabled: bool) -> bool {
    follow_enabled && state.is_active()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowStatus {
    Unchanged,
    Appended(usize),
    /// The file shrank; buffered lines were discarded and reading restarted.
    Truncated,
    Unavailable,
}

/// Tails a file: the first read takes at most `tail_bytes` from the end,
/// later reads continue from the last offset. Keeps at most `max_lines`.
#[derive(Debug, Clone)]
pub struct OutputFollower {
    path: Option<PathBuf>,
    offset: u64,
    lines: VecDeque<String>,
    partial: Vec<u8>,
    tail_bytes: u64,
    max_lines: usize,
    notice: Option<String>,
}

impl OutputFollower {
    pub fn new(path: Option<PathBuf>, output: &OutputConfig) -> Self {
        Self {
            path,
            offset: 0,
            lines: VecDeque::new(),
            partial: Vec::new(),
            tail_bytes: output.tail_bytes.max(1),
            max_lines: output.max_lines.max(1),
            notice: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn content(&self) -> DetailContent {
        if let Some(notice) = &self.notice {
            return DetailContent::Unavailable(notice.clone());
        }
        let mut text = self.lines.iter().cloned().collect::<Vec<_>>().join("\n");
        if !self.partial.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(overwritten(&String::from_utf8_lossy(&self.partial)));
        }
        DetailContent::Text(text)
    }

    pub fn poll(&mut self, fs: &dyn FileSystem) -> FollowStatus {
        let Some(path) = self.path.clone() else {
            self.notice = Some("no output file".to_string());
            return FollowStatus::Unavailable;
        };
        let len = match fs.len(&path) {
            Ok(len) => len,
            Err(err) => {
                self.notice = Some(unavailable_reason(&path, &err));
                return FollowStatus::Unavailable;
            }
        };
        self.notice = None;

        let mut truncated = false;
        if len < self.offset {
            self.reset();
            truncated = true;
        }
        if len == self.offset {
            return if truncated {
                FollowStatus::Truncated
            } else {
                FollowStatus::Unchanged
            };
        }

        let start = self.offset.max(len.saturating_sub(self.tail_bytes));
        let skipped = start > self.offset;
        // Read one byte early when skipping so a cut through the middle of
        // a line can be told apart from a cut on a line boundary.
        let lookback = skipped && start > 0;
        let read_from = if lookback { start - 1 } else { start };
        let mut chunk = match fs.read_range(&path, read_from, len - read_from) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.notice = Some(unavailable_reason(&path, &err));
                return FollowStatus::Unavailable;
            }
        };
        self.offset = read_from + chunk.len() as u64;
        let mut drop_first = false;
        if lookback {
            if chunk.first() == Some(&b'\n') {
                chunk.remove(0);
            } else {
                drop_first = true;
            }
        }

        let mut buf = if skipped {
            self.lines.clear();
            Vec::new()
        } else {
            std::mem::take(&mut self.partial)
        };
        buf.extend_from_slice(&chunk);
        let mut segments: Vec<&[u8]> = buf.split(|b| *b == b'\n').collect();
        let tail = segments.pop().unwrap_or_default().to_vec();
        if drop_first && !segments.is_empty() {
            segments.remove(0);
        }
        let appended = segments.len();
        for segment in segments {
            let line = String::from_utf8_lossy(segment);
            self.lines.push_back(overwritten(&line).to_string());
        }
        self.partial = tail;
        self.compact_partial();
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }

        if truncated {
            FollowStatus::Truncated
        } else {
            FollowStatus::Appended(appended)
        }
    }

    /// Bounds the unterminated last line: text before a carriage return has
    /// already been overwritten, and at most `tail_bytes` of the rest is kept.
    fn compact_partial(&mut self) {
        let last = self.partial.len().saturating_sub(1);
        if let Some(cr) = self.partial[..last].iter().rposition(|b| *b == b'\r') {
            self.partial.drain(..=cr);
        }
        let cap = usize::try_from(self.tail_bytes).unwrap_or(usize::MAX);
        if self.partial.len() > cap {
            let excess = self.partial.len() - cap;
            self.partial.drain(..excess);
        }
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.lines.clear();
        self.partial.clear();
    }
}

/// What a terminal leaves visible for a line redrawn with `\r`.
fn overwritten(line: &str) -> &str {
    let line = line.trim_end_matches('\r');
    line.rsplit('\r').next().unwrap_or(line)
}

fn unavailable_reason(path: &Path, err: &SmonError) -> String {
    match err {
        SmonError::Command(CommandError {
            kind: CommandErrorKind::NotFound,
            ..
        }) => format!("{} does not exist yet", path.display()),
        SmonError::Command(CommandError {
            kind: CommandErrorKind::PermissionDenied,
            ..
        }) => format!("{} is not readable", path.display()),
        other => format!("{}: {other}", path.display()),
    }
}

/// Everything shown in the detail pane for one job.
#[derive(Debug, Clone)]
pub struct JobDetail {
    pub job_id: String,
    pub record: BTreeMap<String, String>,
    pub script: DetailContent,
    pub stdout: OutputFollower,
    pub stderr: OutputFollower,
}

pub struct DetailLoader<'a> {
    pub source: &'a SlurmSource,
    pub fs: &'a dyn FileSystem,
    pub output: &'a OutputConfig,
}

impl DetailLoader<'_> {
    /// Runs scontrol and reads the initial tail of both output files.
    /// Any failure degrades to `DetailContent::Unavailable` for that part.
    pub fn load(&self, job_id: &str) -> JobDetail {
        let record = match self.source.show_job(job_id) {
            Ok(raw) => parse_scontrol_record(&raw),
            Err(err) => {
                append_run_log(
                    "warn",
                    "detail.show_job_failed",
                    json!({"job_id": job_id, "kind": err.kind.as_str(), "detail": err.detail}),
                );
                BTreeMap::new()
            }
        };
        let paths = JobPaths::from_record(&record);
        let script = self.script(job_id, &paths);

        let mut stdout = OutputFollower::new(paths.stdout.clone(), self.output);
        let mut stderr = OutputFollower::new(paths.stderr.clone(), self.output);
        stdout.poll(self.fs);
        stderr.poll(self.fs);

        JobDetail {
            job_id: job_id.to_string(),
            record,
            script,
            stdout,
            stderr,
        }
    }

    /// Batch script from the controller, else the file named by `Command=`.
    pub fn script(&self, job_id: &str, paths: &JobPaths) -> DetailContent {
        let controller_err = match self.source.batch_script(job_id) {
            Ok(script) if !script.trim().is_empty() => {
                return DetailContent::Text(script.trim_end().to_string())
            }
            Ok(_) => None,
            Err(err) => Some(err),
        };
        if let Some(command) = &paths.command {
            match self.fs.read_to_string(command) {
                Ok(text) => return DetailContent::Text(text.trim_end().to_string()),
                Err(err) => return DetailContent::Unavailable(unavailable_reason(command, &err)),
            }
        }
        match controller_err {
            Some(err) if err.kind == CommandErrorKind::NotAvailable => {
                DetailContent::Unavailable(format!("{} is not installed", err.program))
            }
            _ => DetailContent::Unavailable("no script stored by controller".to_string()),
        }
    }
}
