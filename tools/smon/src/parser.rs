use crate::types::{Job, JobState, Node, NodeState};
use std::collections::{HashMap, HashSet};
use std::fmt;

pub const JOB_MIN_FIELDS: usize = 9;
pub const JOB_MAX_FIELDS: usize = 13;
pub const NODE_FIELDS: usize = 9;

const NO_LIMIT_TOKENS: [&str; 6] = [
    "UNLIMITED",
    "INFINITE",
    "NOT_SET",
    "PARTITION_LIMIT",
    "N/A",
    "",
];
const NODE_STATE_FLAGS: &str = "*~#!%$@^-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningKind {
    FieldCount { expected: String, found: usize },
    MissingId,
    BadNumber { field: &'static str, value: String },
    BadState { value: String },
    AllocExceedsTotal { field: &'static str, alloc: u64, total: u64 },
    DuplicateId { id: String },
    /// Kept line: the value falls back to zero or unknown.
    BadTime { field: &'static str, value: String },
}

impl WarningKind {
    pub fn skips_line(&self) -> bool {
        !matches!(self, Self::BadTime { .. })
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldCount { expected, found } => {
                write!(f, "expected {expected} fields, found {found}")
            }
            Self::MissingId => f.write_str("empty identifier"),
            Self::BadNumber { field, value } => write!(f, "bad {field} value {value:?}"),
            Self::BadState { value } => write!(f, "malformed state {value:?}"),
            Self::AllocExceedsTotal { field, alloc, total } => {
                write!(f, "{field} allocation {alloc} exceeds total {total}")
            }
            Self::DuplicateId { id } => write!(f, "duplicate id {id}"),
            Self::BadTime { field, value } => write!(f, "unparseable {field} {value:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    /// 1-based line number in the raw output.
    pub line_no: usize,
    pub line: String,
    pub kind: WarningKind,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line_no, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseReport<T> {
    pub records: Vec<T>,
    pub warnings: Vec<ParseWarning>,
}

impl<T> Default for ParseReport<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl<T> ParseReport<T> {
    pub fn skipped(&self) -> usize {
        self.warnings.iter().filter(|w| w.kind.skips_line()).count()
    }
}

/// Parses squeue output in the
/// `JobID|User|State|Partition|NodeList|TimeUsed|TimeLimit|GpuAlloc|GpuTotal[|CpuAlloc[|MemAlloc[|Name[|Command]]]]`
/// layout, with an optional trailing `|`. Bad lines become warnings and are
/// skipped.
///
/// `GpuTotal` is the job's whole GPU request across all of its nodes and
/// `GpuAlloc` the part of it the job currently holds, so a pending job
/// always reads `0/N`. A parenthesized NodeList is the pending reason.
pub fn parse_jobs(raw: &str) -> ParseReport<Job> {
    let mut report = ParseReport::default();
    let mut seen = HashSet::new();

    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut kept_warnings = Vec::new();
        match parse_job_line(line, &mut kept_warnings) {
            Ok(job) if !seen.insert(job.job_id.clone()) => {
                report.warnings.push(ParseWarning {
                    line_no: idx + 1,
                    line: line.to_string(),
                    kind: WarningKind::DuplicateId { id: job.job_id },
                });
            }
            Ok(job) => {
                report
                    .warnings
                    .extend(kept_warnings.into_iter().map(|kind| ParseWarning {
                        line_no: idx + 1,
                        line: line.to_string(),
                        kind,
                    }));
                report.records.push(job);
            }
            Err(kind) => report.warnings.push(ParseWarning {
                line_no: idx + 1,
                line: line.to_string(),
                kind,
            }),
        }
    }
    report
}

fn parse_job_line(line: &str, kept: &mut Vec<WarningKind>) -> Result<Job, WarningKind> {
    let line = line.trim_end();
    let line = line.strip_suffix('|').unwrap_or(line);
    let fields: Vec<&str> = line.splitn(JOB_MAX_FIELDS, '|').map(str::trim).collect();
    if fields.len() < JOB_MIN_FIELDS {
        return Err(WarningKind::FieldCount {
            expected: format!("{JOB_MIN_FIELDS}-{JOB_MAX_FIELDS}"),
            found: fields.len(),
        });
    }
    let field = |i: usize| fields.get(i).copied().unwrap_or("");

    let job_id = field(0);
    if job_id.is_empty() {
        return Err(WarningKind::MissingId);
    }
    let state = JobState::from_token(parse_state_token(field(2), "_+")?);

    let gpu_alloc = parse_gpu_count(field(7)).map_err(|_| bad_number("gpu_alloc", field(7)))?;
    let gpu_total = parse_gpu_count(field(8)).map_err(|_| bad_number("gpu_total", field(8)))?;
    check_alloc("gpu", gpu_alloc.into(), gpu_total.into())?;
    // squeue reports the request in the allocation column until the job starts.
    let gpu_alloc = if state == JobState::Pending { 0 } else { gpu_alloc };

    let cpu_alloc = match fields.get(9) {
        Some(value) if !value.is_empty() => {
            parse_cpu_alloc(value).map_err(|_| bad_number("cpu_alloc", value))?
        }
        _ => 0,
    };
    let mem_alloc_mb = match fields.get(10) {
        Some(value) => parse_memory_mb(value).map_err(|_| bad_number("mem_alloc", value))?,
        None => 0,
    };

    let time_used = match parse_duration_field(field(5)) {
        Ok(used) => used.unwrap_or(0),
        Err(()) => {
            kept.push(WarningKind::BadTime {
                field: "time_used",
                value: field(5).to_string(),
            });
            0
        }
    };
    let time_limit = match parse_duration_field(field(6)) {
        Ok(limit) => limit,
        Err(()) => {
            kept.push(WarningKind::BadTime {
                field: "time_limit",
                value: field(6).to_string(),
            });
            None
        }
    };

    let command = fields
        .get(12)
        .filter(|value| !value.is_empty() && !is_null_token(value))
        .map(|value| value.to_string());
    let script_path = command
        .as_deref()
        .and_then(|cmd| cmd.split_whitespace().next())
        .filter(|path| path.starts_with('/'))
        .map(str::to_string);

    Ok(Job {
        job_id: job_id.to_string(),
        user: field(1).to_string(),
        state,
        partition: field(3).to_string(),
        node_list: split_node_list(field(4)),
        reason: parse_reason(field(4)),
        time_used,
        time_limit,
        gpu_alloc,
        gpu_total,
        cpu_alloc,
        mem_alloc_mb,
        name: fields.get(11).map(|v| v.to_string()).unwrap_or_default(),
        command,
        script_path,
    })
}

/// Parses `sinfo -N` output in the
/// `NodeName|Partitions|State|GpuAlloc|GpuTotal|CpuAlloc|CpuTotal|MemAlloc|MemTotal`
/// layout. A node listed once per partition is merged into one record.
pub fn parse_nodes(raw: &str) -> ParseReport<Node> {
    let mut report: ParseReport<Node> = ParseReport::default();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_node_line(line) {
            Ok(node) => match index.get(&node.name) {
                Some(&pos) => {
                    let existing = &mut report.records[pos];
                    for partition in node.partitions {
                        if !existing.partitions.contains(&partition) {
                            existing.partitions.push(partition);
                        }
                    }
                }
                None => {
                    index.insert(node.name.clone(), report.records.len());
                    report.records.push(node);
                }
            },
            Err(kind) => report.warnings.push(ParseWarning {
                line_no: idx + 1,
                line: line.to_string(),
                kind,
            }),
        }
    }
    report
}

fn parse_node_line(line: &str) -> Result<Node, WarningKind> {
    let body = line.trim_end();
    let body = body.strip_suffix('|').unwrap_or(body);
    let fields: Vec<&str> = body.split('|').map(str::trim).collect();
    if fields.len() != NODE_FIELDS {
        return Err(WarningKind::FieldCount {
            expected: NODE_FIELDS.to_string(),
            found: fields.len(),
        });
    }
    let name = fields[0];
    if name.is_empty() {
        return Err(WarningKind::MissingId);
    }
    let state = parse_state_token(fields[2], NODE_STATE_FLAGS)?;

    let gpu_alloc = parse_gpu_count(fields[3]).map_err(|_| bad_number("gpu_alloc", fields[3]))?;
    let gpu_total = parse_gpu_count(fields[4]).map_err(|_| bad_number("gpu_total", fields[4]))?;
    let cpu_alloc = parse_cpu_alloc(fields[5]).map_err(|_| bad_number("cpu_alloc", fields[5]))?;
    let cpu_total = fields[6]
        .parse::<u32>()
        .map_err(|_| bad_number("cpu_total", fields[6]))?;
    let mem_alloc_mb = parse_memory_mb(fields[7]).map_err(|_| bad_number("mem_alloc", fields[7]))?;
    let mem_total_mb = parse_memory_mb(fields[8]).map_err(|_| bad_number("mem_total", fields[8]))?;

    check_alloc("gpu", gpu_alloc.into(), gpu_total.into())?;
    check_alloc("cpu", cpu_alloc.into(), cpu_total.into())?;
    check_alloc("mem", mem_alloc_mb, mem_total_mb)?;

    let partitions = fields[1]
        .split(',')
        .map(|p| p.trim().trim_end_matches('*'))
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();

    Ok(Node {
        name: name.to_string(),
        state: NodeState::from_token(state),
        partitions,
        gpu_alloc,
        gpu_total,
        cpu_alloc,
        cpu_total,
        mem_alloc_mb,
        mem_total_mb,
    })
}

fn bad_number(field: &'static str, value: &str) -> WarningKind {
    WarningKind::BadNumber {
        field,
        value: value.to_string(),
    }
}

fn check_alloc(field: &'static str, alloc: u64, total: u64) -> Result<(), WarningKind> {
    if alloc > total {
        return Err(WarningKind::AllocExceedsTotal { field, alloc, total });
    }
    Ok(())
}

fn parse_state_token<'a>(token: &'a str, extra: &str) -> Result<&'a str, WarningKind> {
    let well_formed = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphabetic() || c == '_' || c == '+' || extra.contains(c));
    if well_formed {
        Ok(token)
    } else {
        Err(WarningKind::BadState {
            value: token.to_string(),
        })
    }
}

fn is_null_token(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "" | "(null)" | "n/a" | "none"
    )
}

/// Splits a node list on top-level commas; `node[01-04],gpu7` stays two
/// opaque tokens. Pending-reason placeholders like `(Priority)` mean no nodes.
pub fn split_node_list(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('(') {
        return Vec::new();
    }
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in value.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// The `(Reason)` squeue prints in the node column for jobs holding no
/// nodes, without its parentheses.
pub fn parse_reason(value: &str) -> Option<String> {
    let inner = value.trim().strip_prefix('(')?.strip_suffix(')')?.trim();
    (!is_null_token(inner)).then(|| inner.to_string())
}

/// Converts `D-HH:MM:SS`, `HH:MM:SS` or `MM:SS` to seconds.
pub fn parse_duration(value: &str) -> Option<u64> {
    let value = value.trim();
    let (days, clock) = match value.split_once('-') {
        Some((days, clock)) => (parse_digits(days)?, clock),
        None => (0, value),
    };
    let parts = clock
        .split(':')
        .map(parse_digits)
        .collect::<Option<Vec<u64>>>()?;
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] if value.split_once('-').is_none() => (0, *m, *s),
        _ => return None,
    };
    days.checked_mul(86_400)?
        .checked_add(hours.checked_mul(3_600)?)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)
}

/// `Ok(None)` for the no-limit spellings, `Err` for anything unreadable.
pub fn parse_duration_field(value: &str) -> Result<Option<u64>, ()> {
    let trimmed = value.trim();
    if NO_LIMIT_TOKENS
        .iter()
        .any(|token| token.eq_ignore_ascii_case(trimmed))
    {
        return Ok(None);
    }
    parse_duration(trimmed).map(Some).ok_or(())
}

fn parse_digits(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Reads a GPU count from a bare integer or a GRES/TRES list such as
/// `gres/gpu:h100:4`, `cpu=4,gres/gpu=2` or `gpu:8(IDX:0-7)`.
/// When both untyped and typed entries are present (TRES repeats the total
/// as `gres/gpu=N` next to `gres/gpu:type=N`) only the untyped ones count.
pub fn parse_gpu_count(value: &str) -> Result<u32, ()> {
    let value = value.trim();
    if is_null_token(value) {
        return Ok(0);
    }
    if let Some(count) = parse_digits(value) {
        return u32::try_from(count).map_err(|_| ());
    }
    if !value.chars().any(|c| c.is_ascii_alphabetic()) {
        return Err(());
    }

    let mut untyped: Option<u32> = None;
    let mut typed: Option<u32> = None;
    for entry in value.split(',') {
        let entry = entry.trim();
        let entry = entry
            .strip_prefix("gres/")
            .or_else(|| entry.strip_prefix("gres:"))
            .unwrap_or(entry);
        let entry = entry.split('(').next().unwrap_or(entry);
        let segments: Vec<&str> = entry.split([':', '=']).collect();
        if !segments
            .first()
            .is_some_and(|name| name.eq_ignore_ascii_case("gpu"))
        {
            continue;
        }
        let count = segments
            .iter()
            .skip(1)
            .rev()
            .find_map(|seg| parse_digits(seg))
            .map(|n| u32::try_from(n).map_err(|_| ()))
            .transpose()?
            .unwrap_or(1);
        let is_typed = segments
            .iter()
            .skip(1)
            .any(|seg| parse_digits(seg).is_none());
        let slot = if is_typed { &mut typed } else { &mut untyped };
        *slot = Some(slot.unwrap_or(0).saturating_add(count));
    }
    Ok(untyped.or(typed).unwrap_or(0))
}

/// Accepts a plain count or the sinfo `A/I/O/T` form (allocated first).
pub fn parse_cpu_alloc(value: &str) -> Result<u32, ()> {
    let first = value.trim().split('/').next().unwrap_or("");
    parse_digits(first)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(())
}

/// Plain megabytes or a `K/M/G/T` suffixed size, normalised to MiB.
pub fn parse_memory_mb(value: &str) -> Result<u64, ()> {
    let value = value.trim();
    if is_null_token(value) {
        return Ok(0);
    }
    let (number, scale) = match value.char_indices().last() {
        Some((idx, unit)) if unit.is_ascii_alphabetic() => {
            let scale = match unit.to_ascii_uppercase() {
                'K' => 1.0 / 1024.0,
                'M' => 1.0,
                'G' => 1024.0,
                'T' => 1024.0 * 1024.0,
                _ => return Err(()),
            };
            (&value[..idx], scale)
        }
        _ => (value, 1.0),
    };
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(());
    }
    let parsed: f64 = number.parse().map_err(|_| ())?;
    Ok((parsed * scale).ceil() as u64)
}
