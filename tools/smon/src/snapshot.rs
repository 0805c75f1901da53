use crate::errors::CommandErrorKind;
use crate::types::{DataSource, Job, JobId, Node};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: DataSource,
    pub kind: CommandErrorKind,
    pub detail: String,
}

/// One published view of the cluster. Job and node lists are shared so a
/// degraded snapshot can reuse the last good data of a failed source.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub jobs: Arc<Vec<Job>>,
    pub nodes: Arc<Vec<Node>>,
    /// `None` until the first refresh cycle has finished.
    pub taken_at: Option<SystemTime>,
    pub degraded: bool,
    pub failures: Vec<SourceFailure>,
    pub parse_warnings: usize,
    pub generation: u64,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            jobs: Arc::new(Vec::new()),
            nodes: Arc::new(Vec::new()),
            taken_at: None,
            degraded: false,
            failures: Vec::new(),
            parse_warnings: 0,
            generation: 0,
        }
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.job_id == job_id)
    }

    pub fn failure(&self, source: DataSource) -> Option<&SourceFailure> {
        self.failures.iter().find(|f| f.source == source)
    }

    /// Keeps a selection only while its job is still listed.
    pub fn reconcile_selection(&self, selection: Option<&str>) -> Option<JobId> {
        selection
            .filter(|id| self.job(id).is_some())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<JobId>,
    pub removed: Vec<JobId>,
    pub changed: Vec<JobId>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn diff(prev: &Snapshot, next: &Snapshot) -> SnapshotDiff {
    if Arc::ptr_eq(&prev.jobs, &next.jobs) {
        return SnapshotDiff::default();
    }
    let before: HashMap<&str, &Job> = prev
        .jobs
        .iter()
        .map(|job| (job.job_id.as_str(), job))
        .collect();
    let after: HashMap<&str, &Job> = next
        .jobs
        .iter()
        .map(|job| (job.job_id.as_str(), job))
        .collect();

    let mut out = SnapshotDiff::default();
    for job in next.jobs.iter() {
        match before.get(job.job_id.as_str()) {
            None => out.added.push(job.job_id.clone()),
            Some(old) if *old != job => out.changed.push(job.job_id.clone()),
            Some(_) => {}
        }
    }
    out.removed = prev
        .jobs
        .iter()
        .filter(|job| !after.contains_key(job.job_id.as_str()))
        .map(|job| job.job_id.clone())
        .collect();
    out
}

/// Single-writer, many-reader holder of the current snapshot.
pub struct SnapshotStore {
    tx: watch::Sender<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Snapshot::empty()));
        Self { tx }
    }

    /// Swaps in `snapshot` with the next generation number and hands back
    /// the one it replaced.
    pub fn publish(&self, mut snapshot: Snapshot) -> Arc<Snapshot> {
        snapshot.generation = self.tx.borrow().generation + 1;
        self.tx.send_replace(Arc::new(snapshot))
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn reconcile_selection(&self, selection: Option<&str>) -> Option<JobId> {
        self.current().reconcile_selection(selection)
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SnapshotReader {
    rx: watch::Receiver<Arc<Snapshot>>,
}

impl SnapshotReader {
    /// Returns the latest snapshot and marks it seen.
    pub fn current(&mut self) -> Arc<Snapshot> {
        self.rx.borrow_and_update().clone()
    }

    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobState;

    fn job(id: &str, state: JobState) -> Job {
        Job {
            job_id: id.to_string(),
            user: "alice".to_string(),
            state,
            partition: "gpu".to_string(),
            node_list: Vec::new(),
            reason: None,
            time_used: 0,
            time_limit: None,
            gpu_alloc: 0,
            gpu_total: 0,
            cpu_alloc: 0,
            mem_alloc_mb: 0,
            name: String::new(),
            command: None,
            script_path: None,
        }
    }

    fn with_jobs(jobs: Vec<Job>) -> Snapshot {
        Snapshot {
            jobs: Arc::new(jobs),
            ..Snapshot::empty()
        }
    }

    #[test]
    fn publish_returns_previous_and_bumps_generation() {
        let store = SnapshotStore::new();
        assert_eq!(store.current().generation, 0);
        assert!(!store.current().degraded);

        let prev = store.publish(with_jobs(vec![job("1", JobState::Running)]));
        assert_eq!(prev.generation, 0);
        let prev = store.publish(with_jobs(vec![job("2", JobState::Running)]));
        assert_eq!(prev.generation, 1);
        assert_eq!(prev.jobs[0].job_id, "1");
        assert_eq!(store.current().generation, 2);
    }

    #[test]
    fn selection_is_cleared_only_when_job_disappears() {
        let snapshot = with_jobs(vec![job("10", JobState::Running)]);
        assert_eq!(snapshot.reconcile_selection(Some("10")), Some("10".to_string()));
        assert_eq!(snapshot.reconcile_selection(Some("11")), None);
        assert_eq!(snapshot.reconcile_selection(None), None);
    }

    #[test]
    fn diff_reports_added_removed_and_changed() {
        let prev = with_jobs(vec![job("1", JobState::Pending), job("2", JobState::Running)]);
        let next = with_jobs(vec![job("1", JobState::Running), job("3", JobState::Pending)]);
        let d = diff(&prev, &next);
        assert_eq!(d.added, vec!["3"]);
        assert_eq!(d.removed, vec!["2"]);
        assert_eq!(d.changed, vec!["1"]);
        assert!(diff(&next, &next).is_empty());
    }

    #[test]
    fn reader_sees_new_publications() {
        let store = SnapshotStore::new();
        let mut reader = store.reader();
        assert!(!reader.has_changed());
        store.publish(with_jobs(vec![job("5", JobState::Running)]));
        assert!(reader.has_changed());
        assert_eq!(reader.current().jobs.len(), 1);
        assert!(!reader.has_changed());
    }
}
