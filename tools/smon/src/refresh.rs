use crate::config::RefreshConfig;
use crate::errors::{CommandErrorKind, SmonError};
use crate::logging::append_run_log;
use crate::parser::{parse_jobs, parse_nodes, ParseWarning};
use crate::runtime::Clock;
use crate::slurm::SlurmSource;
use crate::snapshot::{diff, Snapshot, SnapshotStore, SourceFailure};
use crate::types::DataSource;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const CONTROL_QUEUE_DEPTH: usize = 32;
const LOGGED_WARNINGS_PER_CYCLE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Tick,
    Manual,
    AfterCancel,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Manual => "manual",
            Self::AfterCancel => "after_cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Idle: a cycle starts now.
    Start,
    /// In flight: remembered as the single pending request.
    Coalesced,
    /// In flight with a request already pending: dropped.
    AlreadyPending,
    /// Non-manual request while every source is halted.
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Refreshing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub backoff_ceiling: u32,
}

impl RefreshPolicy {
    pub fn from_config(cfg: &RefreshConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs),
            min_interval: Duration::from_secs(cfg.min_interval_secs),
            max_interval: Duration::from_secs(cfg.max_interval_secs),
            backoff_ceiling: cfg.backoff_ceiling.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub results: Vec<(DataSource, Result<(), CommandErrorKind>)>,
}

impl CycleOutcome {
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SourceState {
    consecutive_failures: u32,
    halted: bool,
}

/// Idle/Refreshing state machine with one pending slot, per-source halting
/// and exponential backoff. Holds no threads; the worker drives it.
#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    policy: RefreshPolicy,
    phase: Phase,
    pending: Option<Trigger>,
    consecutive_failures: u32,
    sources: BTreeMap<DataSource, SourceState>,
}

impl RefreshScheduler {
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            policy,
            phase: Phase::Idle,
            pending: None,
            consecutive_failures: 0,
            sources: DataSource::ALL
                .into_iter()
                .map(|source| (source, SourceState::default()))
                .collect(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pending(&self) -> Option<Trigger> {
        self.pending
    }

    pub fn interval(&self) -> Duration {
        self.policy.interval
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_halted(&self, source: DataSource) -> bool {
        self.sources.get(&source).is_some_and(|s| s.halted)
    }

    pub fn halted_sources(&self) -> Vec<DataSource> {
        self.sources
            .iter()
            .filter(|(_, state)| state.halted)
            .map(|(source, _)| *source)
            .collect()
    }

    /// Sources the next cycle should query.
    pub fn sources_to_poll(&self) -> Vec<DataSource> {
        self.sources
            .iter()
            .filter(|(_, state)| !state.halted)
            .map(|(source, _)| *source)
            .collect()
    }

    pub fn request(&mut self, trigger: Trigger) -> Admission {
        if trigger == Trigger::Manual {
            for state in self.sources.values_mut() {
                state.halted = false;
            }
        }
        if trigger != Trigger::Manual && self.sources.values().all(|s| s.halted) {
            return Admission::Halted;
        }
        match (self.phase, self.pending) {
            (Phase::Idle, _) => {
                self.phase = Phase::Refreshing;
                Admission::Start
            }
            (Phase::Refreshing, None) => {
                self.pending = Some(trigger);
                Admission::Coalesced
            }
            (Phase::Refreshing, Some(_)) => Admission::AlreadyPending,
        }
    }

    /// Records a finished cycle and returns the pending request, if any,
    /// which the caller should submit again through `request`.
    pub fn complete(&mut self, outcome: &CycleOutcome) -> Option<Trigger> {
        for (source, result) in &outcome.results {
            let state = self.sources.entry(*source).or_default();
            match result {
                Ok(()) => state.consecutive_failures = 0,
                Err(kind) => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    if *kind == CommandErrorKind::NotAvailable {
                        state.halted = true;
                    }
                }
            }
        }
        if outcome.succeeded() {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        self.phase = Phase::Idle;
        self.pending.take()
    }

    /// `min(2^failures, ceiling)`.
    pub fn backoff_multiplier(&self) -> u32 {
        1u32.checked_shl(self.consecutive_failures)
            .unwrap_or(u32::MAX)
            .min(self.policy.backoff_ceiling)
    }

    pub fn next_delay(&self) -> Duration {
        self.policy
            .interval
            .saturating_mul(self.backoff_multiplier())
    }

    /// Clamps to the configured bounds and returns the applied interval.
    pub fn set_interval(&mut self, interval: Duration) -> Duration {
        self.policy.interval = interval.clamp(self.policy.min_interval, self.policy.max_interval);
        self.policy.interval
    }
}

/// Fetches and parses the given sources, then publishes one snapshot.
/// Sources not polled, or that failed, keep their previous data.
pub fn run_cycle(
    source: &SlurmSource,
    store: &SnapshotStore,
    clock: &dyn Clock,
    poll: &[DataSource],
) -> CycleOutcome {
    let prev = store.current();
    let mut jobs = prev.jobs.clone();
    let mut nodes = prev.nodes.clone();
    let mut failures: Vec<SourceFailure> = prev
        .failures
        .iter()
        .filter(|failure| !poll.contains(&failure.source))
        .cloned()
        .collect();
    let mut parse_warnings = 0;
    let mut outcome = CycleOutcome::default();

    for &data_source in poll {
        match source.fetch(data_source) {
            Ok(raw) => {
                match data_source {
                    DataSource::Jobs => {
                        let report = parse_jobs(&raw);
                        parse_warnings += report.warnings.len();
                        log_parse_warnings(data_source, &report.warnings);
                        jobs = Arc::new(report.records);
                    }
                    DataSource::Nodes => {
                        let report = parse_nodes(&raw);
                        parse_warnings += report.warnings.len();
                        log_parse_warnings(data_source, &report.warnings);
                        nodes = Arc::new(report.records);
                    }
                }
                outcome.results.push((data_source, Ok(())));
            }
            Err(err) => {
                failures.push(SourceFailure {
                    source: data_source,
                    kind: err.kind,
                    detail: err.detail,
                });
                outcome.results.push((data_source, Err(err.kind)));
            }
        }
    }
    failures.sort_by_key(|failure| failure.source);

    let snapshot = Snapshot {
        jobs,
        nodes,
        taken_at: Some(clock.now()),
        degraded: !failures.is_empty(),
        failures,
        parse_warnings,
        generation: 0,
    };
    let previous = store.publish(snapshot);
    let current = store.current();
    let changes = diff(&previous, &current);
    append_run_log(
        if current.degraded { "warn" } else { "info" },
        "refresh.published",
        json!({
            "generation": current.generation,
            "jobs": current.jobs.len(),
            "nodes": current.nodes.len(),
            "degraded": current.degraded,
            "failures": current
                .failures
                .iter()
                .map(|f| json!({"source": f.source.as_str(), "kind": f.kind.as_str()}))
                .collect::<Vec<_>>(),
            "added": changes.added.len(),
            "removed": changes.removed.len(),
            "changed": changes.changed.len(),
        }),
    );
    outcome
}

fn log_parse_warnings(source: DataSource, warnings: &[ParseWarning]) {
    if warnings.is_empty() {
        return;
    }
    append_run_log(
        "warn",
        "parse.warnings",
        json!({
            "source": source.as_str(),
            "count": warnings.len(),
            "sample": warnings
                .iter()
                .take(LOGGED_WARNINGS_PER_CYCLE)
                .map(|w| w.to_string())
                .collect::<Vec<_>>(),
        }),
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshStatus {
    pub phase: Phase,
    pub interval: Duration,
    pub next_delay: Duration,
    pub halted: Vec<DataSource>,
    pub consecutive_failures: u32,
}

impl RefreshStatus {
    fn of(scheduler: &RefreshScheduler) -> Self {
        Self {
            phase: scheduler.phase(),
            interval: scheduler.interval(),
            next_delay: scheduler.next_delay(),
            halted: scheduler.halted_sources(),
            consecutive_failures: scheduler.consecutive_failures(),
        }
    }
}

enum Control {
    Trigger(Trigger),
    SetInterval(Duration),
    CycleFinished(CycleOutcome),
    Shutdown,
}

/// Owning handle to the background refresh worker. Dropping it stops the
/// worker; an in-flight cycle finishes on its own thread.
pub struct RefreshHandle {
    tx: SyncSender<Control>,
    status: watch::Receiver<RefreshStatus>,
    join: Option<JoinHandle<()>>,
}

/// Cloneable sender for refresh requests from other threads.
#[derive(Clone)]
pub struct RefreshRequester {
    tx: SyncSender<Control>,
}

impl RefreshRequester {
    /// Never blocks the caller. A full control queue drops the request,
    /// which coalescing would have dropped anyway.
    pub fn request(&self, trigger: Trigger) -> bool {
        match self.tx.try_send(Control::Trigger(trigger)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                append_run_log(
                    "debug",
                    "refresh.request_dropped",
                    json!({"trigger": trigger.as_str()}),
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl RefreshHandle {
    pub fn request(&self, trigger: Trigger) -> bool {
        self.requester().request(trigger)
    }

    pub fn requester(&self) -> RefreshRequester {
        RefreshRequester {
            tx: self.tx.clone(),
        }
    }

    pub fn set_interval(&self, interval: Duration) -> bool {
        self.tx.try_send(Control::SetInterval(interval)).is_ok()
    }

    pub fn status(&self) -> RefreshStatus {
        self.status.borrow().clone()
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(Control::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    scheduler: RefreshScheduler,
    source: SlurmSource,
    store: Arc<SnapshotStore>,
    clock: Arc<dyn Clock>,
    tx: SyncSender<Control>,
    status: watch::Sender<RefreshStatus>,
}

/// Starts the worker; the first cycle runs immediately.
pub fn spawn_worker(
    scheduler: RefreshScheduler,
    source: SlurmSource,
    store: Arc<SnapshotStore>,
    clock: Arc<dyn Clock>,
) -> Result<RefreshHandle, SmonError> {
    let (tx, rx) = mpsc::sync_channel(CONTROL_QUEUE_DEPTH);
    let (status_tx, status_rx) = watch::channel(RefreshStatus::of(&scheduler));
    let worker = Worker {
        scheduler,
        source,
        store,
        clock,
        tx: tx.clone(),
        status: status_tx,
    };
    let join = std::thread::Builder::new()
        .name("smon-refresh".to_string())
        .spawn(move || worker.run(rx))
        .map_err(|e| SmonError::Io(format!("spawn refresh worker: {e}")))?;
    Ok(RefreshHandle {
        tx,
        status: status_rx,
        join: Some(join),
    })
}

impl Worker {
    fn run(mut self, rx: mpsc::Receiver<Control>) {
        let mut scheduled_from = Instant::now();
        let mut next_tick = scheduled_from;
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            let msg = match rx.recv_timeout(wait) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => {
                    scheduled_from = Instant::now();
                    next_tick = scheduled_from + self.scheduler.next_delay();
                    Control::Trigger(Trigger::Tick)
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match msg {
                Control::Trigger(trigger) => self.admit(trigger),
                Control::SetInterval(interval) => {
                    let applied = self.scheduler.set_interval(interval);
                    next_tick = scheduled_from + self.scheduler.next_delay();
                    append_run_log(
                        "info",
                        "refresh.interval_changed",
                        json!({"interval_ms": applied.as_millis() as u64}),
                    );
                }
                Control::CycleFinished(outcome) => {
                    let pending = self.scheduler.complete(&outcome);
                    scheduled_from = Instant::now();
                    next_tick = scheduled_from + self.scheduler.next_delay();
                    if let Some(trigger) = pending {
                        self.admit(trigger);
                    }
                }
                Control::Shutdown => break,
            }
            self.status.send_replace(RefreshStatus::of(&self.scheduler));
        }
        append_run_log("debug", "refresh.worker_stopped", json!({}));
    }

    fn admit(&mut self, trigger: Trigger) {
        let admission = self.scheduler.request(trigger);
        match admission {
            Admission::Start => self.start_cycle(trigger),
            Admission::Coalesced | Admission::AlreadyPending | Admission::Halted => {
                append_run_log(
                    "debug",
                    "refresh.not_started",
                    json!({
                        "trigger": trigger.as_str(),
                        "admission": format!("{admission:?}"),
                    }),
                );
            }
        }
    }

    fn start_cycle(&mut self, trigger: Trigger) {
        let poll = self.scheduler.sources_to_poll();
        append_run_log(
            "debug",
            "refresh.started",
            json!({
                "trigger": trigger.as_str(),
                "sources": poll.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            }),
        );
        let source = self.source.clone();
        let store = self.store.clone();
        let clock = self.clock.clone();
        let tx = self.tx.clone();
        let spawned = std::thread::Builder::new()
            .name("smon-refresh-cycle".to_string())
            .spawn(move || {
                let outcome = run_cycle(&source, &store, clock.as_ref(), &poll);
                let _ = tx.send(Control::CycleFinished(outcome));
            });
        if let Err(err) = spawned {
            append_run_log(
                "error",
                "refresh.spawn_failed",
                json!({"error": err.to_string()}),
            );
            self.scheduler.complete(&CycleOutcome {
                results: vec![(DataSource::Jobs, Err(CommandErrorKind::Io))],
            });
        }
    }
}
