use crate::errors::{CommandError, CommandErrorKind};
use crate::logging::append_run_log;
use crate::slurm::SlurmSource;
use crate::types::JobId;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;

const FINISHING_MARKERS: [&str; 3] = [
    "already completing",
    "already finished",
    "already completed",
];
const DENIED_MARKERS: [&str; 3] = ["access denied", "permission denied", "not authorized"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// scancel reported the job was already completing or finished.
    AlreadyFinishing,
    PermissionDenied(String),
    Failed(CommandError),
}

impl CancelOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Cancelled | Self::AlreadyFinishing)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Cancelled => "cancel requested".to_string(),
            Self::AlreadyFinishing => "job was already finishing".to_string(),
            Self::PermissionDenied(detail) => format!("permission denied: {detail}"),
            Self::Failed(err) => err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelResult {
    pub job_id: JobId,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelRejected {
    #[error("cancel of job {0} already in flight")]
    InFlight(JobId),
    #[error("could not start cancel thread: {0}")]
    Spawn(String),
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    let lower = text.to_ascii_lowercase();
    markers.iter().any(|marker| lower.contains(marker))
}

/// Maps an scancel result. scancel sometimes exits 0 while printing the
/// "already completing" error, so stderr is checked either way.
pub fn classify(result: Result<String, CommandError>) -> CancelOutcome {
    match result {
        Ok(stderr) if contains_any(&stderr, &FINISHING_MARKERS) => CancelOutcome::AlreadyFinishing,
        Ok(_) => CancelOutcome::Cancelled,
        Err(err) if contains_any(&err.detail, &FINISHING_MARKERS) => {
            CancelOutcome::AlreadyFinishing
        }
        Err(err)
            if err.kind == CommandErrorKind::PermissionDenied
                || contains_any(&err.detail, &DENIED_MARKERS) =>
        {
            CancelOutcome::PermissionDenied(err.detail)
        }
        Err(err) => CancelOutcome::Failed(err),
    }
}

type AfterCancel = Arc<dyn Fn(&CancelResult) + Send + Sync>;

/// Runs `scancel` off the UI thread, at most once per job at a time.
#[derive(Clone)]
pub struct Canceller {
    source: SlurmSource,
    in_flight: Arc<Mutex<HashSet<JobId>>>,
    after_cancel: Option<AfterCancel>,
}

impl Canceller {
    pub fn new(source: SlurmSource) -> Self {
        Self {
            source,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            after_cancel: None,
        }
    }

    /// Called on the cancel thread once scancel has returned, before the
    /// result is delivered.
    pub fn with_after_cancel(mut self, hook: impl Fn(&CancelResult) + Send + Sync + 'static) -> Self {
        self.after_cancel = Some(Arc::new(hook));
        self
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(job_id))
            .unwrap_or(false)
    }

    pub fn cancel(&self, job_id: &str) -> Result<oneshot::Receiver<CancelResult>, CancelRejected> {
        {
            let mut set = self
                .in_flight
                .lock()
                .map_err(|_| CancelRejected::Spawn("in-flight set poisoned".to_string()))?;
            if !set.insert(job_id.to_string()) {
                return Err(CancelRejected::InFlight(job_id.to_string()));
            }
        }
        append_run_log("info", "cancel.requested", json!({"job_id": job_id}));

        let (tx, rx) = oneshot::channel();
        let source = self.source.clone();
        let in_flight = self.in_flight.clone();
        let after_cancel = self.after_cancel.clone();
        let id = job_id.to_string();
        let spawned = std::thread::Builder::new()
            .name("smon-cancel".to_string())
            .spawn(move || {
                let outcome = classify(source.cancel(&id).map(|out| out.stderr));
                append_run_log(
                    if outcome.is_success() { "info" } else { "warn" },
                    "cancel.finished",
                    json!({"job_id": id, "outcome": outcome.describe()}),
                );
                if let Ok(mut set) = in_flight.lock() {
                    set.remove(&id);
                }
                let result = CancelResult {
                    job_id: id,
                    outcome,
                };
                if let Some(hook) = after_cancel {
                    hook(&result);
                }
                let _ = tx.send(result);
            });

        match spawned {
            Ok(_) => Ok(rx),
            Err(err) => {
                if let Ok(mut set) = self.in_flight.lock() {
                    set.remove(job_id);
                }
                Err(CancelRejected::Spawn(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: CommandErrorKind, detail: &str) -> CommandError {
        CommandError {
            kind,
            program: "scancel".to_string(),
            detail: detail.to_string(),
            exit_code: Some(1),
        }
    }

    #[test]
    fn already_finishing_counts_as_success() {
        let outcome = classify(Err(err(
            CommandErrorKind::NonZeroExit,
            "scancel: error: Kill job error on job id 12: Job/step already completing or completed",
        )));
        assert_eq!(outcome, CancelOutcome::AlreadyFinishing);
        assert!(outcome.is_success());

        let zero_exit = classify(Ok("scancel: error: job 12 already finished".to_string()));
        assert_eq!(zero_exit, CancelOutcome::AlreadyFinishing);
        assert_eq!(classify(Ok(String::new())), CancelOutcome::Cancelled);
    }

    #[test]
    fn access_denied_is_reported_separately() {
        let outcome = classify(Err(err(
            CommandErrorKind::NonZeroExit,
            "scancel: error: Kill job error on job id 12: Access/permission denied",
        )));
        assert!(matches!(outcome, CancelOutcome::PermissionDenied(_)));
        assert!(!outcome.is_success());

        let missing = classify(Err(err(CommandErrorKind::NotAvailable, "No such file")));
        assert!(matches!(missing, CancelOutcome::Failed(_)));
    }

    #[test]
    fn cancel_runs_scancel_and_fires_hook_once() {
        use crate::config::CommandsConfig;
        use crate::gateway::CommandGateway;
        use crate::runtime::{FakeProcessRunner, ProcessOutput};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let runner = FakeProcessRunner::default();
        runner.push_response(Ok(ProcessOutput::success("")));
        let source = SlurmSource::new(
            CommandGateway::new(Arc::new(runner.clone())),
            CommandsConfig::default(),
            Duration::from_secs(1),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let canceller = Canceller::new(source).with_after_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let rx = canceller.cancel("42").expect("started");
        let result = rx.blocking_recv().expect("result");

        assert_eq!(result.job_id, "42");
        assert_eq!(result.outcome, CancelOutcome::Cancelled);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!canceller.is_in_flight("42"));
        let spawned = runner.spawned();
        assert_eq!(spawned[0].program, "scancel");
        assert_eq!(spawned[0].args, vec!["42".to_string()]);
    }
}
