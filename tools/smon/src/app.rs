use crate::cancel::CancelResult;
use crate::config::RefreshConfig;
use crate::detail::{should_follow, DetailContent, FollowStatus, JobDetail};
use crate::runtime::FileSystem;
use crate::snapshot::Snapshot;
use crate::types::{JobId, JobState};
use crate::view::{job_view, node_view, JobFilter, JobSortKey, NodeFilter, NodeSortKey, SortState};
use std::time::{Duration, SystemTime};

/// How long an armed cancel waits for its confirming keypress.
pub const CONFIRM_WINDOW: Duration = Duration::from_secs(5);
const INTERVAL_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    Jobs,
    Nodes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Search,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailTab {
    Script,
    Stdout,
    Stderr,
}

impl DetailTab {
    pub fn next(self) -> Self {
        match self {
            Self::Script => Self::Stdout,
            Self::Stdout => Self::Stderr,
            Self::Stderr => Self::Script,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetailPane {
    pub job_id: JobId,
    /// `None` while the loader is still running.
    pub detail: Option<JobDetail>,
    pub tab: DetailTab,
    pub follow: bool,
}

impl DetailPane {
    pub fn content(&self) -> DetailContent {
        match &self.detail {
            None => DetailContent::Text("loading...".to_string()),
            Some(detail) => match self.tab {
                DetailTab::Script => detail.script.clone(),
                DetailTab::Stdout => detail.stdout.content(),
                DetailTab::Stderr => detail.stderr.content(),
            },
        }
    }

    /// Reads new output when the job can still write any. `state` is `None`
    /// once the job has left the listing. Returns whether anything changed.
    pub fn poll_output(&mut self, fs: &dyn FileSystem, state: Option<JobState>) -> bool {
        let Some(detail) = self.detail.as_mut() else {
            return false;
        };
        if !state.is_some_and(|state| should_follow(state, self.follow)) {
            return false;
        }
        let stdout = detail.stdout.poll(fs);
        let stderr = detail.stderr.poll(fs);
        stdout != FollowStatus::Unchanged || stderr != FollowStatus::Unchanged
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCancel {
    pub job_id: JobId,
    pub armed_at: SystemTime,
}

impl PendingCancel {
    pub fn is_live(&self, now: SystemTime) -> bool {
        now.duration_since(self.armed_at)
            .map(|elapsed| elapsed <= CONFIRM_WINDOW)
            .unwrap_or(false)
    }
}

/// All view state owned by the interactive thread.
#[derive(Debug, Clone)]
pub struct AppState {
    pub mode: ViewMode,
    pub input: InputMode,
    pub selected: Option<JobId>,
    pub selected_node: Option<String>,
    pub job_filter: JobFilter,
    pub node_filter: NodeFilter,
    pub job_sort: SortState<JobSortKey>,
    pub node_sort: SortState<NodeSortKey>,
    pub search: String,
    pub detail: Option<DetailPane>,
    pub pending_cancel: Option<PendingCancel>,
    pub interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub follow_default: bool,
    pub status: Option<String>,
}

impl AppState {
    pub fn new(job_filter: JobFilter, refresh: &RefreshConfig) -> Self {
        let node_filter = NodeFilter {
            partition: job_filter.partition.clone(),
            ..NodeFilter::default()
        };
        Self {
            mode: ViewMode::Jobs,
            input: InputMode::Normal,
            selected: None,
            selected_node: None,
            job_filter,
            node_filter,
            job_sort: SortState::default(),
            node_sort: SortState::default(),
            search: String::new(),
            detail: None,
            pending_cancel: None,
            interval: Duration::from_secs(refresh.interval_secs),
            min_interval: Duration::from_secs(refresh.min_interval_secs),
            max_interval: Duration::from_secs(refresh.max_interval_secs),
            follow_default: true,
            status: None,
        }
    }

    pub fn selected_job_index(&self, snapshot: &Snapshot) -> Option<usize> {
        let id = self.selected.as_deref()?;
        job_view(snapshot, &self.job_filter, &self.job_sort)
            .iter()
            .position(|job| job.job_id == id)
    }

    pub fn selected_node_index(&self, snapshot: &Snapshot) -> Option<usize> {
        let name = self.selected_node.as_deref()?;
        node_view(snapshot, &self.node_filter, &self.node_sort)
            .iter()
            .position(|node| node.name == name)
    }

    /// The armed cancel, if its confirmation window is still open.
    pub fn live_pending_cancel(&self, now: SystemTime) -> Option<&PendingCancel> {
        self.pending_cancel.as_ref().filter(|p| p.is_live(now))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Next,
    Prev,
    First,
    Last,
}

#[derive(Debug, Clone)]
pub enum Action {
    Quit,
    Move(Step),
    CycleSort,
    ReverseSort,
    ToggleView,
    OpenDetail,
    /// Esc: closes the detail pane, disarms a cancel, or clears the search.
    Back,
    NextDetailTab,
    ToggleFollow,
    Refresh,
    /// First press arms, a second press on the same job within
    /// `CONFIRM_WINDOW` confirms.
    CancelSelected,
    IntervalUp,
    IntervalDown,
    SaveSettings,
    StartSearch,
    SearchInput(char),
    SearchBackspace,
    SearchCommit,
    SearchCancel,
    SnapshotUpdated,
    DetailLoaded(Box<JobDetail>),
    CancelFinished(CancelResult),
    Notify(String),
}

/// Work the reducer asks the event loop to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    RequestRefresh,
    Cancel(JobId),
    LoadDetail(JobId),
    SetInterval(Duration),
    PersistSettings,
    Quit,
}

pub fn reduce(state: &mut AppState, action: Action, snapshot: &Snapshot, now: SystemTime) -> Vec<Effect> {
    match action {
        Action::Quit => return vec![Effect::Quit],
        Action::Move(step) => move_selection(state, snapshot, step),
        Action::CycleSort => match state.mode {
            ViewMode::Jobs => state.job_sort.select(state.job_sort.key.next()),
            ViewMode::Nodes => state.node_sort.select(state.node_sort.key.next()),
        },
        Action::ReverseSort => match state.mode {
            ViewMode::Jobs => state.job_sort.select(state.job_sort.key),
            ViewMode::Nodes => state.node_sort.select(state.node_sort.key),
        },
        Action::ToggleView => {
            state.mode = match state.mode {
                ViewMode::Jobs => ViewMode::Nodes,
                ViewMode::Nodes => ViewMode::Jobs,
            };
        }
        Action::OpenDetail => {
            if state.mode != ViewMode::Jobs {
                return Vec::new();
            }
            let Some(job_id) = state.selected.clone() else {
                return Vec::new();
            };
            let (tab, follow) = state
                .detail
                .as_ref()
                .map(|pane| (pane.tab, pane.follow))
                .unwrap_or((DetailTab::Stdout, state.follow_default));
            state.detail = Some(DetailPane {
                job_id: job_id.clone(),
                detail: None,
                tab,
                follow,
            });
            return vec![Effect::LoadDetail(job_id)];
        }
        Action::Back => {
            if state.detail.take().is_none() && state.pending_cancel.take().is_none() {
                clear_search(state);
            }
        }
        Action::NextDetailTab => {
            if let Some(pane) = state.detail.as_mut() {
                pane.tab = pane.tab.next();
            }
        }
        Action::ToggleFollow => {
            if let Some(pane) = state.detail.as_mut() {
                pane.follow = !pane.follow;
                state.status = Some(format!(
                    "follow {}",
                    if pane.follow { "on" } else { "off" }
                ));
            }
        }
        Action::Refresh => {
            state.status = Some("refresh requested".to_string());
            return vec![Effect::RequestRefresh];
        }
        Action::CancelSelected => return arm_or_confirm_cancel(state, snapshot, now),
        Action::IntervalUp => {
            let requested = state.interval.saturating_add(INTERVAL_STEP);
            return change_interval(state, requested);
        }
        Action::IntervalDown => {
            let requested = state.interval.saturating_sub(INTERVAL_STEP);
            return change_interval(state, requested);
        }
        Action::SaveSettings => return vec![Effect::PersistSettings],
        Action::StartSearch => {
            state.input = InputMode::Search;
        }
        Action::SearchInput(c) => {
            state.search.push(c);
            apply_search(state);
        }
        Action::SearchBackspace => {
            state.search.pop();
            apply_search(state);
        }
        Action::SearchCommit => {
            state.input = InputMode::Normal;
        }
        Action::SearchCancel => {
            state.input = InputMode::Normal;
            clear_search(state);
        }
        Action::SnapshotUpdated => {
            state.selected = snapshot.reconcile_selection(state.selected.as_deref());
            if let Some(name) = state.selected_node.as_deref() {
                if !snapshot.nodes.iter().any(|node| node.name == name) {
                    state.selected_node = None;
                }
            }
            if let Some(pending) = &state.pending_cancel {
                if snapshot.job(&pending.job_id).is_none() {
                    state.pending_cancel = None;
                }
            }
        }
        Action::DetailLoaded(detail) => {
            if let Some(pane) = state.detail.as_mut() {
                if pane.job_id == detail.job_id {
                    pane.detail = Some(*detail);
                }
            }
        }
        Action::CancelFinished(result) => {
            state.status = Some(format!("job {}: {}", result.job_id, result.outcome.describe()));
        }
        Action::Notify(message) => state.status = Some(message),
    }
    Vec::new()
}

fn step_index(current: Option<usize>, len: usize, step: Step) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let last = len - 1;
    Some(match (step, current) {
        (Step::First, _) | (_, None) => 0,
        (Step::Last, _) => last,
        (Step::Next, Some(i)) => (i + 1).min(last),
        (Step::Prev, Some(i)) => i.saturating_sub(1),
    })
}

fn move_selection(state: &mut AppState, snapshot: &Snapshot, step: Step) {
    match state.mode {
        ViewMode::Jobs => {
            let jobs = job_view(snapshot, &state.job_filter, &state.job_sort);
            let current = state.selected_job_index(snapshot);
            state.selected = step_index(current, jobs.len(), step).map(|i| jobs[i].job_id.clone());
        }
        ViewMode::Nodes => {
            let nodes = node_view(snapshot, &state.node_filter, &state.node_sort);
            let current = state.selected_node_index(snapshot);
            state.selected_node = step_index(current, nodes.len(), step).map(|i| nodes[i].name.clone());
        }
    }
}

fn arm_or_confirm_cancel(state: &mut AppState, snapshot: &Snapshot, now: SystemTime) -> Vec<Effect> {
    if state.mode != ViewMode::Jobs {
        return Vec::new();
    }
    let Some(job_id) = state.selected.clone() else {
        return Vec::new();
    };
    let Some(job) = snapshot.job(&job_id) else {
        return Vec::new();
    };
    if !job.state.is_active() {
        state.pending_cancel = None;
        state.status = Some(format!("job {job_id} is {}, nothing to cancel", job.state.as_str()));
        return Vec::new();
    }

    let confirmed = state
        .live_pending_cancel(now)
        .is_some_and(|pending| pending.job_id == job_id);
    if confirmed {
        state.pending_cancel = None;
        state.status = Some(format!("cancelling job {job_id}"));
        return vec![Effect::Cancel(job_id)];
    }
    state.status = Some(format!(
        "press x again within {}s to cancel job {job_id}",
        CONFIRM_WINDOW.as_secs()
    ));
    state.pending_cancel = Some(PendingCancel {
        job_id,
        armed_at: now,
    });
    Vec::new()
}

fn change_interval(state: &mut AppState, requested: Duration) -> Vec<Effect> {
    let clamped = requested.clamp(state.min_interval, state.max_interval);
    if clamped == state.interval {
        return Vec::new();
    }
    state.interval = clamped;
    state.status = Some(format!("refresh every {}s", clamped.as_secs()));
    vec![Effect::SetInterval(clamped)]
}

fn apply_search(state: &mut AppState) {
    let text = (!state.search.is_empty()).then(|| state.search.clone());
    state.job_filter.text = text.clone();
    state.node_filter.text = text;
}

fn clear_search(state: &mut AppState) {
    state.search.clear();
    apply_search(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelOutcome;
    use crate::config::AppConfig;
    use crate::types::Job;
    use std::sync::Arc;

    fn job(id: &str, state: JobState) -> Job {
        Job {
            job_id: id.to_string(),
            user: "alice".to_string(),
            state,
            partition: "gpu".to_string(),
            node_list: vec!["node01".to_string()],
            reason: None,
            time_used: 10,
            time_limit: Some(100),
            gpu_alloc: 0,
            gpu_total: 0,
            cpu_alloc: 1,
            mem_alloc_mb: 100,
            name: format!("job-{id}"),
            command: None,
            script_path: None,
        }
    }

    fn snapshot(jobs: Vec<Job>) -> Snapshot {
        Snapshot {
            jobs: Arc::new(jobs),
            ..Snapshot::empty()
        }
    }

    fn state() -> AppState {
        AppState::new(JobFilter::default(), &AppConfig::default().refresh)
    }

    #[test]
    fn movement_walks_the_sorted_view_and_clamps() {
        let snap = snapshot(vec![
            job("10", JobState::Running),
            job("9", JobState::Running),
            job("11", JobState::Pending),
        ]);
        let mut app = state();
        let t = SystemTime::UNIX_EPOCH;

        reduce(&mut app, Action::Move(Step::Next), &snap, t);
        assert_eq!(app.selected.as_deref(), Some("9"));
        reduce(&mut app, Action::Move(Step::Next), &snap, t);
        assert_eq!(app.selected.as_deref(), Some("10"));
        reduce(&mut app, Action::Move(Step::Last), &snap, t);
        reduce(&mut app, Action::Move(Step::Next), &snap, t);
        assert_eq!(app.selected.as_deref(), Some("11"));
        reduce(&mut app, Action::Move(Step::First), &snap, t);
        reduce(&mut app, Action::Move(Step::Prev), &snap, t);
        assert_eq!(app.selected.as_deref(), Some("9"));
    }

    #[test]
    fn snapshot_update_clears_vanished_selection_only() {
        let mut app = state();
        app.selected = Some("7".to_string());
        let t = SystemTime::UNIX_EPOCH;

        reduce(&mut app, Action::SnapshotUpdated, &snapshot(vec![job("7", JobState::Running)]), t);
        assert_eq!(app.selected.as_deref(), Some("7"));
        reduce(&mut app, Action::SnapshotUpdated, &snapshot(vec![job("8", JobState::Running)]), t);
        assert_eq!(app.selected, None);
    }

    #[test]
    fn cancel_needs_two_presses_inside_window() {
        let snap = snapshot(vec![job("5", JobState::Running)]);
        let mut app = state();
        app.selected = Some("5".to_string());
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);

        assert!(reduce(&mut app, Action::CancelSelected, &snap, t0).is_empty());
        assert!(app.pending_cancel.is_some());
        let effects = reduce(&mut app, Action::CancelSelected, &snap, t0 + Duration::from_secs(2));
        assert_eq!(effects, vec![Effect::Cancel("5".to_string())]);
        assert!(app.pending_cancel.is_none());

        // Confirmation after the window re-arms instead.
        reduce(&mut app, Action::CancelSelected, &snap, t0);
        let late = reduce(&mut app, Action::CancelSelected, &snap, t0 + CONFIRM_WINDOW + Duration::from_secs(1));
        assert!(late.is_empty());
        assert!(app.pending_cancel.is_some());
    }

    #[test]
    fn cancel_ignores_finished_jobs_and_back_disarms() {
        let snap = snapshot(vec![job("5", JobState::Completed), job("6", JobState::Pending)]);
        let mut app = state();
        let t = SystemTime::UNIX_EPOCH;
        app.selected = Some("5".to_string());
        assert!(reduce(&mut app, Action::CancelSelected, &snap, t).is_empty());
        assert!(app.pending_cancel.is_none());

        app.selected = Some("6".to_string());
        reduce(&mut app, Action::CancelSelected, &snap, t);
        reduce(&mut app, Action::Back, &snap, t);
        assert!(app.pending_cancel.is_none());
        assert!(reduce(&mut app, Action::CancelSelected, &snap, t).is_empty());
    }

    #[test]
    fn interval_changes_are_clamped() {
        let snap = Snapshot::empty();
        let mut app = state();
        app.interval = Duration::from_secs(1);
        let t = SystemTime::UNIX_EPOCH;

        assert!(reduce(&mut app, Action::IntervalDown, &snap, t).is_empty());
        assert_eq!(
            reduce(&mut app, Action::IntervalUp, &snap, t),
            vec![Effect::SetInterval(Duration::from_secs(2))]
        );
    }

    #[test]
    fn search_filters_live_and_cancel_restores() {
        let snap = snapshot(vec![job("1", JobState::Running)]);
        let mut app = state();
        let t = SystemTime::UNIX_EPOCH;
        reduce(&mut app, Action::StartSearch, &snap, t);
        for c in "gpu".chars() {
            reduce(&mut app, Action::SearchInput(c), &snap, t);
        }
        assert_eq!(app.job_filter.text.as_deref(), Some("gpu"));
        assert_eq!(app.node_filter.text.as_deref(), Some("gpu"));
        reduce(&mut app, Action::SearchCancel, &snap, t);
        assert_eq!(app.input, InputMode::Normal);
        assert_eq!(app.job_filter.text, None);
    }

    #[test]
    fn detail_open_requests_load_and_ignores_stale_results() {
        use crate::config::OutputConfig;
        use crate::detail::OutputFollower;
        use std::collections::BTreeMap;

        let snap = snapshot(vec![job("1", JobState::Running)]);
        let mut app = state();
        let t = SystemTime::UNIX_EPOCH;
        app.selected = Some("1".to_string());
        assert_eq!(
            reduce(&mut app, Action::OpenDetail, &snap, t),
            vec![Effect::LoadDetail("1".to_string())]
        );

        let output = AppConfig::default().output;
        let loaded = |id: &str, output: &OutputConfig| JobDetail {
            job_id: id.to_string(),
            record: BTreeMap::new(),
            script: DetailContent::Text("#!/bin/sh".to_string()),
            stdout: OutputFollower::new(None, output),
            stderr: OutputFollower::new(None, output),
        };
        reduce(&mut app, Action::DetailLoaded(Box::new(loaded("2", &output))), &snap, t);
        assert!(app.detail.as_ref().is_some_and(|pane| pane.detail.is_none()));
        reduce(&mut app, Action::DetailLoaded(Box::new(loaded("1", &output))), &snap, t);
        reduce(&mut app, Action::NextDetailTab, &snap, t);
        reduce(&mut app, Action::NextDetailTab, &snap, t);
        let pane = app.detail.as_ref().expect("pane");
        assert_eq!(pane.tab, DetailTab::Script);
        assert_eq!(pane.content().as_text(), "#!/bin/sh");
    }

    #[test]
    fn cancel_result_goes_to_status_line() {
        let mut app = state();
        reduce(
            &mut app,
            Action::CancelFinished(CancelResult {
                job_id: "3".to_string(),
                outcome: CancelOutcome::AlreadyFinishing,
            }),
            &Snapshot::empty(),
            SystemTime::UNIX_EPOCH,
        );
        assert_eq!(app.status.as_deref(), Some("job 3: job was already finishing"));
    }
}
