pub mod app;
pub mod cancel;
pub mod config;
pub mod detail;
pub mod errors;
pub mod gateway;
pub mod hotkeys;
pub mod log_retention;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod refresh;
pub mod runtime;
pub mod slurm;
pub mod snapshot;
pub mod tui;
pub mod types;
pub mod view;

use app::{reduce, Action, AppState, Effect};
use cancel::{CancelResult, Canceller};
use clap::{error::ErrorKind, Parser};
use config::{default_config_path, load_config, persist_settings, AppConfig, CliOverrides};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use detail::{DetailLoader, JobDetail};
use errors::SmonError;
use gateway::CommandGateway;
use hotkeys::{action_for_key, Key};
use logging::{append_run_log, default_log_path, init_run_log, JsonlLogger};
use ratatui::backend::CrosstermBackend;
use refresh::{run_cycle, spawn_worker, RefreshHandle, RefreshPolicy, RefreshScheduler, Trigger};
use runtime::ProductionRuntime;
use serde_json::json;
use slurm::SlurmSource;
use snapshot::{Snapshot, SnapshotReader, SnapshotStore};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tui::{banner_lines, draw_dashboard, render_dashboard, DashboardView};
use types::DataSource;
use view::{job_view, JobFilter};

const INPUT_POLL: Duration = Duration::from_millis(100);
const ONCE_WIDTH: u16 = 140;

#[derive(Debug, Clone, Parser)]
#[command(name = "smon")]
#[command(about = "Live dashboard for Slurm jobs and nodes")]
pub struct Cli {
    /// Refresh interval in seconds
    #[arg(long)]
    pub refresh: Option<u64>,
    /// Only jobs whose user contains this text
    #[arg(long)]
    pub user: Option<String>,
    /// Only jobs of the current user ($USER)
    #[arg(long, default_value_t = false, conflicts_with = "user")]
    pub me: bool,
    #[arg(long)]
    pub partition: Option<String>,
    /// Comma separated job states, or `all`
    #[arg(long)]
    pub state: Option<String>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// Fetch once, print a single frame and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

pub fn run() -> Result<i32, SmonError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &env, &runtime)
}

pub fn run_with_runtime(
    args: &[OsString],
    env: &[(OsString, OsString)],
    runtime: &ProductionRuntime,
) -> Result<i32, SmonError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(SmonError::Cli(error.to_string())),
        },
    };

    let env_map = env_to_map(env);
    let user = if cli.me {
        let me = env_map
            .get("USER")
            .or_else(|| env_map.get("LOGNAME"))
            .filter(|name| !name.is_empty())
            .cloned()
            .ok_or_else(|| SmonError::Cli("--me needs $USER or $LOGNAME".to_string()))?;
        Some(me)
    } else {
        cli.user.clone()
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        refresh_secs: cli.refresh,
        user,
        partition: cli.partition.clone(),
        state: cli.state.clone(),
        log_file: cli.log_file.clone(),
    };
    let cfg = load_config(&overrides, runtime.file_system.as_ref())?;

    let mut logger = JsonlLogger::new(cfg.logging.path.clone().unwrap_or_else(default_log_path));
    logger.budget_bytes = cfg.logging.budget_bytes;
    init_run_log(logger);
    append_run_log(
        "info",
        "app.started",
        json!({
            "once": cli.once,
            "interval_secs": cfg.refresh.interval_secs,
            "filters": cfg.filters,
        }),
    );

    let filter = JobFilter::from_config(&cfg.filters)?;
    let source = SlurmSource::new(
        CommandGateway::new(runtime.process_runner.clone()),
        cfg.commands.clone(),
        Duration::from_secs(cfg.refresh.command_timeout_secs),
    );
    let store = Arc::new(SnapshotStore::new());

    if cli.once {
        return run_once(runtime, &cfg, &source, &store, filter);
    }
    if !runtime.terminal.stdin_is_tty() {
        return Err(SmonError::Terminal(
            "the dashboard needs an interactive terminal; use --once".to_string(),
        ));
    }
    run_interactive(runtime, &cfg, cli.config.clone(), source, store, filter)
}

fn run_once(
    runtime: &ProductionRuntime,
    cfg: &AppConfig,
    source: &SlurmSource,
    store: &SnapshotStore,
    filter: JobFilter,
) -> Result<i32, SmonError> {
    run_cycle(source, store, runtime.clock.as_ref(), &DataSource::ALL);
    let snapshot = store.current();
    let state = AppState::new(filter, &cfg.refresh);

    // Tall enough for every visible job: summary, banner, table chrome, footer.
    let shown = job_view(&snapshot, &state.job_filter, &state.job_sort).len();
    let height = (3 + banner_lines(&snapshot).len() + shown + 3 + 2).clamp(12, u16::MAX as usize) as u16;
    let frame = render_dashboard(
        &DashboardView {
            state: &state,
            snapshot: &snapshot,
            refresh: None,
            now: runtime.clock.now(),
        },
        ONCE_WIDTH,
        height,
    )?;
    let trimmed = frame
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    runtime.terminal.draw(&trimmed)?;
    if snapshot.parse_warnings > 0 {
        runtime.terminal.write_line(&format!(
            "smon: {} listing line(s) had parse problems; see the run log",
            snapshot.parse_warnings
        ))?;
    }
    Ok(0)
}

fn run_interactive(
    runtime: &ProductionRuntime,
    cfg: &AppConfig,
    config_path: Option<PathBuf>,
    source: SlurmSource,
    store: Arc<SnapshotStore>,
    filter: JobFilter,
) -> Result<i32, SmonError> {
    let scheduler = RefreshScheduler::new(RefreshPolicy::from_config(&cfg.refresh));
    let mut refresh = spawn_worker(scheduler, source.clone(), store.clone(), runtime.clock.clone())?;
    let requester = refresh.requester();
    let canceller = Canceller::new(source.clone()).with_after_cancel(move |_| {
        requester.request(Trigger::AfterCancel);
    });

    let terminal_error = |e: std::io::Error| SmonError::Terminal(e.to_string());
    enable_raw_mode().map_err(terminal_error)?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen).map_err(terminal_error)?;
    let mut terminal =
        ratatui::Terminal::new(CrosstermBackend::new(stdout)).map_err(terminal_error)?;

    let mut session = Session {
        runtime,
        cfg,
        config_path,
        source,
        canceller,
        refresh: &refresh,
        reader: store.reader(),
        state: AppState::new(filter, &cfg.refresh),
        cancels: Vec::new(),
        detail_rx: None,
        last_follow: Instant::now(),
    };
    let result = session.event_loop(&mut terminal);

    disable_raw_mode().map_err(terminal_error)?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen).map_err(terminal_error)?;
    terminal.show_cursor().map_err(terminal_error)?;
    refresh.shutdown();
    append_run_log("info", "app.stopped", json!({}));
    result
}

type DashboardTerminal = ratatui::Terminal<CrosstermBackend<std::io::Stdout>>;

struct Session<'a> {
    runtime: &'a ProductionRuntime,
    cfg: &'a AppConfig,
    config_path: Option<PathBuf>,
    source: SlurmSource,
    canceller: Canceller,
    refresh: &'a RefreshHandle,
    reader: SnapshotReader,
    state: AppState,
    cancels: Vec<oneshot::Receiver<CancelResult>>,
    detail_rx: Option<mpsc::Receiver<JobDetail>>,
    last_follow: Instant,
}

impl Session<'_> {
    fn event_loop(&mut self, terminal: &mut DashboardTerminal) -> Result<i32, SmonError> {
        let terminal_error = |e: std::io::Error| SmonError::Terminal(e.to_string());
        let mut snapshot = self.reader.current();
        loop {
            let status = self.refresh.status();
            terminal
                .draw(|frame| {
                    draw_dashboard(
                        frame,
                        &DashboardView {
                            state: &self.state,
                            snapshot: &snapshot,
                            refresh: Some(&status),
                            now: self.runtime.clock.now(),
                        },
                    )
                })
                .map_err(terminal_error)?;

            if event::poll(INPUT_POLL).map_err(terminal_error)? {
                if let Event::Key(key) = event::read().map_err(terminal_error)? {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    let action = if key.code == KeyCode::Char('c')
                        && key.modifiers.contains(KeyModifiers::CONTROL)
                    {
                        Some(Action::Quit)
                    } else {
                        translate_key(key.code).and_then(|k| action_for_key(k, self.state.input))
                    };
                    if let Some(action) = action {
                        if self.dispatch(action, &snapshot) {
                            return Ok(0);
                        }
                    }
                }
            }

            if self.reader.has_changed() {
                snapshot = self.reader.current();
                self.dispatch(Action::SnapshotUpdated, &snapshot);
            }
            for result in self.drain_cancels() {
                self.dispatch(Action::CancelFinished(result), &snapshot);
            }
            if let Some(detail) = self.take_detail() {
                self.dispatch(Action::DetailLoaded(Box::new(detail)), &snapshot);
            }
            self.follow_output(&snapshot);
        }
    }

    /// Runs the reducer and its effects. Returns true on quit.
    fn dispatch(&mut self, action: Action, snapshot: &Snapshot) -> bool {
        let now = self.runtime.clock.now();
        let effects = reduce(&mut self.state, action, snapshot, now);
        for effect in effects {
            match effect {
                Effect::Quit => return true,
                Effect::RequestRefresh => {
                    self.refresh.request(Trigger::Manual);
                }
                Effect::SetInterval(interval) => {
                    self.refresh.set_interval(interval);
                }
                Effect::Cancel(job_id) => match self.canceller.cancel(&job_id) {
                    Ok(rx) => self.cancels.push(rx),
                    Err(rejected) => {
                        reduce(&mut self.state, Action::Notify(rejected.to_string()), snapshot, now);
                    }
                },
                Effect::LoadDetail(job_id) => self.load_detail(job_id),
                Effect::PersistSettings => {
                    let message = match self.persist() {
                        Ok(path) => format!("settings saved to {}", path.display()),
                        Err(err) => format!("could not save settings: {err}"),
                    };
                    reduce(&mut self.state, Action::Notify(message), snapshot, now);
                }
            }
        }
        false
    }

    fn drain_cancels(&mut self) -> Vec<CancelResult> {
        let mut finished = Vec::new();
        self.cancels.retain_mut(|rx| match rx.try_recv() {
            Ok(result) => {
                finished.push(result);
                false
            }
            Err(oneshot::error::TryRecvError::Empty) => true,
            Err(oneshot::error::TryRecvError::Closed) => false,
        });
        finished
    }

    fn load_detail(&mut self, job_id: String) {
        let (tx, rx) = mpsc::sync_channel(1);
        let source = self.source.clone();
        let fs = self.runtime.file_system.clone();
        let output = self.cfg.output.clone();
        let spawned = std::thread::Builder::new()
            .name("smon-detail".to_string())
            .spawn(move || {
                let loader = DetailLoader {
                    source: &source,
                    fs: fs.as_ref(),
                    output: &output,
                };
                let _ = tx.send(loader.load(&job_id));
            });
        match spawned {
            Ok(_) => self.detail_rx = Some(rx),
            Err(err) => append_run_log("error", "detail.spawn_failed", json!({"error": err.to_string()})),
        }
    }

    fn take_detail(&mut self) -> Option<JobDetail> {
        let rx = self.detail_rx.as_ref()?;
        match rx.try_recv() {
            Ok(detail) => {
                self.detail_rx = None;
                Some(detail)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.detail_rx = None;
                None
            }
        }
    }

    fn follow_output(&mut self, snapshot: &Snapshot) {
        let every = Duration::from_secs(self.cfg.output.follow_interval_secs.max(1));
        if self.last_follow.elapsed() < every {
            return;
        }
        self.last_follow = Instant::now();
        if let Some(pane) = self.state.detail.as_mut() {
            let state = snapshot.job(&pane.job_id).map(|job| job.state);
            pane.poll_output(self.runtime.file_system.as_ref(), state);
        }
    }

    fn persist(&self) -> Result<PathBuf, SmonError> {
        let path = self
            .config_path
            .clone()
            .or_else(default_config_path)
            .ok_or_else(|| SmonError::InvalidConfig("no config path; pass --config".to_string()))?;
        if let Some(parent) = path.parent() {
            self.runtime.file_system.create_dir_all(parent)?;
        }
        persist_settings(
            self.runtime.file_system.as_ref(),
            &path,
            self.state.interval.as_secs(),
            &self.state.job_filter.to_config(),
        )?;
        append_run_log("info", "settings.saved", json!({"path": path.display().to_string()}));
        Ok(path)
    }
}

fn translate_key(code: KeyCode) -> Option<Key> {
    match code {
        KeyCode::Char(c) => Some(Key::Char(c)),
        KeyCode::Up => Some(Key::Up),
        KeyCode::Down => Some(Key::Down),
        KeyCode::Home => Some(Key::Home),
        KeyCode::End => Some(Key::End),
        KeyCode::Enter => Some(Key::Enter),
        KeyCode::Esc => Some(Key::Esc),
        KeyCode::Backspace => Some(Key::Backspace),
        KeyCode::Tab => Some(Key::Tab),
        _ => None,
    }
}

fn env_to_map(env: &[(OsString, OsString)]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeClock, FakeFileSystem, FakeProcessRunner, FakeTerminal, ProcessOutput};

    fn runtime(runner: FakeProcessRunner, terminal: FakeTerminal) -> ProductionRuntime {
        ProductionRuntime {
            clock: Arc::new(FakeClock::default()),
            file_system: Arc::new(FakeFileSystem::default()),
            process_runner: Arc::new(runner),
            terminal: Arc::new(terminal),
        }
    }

    fn args(extra: &[&str], log_dir: &std::path::Path) -> Vec<OsString> {
        let mut args = vec![OsString::from("smon")];
        args.extend(extra.iter().map(OsString::from));
        args.push(OsString::from("--log-file"));
        args.push(log_dir.join("run.jsonl").into_os_string());
        args
    }

    #[test]
    fn once_prints_a_single_frame_with_filters_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeProcessRunner::default();
        runner.push_program_response(
            "squeue",
            Ok(ProcessOutput::success(
                "123|alice|RUNNING|gpu|node01|00:10:00|01:00:00|2|8\n124|bob|PENDING|cpu|(Priority)|0:00|1:00:00|0|0\n",
            )),
        );
        runner.push_program_response(
            "sinfo",
            Ok(ProcessOutput::success("node01|gpu*|mixed|gpu:2|gpu:8|4/60/0/64|64|1024|262144|\n")),
        );
        let terminal = FakeTerminal::new(false);
        let rt = runtime(runner, terminal.clone());

        let code = run_with_runtime(&args(&["--once", "--user", "ali"], dir.path()), &[], &rt)
            .expect("run");

        assert_eq!(code, 0);
        let frames = terminal.drawn_frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("alice"));
        assert!(!frames[0].contains("bob"));
        assert!(frames[0].contains("user=ali"));
    }

    #[test]
    fn me_uses_user_from_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeProcessRunner::default();
        runner.push_program_response("squeue", Ok(ProcessOutput::success("")));
        runner.push_program_response("sinfo", Ok(ProcessOutput::success("")));
        let terminal = FakeTerminal::new(false);
        let rt = runtime(runner, terminal.clone());
        let env = vec![(OsString::from("USER"), OsString::from("carol"))];

        run_with_runtime(&args(&["--once", "--me"], dir.path()), &env, &rt).expect("run");
        assert!(terminal.drawn_frames()[0].contains("user=carol"));

        let missing = run_with_runtime(&args(&["--once", "--me"], dir.path()), &[], &rt);
        assert!(matches!(missing, Err(SmonError::Cli(_))));
    }

    #[test]
    fn once_reports_parse_problems_below_the_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeProcessRunner::default();
        runner.push_program_response(
            "squeue",
            Ok(ProcessOutput::success(
                "123|alice|RUNNING|gpu|node01|00:10:00|01:00:00|2|8\nnot|enough|fields\n",
            )),
        );
        runner.push_program_response("sinfo", Ok(ProcessOutput::success("")));
        let terminal = FakeTerminal::new(false);
        let rt = runtime(runner, terminal.clone());

        run_with_runtime(&args(&["--once"], dir.path()), &[], &rt).expect("run");

        assert!(terminal.drawn_frames()[0].contains("alice"));
        assert_eq!(
            terminal.written_lines(),
            vec!["smon: 1 listing line(s) had parse problems; see the run log".to_string()]
        );
    }

    #[test]
    fn interactive_mode_requires_a_terminal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rt = runtime(FakeProcessRunner::default(), FakeTerminal::new(false));
        let result = run_with_runtime(&args(&[], dir.path()), &[], &rt);
        assert!(matches!(result, Err(SmonError::Terminal(_))));
    }

    #[test]
    fn bad_state_filter_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rt = runtime(FakeProcessRunner::default(), FakeTerminal::new(false));
        let result = run_with_runtime(&args(&["--once", "--state", "sleeping"], dir.path()), &[], &rt);
        assert!(matches!(result, Err(SmonError::InvalidConfig(_))));
    }

    #[test]
    fn translate_key_covers_navigation() {
        assert_eq!(translate_key(KeyCode::Char('x')), Some(Key::Char('x')));
        assert_eq!(translate_key(KeyCode::Esc), Some(Key::Esc));
        assert_eq!(translate_key(KeyCode::F(1)), None);
    }
}
