use crate::app::{AppState, InputMode, ViewMode};
use crate::detail::{should_follow, DetailContent};
use crate::errors::{CommandErrorKind, SmonError};
use crate::hotkeys::controls_legend;
use crate::metrics::{
    classify, format_duration, format_limit, format_memory_mb, gpu_bar, job_state_color,
    node_state_color, time_ratio, urgency_color, TimeRatio,
};
use crate::refresh::RefreshStatus;
use crate::snapshot::Snapshot;
use crate::types::Job;
use crate::view::{job_view, node_view, SortDirection, SortState};
use ratatui::backend::TestBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState, Wrap};
use ratatui::{Frame, Terminal};
use std::time::SystemTime;

const GPU_BAR_WIDTH: usize = 8;

/// Everything one frame needs; borrowed from the event loop.
pub struct DashboardView<'a> {
    pub state: &'a AppState,
    pub snapshot: &'a Snapshot,
    pub refresh: Option<&'a RefreshStatus>,
    pub now: SystemTime,
}

fn sort_marker<K>(sort: &SortState<K>) -> &'static str {
    match sort.direction {
        SortDirection::Ascending => "asc",
        SortDirection::Descending => "desc",
    }
}

fn summary_line(view: &DashboardView) -> String {
    let state = view.state;
    let snapshot = view.snapshot;
    let shown = job_view(snapshot, &state.job_filter, &state.job_sort).len();
    let mut parts = vec![format!(
        "jobs {shown}/{}  nodes {}",
        snapshot.jobs.len(),
        snapshot.nodes.len()
    )];

    let interval = view.refresh.map_or(state.interval, |r| r.interval);
    let mut cadence = format!("every {}s", interval.as_secs());
    if let Some(refresh) = view.refresh {
        if refresh.next_delay > refresh.interval {
            cadence.push_str(&format!(" (backoff {}s)", refresh.next_delay.as_secs()));
        }
    }
    parts.push(cadence);

    parts.push(match snapshot.taken_at {
        Some(at) => {
            let age = view.now.duration_since(at).map(|d| d.as_secs()).unwrap_or(0);
            format!("updated {age}s ago")
        }
        None => "waiting for first refresh".to_string(),
    });

    let mut filters = Vec::new();
    if let Some(user) = &state.job_filter.user {
        filters.push(format!("user={user}"));
    }
    if let Some(partition) = &state.job_filter.partition {
        filters.push(format!("partition={partition}"));
    }
    if !state.job_filter.states.is_empty() {
        let states = state
            .job_filter
            .states
            .iter()
            .map(|s| s.as_str().to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(",");
        filters.push(format!("state={states}"));
    }
    if !state.search.is_empty() {
        filters.push(format!("search={}", state.search));
    }
    if !filters.is_empty() {
        parts.push(format!("filter: {}", filters.join(" ")));
    }

    parts.push(match state.mode {
        ViewMode::Jobs => format!(
            "sort: {} {}",
            state.job_sort.key.label(),
            sort_marker(&state.job_sort)
        ),
        ViewMode::Nodes => format!(
            "sort: {} {}",
            state.node_sort.key.label(),
            sort_marker(&state.node_sort)
        ),
    });
    if snapshot.parse_warnings > 0 {
        parts.push(format!("{} unparsed lines", snapshot.parse_warnings));
    }
    parts.join("  |  ")
}

/// One line per failed source; empty when the snapshot is healthy.
pub fn banner_lines(snapshot: &Snapshot) -> Vec<String> {
    snapshot
        .failures
        .iter()
        .map(|failure| match failure.kind {
            CommandErrorKind::NotAvailable => format!(
                "{}: command not available ({}); polling halted, press r to retry",
                failure.source.as_str(),
                failure.detail
            ),
            kind => format!(
                "{}: {kind}: {}; showing last good data",
                failure.source.as_str(),
                failure.detail
            ),
        })
        .collect()
}

fn header_row(labels: &[&str]) -> Row<'static> {
    Row::new(labels.iter().map(|l| Cell::from(l.to_string())).collect::<Vec<_>>())
        .style(Style::default().add_modifier(Modifier::BOLD))
}

/// Nodes for jobs that hold some, otherwise the pending reason.
fn node_column(job: &Job) -> String {
    match &job.reason {
        Some(reason) if job.node_list.is_empty() => format!("({reason})"),
        _ => job.node_list.join(","),
    }
}

fn draw_jobs(frame: &mut Frame, area: Rect, view: &DashboardView) {
    let state = view.state;
    let jobs = job_view(view.snapshot, &state.job_filter, &state.job_sort);
    let pending = state.live_pending_cancel(view.now).map(|p| p.job_id.as_str());
    let rows = jobs
        .iter()
        .map(|job| {
            let ratio = time_ratio(job.time_used, job.time_limit);
            let usage = match ratio {
                TimeRatio::Ratio(r) => format!("{:.0}%", r * 100.0),
                TimeRatio::Unlimited => "-".to_string(),
            };
            let id_style = if pending == Some(job.job_id.as_str()) {
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            Row::new(vec![
                Cell::from(Span::styled(job.job_id.clone(), id_style)),
                Cell::from(job.user.clone()),
                Cell::from(Span::styled(
                    job.state.as_str(),
                    Style::default().fg(job_state_color(job.state)),
                )),
                Cell::from(job.partition.clone()),
                Cell::from(job.name.clone()),
                Cell::from(format_duration(job.time_used)),
                Cell::from(format_limit(job.time_limit)),
                Cell::from(Span::styled(
                    usage,
                    Style::default().fg(urgency_color(classify(ratio))),
                )),
                Cell::from(format!(
                    "{} {}/{}",
                    gpu_bar(job.gpu_alloc, job.gpu_total, GPU_BAR_WIDTH),
                    job.gpu_alloc,
                    job.gpu_total
                )),
                Cell::from(node_column(job)),
            ])
        })
        .collect::<Vec<_>>();
    let widths = [
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(16),
        Constraint::Length(11),
        Constraint::Length(11),
        Constraint::Length(6),
        Constraint::Length(14),
        Constraint::Min(8),
    ];
    let table = Table::new(rows, widths)
        .header(header_row(&[
            "JOBID", "USER", "STATE", "PARTITION", "NAME", "TIME", "LIMIT", "USE", "GPUS", "NODES",
        ]))
        .block(Block::default().borders(Borders::ALL).title("Jobs"))
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut table_state = TableState::default().with_selected(state.selected_job_index(view.snapshot));
    frame.render_stateful_widget(table, area, &mut table_state);
}

fn draw_nodes(frame: &mut Frame, area: Rect, view: &DashboardView) {
    let state = view.state;
    let nodes = node_view(view.snapshot, &state.node_filter, &state.node_sort);
    let rows = nodes
        .iter()
        .map(|node| {
            Row::new(vec![
                Cell::from(node.name.clone()),
                Cell::from(Span::styled(
                    node.state.as_str(),
                    Style::default().fg(node_state_color(node.state)),
                )),
                Cell::from(node.partitions.join(",")),
                Cell::from(format!(
                    "{} {}/{}",
                    gpu_bar(node.gpu_alloc, node.gpu_total, GPU_BAR_WIDTH),
                    node.gpu_alloc,
                    node.gpu_total
                )),
                Cell::from(format!("{}/{}", node.cpu_alloc, node.cpu_total)),
                Cell::from(format!(
                    "{}/{}",
                    format_memory_mb(node.mem_alloc_mb),
                    format_memory_mb(node.mem_total_mb)
                )),
            ])
        })
        .collect::<Vec<_>>();
    let widths = [
        Constraint::Length(14),
        Constraint::Length(8),
        Constraint::Length(16),
        Constraint::Length(16),
        Constraint::Length(10),
        Constraint::Min(12),
    ];
    let table = Table::new(rows, widths)
        .header(header_row(&["NODE", "STATE", "PARTITIONS", "GPUS", "CPUS", "MEMORY"]))
        .block(Block::default().borders(Borders::ALL).title("Nodes"))
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut table_state = TableState::default().with_selected(state.selected_node_index(view.snapshot));
    frame.render_stateful_widget(table, area, &mut table_state);
}

fn draw_detail(frame: &mut Frame, area: Rect, view: &DashboardView) {
    let Some(pane) = &view.state.detail else {
        return;
    };
    let following = view
        .snapshot
        .job(&pane.job_id)
        .is_some_and(|job| should_follow(job.state, pane.follow));
    let title = format!(
        "Job {} [{}]{}",
        pane.job_id,
        pane.tab.label(),
        if following { " following" } else { "" }
    );
    let content = pane.content();
    let text = content.as_text();
    // Keep the newest lines visible.
    let inner_height = area.height.saturating_sub(2) as usize;
    let line_count = text.lines().count();
    let scroll = line_count.saturating_sub(inner_height).min(u16::MAX as usize) as u16;
    let style = match &content {
        DetailContent::Unavailable(_) => Style::default().fg(Color::DarkGray),
        DetailContent::Text(_) => Style::default(),
    };
    frame.render_widget(
        Paragraph::new(text.to_string())
            .style(style)
            .wrap(Wrap { trim: false })
            .scroll((scroll, 0))
            .block(Block::default().borders(Borders::ALL).title(title)),
        area,
    );
}

pub fn draw_dashboard(frame: &mut Frame, view: &DashboardView) {
    let banner = banner_lines(view.snapshot);
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(banner.len() as u16),
            Constraint::Min(5),
            Constraint::Length(1),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(
        Paragraph::new(summary_line(view)).block(Block::default().borders(Borders::ALL).title("smon")),
        chunks[0],
    );
    if !banner.is_empty() {
        let lines = banner
            .into_iter()
            .map(|line| Line::from(Span::styled(line, Style::default().fg(Color::Red))))
            .collect::<Vec<_>>();
        frame.render_widget(Paragraph::new(lines), chunks[1]);
    }

    match view.state.mode {
        ViewMode::Jobs if view.state.detail.is_some() => {
            let split = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
                .split(chunks[2]);
            draw_jobs(frame, split[0], view);
            draw_detail(frame, split[1], view);
        }
        ViewMode::Jobs => draw_jobs(frame, chunks[2], view),
        ViewMode::Nodes => draw_nodes(frame, chunks[2], view),
    }

    let status = match view.state.input {
        InputMode::Search => format!("/{}", view.state.search),
        InputMode::Normal => view.state.status.clone().unwrap_or_default(),
    };
    frame.render_widget(Paragraph::new(status), chunks[3]);
    frame.render_widget(
        Paragraph::new(controls_legend(view.state.input, view.state.detail.is_some()))
            .style(Style::default().fg(Color::DarkGray)),
        chunks[4],
    );
}

/// Renders one frame off-screen and returns it as plain text rows.
pub fn render_dashboard(view: &DashboardView, width: u16, height: u16) -> Result<String, SmonError> {
    let backend = TestBackend::new(width, height);
    let mut terminal = Terminal::new(backend).map_err(|e| SmonError::Terminal(e.to_string()))?;
    terminal
        .draw(|frame| draw_dashboard(frame, view))
        .map_err(|e| SmonError::Terminal(e.to_string()))?;

    let mut out = String::new();
    let buffer = terminal.backend().buffer();
    for y in 0..height {
        for x in 0..width {
            out.push_str(buffer[(x, y)].symbol());
        }
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::snapshot::SourceFailure;
    use crate::types::{DataSource, Job, JobState, Node, NodeState};
    use crate::view::JobFilter;
    use std::sync::Arc;
    use std::time::Duration;

    fn snapshot() -> Snapshot {
        Snapshot {
            jobs: Arc::new(vec![Job {
                job_id: "123".to_string(),
                user: "alice".to_string(),
                state: JobState::Running,
                partition: "gpu".to_string(),
                node_list: vec!["node01".to_string()],
                reason: None,
                time_used: 600,
                time_limit: Some(3600),
                gpu_alloc: 2,
                gpu_total: 8,
                cpu_alloc: 4,
                mem_alloc_mb: 1024,
                name: "train".to_string(),
                command: None,
                script_path: None,
            }]),
            nodes: Arc::new(vec![Node {
                name: "node01".to_string(),
                state: NodeState::Mixed,
                partitions: vec!["gpu".to_string()],
                gpu_alloc: 2,
                gpu_total: 8,
                cpu_alloc: 4,
                cpu_total: 64,
                mem_alloc_mb: 1024,
                mem_total_mb: 256 * 1024,
            }]),
            taken_at: Some(SystemTime::UNIX_EPOCH),
            ..Snapshot::empty()
        }
    }

    fn app() -> AppState {
        AppState::new(JobFilter::default(), &AppConfig::default().refresh)
    }

    #[test]
    fn job_frame_shows_row_gpu_bar_and_legend() {
        let snap = snapshot();
        let state = app();
        let frame = render_dashboard(
            &DashboardView {
                state: &state,
                snapshot: &snap,
                refresh: None,
                now: SystemTime::UNIX_EPOCH + Duration::from_secs(3),
            },
            140,
            16,
        )
        .expect("render");
        assert!(frame.contains("Jobs"));
        assert!(frame.contains("alice"));
        assert!(frame.contains("RUNNING"));
        assert!(frame.contains("██░░░░░░ 2/8"));
        assert!(frame.contains("17%"));
        assert!(frame.contains("updated 3s ago"));
        assert!(frame.contains("Keys: q quit"));
    }

    #[test]
    fn pending_job_shows_its_reason_in_the_node_column() {
        let mut snap = snapshot();
        let mut waiting = snap.jobs[0].clone();
        waiting.job_id = "124".to_string();
        waiting.state = JobState::Pending;
        waiting.node_list = Vec::new();
        waiting.reason = Some("QOSMaxGRESPerUser".to_string());
        waiting.gpu_alloc = 0;
        snap.jobs = Arc::new(vec![snap.jobs[0].clone(), waiting]);
        let frame = render_dashboard(
            &DashboardView {
                state: &app(),
                snapshot: &snap,
                refresh: None,
                now: SystemTime::UNIX_EPOCH,
            },
            160,
            16,
        )
        .expect("render");
        let row = frame
            .lines()
            .find(|line| line.contains("124"))
            .expect("pending row");
        assert!(row.contains("(QOSMaxGRESPerUser)"), "{row}");
        assert!(row.contains("0/8"), "{row}");
        let running = frame
            .lines()
            .find(|line| line.contains("123"))
            .expect("running row");
        assert!(running.contains("node01"), "{running}");
    }

    #[test]
    fn node_mode_and_failure_banner_render() {
        let mut snap = snapshot();
        snap.degraded = true;
        snap.failures = vec![SourceFailure {
            source: DataSource::Jobs,
            kind: CommandErrorKind::NotAvailable,
            detail: "No such file or directory".to_string(),
        }];
        let mut state = app();
        state.mode = ViewMode::Nodes;
        let frame = render_dashboard(
            &DashboardView {
                state: &state,
                snapshot: &snap,
                refresh: None,
                now: SystemTime::UNIX_EPOCH,
            },
            140,
            16,
        )
        .expect("render");
        assert!(frame.contains("jobs: command not available"));
        assert!(frame.contains("Nodes"));
        assert!(frame.contains("MIXED"));
        assert!(frame.contains("1.0G/256.0G"));
    }

    #[test]
    fn banner_is_empty_for_healthy_snapshot() {
        assert!(banner_lines(&snapshot()).is_empty());
    }
}
