use crate::types::{JobState, NodeState};
use ratatui::style::Color;

pub const WARNING_RATIO: f64 = 0.80;
pub const CRITICAL_RATIO: f64 = 0.95;

const FILLED: char = '█';
const EMPTY: char = '░';
const NEUTRAL: char = '·';

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeRatio {
    Ratio(f64),
    Unlimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    Normal,
    Warning,
    Critical,
}

/// Renders exactly `width` cells. A node or job without GPUs gets a
/// neutral bar rather than an empty one.
pub fn gpu_bar(alloc: u32, total: u32, width: usize) -> String {
    if total == 0 {
        return std::iter::repeat(NEUTRAL).take(width).collect();
    }
    let alloc = alloc.min(total) as u64;
    let filled = ((alloc * width as u64 + total as u64 / 2) / total as u64) as usize;
    let filled = filled.min(width);
    std::iter::repeat(FILLED)
        .take(filled)
        .chain(std::iter::repeat(EMPTY).take(width - filled))
        .collect()
}

pub fn time_ratio(used: u64, limit: Option<u64>) -> TimeRatio {
    match limit {
        None | Some(0) => TimeRatio::Unlimited,
        Some(limit) => TimeRatio::Ratio(used as f64 / limit as f64),
    }
}

pub fn classify(ratio: TimeRatio) -> Urgency {
    match ratio {
        TimeRatio::Unlimited => Urgency::Normal,
        TimeRatio::Ratio(r) if r >= CRITICAL_RATIO => Urgency::Critical,
        TimeRatio::Ratio(r) if r >= WARNING_RATIO => Urgency::Warning,
        TimeRatio::Ratio(_) => Urgency::Normal,
    }
}

pub fn job_state_color(state: JobState) -> Color {
    match state {
        JobState::Running => Color::Green,
        JobState::Pending => Color::Yellow,
        JobState::Completed => Color::Blue,
        JobState::Failed => Color::Red,
        JobState::Cancelled => Color::Magenta,
        JobState::Other => Color::Gray,
    }
}

pub fn node_state_color(state: NodeState) -> Color {
    match state {
        NodeState::Idle => Color::Green,
        NodeState::Mixed => Color::Yellow,
        NodeState::Alloc => Color::Cyan,
        NodeState::Drain => Color::Magenta,
        NodeState::Down => Color::Red,
        NodeState::Other => Color::Gray,
    }
}

pub fn urgency_color(urgency: Urgency) -> Color {
    match urgency {
        Urgency::Normal => Color::Reset,
        Urgency::Warning => Color::Yellow,
        Urgency::Critical => Color::Red,
    }
}

/// Slurm-style elapsed time: `MM:SS`, `HH:MM:SS` or `D-HH:MM:SS`.
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        format!("{days}-{hours:02}:{minutes:02}:{secs:02}")
    } else if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

pub fn format_limit(limit: Option<u64>) -> String {
    limit.map_or_else(|| "UNLIMITED".to_string(), format_duration)
}

pub fn format_memory_mb(mb: u64) -> String {
    if mb >= 1024 * 1024 {
        format!("{:.1}T", mb as f64 / (1024.0 * 1024.0))
    } else if mb >= 1024 {
        format!("{:.1}G", mb as f64 / 1024.0)
    } else {
        format!("{mb}M")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_bar_is_always_width_cells() {
        for width in [0usize, 1, 5, 10] {
            for (alloc, total) in [(0, 0), (0, 8), (3, 8), (8, 8), (9, 8)] {
                assert_eq!(gpu_bar(alloc, total, width).chars().count(), width);
            }
        }
        assert_eq!(gpu_bar(2, 8, 8), "██░░░░░░");
        assert_eq!(gpu_bar(0, 0, 4), "····");
    }

    #[test]
    fn over_limit_ratio_is_not_clamped() {
        assert_eq!(time_ratio(110, Some(100)), TimeRatio::Ratio(1.1));
        assert_eq!(time_ratio(5, None), TimeRatio::Unlimited);
        assert_eq!(time_ratio(5, Some(0)), TimeRatio::Unlimited);
    }

    #[test]
    fn durations_render_in_slurm_style() {
        assert_eq!(format_duration(65), "01:05");
        assert_eq!(format_duration(3_600), "01:00:00");
        assert_eq!(format_duration(90_061), "1-01:01:01");
        assert_eq!(format_limit(None), "UNLIMITED");
        assert_eq!(format_memory_mb(2048), "2.0G");
        assert_eq!(format_memory_mb(512), "512M");
    }

    #[test]
    fn other_states_are_neutral() {
        assert_eq!(job_state_color(JobState::Other), Color::Gray);
        assert_eq!(node_state_color(NodeState::Other), Color::Gray);
        assert_eq!(urgency_color(Urgency::Critical), Color::Red);
    }
}
