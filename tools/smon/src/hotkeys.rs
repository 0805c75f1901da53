use crate::app::{Action, InputMode, Step};

/// Terminal-independent key, translated from crossterm in the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Up,
    Down,
    Home,
    End,
    Enter,
    Esc,
    Backspace,
    Tab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotkeyBinding {
    pub key: &'static str,
    pub action: &'static str,
}

pub const DASHBOARD_BINDINGS: [HotkeyBinding; 10] = [
    HotkeyBinding {
        key: "q",
        action: "quit",
    },
    HotkeyBinding {
        key: "j/k",
        action: "move",
    },
    HotkeyBinding {
        key: "enter",
        action: "detail",
    },
    HotkeyBinding {
        key: "/",
        action: "search",
    },
    HotkeyBinding {
        key: "s",
        action: "sort",
    },
    HotkeyBinding {
        key: "S",
        action: "reverse",
    },
    HotkeyBinding {
        key: "n",
        action: "jobs/nodes",
    },
    HotkeyBinding {
        key: "r",
        action: "refresh",
    },
    HotkeyBinding {
        key: "x",
        action: "cancel",
    },
    HotkeyBinding {
        key: "+/-",
        action: "interval",
    },
];

pub const DETAIL_BINDINGS: [HotkeyBinding; 3] = [
    HotkeyBinding {
        key: "tab",
        action: "script/stdout/stderr",
    },
    HotkeyBinding {
        key: "f",
        action: "follow",
    },
    HotkeyBinding {
        key: "esc",
        action: "close",
    },
];

pub const SEARCH_BINDINGS: [HotkeyBinding; 2] = [
    HotkeyBinding {
        key: "enter",
        action: "keep",
    },
    HotkeyBinding {
        key: "esc",
        action: "clear",
    },
];

pub fn controls_legend(input: InputMode, detail_open: bool) -> String {
    match input {
        InputMode::Search => format_bindings("Search: ", &SEARCH_BINDINGS),
        InputMode::Normal if detail_open => {
            let mut bindings = DASHBOARD_BINDINGS.to_vec();
            bindings.extend(DETAIL_BINDINGS);
            format_bindings("Keys: ", &bindings)
        }
        InputMode::Normal => format_bindings("Keys: ", &DASHBOARD_BINDINGS),
    }
}

pub fn action_for_key(key: Key, input: InputMode) -> Option<Action> {
    if input == InputMode::Search {
        return match key {
            Key::Char(c) => Some(Action::SearchInput(c)),
            Key::Backspace => Some(Action::SearchBackspace),
            Key::Enter => Some(Action::SearchCommit),
            Key::Esc => Some(Action::SearchCancel),
            _ => None,
        };
    }
    match key {
        Key::Char('q') => Some(Action::Quit),
        Key::Char('j') | Key::Down => Some(Action::Move(Step::Next)),
        Key::Char('k') | Key::Up => Some(Action::Move(Step::Prev)),
        Key::Char('g') | Key::Home => Some(Action::Move(Step::First)),
        Key::Char('G') | Key::End => Some(Action::Move(Step::Last)),
        Key::Enter => Some(Action::OpenDetail),
        Key::Esc => Some(Action::Back),
        Key::Tab => Some(Action::NextDetailTab),
        Key::Char('f') => Some(Action::ToggleFollow),
        Key::Char('/') => Some(Action::StartSearch),
        Key::Char('s') => Some(Action::CycleSort),
        Key::Char('S') => Some(Action::ReverseSort),
        Key::Char('n') => Some(Action::ToggleView),
        Key::Char('r') => Some(Action::Refresh),
        Key::Char('x') => Some(Action::CancelSelected),
        Key::Char('+') | Key::Char('=') => Some(Action::IntervalUp),
        Key::Char('-') => Some(Action::IntervalDown),
        Key::Char('w') => Some(Action::SaveSettings),
        _ => None,
    }
}

fn format_bindings(prefix: &str, bindings: &[HotkeyBinding]) -> String {
    let parts = bindings
        .iter()
        .map(|binding| format!("{} {}", binding.key, binding.action))
        .collect::<Vec<_>>();
    format!("{prefix}{}", parts.join("  "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_mode_keys_map_to_actions() {
        assert!(matches!(action_for_key(Key::Char('q'), InputMode::Normal), Some(Action::Quit)));
        assert!(matches!(
            action_for_key(Key::Down, InputMode::Normal),
            Some(Action::Move(Step::Next))
        ));
        assert!(matches!(
            action_for_key(Key::Char('x'), InputMode::Normal),
            Some(Action::CancelSelected)
        ));
        assert!(action_for_key(Key::Char('z'), InputMode::Normal).is_none());
    }

    #[test]
    fn search_mode_captures_printable_keys() {
        assert!(matches!(
            action_for_key(Key::Char('q'), InputMode::Search),
            Some(Action::SearchInput('q'))
        ));
        assert!(matches!(
            action_for_key(Key::Esc, InputMode::Search),
            Some(Action::SearchCancel)
        ));
        assert!(action_for_key(Key::Tab, InputMode::Search).is_none());
    }

    #[test]
    fn legend_lists_detail_keys_only_when_open() {
        let closed = controls_legend(InputMode::Normal, false);
        let open = controls_legend(InputMode::Normal, true);
        assert!(closed.starts_with("Keys: q quit"));
        assert!(!closed.contains("follow"));
        assert!(open.contains("f follow"));
        assert!(controls_legend(InputMode::Search, false).contains("esc clear"));
    }
}
