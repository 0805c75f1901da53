use crate::errors::SmonError;
use crate::runtime::FileSystem;
use crate::types::JobState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub refresh_secs: Option<u64>,
    pub user: Option<String>,
    pub partition: Option<String>,
    pub state: Option<String>,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub refresh: RefreshConfig,
    pub filters: FiltersConfig,
    pub commands: CommandsConfig,
    pub output: OutputConfig,
    pub ui: UiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub command_timeout_secs: u64,
    pub backoff_ceiling: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FiltersConfig {
    pub user: Option<String>,
    pub partition: Option<String>,
    /// Comma separated job states, e.g. `running,pending`.
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandsConfig {
    pub squeue: String,
    pub sinfo: String,
    pub scontrol: String,
    pub scancel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputConfig {
    pub tail_bytes: u64,
    pub max_lines: usize,
    pub follow_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiConfig {
    /// Persisted colour theme name. The dashboard renders one fixed palette;
    /// the value is loaded and written back untouched for front ends that
    /// offer theme switching.
    pub theme: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    pub budget_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            refresh: RefreshConfig {
                interval_secs: 5,
                min_interval_secs: 1,
                max_interval_secs: 300,
                command_timeout_secs: 10,
                backoff_ceiling: 8,
            },
            filters: FiltersConfig::default(),
            commands: CommandsConfig::default(),
            output: OutputConfig {
                tail_bytes: 64 * 1024,
                max_lines: 1000,
                follow_interval_secs: 2,
            },
            ui: UiConfig {
                theme: "dark".to_string(),
            },
            logging: LoggingConfig {
                path: None,
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            squeue: "squeue".to_string(),
            sinfo: "sinfo".to_string(),
            scontrol: "scontrol".to_string(),
            scancel: "scancel".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    refresh: Option<PartialRefreshConfig>,
    filters: Option<FiltersConfig>,
    commands: Option<PartialCommandsConfig>,
    output: Option<PartialOutputConfig>,
    ui: Option<PartialUiConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRefreshConfig {
    interval_secs: Option<u64>,
    min_interval_secs: Option<u64>,
    max_interval_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    backoff_ceiling: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialCommandsConfig {
    squeue: Option<String>,
    sinfo: Option<String>,
    scontrol: Option<String>,
    scancel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialOutputConfig {
    tail_bytes: Option<u64>,
    max_lines: Option<usize>,
    follow_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialUiConfig {
    theme: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    budget_bytes: Option<u64>,
}

pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .map(|dir| dir.join("smon").join("config.toml"))
}

/// Defaults, then the config file, then CLI flags. An explicit
/// `--config` must exist; the default location is optional.
pub fn load_config(overrides: &CliOverrides, fs: &dyn FileSystem) -> Result<AppConfig, SmonError> {
    let mut cfg = AppConfig::default();

    let path = match &overrides.config_path {
        Some(path) => Some(path.clone()),
        None => default_config_path().filter(|path| fs.exists(path)),
    };
    if let Some(path) = path {
        let file_contents = fs.read_to_string(&path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| SmonError::ConfigParse(format!("{}: {e}", path.display())))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    cfg.refresh.interval_secs = cfg
        .refresh
        .interval_secs
        .clamp(cfg.refresh.min_interval_secs, cfg.refresh.max_interval_secs);
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(refresh) = partial.refresh {
        if let Some(value) = refresh.interval_secs {
            cfg.refresh.interval_secs = value;
        }
        if let Some(value) = refresh.min_interval_secs {
            cfg.refresh.min_interval_secs = value;
        }
        if let Some(value) = refresh.max_interval_secs {
            cfg.refresh.max_interval_secs = value;
        }
        if let Some(value) = refresh.command_timeout_secs {
            cfg.refresh.command_timeout_secs = value;
        }
        if let Some(value) = refresh.backoff_ceiling {
            cfg.refresh.backoff_ceiling = value;
        }
    }

    if let Some(filters) = partial.filters {
        cfg.filters = filters;
    }

    if let Some(commands) = partial.commands {
        if let Some(value) = commands.squeue {
            cfg.commands.squeue = value;
        }
        if let Some(value) = commands.sinfo {
            cfg.commands.sinfo = value;
        }
        if let Some(value) = commands.scontrol {
            cfg.commands.scontrol = value;
        }
        if let Some(value) = commands.scancel {
            cfg.commands.scancel = value;
        }
    }

    if let Some(output) = partial.output {
        if let Some(value) = output.tail_bytes {
            cfg.output.tail_bytes = value;
        }
        if let Some(value) = output.max_lines {
            cfg.output.max_lines = value;
        }
        if let Some(value) = output.follow_interval_secs {
            cfg.output.follow_interval_secs = value;
        }
    }

    if let Some(ui) = partial.ui {
        if let Some(theme) = ui.theme {
            cfg.ui.theme = theme;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.path {
            cfg.logging.path = Some(path);
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(secs) = overrides.refresh_secs {
        cfg.refresh.interval_secs = secs;
    }
    if let Some(user) = &overrides.user {
        cfg.filters.user = Some(user.clone());
    }
    if let Some(partition) = &overrides.partition {
        cfg.filters.partition = Some(partition.clone());
    }
    if let Some(state) = &overrides.state {
        cfg.filters.state = Some(state.clone());
    }
    if let Some(path) = &overrides.log_file {
        cfg.logging.path = Some(path.clone());
    }
}

/// Parses a comma separated state list; empty means all states.
pub fn parse_state_list(value: &str) -> Result<Vec<JobState>, SmonError> {
    let mut states = Vec::new();
    for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if token.eq_ignore_ascii_case("all") {
            return Ok(Vec::new());
        }
        let state = JobState::parse_cli(token)
            .ok_or_else(|| SmonError::InvalidConfig(format!("unknown job state `{token}`")))?;
        if !states.contains(&state) {
            states.push(state);
        }
    }
    Ok(states)
}

fn validate_config(cfg: &AppConfig) -> Result<(), SmonError> {
    let refresh = &cfg.refresh;
    if refresh.min_interval_secs == 0 {
        return Err(SmonError::InvalidConfig(
            "refresh.min_interval_secs must be greater than zero".to_string(),
        ));
    }
    if refresh.min_interval_secs > refresh.max_interval_secs {
        return Err(SmonError::InvalidConfig(
            "refresh.min_interval_secs must not exceed refresh.max_interval_secs".to_string(),
        ));
    }
    if refresh.command_timeout_secs == 0 {
        return Err(SmonError::InvalidConfig(
            "refresh.command_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if refresh.backoff_ceiling == 0 {
        return Err(SmonError::InvalidConfig(
            "refresh.backoff_ceiling must be at least 1".to_string(),
        ));
    }
    if cfg.output.tail_bytes == 0 || cfg.output.max_lines == 0 {
        return Err(SmonError::InvalidConfig(
            "output.tail_bytes and output.max_lines must be greater than zero".to_string(),
        ));
    }
    if cfg.output.follow_interval_secs == 0 {
        return Err(SmonError::InvalidConfig(
            "output.follow_interval_secs must be greater than zero".to_string(),
        ));
    }
    for (key, program) in [
        ("squeue", &cfg.commands.squeue),
        ("sinfo", &cfg.commands.sinfo),
        ("scontrol", &cfg.commands.scontrol),
        ("scancel", &cfg.commands.scancel),
    ] {
        if program.trim().is_empty() {
            return Err(SmonError::InvalidConfig(format!(
                "commands.{key} must not be empty"
            )));
        }
    }
    if let Some(state) = &cfg.filters.state {
        parse_state_list(state)?;
    }
    Ok(())
}

/// Writes the live refresh interval and filters back into the config file,
/// keeping every other key the user wrote.
pub fn persist_settings(
    fs: &dyn FileSystem,
    path: &Path,
    interval_secs: u64,
    filters: &FiltersConfig,
) -> Result<(), SmonError> {
    let mut value: toml::Value = if fs.exists(path) {
        let existing = fs.read_to_string(path)?;
        toml::from_str(&existing).map_err(|e| SmonError::ConfigParse(e.to_string()))?
    } else {
        toml::Value::Table(Default::default())
    };

    let table = value
        .as_table_mut()
        .ok_or_else(|| SmonError::ConfigParse("config root must be table".to_string()))?;

    let refresh = table
        .entry("refresh")
        .or_insert_with(|| toml::Value::Table(Default::default()))
        .as_table_mut()
        .ok_or_else(|| SmonError::ConfigParse("refresh table invalid".to_string()))?;
    refresh.insert(
        "interval_secs".to_string(),
        toml::Value::Integer(i64::try_from(interval_secs).unwrap_or(i64::MAX)),
    );

    let filter_table = table
        .entry("filters")
        .or_insert_with(|| toml::Value::Table(Default::default()))
        .as_table_mut()
        .ok_or_else(|| SmonError::ConfigParse("filters table invalid".to_string()))?;
    for (key, value) in [
        ("user", &filters.user),
        ("partition", &filters.partition),
        ("state", &filters.state),
    ] {
        match value {
            Some(value) => {
                filter_table.insert(key.to_string(), toml::Value::String(value.clone()));
            }
            None => {
                filter_table.remove(key);
            }
        }
    }

    if let Some(parent) = path.parent() {
        fs.create_dir_all(parent)?;
    }
    let output =
        toml::to_string_pretty(&value).map_err(|e| SmonError::ConfigParse(e.to_string()))?;
    fs.write_string(path, &output)
}
