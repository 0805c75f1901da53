use thiserror::Error;

#[derive(Debug, Error)]
pub enum SmonError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("terminal error: {0}")]
    Terminal(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandErrorKind {
    /// The executable is not installed on this host.
    NotAvailable,
    Timeout,
    NonZeroExit,
    PermissionDenied,
    NotFound,
    Io,
}

impl CommandErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAvailable => "not available",
            Self::Timeout => "timeout",
            Self::NonZeroExit => "non-zero exit",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::Io => "io",
        }
    }

    /// Whether a refresh should keep polling after this failure.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::NonZeroExit | Self::Io)
    }
}

impl std::fmt::Display for CommandErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{program}: {kind}: {detail}")]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub program: String,
    pub detail: String,
    pub exit_code: Option<i32>,
}

impl CommandError {
    pub fn new(kind: CommandErrorKind, program: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            program: program.into(),
            detail: detail.into(),
            exit_code: None,
        }
    }

    pub fn non_zero_exit(program: impl Into<String>, exit_code: i32, stderr: &str) -> Self {
        let detail = if stderr.trim().is_empty() {
            format!("exited with status {exit_code}")
        } else {
            stderr.trim().to_string()
        };
        Self {
            kind: CommandErrorKind::NonZeroExit,
            program: program.into(),
            detail,
            exit_code: Some(exit_code),
        }
    }

    pub fn from_io(program: impl Into<String>, error: &std::io::Error) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::NotFound => CommandErrorKind::NotAvailable,
            std::io::ErrorKind::PermissionDenied => CommandErrorKind::PermissionDenied,
            _ => CommandErrorKind::Io,
        };
        Self::new(kind, program, error.to_string())
    }
}
