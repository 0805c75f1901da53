use serde::{Deserialize, Serialize};

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Other,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Other,
    ];

    /// Maps a well-formed squeue state token (long or compact form).
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "PENDING" | "PD" => Self::Pending,
            "RUNNING" | "R" => Self::Running,
            "COMPLETED" | "CD" => Self::Completed,
            "FAILED" | "F" => Self::Failed,
            "CANCELLED" | "CA" => Self::Cancelled,
            _ => Self::Other,
        }
    }

    pub fn parse_cli(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "pd" => Some(Self::Pending),
            "running" | "r" => Some(Self::Running),
            "completed" | "cd" => Some(Self::Completed),
            "failed" | "f" => Some(Self::Failed),
            "cancelled" | "canceled" | "ca" => Some(Self::Cancelled),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Other => "OTHER",
        }
    }

    /// States whose output files may still grow.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Idle,
    Alloc,
    Mixed,
    Down,
    Drain,
    Other,
}

impl NodeState {
    /// Maps a sinfo state token, ignoring trailing flag characters such as
    /// `idle*` (not responding) or `mix-` (powering down).
    pub fn from_token(token: &str) -> Self {
        let base = token
            .trim_end_matches(['*', '~', '#', '!', '%', '$', '@', '^', '-', '+'])
            .to_ascii_lowercase();
        match base.as_str() {
            "idle" => Self::Idle,
            "alloc" | "allocated" => Self::Alloc,
            "mix" | "mixed" => Self::Mixed,
            "down" => Self::Down,
            "drain" | "drained" | "draining" | "drng" => Self::Drain,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Alloc => "ALLOC",
            Self::Mixed => "MIXED",
            Self::Down => "DOWN",
            Self::Drain => "DRAIN",
            Self::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub user: String,
    pub state: JobState,
    pub partition: String,
    /// Node tokens as printed; bracketed ranges stay unexpanded.
    pub node_list: Vec<String>,
    /// Why a job holds no nodes, e.g. `Priority` or `Resources`.
    pub reason: Option<String>,
    pub time_used: u64,
    /// `None` means unlimited or unknown.
    pub time_limit: Option<u64>,
    pub gpu_alloc: u32,
    pub gpu_total: u32,
    pub cpu_alloc: u32,
    pub mem_alloc_mb: u64,
    pub name: String,
    pub command: Option<String>,
    pub script_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub state: NodeState,
    pub partitions: Vec<String>,
    pub gpu_alloc: u32,
    pub gpu_total: u32,
    pub cpu_alloc: u32,
    pub cpu_total: u32,
    pub mem_alloc_mb: u64,
    pub mem_total_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Jobs,
    Nodes,
}

impl DataSource {
    pub const ALL: [DataSource; 2] = [Self::Jobs, Self::Nodes];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Nodes => "nodes",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{JobState, NodeState};

    #[test]
    fn job_tokens_accept_long_and_compact_forms() {
        assert_eq!(JobState::from_token("RUNNING"), JobState::Running);
        assert_eq!(JobState::from_token("PD"), JobState::Pending);
        assert_eq!(JobState::from_token("CA"), JobState::Cancelled);
        assert_eq!(JobState::from_token("TIMEOUT"), JobState::Other);
        assert_eq!(JobState::from_token("NODE_FAIL"), JobState::Other);
    }

    #[test]
    fn node_tokens_strip_flag_suffixes() {
        assert_eq!(NodeState::from_token("idle*"), NodeState::Idle);
        assert_eq!(NodeState::from_token("mixed-"), NodeState::Mixed);
        assert_eq!(NodeState::from_token("draining"), NodeState::Drain);
        assert_eq!(NodeState::from_token("allocated+"), NodeState::Alloc);
        assert_eq!(NodeState::from_token("planned"), NodeState::Other);
    }

    #[test]
    fn cli_state_names_are_case_insensitive() {
        assert_eq!(JobState::parse_cli("Running"), Some(JobState::Running));
        assert_eq!(JobState::parse_cli("canceled"), Some(JobState::Cancelled));
        assert_eq!(JobState::parse_cli("bogus"), None);
        assert!(JobState::Pending.is_active());
        assert!(!JobState::Failed.is_active());
    }
}
