use crate::config::{parse_state_list, FiltersConfig};
use crate::errors::SmonError;
use crate::metrics::{time_ratio, TimeRatio};
use crate::snapshot::Snapshot;
use crate::types::{Job, JobState, Node, NodeState};
use std::cmp::Ordering;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub user: Option<String>,
    pub partition: Option<String>,
    /// Empty means every state.
    pub states: Vec<JobState>,
    pub text: Option<String>,
}

impl JobFilter {
    pub fn from_config(filters: &FiltersConfig) -> Result<Self, SmonError> {
        Ok(Self {
            user: filters.user.clone(),
            partition: filters.partition.clone(),
            states: match &filters.state {
                Some(state) => parse_state_list(state)?,
                None => Vec::new(),
            },
            text: None,
        })
    }

    pub fn to_config(&self) -> FiltersConfig {
        FiltersConfig {
            user: self.user.clone(),
            partition: self.partition.clone(),
            state: (!self.states.is_empty()).then(|| {
                self.states
                    .iter()
                    .map(|s| s.as_str().to_ascii_lowercase())
                    .collect::<Vec<_>>()
                    .join(",")
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.partition.is_none() && self.states.is_empty() && self.text.is_none()
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(user) = &self.user {
            if !contains_ci(&job.user, user) {
                return false;
            }
        }
        if let Some(partition) = &self.partition {
            if !contains_ci(&job.partition, partition) {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&job.state) {
            return false;
        }
        match &self.text {
            Some(text) => {
                contains_ci(&job.job_id, text)
                    || contains_ci(&job.user, text)
                    || contains_ci(job.state.as_str(), text)
                    || contains_ci(&job.partition, text)
                    || contains_ci(&job.name, text)
                    || job.node_list.iter().any(|node| contains_ci(node, text))
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    pub partition: Option<String>,
    pub states: Vec<NodeState>,
    pub text: Option<String>,
}

impl NodeFilter {
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(partition) = &self.partition {
            if !node.partitions.iter().any(|p| contains_ci(p, partition)) {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&node.state) {
            return false;
        }
        match &self.text {
            Some(text) => {
                contains_ci(&node.name, text)
                    || contains_ci(node.state.as_str(), text)
                    || node.partitions.iter().any(|p| contains_ci(p, text))
            }
            None => true,
        }
    }
}

/// Case-insensitive substring match; an empty needle matches everything.
fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn flipped(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Self::Ascending => ordering,
            Self::Descending => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortState<K> {
    pub key: K,
    pub direction: SortDirection,
}

impl<K: Copy + PartialEq> SortState<K> {
    pub fn new(key: K) -> Self {
        Self {
            key,
            direction: SortDirection::Ascending,
        }
    }

    /// Same key toggles direction; a new key starts ascending.
    pub fn select(&mut self, key: K) {
        if self.key == key {
            self.direction = self.direction.flipped();
        } else {
            self.key = key;
            self.direction = SortDirection::Ascending;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSortKey {
    JobId,
    User,
    State,
    Partition,
    Name,
    TimeUsed,
    TimeLimit,
    /// Elapsed over limit; unlimited jobs sort lowest.
    TimeRatio,
    Gpus,
}

impl JobSortKey {
    pub const ALL: [JobSortKey; 9] = [
        Self::JobId,
        Self::User,
        Self::State,
        Self::Partition,
        Self::Name,
        Self::TimeUsed,
        Self::TimeLimit,
        Self::TimeRatio,
        Self::Gpus,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::JobId => "id",
            Self::User => "user",
            Self::State => "state",
            Self::Partition => "partition",
            Self::Name => "name",
            Self::TimeUsed => "time",
            Self::TimeLimit => "limit",
            Self::TimeRatio => "usage",
            Self::Gpus => "gpus",
        }
    }

    pub fn next(self) -> Self {
        let idx = Self::ALL.iter().position(|k| *k == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl Default for SortState<JobSortKey> {
    fn default() -> Self {
        Self::new(JobSortKey::JobId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSortKey {
    Name,
    State,
    GpusFree,
    CpuLoad,
}

impl NodeSortKey {
    pub const ALL: [NodeSortKey; 4] = [Self::Name, Self::State, Self::GpusFree, Self::CpuLoad];

    pub fn label(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::State => "state",
            Self::GpusFree => "free gpus",
            Self::CpuLoad => "cpu load",
        }
    }

    pub fn next(self) -> Self {
        let idx = Self::ALL.iter().position(|k| *k == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl Default for SortState<NodeSortKey> {
    fn default() -> Self {
        Self::new(NodeSortKey::Name)
    }
}

/// Natural ordering over digit and non-digit runs, so
/// `9 < 10 < 10_1 < 10_2 < 10_10 < 11`. Digit runs sort before text. Ids
/// that differ only in leading zeros fall back to byte order, so only
/// identical ids compare equal.
pub fn compare_job_ids(a: &str, b: &str) -> Ordering {
    fn chunk(s: &str) -> (&str, &str) {
        let digit = s.starts_with(|c: char| c.is_ascii_digit());
        let end = s
            .find(|c: char| c.is_ascii_digit() != digit)
            .unwrap_or(s.len());
        s.split_at(end)
    }
    let (whole_a, whole_b) = (a, b);
    let (mut a, mut b) = (a, b);
    loop {
        match (a.is_empty(), b.is_empty()) {
            (true, true) => return whole_a.cmp(whole_b),
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        let (ca, ra) = chunk(a);
        let (cb, rb) = chunk(b);
        let a_digit = ca.starts_with(|c: char| c.is_ascii_digit());
        let b_digit = cb.starts_with(|c: char| c.is_ascii_digit());
        let ordering = match (a_digit, b_digit) {
            (true, true) => {
                let (ta, tb) = (ca.trim_start_matches('0'), cb.trim_start_matches('0'));
                ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb))
            }
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => ca.cmp(cb),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
        a = ra;
        b = rb;
    }
}

fn compare_limits(a: Option<u64>, b: Option<u64>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

fn compare_ratios(a: TimeRatio, b: TimeRatio) -> Ordering {
    match (a, b) {
        (TimeRatio::Unlimited, TimeRatio::Unlimited) => Ordering::Equal,
        (TimeRatio::Unlimited, TimeRatio::Ratio(_)) => Ordering::Less,
        (TimeRatio::Ratio(_), TimeRatio::Unlimited) => Ordering::Greater,
        (TimeRatio::Ratio(a), TimeRatio::Ratio(b)) => a.total_cmp(&b),
    }
}

fn compare_jobs_by(key: JobSortKey, a: &Job, b: &Job) -> Ordering {
    match key {
        JobSortKey::JobId => compare_job_ids(&a.job_id, &b.job_id),
        JobSortKey::User => a.user.cmp(&b.user),
        JobSortKey::State => a.state.cmp(&b.state),
        JobSortKey::Partition => a.partition.cmp(&b.partition),
        JobSortKey::Name => a.name.cmp(&b.name),
        JobSortKey::TimeUsed => a.time_used.cmp(&b.time_used),
        JobSortKey::TimeLimit => compare_limits(a.time_limit, b.time_limit),
        JobSortKey::TimeRatio => compare_ratios(
            time_ratio(a.time_used, a.time_limit),
            time_ratio(b.time_used, b.time_limit),
        ),
        JobSortKey::Gpus => a
            .gpu_alloc
            .cmp(&b.gpu_alloc)
            .then_with(|| a.gpu_total.cmp(&b.gpu_total)),
    }
}

/// Filtered, sorted jobs. Ties always fall back to ascending job id, in
/// both directions, so the order is total and repeatable.
pub fn job_view<'a>(
    snapshot: &'a Snapshot,
    filter: &JobFilter,
    sort: &SortState<JobSortKey>,
) -> Vec<&'a Job> {
    let mut jobs: Vec<&Job> = snapshot.jobs.iter().filter(|job| filter.matches(job)).collect();
    jobs.sort_by(|a, b| {
        sort.direction
            .apply(compare_jobs_by(sort.key, a, b))
            .then_with(|| compare_job_ids(&a.job_id, &b.job_id))
    });
    jobs
}

fn compare_nodes_by(key: NodeSortKey, a: &Node, b: &Node) -> Ordering {
    match key {
        NodeSortKey::Name => a.name.cmp(&b.name),
        NodeSortKey::State => a.state.cmp(&b.state),
        NodeSortKey::GpusFree => a
            .gpu_total
            .saturating_sub(a.gpu_alloc)
            .cmp(&b.gpu_total.saturating_sub(b.gpu_alloc)),
        NodeSortKey::CpuLoad => {
            let load = |n: &Node| {
                if n.cpu_total == 0 {
                    0.0
                } else {
                    n.cpu_alloc as f64 / n.cpu_total as f64
                }
            };
            load(a).total_cmp(&load(b))
        }
    }
}

pub fn node_view<'a>(
    snapshot: &'a Snapshot,
    filter: &NodeFilter,
    sort: &SortState<NodeSortKey>,
) -> Vec<&'a Node> {
    let mut nodes: Vec<&Node> = snapshot
        .nodes
        .iter()
        .filter(|node| filter.matches(node))
        .collect();
    nodes.sort_by(|a, b| {
        sort.direction
            .apply(compare_nodes_by(sort.key, a, b))
            .then_with(|| a.name.cmp(&b.name))
    });
    nodes
}
