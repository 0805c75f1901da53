use crate::config::CommandsConfig;
use crate::errors::CommandError;
use crate::gateway::{CommandGateway, RawOutput};
use crate::types::DataSource;
use std::time::Duration;

/// squeue `-O` layout matching `parser::parse_jobs`. Both GPU columns read
/// `tres-alloc`: the job's GPUs across all nodes, which squeue reports as the
/// request while the job is pending. `ReasonList` prints `(Reason)` in place
/// of the node list for jobs holding no nodes.
pub const SQUEUE_FORMAT: &str = "JobID:|,UserName:|,State:|,Partition:|,ReasonList:|,\
TimeUsed:|,TimeLimit:|,tres-alloc:|,tres-alloc:|,NumCPUs:|,MinMemory:|,Name:|,Command:|";

/// sinfo `-O` layout matching `parser::parse_nodes`; every column carries a
/// `|` suffix, so lines end with one.
pub const SINFO_FORMAT: &str =
    "NodeList:|,Partition:|,StateLong:|,GresUsed:|,Gres:|,CPUsState:|,CPUs:|,AllocMem:|,Memory:|";

#[derive(Clone)]
pub struct SlurmSource {
    gateway: CommandGateway,
    commands: CommandsConfig,
    timeout: Duration,
}

impl SlurmSource {
    pub fn new(gateway: CommandGateway, commands: CommandsConfig, timeout: Duration) -> Self {
        Self {
            gateway,
            commands,
            timeout,
        }
    }

    pub fn program(&self, source: DataSource) -> &str {
        match source {
            DataSource::Jobs => &self.commands.squeue,
            DataSource::Nodes => &self.commands.sinfo,
        }
    }

    pub fn listing_args(source: DataSource) -> Vec<String> {
        let args: &[&str] = match source {
            DataSource::Jobs => &["-h", "--states=all", "-O", SQUEUE_FORMAT],
            DataSource::Nodes => &["-N", "-h", "-O", SINFO_FORMAT],
        };
        args.iter().map(|arg| arg.to_string()).collect()
    }

    /// Raw listing text for one data source.
    pub fn fetch(&self, source: DataSource) -> Result<String, CommandError> {
        self.gateway
            .run(self.program(source), &Self::listing_args(source), self.timeout)
            .map(|out| out.stdout)
    }

    /// One-line `key=value` record from `scontrol show job -o`.
    pub fn show_job(&self, job_id: &str) -> Result<String, CommandError> {
        let args = ["show", "job", "-o", job_id].map(str::to_string);
        self.gateway
            .run(&self.commands.scontrol, &args, self.timeout)
            .map(|out| out.stdout)
    }

    pub fn batch_script(&self, job_id: &str) -> Result<String, CommandError> {
        let args = ["write", "batch_script", job_id, "-"].map(str::to_string);
        self.gateway
            .run(&self.commands.scontrol, &args, self.timeout)
            .map(|out| out.stdout)
    }

    pub fn cancel(&self, job_id: &str) -> Result<RawOutput, CommandError> {
        self.gateway
            .run(&self.commands.scancel, &[job_id.to_string()], self.timeout)
    }
}
