use crate::errors::{CommandError, CommandErrorKind, SmonError};
use crate::logging::append_run_log;
use crate::runtime::{ProcessRequest, ProcessRunner};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs one external command per call and turns every way it can go wrong
/// into a `CommandError`.
#[derive(Clone)]
pub struct CommandGateway {
    runner: Arc<dyn ProcessRunner>,
}

impl CommandGateway {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    pub fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RawOutput, CommandError> {
        append_run_log(
            "debug",
            "command.started",
            json!({
                "program": program,
                "args": args,
                "timeout_ms": timeout.as_millis() as u64,
            }),
        );
        let started = Instant::now();
        let request = ProcessRequest {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: None,
            timeout: Some(timeout),
        };

        let output = match self.runner.run(request) {
            Ok(output) => output,
            Err(err) => {
                let err = match err {
                    SmonError::Command(err) => err,
                    other => CommandError::new(CommandErrorKind::Io, program, other.to_string()),
                };
                let event = if err.kind == CommandErrorKind::Timeout {
                    "command.timeout"
                } else {
                    "command.failed"
                };
                append_run_log(
                    "warn",
                    event,
                    json!({
                        "program": program,
                        "kind": err.kind.as_str(),
                        "detail": err.detail,
                    }),
                );
                return Err(err);
            }
        };

        if output.exit_code != 0 {
            let err = CommandError::non_zero_exit(program, output.exit_code, &output.stderr);
            append_run_log(
                "warn",
                "command.failed",
                json!({
                    "program": program,
                    "kind": err.kind.as_str(),
                    "exit_code": output.exit_code,
                    "detail": err.detail,
                }),
            );
            return Err(err);
        }

        append_run_log(
            "debug",
            "command.finished",
            json!({
                "program": program,
                "elapsed_ms": started.elapsed().as_millis() as u64,
                "stdout_bytes": output.stdout.len(),
            }),
        );
        Ok(RawOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
