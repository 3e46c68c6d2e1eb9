use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::diagnosis::diagnose_timeout;
use super::{Tool, ToolContext, ToolOutcome};
use crate::cancel::CancelFlag;
use crate::error::ErrorCategory;

const MAX_STREAM_BYTES: usize = 200 * 1024;

pub struct RunResult {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Run a shell command with a hard deadline. On timeout the child is killed
/// but whatever it printed so far is preserved; diagnosis depends on it.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    cancel: &CancelFlag,
) -> Result<RunResult> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn `{command}`: {e}"))?;

    let stdout_pipe = child.stdout.take().expect("stdout piped");
    let stderr_pipe = child.stderr.take().expect("stderr piped");
    let mut stdout_lines = BufReader::new(stdout_pipe).lines();
    let mut stderr_lines = BufReader::new(stderr_pipe).lines();

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut timed_out = false;
    let mut cancelled = false;

    let deadline = tokio::time::Instant::now() + timeout;

    while !stdout_done || !stderr_done {
        tokio::select! {
            biased;
            result = stdout_lines.next_line(), if !stdout_done => {
                match result {
                    Ok(Some(line)) => append_line(&mut stdout, &line),
                    _ => stdout_done = true,
                }
            }
            result = stderr_lines.next_line(), if !stderr_done => {
                match result {
                    Ok(Some(line)) => append_line(&mut stderr, &line),
                    _ => stderr_done = true,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                let _ = child.kill().await;
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if cancel.is_cancelled() {
                    cancelled = true;
                    let _ = child.kill().await;
                    break;
                }
            }
        }
    }

    let rc = if timed_out || cancelled {
        -1
    } else {
        child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1)
    };

    Ok(RunResult {
        rc,
        stdout,
        stderr,
        timed_out,
        cancelled,
    })
}

fn append_line(buffer: &mut String, line: &str) {
    if buffer.len() >= MAX_STREAM_BYTES {
        return;
    }
    if !buffer.is_empty() {
        buffer.push('\n');
    }
    buffer.push_str(line);
}

fn outcome_from(command: &str, result: RunResult) -> ToolOutcome {
    if result.cancelled {
        return ToolOutcome {
            rc: -1,
            stdout: result.stdout,
            stderr: result.stderr,
            data: json!({ "cancelled": true }),
            diagnosis: None,
            category: Some(ErrorCategory::Cancelled),
        };
    }
    if result.timed_out {
        let combined = format!("{}\n{}", result.stdout, result.stderr);
        let diagnosis = diagnose_timeout(command, &combined);
        return ToolOutcome {
            rc: -1,
            // Partial output MUST survive the kill; replanning reads it.
            stdout: result.stdout,
            stderr: result.stderr,
            data: json!({ "timed_out": true, "timeout_diagnosis": diagnosis.clone() }),
            diagnosis: Some(diagnosis),
            category: Some(ErrorCategory::TimeoutExceeded),
        };
    }
    ToolOutcome {
        rc: result.rc,
        stdout: result.stdout,
        stderr: result.stderr,
        data: json!({ "exit_code": result.rc }),
        diagnosis: None,
        category: None,
    }
}

// ---------------------------------------------------------------------------
// run_cmd
// ---------------------------------------------------------------------------

pub struct RunCmdTool;

#[async_trait]
impl Tool for RunCmdTool {
    fn name(&self) -> &str {
        "run_cmd"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace root and return stdout, stderr, and the \
         exit code. Killed after the timeout, preserving partial output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to execute" },
                "timeout": { "type": "integer", "description": "Timeout in seconds (defaults to the configured run_cmd timeout)" }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: command"))?;
        let timeout_secs = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(ctx.run_cmd_timeout_secs);

        let result = run_shell(
            command,
            &ctx.workspace_root,
            Duration::from_secs(timeout_secs),
            &ctx.cancel,
        )
        .await?;
        Ok(outcome_from(command, result))
    }
}

// ---------------------------------------------------------------------------
// run_tests
// ---------------------------------------------------------------------------

pub struct RunTestsTool;

#[async_trait]
impl Tool for RunTestsTool {
    fn name(&self) -> &str {
        "run_tests"
    }

    fn description(&self) -> &str {
        "Run the project's test command and return stdout, stderr, and the exit code. \
         Uses the longer test timeout; killed after it, preserving partial output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Test command to execute (e.g. `npm test`, `cargo test`)" }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: command"))?;

        let result = run_shell(
            command,
            &ctx.workspace_root,
            Duration::from_secs(ctx.run_tests_timeout_secs),
            &ctx.cancel,
        )
        .await?;
        Ok(outcome_from(command, result))
    }
}
