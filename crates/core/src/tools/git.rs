use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::subprocess::run_shell;
use super::{Tool, ToolContext, ToolOutcome};

const GIT_TIMEOUT: Duration = Duration::from_secs(30);

async fn run_git(ctx: &ToolContext, args: &str) -> Result<ToolOutcome> {
    let result = run_shell(
        &format!("git {args}"),
        &ctx.workspace_root,
        GIT_TIMEOUT,
        &ctx.cancel,
    )
    .await?;
    Ok(ToolOutcome {
        rc: result.rc,
        stdout: result.stdout,
        stderr: result.stderr,
        data: json!({ "exit_code": result.rc }),
        diagnosis: None,
        category: None,
    })
}

pub struct GitStatusTool;

#[async_trait]
impl Tool for GitStatusTool {
    fn name(&self) -> &str {
        "git_status"
    }

    fn description(&self) -> &str {
        "Show the working tree status (porcelain format)."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn execute(&self, _args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        run_git(ctx, "status --porcelain=v1 --branch").await
    }
}

pub struct GitDiffTool;

#[async_trait]
impl Tool for GitDiffTool {
    fn name(&self) -> &str {
        "git_diff"
    }

    fn description(&self) -> &str {
        "Show unstaged changes as a unified diff, optionally limited to one path."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Limit the diff to this path" }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        match args.get("path").and_then(|v| v.as_str()) {
            Some(raw) => {
                let resolved = match ctx.resolve(raw) {
                    Ok(_) => raw,
                    Err(c) => return Ok(ToolOutcome::fail(1, format!("{raw}: {c}"), c)),
                };
                run_git(ctx, &format!("diff -- {resolved}")).await
            }
            None => run_git(ctx, "diff").await,
        }
    }
}

pub struct GitCommitTool;

#[async_trait]
impl Tool for GitCommitTool {
    fn name(&self) -> &str {
        "git_commit"
    }

    fn description(&self) -> &str {
        "Stage all changes and create a commit with the given message."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string", "description": "Commit message" }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: message"))?;
        let escaped = message.replace('\'', "'\\''");
        run_git(ctx, &format!("add -A && git commit -m '{escaped}'")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &tempfile::TempDir) {
        let ctx = ToolContext::new(dir.path().to_path_buf());
        for cmd in [
            "init -q",
            "config user.email t@t.local",
            "config user.name t",
        ] {
            run_git(&ctx, cmd).await.unwrap();
        }
    }

    #[tokio::test]
    async fn status_reports_untracked_files() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(&dir).await;
        std::fs::write(dir.path().join("new.txt"), "x").unwrap();

        let ctx = ToolContext::new(dir.path().to_path_buf());
        let outcome = GitStatusTool.execute(json!({}), &ctx).await.unwrap();
        assert_eq!(outcome.rc, 0);
        assert!(outcome.stdout.contains("new.txt"));
    }

    #[tokio::test]
    async fn commit_then_clean_status() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(&dir).await;
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();

        let ctx = ToolContext::new(dir.path().to_path_buf());
        let outcome = GitCommitTool
            .execute(json!({"message": "add a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.rc, 0, "stderr: {}", outcome.stderr);

        let status = GitStatusTool.execute(json!({}), &ctx).await.unwrap();
        assert!(!status.stdout.contains("a.txt"));
    }
}
