use anyhow::Result;
use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use std::path::Path;

use super::{Tool, ToolContext, ToolOutcome};
use crate::error::ErrorCategory;

const SKIP_DIRS: &[&str] = &["node_modules", ".git", "target", "__pycache__", ".venv", "dist"];
const MAX_MATCHES: usize = 200;
const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Regex search over workspace files, `path:line: text` per match.
pub struct SearchCodeTool;

#[async_trait]
impl Tool for SearchCodeTool {
    fn name(&self) -> &str {
        "search_code"
    }

    fn description(&self) -> &str {
        "Search workspace files with a regular expression. Returns `path:line: text` \
         matches, capped at 200. Case-insensitive unless the pattern contains an \
         uppercase letter."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression to search for" },
                "path": { "type": "string", "description": "Directory to search under (default: workspace root)" }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let pattern = args
            .get("pattern")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: pattern"))?;

        let root = match args.get("path").and_then(|v| v.as_str()) {
            Some(raw) => match ctx.resolve(raw) {
                Ok(p) => p,
                Err(c) => return Ok(ToolOutcome::fail(1, format!("{raw}: {c}"), c)),
            },
            None => ctx.workspace_root.clone(),
        };

        // Smart-case: literal lowercase patterns match case-insensitively.
        let case_insensitive = !pattern.chars().any(|c| c.is_uppercase());
        let regex = match RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
        {
            Ok(r) => r,
            Err(e) => {
                return Ok(ToolOutcome::fail(
                    2,
                    format!("invalid pattern: {e}"),
                    ErrorCategory::MalformedResponse,
                ))
            }
        };

        let mut matches = Vec::new();
        search_dir(&root, &ctx.workspace_root, &regex, &mut matches)?;

        let truncated = matches.len() >= MAX_MATCHES;
        let count = matches.len();
        let mut output = matches.join("\n");
        if output.is_empty() {
            output = format!("no matches for `{pattern}`");
        } else if truncated {
            output.push_str("\n... (results truncated)");
        }

        Ok(ToolOutcome::ok_with_data(
            output,
            json!({ "matches": count, "truncated": truncated }),
        ))
    }
}

fn search_dir(
    dir: &Path,
    workspace_root: &Path,
    regex: &regex::Regex,
    matches: &mut Vec<String>,
) -> Result<()> {
    if matches.len() >= MAX_MATCHES {
        return Ok(());
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();
        if path.is_dir() {
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_str()) {
                continue;
            }
            search_dir(&path, workspace_root, regex, matches)?;
        } else {
            if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let display = path
                .strip_prefix(workspace_root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            for (line_no, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{display}:{}: {}", line_no + 1, line.trim_end()));
                    if matches.len() >= MAX_MATCHES {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_in(dir: &tempfile::TempDir) -> ToolContext {
        ToolContext::new(dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn finds_matches_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src/app.js"),
            "const x = 1;\nfunction handler() {}\n",
        )
        .unwrap();

        let outcome = SearchCodeTool
            .execute(json!({"pattern": "function \\w+"}), &ctx_in(&dir))
            .await
            .unwrap();
        assert!(outcome.stdout.contains("src/app.js:2"));
        assert_eq!(outcome.data["matches"], 1);
    }

    #[tokio::test]
    async fn skips_noisy_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/i.js"), "needle").unwrap();
        std::fs::write(dir.path().join("main.js"), "needle").unwrap();

        let outcome = SearchCodeTool
            .execute(json!({"pattern": "needle"}), &ctx_in(&dir))
            .await
            .unwrap();
        assert!(outcome.stdout.contains("main.js"));
        assert!(!outcome.stdout.contains("node_modules"));
    }

    #[tokio::test]
    async fn smart_case_matching() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "HELLO world").unwrap();

        let lower = SearchCodeTool
            .execute(json!({"pattern": "hello"}), &ctx_in(&dir))
            .await
            .unwrap();
        assert_eq!(lower.data["matches"], 1);

        let upper = SearchCodeTool
            .execute(json!({"pattern": "Hello"}), &ctx_in(&dir))
            .await
            .unwrap();
        assert_eq!(upper.data["matches"], 0);
    }

    #[tokio::test]
    async fn invalid_pattern_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = SearchCodeTool
            .execute(json!({"pattern": "[unclosed"}), &ctx_in(&dir))
            .await
            .unwrap();
        assert_eq!(outcome.rc, 2);
    }
}
