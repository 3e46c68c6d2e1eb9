use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;

use super::{Tool, ToolContext, ToolOutcome};
use crate::error::ErrorCategory;

/// Unified-diff application. All hunks succeed or the whole patch is rolled
/// back, so a half-applied diff never reaches verification.
pub struct ApplyPatchTool;

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff patch atomically. All hunks must succeed or the entire \
         patch is rolled back. Use for multi-file changes expressed as unified diffs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "patch": { "type": "string", "description": "Unified diff (output of `diff -u` or `git diff`)" }
            },
            "required": ["patch"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let patch_str = args
            .get("patch")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: patch"))?;

        let files = parse_unified_diff(patch_str);
        if files.is_empty() {
            return Ok(ToolOutcome::fail(
                1,
                "no hunks found in patch",
                ErrorCategory::PatchDoesNotApply,
            ));
        }

        let mut resolved: Vec<(PathBuf, &FileHunks)> = Vec::new();
        for file in &files {
            match ctx.resolve(&file.target_file) {
                Ok(path) => resolved.push((path, file)),
                Err(category) => {
                    return Ok(ToolOutcome::fail(
                        1,
                        format!("{}: {category}", file.target_file),
                        category,
                    ))
                }
            }
        }

        let mut backups: HashMap<PathBuf, Option<String>> = HashMap::new();
        for (path, _) in &resolved {
            if !backups.contains_key(path) {
                let backup = if path.exists() {
                    Some(std::fs::read_to_string(path)?)
                } else {
                    None
                };
                backups.insert(path.clone(), backup);
            }
        }

        let mut applied = 0usize;
        let mut changed = Vec::new();

        for (path, file) in &resolved {
            let content = backups
                .get(path)
                .and_then(|b| b.clone())
                .unwrap_or_default();

            match apply_hunks(&content, &file.hunks) {
                Ok(new_content) => {
                    ctx.record_mutation(path);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(path, &new_content)?;
                    applied += file.hunks.len();
                    changed.push(file.target_file.clone());
                }
                Err(reason) => {
                    for (backup_path, backup) in &backups {
                        match backup {
                            Some(content) => std::fs::write(backup_path, content)?,
                            None => {
                                if backup_path.exists() {
                                    std::fs::remove_file(backup_path)?;
                                }
                            }
                        }
                    }
                    return Ok(ToolOutcome::fail(
                        1,
                        format!("patch rolled back: {}: {reason}", file.target_file),
                        ErrorCategory::PatchDoesNotApply,
                    ));
                }
            }
        }

        Ok(ToolOutcome::ok_with_data(
            format!(
                "Applied {applied} hunks across {} files: {}",
                changed.len(),
                changed.join(", ")
            ),
            json!({ "files": changed, "hunks": applied }),
        ))
    }
}

struct FileHunks {
    target_file: String,
    hunks: Vec<Hunk>,
}

struct Hunk {
    old_start: usize,
    old_lines: Vec<String>,
    new_lines: Vec<String>,
}

fn parse_unified_diff(patch: &str) -> Vec<FileHunks> {
    let mut result: Vec<FileHunks> = Vec::new();
    let mut current_file: Option<FileHunks> = None;
    let mut current_hunk: Option<Hunk> = None;

    let flush_hunk = |file: &mut Option<FileHunks>, hunk: Option<Hunk>| {
        if let (Some(f), Some(h)) = (file.as_mut(), hunk) {
            f.hunks.push(h);
        }
    };

    for line in patch.lines() {
        if let Some(target) = line.strip_prefix("+++ ") {
            flush_hunk(&mut current_file, current_hunk.take());
            if let Some(f) = current_file.take() {
                if !f.hunks.is_empty() {
                    result.push(f);
                }
            }
            let target = target.trim();
            let target = target.strip_prefix("b/").unwrap_or(target);
            current_file = Some(FileHunks {
                target_file: target.to_string(),
                hunks: Vec::new(),
            });
        } else if line.starts_with("--- ") {
            continue;
        } else if line.starts_with("@@ ") {
            flush_hunk(&mut current_file, current_hunk.take());
            current_hunk = Some(Hunk {
                old_start: parse_hunk_header(line).unwrap_or(1),
                old_lines: Vec::new(),
                new_lines: Vec::new(),
            });
        } else if let Some(hunk) = current_hunk.as_mut() {
            if let Some(removed) = line.strip_prefix('-') {
                hunk.old_lines.push(removed.to_string());
            } else if let Some(added) = line.strip_prefix('+') {
                hunk.new_lines.push(added.to_string());
            } else {
                let context = line.strip_prefix(' ').unwrap_or(line);
                hunk.old_lines.push(context.to_string());
                hunk.new_lines.push(context.to_string());
            }
        }
    }

    flush_hunk(&mut current_file, current_hunk.take());
    if let Some(f) = current_file {
        if !f.hunks.is_empty() {
            result.push(f);
        }
    }
    result
}

fn parse_hunk_header(header: &str) -> Option<usize> {
    let after_at = header.strip_prefix("@@ -")?;
    after_at.split([',', ' ']).next()?.parse().ok()
}

fn apply_hunks(content: &str, hunks: &[Hunk]) -> Result<String, String> {
    let mut lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();

    let mut offset: isize = 0;
    for hunk in hunks {
        let start = hunk.old_start as isize - 1 + offset;
        if start < 0 || start as usize > lines.len() {
            return Err(format!(
                "hunk start {} out of range for {} lines",
                hunk.old_start,
                lines.len()
            ));
        }
        let start = start as usize;
        let end = (start + hunk.old_lines.len()).min(lines.len());

        let existing = &lines[start..end];
        if existing != hunk.old_lines.as_slice() {
            return Err(format!("context mismatch at line {}", hunk.old_start));
        }

        lines.splice(start..end, hunk.new_lines.iter().cloned());
        offset += hunk.new_lines.len() as isize - hunk.old_lines.len() as isize;
    }

    Ok(lines.join("\n"))
}
