use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;

use super::{Tool, ToolContext, ToolOutcome};
use crate::error::ErrorCategory;

const MAX_READ_BYTES: u64 = 512 * 1024;

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing required parameter: {key}"))
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file and return its content. Paths are relative to the workspace root."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace root" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let raw = require_str(&args, "path")?;
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(category) => return Ok(ToolOutcome::fail(1, format!("{raw}: {category}"), category)),
        };

        if !path.is_file() {
            return Ok(ToolOutcome::fail(
                1,
                format!("file not found: {raw}"),
                ErrorCategory::FileNotFound,
            ));
        }

        let size = tokio::fs::metadata(&path).await?.len();
        if size > MAX_READ_BYTES {
            return Ok(ToolOutcome {
                rc: 1,
                stderr: format!("{raw} is {size} bytes, over the {MAX_READ_BYTES} byte read limit"),
                ..Default::default()
            });
        }

        let content = tokio::fs::read_to_string(&path).await?;
        Ok(ToolOutcome::ok_with_data(
            content,
            json!({ "path": raw, "bytes": size }),
        ))
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write full content to a file, creating it and any parent directories if needed. \
         Overwrites existing content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace root" },
                "content": { "type": "string", "description": "Complete new file content" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let raw = require_str(&args, "path")?;
        let content = require_str(&args, "content")?;
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(category) => return Ok(ToolOutcome::fail(1, format!("{raw}: {category}"), category)),
        };

        ctx.record_mutation(&path);
        let existed = path.exists();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;

        Ok(ToolOutcome::ok_with_data(
            format!(
                "{} {} ({} bytes)",
                if existed { "Updated" } else { "Created" },
                raw,
                content.len()
            ),
            json!({ "path": raw, "created": !existed, "bytes": content.len() }),
        ))
    }
}

// ---------------------------------------------------------------------------
// replace_in_file
// ---------------------------------------------------------------------------

pub struct ReplaceInFileTool;

#[async_trait]
impl Tool for ReplaceInFileTool {
    fn name(&self) -> &str {
        "replace_in_file"
    }

    fn description(&self) -> &str {
        "Replace one occurrence of a byte-exact substring in a file. The `find` string \
         must appear in the current file content exactly as written."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace root" },
                "find": { "type": "string", "description": "Exact substring to locate" },
                "replace": { "type": "string", "description": "Replacement text" }
            },
            "required": ["path", "find", "replace"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let raw = require_str(&args, "path")?;
        let find = require_str(&args, "find")?;
        let replace = require_str(&args, "replace")?;
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(category) => return Ok(ToolOutcome::fail(1, format!("{raw}: {category}"), category)),
        };

        if !path.is_file() {
            return Ok(ToolOutcome::fail(
                1,
                format!("file not found: {raw}"),
                ErrorCategory::FileNotFound,
            ));
        }

        let content = tokio::fs::read_to_string(&path).await?;
        if !content.contains(find) {
            return Ok(ToolOutcome::fail(
                1,
                format!("`find` string is not a substring of {raw}"),
                ErrorCategory::PatchDoesNotApply,
            ));
        }

        ctx.record_mutation(&path);
        let new_content = content.replacen(find, replace, 1);
        tokio::fs::write(&path, &new_content).await?;

        Ok(ToolOutcome::ok_with_data(
            format!("Replaced 1 occurrence in {raw}"),
            json!({ "path": raw }),
        ))
    }
}

// ---------------------------------------------------------------------------
// copy_file / move_file / delete_file
// ---------------------------------------------------------------------------

pub struct CopyFileTool;

#[async_trait]
impl Tool for CopyFileTool {
    fn name(&self) -> &str {
        "copy_file"
    }

    fn description(&self) -> &str {
        "Copy a file to a new location inside the workspace. Creates parent directories \
         for the destination if needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string", "description": "Source file path" },
                "destination": { "type": "string", "description": "Destination file path" }
            },
            "required": ["source", "destination"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let source = require_str(&args, "source")?;
        let destination = require_str(&args, "destination")?;
        let src = match ctx.resolve(source) {
            Ok(p) => p,
            Err(c) => return Ok(ToolOutcome::fail(1, format!("{source}: {c}"), c)),
        };
        let dst = match ctx.resolve(destination) {
            Ok(p) => p,
            Err(c) => return Ok(ToolOutcome::fail(1, format!("{destination}: {c}"), c)),
        };

        if !src.is_file() {
            return Ok(ToolOutcome::fail(
                1,
                format!("source is not a file: {source}"),
                ErrorCategory::FileNotFound,
            ));
        }

        ctx.record_mutation(&dst);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = tokio::fs::copy(&src, &dst).await?;

        Ok(ToolOutcome::ok_with_data(
            format!("Copied {source} -> {destination} ({bytes} bytes)"),
            json!({ "source": source, "destination": destination, "bytes": bytes }),
        ))
    }
}

pub struct MoveFileTool;

#[async_trait]
impl Tool for MoveFileTool {
    fn name(&self) -> &str {
        "move_file"
    }

    fn description(&self) -> &str {
        "Move or rename a file inside the workspace. Fails if the destination already exists."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string", "description": "Source file path" },
                "destination": { "type": "string", "description": "Destination file path" }
            },
            "required": ["source", "destination"]
        })
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let source = require_str(&args, "source")?;
        let destination = require_str(&args, "destination")?;
        let src = match ctx.resolve(source) {
            Ok(p) => p,
            Err(c) => return Ok(ToolOutcome::fail(1, format!("{source}: {c}"), c)),
        };
        let dst = match ctx.resolve(destination) {
            Ok(p) => p,
            Err(c) => return Ok(ToolOutcome::fail(1, format!("{destination}: {c}"), c)),
        };

        if !src.exists() {
            return Ok(ToolOutcome::fail(
                1,
                format!("source does not exist: {source}"),
                ErrorCategory::FileNotFound,
            ));
        }
        if dst.exists() {
            return Ok(ToolOutcome::fail(
                1,
                format!("destination already exists: {destination}"),
                ErrorCategory::PatchDoesNotApply,
            ));
        }

        // Both ends change: the source disappears, the destination appears.
        ctx.record_mutation(&src);
        ctx.record_mutation(&dst);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst).await?;

        Ok(ToolOutcome::ok_with_data(
            format!("Moved {source} -> {destination}"),
            json!({ "source": source, "destination": destination }),
        ))
    }
}

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file. The pre-image is kept by the task's transaction, so an aborted \
         task restores it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace root" }
            },
            "required": ["path"]
        })
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let raw = require_str(&args, "path")?;
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(c) => return Ok(ToolOutcome::fail(1, format!("{raw}: {c}"), c)),
        };

        if !path.is_file() {
            return Ok(ToolOutcome::fail(
                1,
                format!("file not found: {raw}"),
                ErrorCategory::FileNotFound,
            ));
        }

        ctx.record_mutation(&path);
        tokio::fs::remove_file(&path).await?;

        Ok(ToolOutcome::ok_with_data(
            format!("Deleted {raw}"),
            json!({ "path": raw }),
        ))
    }
}

// ---------------------------------------------------------------------------
// file_exists / list_dir / tree_view
// ---------------------------------------------------------------------------

pub struct FileExistsTool;

#[async_trait]
impl Tool for FileExistsTool {
    fn name(&self) -> &str {
        "file_exists"
    }

    fn description(&self) -> &str {
        "Check whether a path exists, and whether it is a file or a directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let raw = require_str(&args, "path")?;
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(c) => return Ok(ToolOutcome::fail(1, format!("{raw}: {c}"), c)),
        };

        let kind = if path.is_file() {
            "file"
        } else if path.is_dir() {
            "directory"
        } else {
            "absent"
        };

        Ok(ToolOutcome::ok_with_data(
            format!("{raw}: {kind}"),
            json!({ "path": raw, "exists": kind != "absent", "kind": kind }),
        ))
    }
}

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory contents with [FILE] or [DIR] prefixes, sorted alphabetically. \
         Hidden entries are omitted."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path relative to the workspace root ('.' for the root)" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let raw = require_str(&args, "path")?;
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(c) => return Ok(ToolOutcome::fail(1, format!("{raw}: {c}"), c)),
        };

        if !path.is_dir() {
            return Ok(ToolOutcome::fail(
                1,
                format!("not a directory: {raw}"),
                ErrorCategory::FileNotFound,
            ));
        }

        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                entries.push(format!("[DIR]  {name}/"));
            } else {
                entries.push(format!("[FILE] {name}"));
            }
        }
        entries.sort();

        let count = entries.len();
        let output = if entries.is_empty() {
            format!("{raw} is empty")
        } else {
            entries.join("\n")
        };
        Ok(ToolOutcome::ok_with_data(output, json!({ "count": count })))
    }
}

pub struct TreeViewTool;

#[async_trait]
impl Tool for TreeViewTool {
    fn name(&self) -> &str {
        "tree_view"
    }

    fn description(&self) -> &str {
        "Show a recursive tree of directory contents up to a depth (default 3). \
         Skips noisy directories (node_modules, .git, target, __pycache__)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Root directory relative to the workspace root" },
                "depth": { "type": "integer", "description": "Maximum recursion depth (default 3)" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let raw = require_str(&args, "path")?;
        let max_depth = args.get("depth").and_then(|v| v.as_u64()).unwrap_or(3) as usize;
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(c) => return Ok(ToolOutcome::fail(1, format!("{raw}: {c}"), c)),
        };

        if !path.is_dir() {
            return Ok(ToolOutcome::fail(
                1,
                format!("not a directory: {raw}"),
                ErrorCategory::FileNotFound,
            ));
        }

        let mut lines = vec![format!("{raw}/")];
        build_tree(&path, "", max_depth, 0, &mut lines)?;
        Ok(ToolOutcome::ok(lines.join("\n")))
    }
}

const TREE_EXCLUDES: &[&str] = &["node_modules", ".git", "target", "__pycache__", ".venv"];

fn build_tree(
    dir: &Path,
    prefix: &str,
    max_depth: usize,
    depth: usize,
    lines: &mut Vec<String>,
) -> Result<()> {
    if depth >= max_depth {
        return Ok(());
    }
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || TREE_EXCLUDES.contains(&name.as_str()) {
            continue;
        }
        entries.push((name, entry.path().is_dir(), entry.path()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let total = entries.len();
    for (i, (name, is_dir, entry_path)) in entries.into_iter().enumerate() {
        let is_last = i == total - 1;
        let connector = if is_last { "└── " } else { "├── " };
        if is_dir {
            lines.push(format!("{prefix}{connector}{name}/"));
            let child_prefix = format!("{prefix}{}", if is_last { "    " } else { "│   " });
            build_tree(&entry_path, &child_prefix, max_depth, depth + 1, lines)?;
        } else {
            lines.push(format!("{prefix}{connector}{name}"));
        }
    }
    Ok(())
}
