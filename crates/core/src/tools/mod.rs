pub mod diagnosis;
pub mod diff;
pub mod fs;
pub mod git;
pub mod patch;
pub mod search;
pub mod subprocess;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use drover_provider::ToolDefinition;

use crate::cancel::CancelFlag;
use crate::error::ErrorCategory;
use crate::transaction::TransactionHandle;
use diagnosis::TimeoutDiagnosis;

/// Uniform result of one tool invocation: `{rc, stdout, stderr, data?,
/// diagnosis?}`. Domain failures are outcomes with a nonzero rc, not Errs;
/// `Err` is reserved for unexpected I/O the tool could not express.
/// Serializable so the resilient executor can cache successful results.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ToolOutcome {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
    pub data: Value,
    pub diagnosis: Option<TimeoutDiagnosis>,
    pub category: Option<ErrorCategory>,
}

impl ToolOutcome {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            rc: 0,
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn ok_with_data(stdout: impl Into<String>, data: Value) -> Self {
        Self {
            rc: 0,
            stdout: stdout.into(),
            data,
            ..Default::default()
        }
    }

    pub fn fail(rc: i32, stderr: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            rc,
            stderr: stderr.into(),
            category: Some(category),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.rc == 0
    }
}

#[derive(Clone)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub cancel: CancelFlag,
    /// Open transaction for the current task; mutating tools record
    /// pre-images here before touching anything.
    pub txn: Option<TransactionHandle>,
    pub run_cmd_timeout_secs: u64,
    pub run_tests_timeout_secs: u64,
}

impl ToolContext {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            cancel: CancelFlag::new(),
            txn: None,
            run_cmd_timeout_secs: 300,
            run_tests_timeout_secs: 600,
        }
    }

    pub fn with_txn(mut self, txn: TransactionHandle) -> Self {
        self.txn = Some(txn);
        self
    }

    /// Resolve a tool-supplied path inside the workspace. Absolute paths and
    /// `..` escapes are rejected outright.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ErrorCategory> {
        resolve_in_workspace(&self.workspace_root, raw)
    }

    /// Capture the pre-image of a path about to be mutated.
    pub fn record_mutation(&self, absolute_path: &Path) {
        if let Some(txn) = &self.txn {
            txn.lock().expect("transaction lock").record_pre_image(absolute_path);
        }
    }
}

/// Lexical confinement: no absolute paths, no escaping the root via `..`.
pub fn resolve_in_workspace(root: &Path, raw: &str) -> Result<PathBuf, ErrorCategory> {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        return Err(ErrorCategory::PathEscapesRepo);
    }
    let mut resolved = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(ErrorCategory::PathEscapesRepo);
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ErrorCategory::PathEscapesRepo);
            }
        }
    }
    Ok(root.join(resolved))
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    /// Destructive tools remove or displace existing content; the plan gate
    /// treats tasks that use them more strictly.
    fn destructive(&self) -> bool {
        false
    }
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome>;
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
    sealed: bool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            sealed: false,
        }
    }

    /// Registration is startup-only: once the registry is sealed at run
    /// start, nothing can add tools mid-run.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<()> {
        anyhow::ensure!(!self.sealed, "tool registry is sealed; registration is startup-only");
        self.tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_destructive(&self, name: &str) -> bool {
        self.get(name).map(|t| t.destructive()).unwrap_or(false)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn definitions_for(&self, names: &[&str]) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = names
            .iter()
            .filter_map(|n| self.get(n))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Validate arguments against the tool's declared schema before
    /// dispatch. Catching `file_path` vs `path` mismatches here keeps them
    /// out of the tools entirely.
    pub fn validate_args(&self, name: &str, args: &Value) -> Result<(), String> {
        let tool = self
            .get(name)
            .ok_or_else(|| format!("unknown tool: {name}"))?;
        let schema = tool.parameters_schema();

        let Some(args_obj) = args.as_object() else {
            return Err(format!("arguments for {name} must be a JSON object"));
        };

        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !args_obj.contains_key(key) {
                    return Err(format!("missing required parameter `{key}` for {name}"));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
            for (key, value) in args_obj {
                let Some(declared) = properties.get(key) else {
                    return Err(format!("unknown parameter `{key}` for {name}"));
                };
                if let Some(expected) = declared.get("type").and_then(|t| t.as_str()) {
                    let matches = match expected {
                        "string" => value.is_string(),
                        "integer" | "number" => value.is_number(),
                        "boolean" => value.is_boolean(),
                        "array" => value.is_array(),
                        "object" => value.is_object(),
                        _ => true,
                    };
                    if !matches {
                        return Err(format!(
                            "parameter `{key}` for {name} must be a {expected}"
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Invoke a tool. Schema violations and cancellation come back as failed
    /// outcomes so every invocation still produces exactly one tool event.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        if ctx.cancel.is_cancelled() {
            return Ok(ToolOutcome::fail(-1, "cancelled", ErrorCategory::Cancelled));
        }
        if let Err(reason) = self.validate_args(name, &args) {
            return Ok(ToolOutcome::fail(2, reason, ErrorCategory::MalformedResponse));
        }
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown tool: {name}"))?;
        tracing::debug!(tool = name, "executing tool");
        tool.execute(args, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build and seal the standard registry.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    let register = |registry: &mut ToolRegistry, tool: Box<dyn Tool>| {
        registry.register(tool).expect("registry not sealed yet");
    };

    // File I/O
    register(&mut registry, Box::new(fs::ReadFileTool));
    register(&mut registry, Box::new(fs::WriteFileTool));
    register(&mut registry, Box::new(fs::ReplaceInFileTool));
    register(&mut registry, Box::new(fs::CopyFileTool));
    register(&mut registry, Box::new(fs::MoveFileTool));
    register(&mut registry, Box::new(fs::DeleteFileTool));
    register(&mut registry, Box::new(fs::FileExistsTool));
    register(&mut registry, Box::new(fs::ListDirTool));
    register(&mut registry, Box::new(fs::TreeViewTool));

    // Patching
    register(&mut registry, Box::new(patch::ApplyPatchTool));

    // Subprocess
    register(&mut registry, Box::new(subprocess::RunCmdTool));
    register(&mut registry, Box::new(subprocess::RunTestsTool));

    // VCS
    register(&mut registry, Box::new(git::GitStatusTool));
    register(&mut registry, Box::new(git::GitDiffTool));
    register(&mut registry, Box::new(git::GitCommitTool));

    // Analysis
    register(&mut registry, Box::new(search::SearchCodeTool));

    registry.seal();
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_confinement_rejects_escapes() {
        let root = Path::new("/workspace/project");
        assert!(resolve_in_workspace(root, "src/main.rs").is_ok());
        assert!(resolve_in_workspace(root, "./a/./b.txt").is_ok());
        assert!(resolve_in_workspace(root, "a/../b.txt").is_ok());
        assert_eq!(
            resolve_in_workspace(root, "/etc/passwd"),
            Err(ErrorCategory::PathEscapesRepo)
        );
        assert_eq!(
            resolve_in_workspace(root, "../outside.txt"),
            Err(ErrorCategory::PathEscapesRepo)
        );
        assert_eq!(
            resolve_in_workspace(root, "a/../../outside.txt"),
            Err(ErrorCategory::PathEscapesRepo)
        );
    }

    #[test]
    fn registry_seals_against_midrun_registration() {
        let mut registry = default_registry();
        let result = registry.register(Box::new(fs::ReadFileTool));
        assert!(result.is_err());
    }

    #[test]
    fn validate_args_flags_name_mismatches() {
        let registry = default_registry();
        // The classic bug: caller says file_path, schema says path.
        let err = registry
            .validate_args("read_file", &json!({"file_path": "a.txt"}))
            .unwrap_err();
        assert!(err.contains("file_path"));
        assert!(registry
            .validate_args("read_file", &json!({"path": "a.txt"}))
            .is_ok());
    }

    #[test]
    fn validate_args_checks_required_and_types() {
        let registry = default_registry();
        assert!(registry.validate_args("write_file", &json!({"path": "a"})).is_err());
        assert!(registry
            .validate_args("write_file", &json!({"path": "a", "content": 7}))
            .is_err());
        assert!(registry
            .validate_args("write_file", &json!({"path": "a", "content": "x"}))
            .is_ok());
    }

    #[tokio::test]
    async fn execute_turns_schema_violation_into_failed_outcome() {
        let registry = default_registry();
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf());
        let outcome = registry
            .execute("read_file", json!({"wrong": true}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.rc, 2);
        assert_eq!(outcome.category, Some(ErrorCategory::MalformedResponse));
    }

    #[tokio::test]
    async fn execute_respects_cancellation() {
        let registry = default_registry();
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf());
        ctx.cancel.cancel();
        let outcome = registry
            .execute("read_file", json!({"path": "a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.category, Some(ErrorCategory::Cancelled));
    }

    #[test]
    fn definitions_are_sorted_and_complete() {
        let registry = default_registry();
        let defs = registry.definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"read_file"));
        assert!(names.contains(&"run_tests"));
        assert!(names.contains(&"git_commit"));
    }

    #[test]
    fn destructive_flags_cover_removals() {
        let registry = default_registry();
        assert!(registry.is_destructive("delete_file"));
        assert!(registry.is_destructive("move_file"));
        assert!(!registry.is_destructive("read_file"));
        assert!(!registry.is_destructive("write_file"));
    }
}
