use async_trait::async_trait;

use super::{
    recovery_or_failure, single_tool_step, Agent, AgentDeps, AgentResult, StepOutcome,
};
use crate::context::{AgentRequest, AgentRequestKind, ContextView};
use crate::error::ErrorCategory;
use crate::prompt;
use crate::selector::SchemaSelector;
use crate::task::{ActionType, Task};
use crate::verification::missing_relative_imports;

/// Handles `edit`, `add`, and `create`. Pre-validates the target before any
/// model call, embeds the real file content so substring edits are grounded
/// in reality, and warns about unresolved imports afterward.
pub struct WriterAgent;

#[async_trait]
impl Agent for WriterAgent {
    fn role(&self) -> &'static str {
        "writer"
    }

    async fn execute(
        &self,
        task: &mut Task,
        view: &ContextView,
        deps: &AgentDeps<'_>,
    ) -> AgentResult {
        // Pre-checks: an edit must name a readable target. Failing early
        // lets the orchestrator reword the task or reroute it to add/create.
        let target_content = match self.pre_check(task, view) {
            Ok(content) => content,
            Err(result) => return result,
        };

        let brief = self.build_brief(task, target_content.as_deref());
        let system_prompt =
            prompt::role_system_prompt(task.action_type, deps.config.llm.ultrathink);
        let allowed = SchemaSelector::candidates(task.action_type);

        match single_tool_step(task, deps, system_prompt, brief, allowed).await {
            StepOutcome::Executed { tool_name, outcome } => {
                if outcome.is_ok() {
                    self.trace_change(task, view, target_content.as_deref());
                }
                if tool_name == "write_file" && outcome.is_ok() {
                    self.post_check_imports(task, deps);
                }
                AgentResult::Success
            }
            StepOutcome::NoToolCall { text } => recovery_or_failure(task, deps, text),
            StepOutcome::TransportFailure { detail } => AgentResult::FinalFailure {
                reason: format!("provider unavailable: {detail}"),
            },
        }
    }
}

impl WriterAgent {
    /// For `edit`: a target file must be named and readable. Returns the
    /// current content so the prompt can embed it.
    fn pre_check(&self, task: &Task, view: &ContextView) -> Result<Option<String>, AgentResult> {
        let Some(target) = task.primary_target() else {
            if task.action_type == ActionType::Edit {
                return Err(AgentResult::RecoveryRequested {
                    reason: ErrorCategory::MissingTarget,
                    detail: "edit task names no target file; name one or use add/create".into(),
                });
            }
            return Ok(None);
        };

        let path = view.workspace_root.join(target);
        if !path.is_file() {
            if task.action_type == ActionType::Edit {
                return Err(AgentResult::RecoveryRequested {
                    reason: ErrorCategory::FileNotFound,
                    detail: format!("edit target {target} does not exist; use add/create instead"),
                });
            }
            return Ok(None);
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) => Err(AgentResult::RecoveryRequested {
                reason: ErrorCategory::FileNotFound,
                detail: format!("cannot read {target}: {e}"),
            }),
        }
    }

    fn build_brief(&self, task: &Task, target_content: Option<&str>) -> String {
        let mut brief = format!("TASK: {}\n", task.description);
        if !task.target_files.is_empty() {
            brief.push_str(&format!("TARGET FILES: {}\n", task.target_files.join(", ")));
        }
        if let (Some(target), Some(content)) = (task.primary_target(), target_content) {
            brief.push_str(&format!(
                "\nCURRENT CONTENT OF {target} (any `find` parameter must be a byte-exact \
                 substring of this):\n---\n{content}\n---\n"
            ));
        }
        brief
    }

    /// Log the applied change as a compact unified diff.
    fn trace_change(&self, task: &Task, view: &ContextView, old_content: Option<&str>) {
        let (Some(target), Some(old)) = (task.primary_target(), old_content) else {
            return;
        };
        let Ok(new_content) = std::fs::read_to_string(view.workspace_root.join(target)) else {
            return;
        };
        let diff = crate::tools::diff::unified_diff(target, old, &new_content, 3);
        if !diff.is_empty() {
            tracing::debug!(target, change = %crate::tools::diff::truncate_diff(&diff, 40), "edit applied");
        }
    }

    /// After a successful full-file write, check that relative imports in
    /// the new content resolve. Non-blocking: the user may be introducing a
    /// dependency on purpose, so this only surfaces a warning.
    fn post_check_imports(&self, task: &Task, deps: &AgentDeps<'_>) {
        let Some(event) = task.tool_events.last() else {
            return;
        };
        let (Some(path), Some(content)) = (
            event.target_path(),
            event.args.get("content").and_then(|v| v.as_str()),
        ) else {
            return;
        };

        let absolute = deps.tool_ctx.workspace_root.join(path);
        let missing = missing_relative_imports(content, &absolute);
        if !missing.is_empty() {
            deps.sink.push(AgentRequest::new(
                AgentRequestKind::ImportWarning,
                format!("{path} imports unresolved modules: {}", missing.join(", ")),
            ));
        }
    }
}
