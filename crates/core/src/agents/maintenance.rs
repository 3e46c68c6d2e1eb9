use async_trait::async_trait;

use super::{recovery_or_failure, single_tool_step, Agent, AgentDeps, AgentResult, StepOutcome};
use crate::context::ContextView;
use crate::prompt;
use crate::selector::SchemaSelector;
use crate::task::{ActionType, Task};

/// One implementation for the remaining role-bound executors: refactor,
/// delete, debug, fix, document, tool, execute. They share the common
/// contract and differ only in role prompt and tool subset, both of which
/// key off the action type.
pub struct RoleAgent {
    action: ActionType,
    role: &'static str,
}

impl RoleAgent {
    pub fn new(action: ActionType) -> Self {
        let role = match action {
            ActionType::Refactor => "refactor",
            ActionType::Delete => "cleanup",
            ActionType::Debug => "debug",
            ActionType::Fix => "fix",
            ActionType::Document => "doc",
            ActionType::Tool => "tool-create",
            ActionType::Execute => "execute",
            other => {
                debug_assert!(false, "RoleAgent misused for {other}");
                "generic"
            }
        };
        Self { action, role }
    }
}

#[async_trait]
impl Agent for RoleAgent {
    fn role(&self) -> &'static str {
        self.role
    }

    async fn execute(
        &self,
        task: &mut Task,
        view: &ContextView,
        deps: &AgentDeps<'_>,
    ) -> AgentResult {
        let mut brief = format!("TASK: {}\n", task.description);
        if !task.target_files.is_empty() {
            brief.push_str(&format!("TARGET FILES: {}\n", task.target_files.join(", ")));

            // Ground edits in the real file content, like the writer does.
            for target in task.target_files.iter().take(3) {
                let path = view.workspace_root.join(target);
                if let Ok(content) = std::fs::read_to_string(&path) {
                    brief.push_str(&format!(
                        "\nCURRENT CONTENT OF {target}:\n---\n{content}\n---\n"
                    ));
                }
            }
        }

        let system_prompt = prompt::role_system_prompt(self.action, deps.config.llm.ultrathink);
        let allowed = SchemaSelector::candidates(self.action);

        match single_tool_step(task, deps, system_prompt, brief, allowed).await {
            StepOutcome::Executed { .. } => AgentResult::Success,
            StepOutcome::NoToolCall { text } => recovery_or_failure(task, deps, text),
            StepOutcome::TransportFailure { detail } => AgentResult::FinalFailure {
                reason: format!("provider unavailable: {detail}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::Harness;
    use serde_json::json;

    #[tokio::test]
    async fn delete_agent_removes_the_named_file() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("legacy.py"), "old code").unwrap();
        harness
            .provider
            .push_tool_call("delete_file", json!({"path": "legacy.py"}));
        let deps = harness.deps(dir.path());

        let mut task = Task::new(ActionType::Delete, "remove legacy.py")
            .with_targets(vec!["legacy.py".into()]);
        let result = RoleAgent::new(ActionType::Delete)
            .execute(&mut task, &harness.view(dir.path()), &deps)
            .await;

        assert!(matches!(result, AgentResult::Success));
        assert!(!dir.path().join("legacy.py").exists());
    }

    #[tokio::test]
    async fn execute_agent_runs_commands() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        harness
            .provider
            .push_tool_call("run_cmd", json!({"command": "echo built"}));
        let deps = harness.deps(dir.path());

        let mut task = Task::new(ActionType::Execute, "run the build");
        let result = RoleAgent::new(ActionType::Execute)
            .execute(&mut task, &harness.view(dir.path()), &deps)
            .await;

        assert!(matches!(result, AgentResult::Success));
        assert_eq!(task.tool_events[0].stdout, "built");
    }

    #[tokio::test]
    async fn tool_create_drafts_under_drover_dir() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        harness.provider.push_tool_call(
            "write_file",
            json!({
                "path": ".drover/tools/complexity_report.json",
                "content": "{\"name\": \"complexity_report\", \"description\": \"draft\"}"
            }),
        );
        let deps = harness.deps(dir.path());

        let mut task = Task::new(ActionType::Tool, "draft a complexity_report tool");
        let result = RoleAgent::new(ActionType::Tool)
            .execute(&mut task, &harness.view(dir.path()), &deps)
            .await;

        assert!(matches!(result, AgentResult::Success));
        assert!(dir.path().join(".drover/tools/complexity_report.json").exists());
        // Drafted, not registered: the live registry is unchanged.
        assert!(deps.registry.get("complexity_report").is_none());
    }
}
