use async_trait::async_trait;

use super::{recovery_or_failure, single_tool_step, Agent, AgentDeps, AgentResult, StepOutcome};
use crate::context::ContextView;
use crate::prompt;
use crate::selector::SchemaSelector;
use crate::task::Task;

/// Handles the research class: read, research, analyze, review,
/// investigate. Read-only by construction: the tool subset offered (and the
/// recovery extractor's allowed set) contains no mutating tool.
pub struct ResearchAgent;

#[async_trait]
impl Agent for ResearchAgent {
    fn role(&self) -> &'static str {
        "research"
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
        }
        if !view.completed_work_summary.is_empty() {
            brief.push_str(&format!(
                "\nWORK COMPLETED SO FAR:\n{}\n",
                view.completed_work_summary
            ));
        }

        let system_prompt = prompt::role_system_prompt(task.action_type, deps.config.llm.ultrathink);
        let allowed = SchemaSelector::candidates(task.action_type);

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
    use crate::task::ActionType;
    use serde_json::json;

    #[tokio::test]
    async fn read_task_executes_read_tool() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "# notes").unwrap();
        harness
            .provider
            .push_tool_call("read_file", json!({"path": "notes.md"}));
        let deps = harness.deps(dir.path());

        let mut task = Task::new(ActionType::Read, "read notes.md");
        let result = ResearchAgent
            .execute(&mut task, &harness.view(dir.path()), &deps)
            .await;

        assert!(matches!(result, AgentResult::Success));
        assert_eq!(task.tool_events[0].tool_name, "read_file");
        assert_eq!(task.tool_events[0].stdout, "# notes");
    }

    #[tokio::test]
    async fn mutating_tool_call_is_refused() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        // A confused model tries to write during research.
        harness
            .provider
            .push_tool_call("write_file", json!({"path": "x.txt", "content": "oops"}));
        let deps = harness.deps(dir.path());

        let mut task = Task::new(ActionType::Analyze, "analyze the project layout");
        let result = ResearchAgent
            .execute(&mut task, &harness.view(dir.path()), &deps)
            .await;

        // Refused, no event recorded, nothing written.
        assert!(matches!(result, AgentResult::RecoveryRequested { .. }));
        assert!(task.tool_events.is_empty());
        assert!(!dir.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn prose_with_embedded_json_is_recovered() {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        harness.provider.push_text(
            r#"Let me list the sources: {"name": "list_dir", "arguments": {"path": "src"}}"#,
        );
        let deps = harness.deps(dir.path());

        let mut task = Task::new(ActionType::Investigate, "inspect the src directory");
        let result = ResearchAgent
            .execute(&mut task, &harness.view(dir.path()), &deps)
            .await;

        assert!(matches!(result, AgentResult::Success));
        assert_eq!(task.tool_events[0].tool_name, "list_dir");
    }
}
