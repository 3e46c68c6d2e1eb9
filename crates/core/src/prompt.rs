use crate::context::AgentRequest;
use crate::task::ActionType;

/// Role prompt for the agent handling one action class. Kept short and
/// directive: one task, one tool call.
pub fn role_system_prompt(action: ActionType, ultrathink: bool) -> String {
    let base = match action {
        ActionType::Read
        | ActionType::Research
        | ActionType::Analyze
        | ActionType::Review
        | ActionType::Investigate => {
            "You are a research agent. Gather the requested information with exactly one \
             tool call. Reply with the tool call ONLY: no prose before it, no prose after \
             it, no markdown wrapping. You cannot modify files; do not try."
        }
        ActionType::Edit | ActionType::Add | ActionType::Create => {
            "You are a code-writing agent. Make the requested change with exactly one tool \
             call. When using replace_in_file, the `find` parameter must be a byte-exact \
             substring of the CURRENT file content shown to you; copy it exactly, \
             whitespace included. Prefer replace_in_file for small changes and write_file \
             for rewrites or new files."
        }
        ActionType::Refactor => {
            "You are a refactoring agent. Restructure code without changing behavior, one \
             tool call per task. Preserve the file's existing style and imports."
        }
        ActionType::Delete => {
            "You are a cleanup agent. Remove exactly what the task names, nothing else, \
             with one tool call."
        }
        ActionType::Test => {
            "You are a test-execution agent. Choose the right test command for this \
             project from the manifests you can see and issue one run_tests call. Do not \
             guess a Python runner for a project with a JavaScript, Go, or Rust manifest."
        }
        ActionType::Debug | ActionType::Fix => {
            "You are a debugging agent. Identify the smallest change that fixes the \
             problem and apply it with one tool call."
        }
        ActionType::Document => {
            "You are a documentation agent. Write clear, accurate documentation for the \
             code the task names, with one tool call."
        }
        ActionType::Tool => {
            "You are a tooling agent. Draft the requested tool definition as a JSON file \
             under .drover/tools/ with one write_file call. New tools are registered at \
             startup, never mid-run."
        }
        ActionType::Execute => {
            "You are a command-execution agent. Run the requested command with one \
             run_cmd call and report its output faithfully."
        }
    };

    if ultrathink {
        format!("{base}\n\n{}", ultrathink_appendix())
    } else {
        base.to_string()
    }
}

/// Extended-reasoning instructions. Affects prompt text only.
pub fn ultrathink_appendix() -> &'static str {
    "Before acting, reason carefully through the task: restate what must change, \
     enumerate the files involved, and double-check the tool arguments against the \
     file content you were shown."
}

/// The "what's next?" prompt. Text-only mode: the reply is a structured
/// block or the GOAL_ACHIEVED sentinel, never a tool call.
pub fn planner_prompt(
    request: &str,
    repo_context: &str,
    completed_work_summary: &str,
    file_snapshot: &str,
    agent_requests: &[AgentRequest],
) -> String {
    let mut sections = vec![format!("USER REQUEST:\n{request}")];

    if !repo_context.is_empty() {
        sections.push(format!("REPOSITORY CONTEXT:\n{repo_context}"));
    }
    if !completed_work_summary.is_empty() {
        sections.push(format!("WORK COMPLETED SO FAR:\n{completed_work_summary}"));
    }
    if !file_snapshot.is_empty() {
        sections.push(format!("RECENTLY TOUCHED FILES:\n{file_snapshot}"));
    }
    if !agent_requests.is_empty() {
        let rendered: Vec<String> = agent_requests
            .iter()
            .map(|r| format!("- {}", r.render()))
            .collect();
        sections.push(format!(
            "CONSTRAINTS FROM THE LAST STEP (you MUST respect these):\n{}",
            rendered.join("\n")
        ));
    }

    sections.push(
        "Decide the single next task. Reply in EXACTLY this form:\n\
         ACTION: one of read|research|analyze|review|investigate|edit|add|create|\
         refactor|delete|test|debug|fix|document|tool|execute\n\
         DESCRIPTION: one sentence describing the task\n\
         TARGETS: comma-separated file paths (omit the line if none)\n\n\
         If the user request is fully satisfied, reply with exactly:\n\
         GOAL_ACHIEVED"
            .to_string(),
    );

    sections.join("\n\n")
}

/// Directive attached after repeated substring-replacement failures: switch
/// the strategy to a full-file rewrite.
pub fn escalation_directive(target: &str) -> String {
    format!(
        "Substring replacement keeps failing on {target}. Switch strategy: call \
         read_file on {target}, construct the complete corrected content locally, \
         then call write_file with the full new content. Do not call \
         replace_in_file again for this file."
    )
}

/// Prompt for the adaptive prompt optimizer: rewrite a role prompt so the
/// missing behavior is explicit.
pub fn prompt_improvement_prompt(
    old_prompt: &str,
    action: ActionType,
    tool_pattern: &str,
) -> String {
    format!(
        "An agent with the system prompt below was asked to perform a `{action}` task \
         but its tool usage shows it never performed the required mutation.\n\n\
         CURRENT PROMPT:\n{old_prompt}\n\n\
         OBSERVED TOOL PATTERN:\n{tool_pattern}\n\n\
         Rewrite the system prompt to make the required behavior explicit and \
         unmissable (e.g. \"you MUST call write_file\"). Reply with the new prompt \
         text only."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentRequestKind;

    #[test]
    fn every_action_has_a_role_prompt() {
        for action in ActionType::ALL {
            let prompt = role_system_prompt(action, false);
            assert!(!prompt.is_empty());
        }
    }

    #[test]
    fn ultrathink_appends_reasoning_instructions() {
        let plain = role_system_prompt(ActionType::Edit, false);
        let extended = role_system_prompt(ActionType::Edit, true);
        assert!(extended.starts_with(&plain));
        assert!(extended.len() > plain.len());
    }

    #[test]
    fn planner_prompt_includes_constraints() {
        let requests = vec![AgentRequest::new(
            AgentRequestKind::ResearchBudgetExhausted,
            "propose an action-class task",
        )];
        let prompt = planner_prompt("fix the bug", "", "read 3 files", "", &requests);
        assert!(prompt.contains("RESEARCH_BUDGET_EXHAUSTED"));
        assert!(prompt.contains("GOAL_ACHIEVED"));
        assert!(prompt.contains("ACTION:"));
    }

    #[test]
    fn escalation_directive_names_both_tools() {
        let directive = escalation_directive("package.json");
        assert!(directive.contains("read_file"));
        assert!(directive.contains("write_file"));
        assert!(directive.contains("package.json"));
    }
}
