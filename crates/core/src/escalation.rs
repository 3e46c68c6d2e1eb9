use drover_provider::{CallSpec, Gateway, Message};

use crate::context::{AgentRequest, AgentRequestKind, RunContext};
use crate::error::ErrorCategory;
use crate::prompt;
use crate::task::{digest_str, ActionType, Task};

/// Content hash of (action_type, primary_target, failure_category): the
/// shape of a failure, used to count repeats.
pub fn failure_signature(action: ActionType, target: &str, category: ErrorCategory) -> String {
    digest_str(&format!("{action}\u{1f}{target}\u{1f}{category:?}"))
}

/// Record one failure occurrence. When the same signature has repeated up to
/// the cap, the counter resets and an escalation directive is returned so
/// the new strategy starts with a clean slate.
pub fn record_failure(
    ctx: &mut RunContext,
    action: ActionType,
    target: &str,
    category: ErrorCategory,
    max_repeats: u32,
) -> Option<AgentRequest> {
    let signature = failure_signature(action, target, category);
    let count = ctx.failure_counts.entry(signature.clone()).or_default();
    *count += 1;
    tracing::debug!(%target, ?category, count = *count, "failure recorded");

    if *count >= max_repeats {
        ctx.failure_counts.remove(&signature);
        return Some(AgentRequest::new(
            AgentRequestKind::EditStrategyEscalation,
            prompt::escalation_directive(target),
        ));
    }
    None
}

/// True when a mutating task finished without even ATTEMPTING a mutating
/// tool call (e.g. the agent only ever called read_file). A failed attempt
/// is not a no-op; that path belongs to failure-signature counting.
pub fn mutation_was_noop(task: &Task) -> bool {
    task.action_type.is_mutating()
        && !task.tool_events.iter().any(|e| {
            matches!(
                e.tool_name.as_str(),
                "write_file" | "replace_in_file" | "apply_patch" | "copy_file" | "move_file"
                    | "delete_file"
            )
        })
}

/// Adaptive prompt optimizer: ask the model to rewrite the role prompt so
/// the missing behavior is explicit. Capped per failure signature; returns
/// `None` once the cap is spent or when the model gives nothing usable.
pub async fn improve_prompt(
    gateway: &Gateway,
    model: &str,
    ctx: &mut RunContext,
    task: &Task,
    current_prompt: &str,
    max_improvements: u32,
) -> Option<String> {
    let signature = failure_signature(
        task.action_type,
        task.primary_target().unwrap_or(""),
        ErrorCategory::VerificationInconclusive,
    );
    let spent = ctx.prompt_improvements.entry(signature).or_default();
    if *spent >= max_improvements {
        tracing::debug!("prompt improvement cap reached");
        return None;
    }
    *spent += 1;

    let tool_pattern: Vec<String> = task
        .tool_events
        .iter()
        .map(|e| format!("{} (rc {})", e.tool_name, e.rc))
        .collect();
    let request = prompt::prompt_improvement_prompt(
        current_prompt,
        task.action_type,
        &tool_pattern.join(", "),
    );

    let spec = CallSpec::text_only(model, None, vec![Message::user(request)]);
    match gateway.chat(&spec).await {
        Ok(reply) => reply
            .text
            .map(|t| t.trim().to_string())
            .filter(|t| t.len() > 40),
        Err(e) => {
            tracing::debug!(error = %e, "prompt improvement call failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_provider::scripted::ScriptedProvider;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn ctx() -> RunContext {
        RunContext::new(PathBuf::from("/tmp/w"))
    }

    #[test]
    fn signature_distinguishes_shape_components() {
        let a = failure_signature(ActionType::Edit, "package.json", ErrorCategory::PatchDoesNotApply);
        let b = failure_signature(ActionType::Edit, "package.json", ErrorCategory::PatchDoesNotApply);
        let c = failure_signature(ActionType::Edit, "other.json", ErrorCategory::PatchDoesNotApply);
        let d = failure_signature(ActionType::Edit, "package.json", ErrorCategory::FileNotFound);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn third_repeat_escalates_and_resets() {
        let mut context = ctx();
        for _ in 0..2 {
            let escalation = record_failure(
                &mut context,
                ActionType::Edit,
                "package.json",
                ErrorCategory::PatchDoesNotApply,
                3,
            );
            assert!(escalation.is_none());
        }
        let escalation = record_failure(
            &mut context,
            ActionType::Edit,
            "package.json",
            ErrorCategory::PatchDoesNotApply,
            3,
        )
        .expect("third repeat escalates");
        assert_eq!(escalation.kind, AgentRequestKind::EditStrategyEscalation);
        assert!(escalation.detail.contains("write_file"));

        // Counter was reset: the new strategy gets a fresh budget.
        assert!(context.failure_counts.is_empty());
    }

    #[test]
    fn noop_detection_requires_mutating_action() {
        let mut task = Task::new(ActionType::Edit, "change file");
        task.tool_events.push(crate::task::ToolEvent {
            tool_name: "read_file".into(),
            args: json!({"path": "a"}),
            args_digest: String::new(),
            result_digest: String::new(),
            rc: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            idempotency_key: String::new(),
            error_category: None,
        });
        assert!(mutation_was_noop(&task));

        let read_task = Task::new(ActionType::Read, "look around");
        assert!(!mutation_was_noop(&read_task));
    }

    #[tokio::test]
    async fn prompt_improvement_is_capped() {
        let provider = Arc::new(ScriptedProvider::new());
        let long_prompt = "You are a code-writing agent. You MUST call write_file with the \
                           complete new file content before finishing.";
        provider.push_text(long_prompt);
        provider.push_text(long_prompt);
        let gateway = Gateway::new(provider);

        let mut context = ctx();
        let task = Task::new(ActionType::Edit, "change file");

        let first = improve_prompt(&gateway, "m", &mut context, &task, "old prompt", 1).await;
        assert!(first.is_some());

        let second = improve_prompt(&gateway, "m", &mut context, &task, "old prompt", 1).await;
        assert!(second.is_none(), "cap of 1 must block the second improvement");
    }

    #[tokio::test]
    async fn short_replies_are_discarded() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_text("ok");
        let gateway = Gateway::new(provider);

        let mut context = ctx();
        let task = Task::new(ActionType::Edit, "change file");
        let improved = improve_prompt(&gateway, "m", &mut context, &task, "old", 3).await;
        assert!(improved.is_none());
    }
}
