pub mod maintenance;
pub mod research;
pub mod test_exec;
pub mod writer;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use drover_config::Config;
use drover_provider::{CallSpec, Gateway, GatewayReply, Message, ToolChoice, ToolDefinition};

use crate::context::{ContextView, RequestSink};
use crate::error::ErrorCategory;
use crate::resilient::{InvokeError, ResilientExecutor};
use crate::selector::SchemaSelector;
use crate::task::{digest, digest_str, ActionType, Task, ToolEvent};
use crate::tools::{ToolContext, ToolOutcome, ToolRegistry};

/// Outcome of one agent execution. Tagged variants instead of exceptions:
/// the orchestrator reacts to the tag, never to an error type.
#[derive(Debug, Clone)]
pub enum AgentResult {
    Success,
    RecoveryRequested { reason: ErrorCategory, detail: String },
    FinalFailure { reason: String },
    PromptImproved { prompt: String },
}

/// Everything an agent needs, threaded by reference. Agents get a read-only
/// context view plus the narrow request sink; they never touch RunContext.
pub struct AgentDeps<'a> {
    pub gateway: &'a Gateway,
    pub registry: &'a ToolRegistry,
    pub selector: &'a SchemaSelector,
    pub executor: &'a ResilientExecutor,
    pub config: &'a Config,
    pub sink: RequestSink,
    pub tool_ctx: ToolContext,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn role(&self) -> &'static str;
    async fn execute(
        &self,
        task: &mut Task,
        view: &ContextView,
        deps: &AgentDeps<'_>,
    ) -> AgentResult;
}

/// action_type -> implementation. Replaces the source's dynamic dispatch on
/// agent classes with a plain registry over a narrow interface.
pub struct AgentRegistry {
    agents: HashMap<ActionType, Box<dyn Agent>>,
}

impl AgentRegistry {
    pub fn with_defaults() -> Self {
        let mut agents: HashMap<ActionType, Box<dyn Agent>> = HashMap::new();
        for action in [
            ActionType::Read,
            ActionType::Research,
            ActionType::Analyze,
            ActionType::Review,
            ActionType::Investigate,
        ] {
            agents.insert(action, Box::new(research::ResearchAgent));
        }
        for action in [ActionType::Edit, ActionType::Add, ActionType::Create] {
            agents.insert(action, Box::new(writer::WriterAgent));
        }
        agents.insert(ActionType::Test, Box::new(test_exec::TestExecutorAgent));
        for action in [
            ActionType::Refactor,
            ActionType::Delete,
            ActionType::Debug,
            ActionType::Fix,
            ActionType::Document,
            ActionType::Tool,
            ActionType::Execute,
        ] {
            agents.insert(action, Box::new(maintenance::RoleAgent::new(action)));
        }
        Self { agents }
    }

    pub fn agent_for(&self, action: ActionType) -> Option<&dyn Agent> {
        self.agents.get(&action).map(|a| a.as_ref())
    }
}

/// What the shared single-call step produced.
pub(crate) enum StepOutcome {
    Executed {
        tool_name: String,
        outcome: ToolOutcome,
    },
    NoToolCall {
        text: String,
    },
    TransportFailure {
        detail: String,
    },
}

/// The common contract: build the frame, call the gateway ONCE, execute the
/// first (structured or recovered) tool call through the resilient executor,
/// and append the event to the task before returning.
pub(crate) async fn single_tool_step(
    task: &mut Task,
    deps: &AgentDeps<'_>,
    system_prompt: String,
    brief: String,
    allowed: &[&'static str],
) -> StepOutcome {
    let curated: Vec<ToolDefinition> = deps.registry.definitions_for(allowed);
    let selected: Vec<ToolDefinition> = deps
        .selector
        .select(deps.registry, task.action_type, &task.description)
        .into_iter()
        .filter(|d| allowed.contains(&d.name.as_str()))
        .collect();

    let system = task
        .override_system_prompt
        .clone()
        .unwrap_or(system_prompt);

    let spec = CallSpec {
        model: deps.config.provider.model.clone(),
        system: Some(system),
        messages: vec![Message::user(brief)],
        curated_tools: Some(curated),
        selected_tools: Some(selected),
        tool_choice: ToolChoice::Auto,
        supports_tools: deps.config.llm.supports_tools.unwrap_or(true),
        temperature: Some(deps.config.llm.temperature),
        max_tokens: None,
    };

    let reply = match chat_with_retry(deps.gateway, &deps.config.retry, &spec).await {
        Ok(reply) => reply,
        Err(detail) => return StepOutcome::TransportFailure { detail },
    };

    let Some(call) = reply.tool_calls.into_iter().next() else {
        return StepOutcome::NoToolCall {
            text: reply.text.unwrap_or_default(),
        };
    };

    if !allowed.contains(&call.name.as_str()) {
        return StepOutcome::NoToolCall {
            text: format!("model called disallowed tool `{}`", call.name),
        };
    }

    execute_and_record(task, deps, &call.name, call.arguments).await
}

/// Invoke one tool through the resilient executor and append the event.
pub(crate) async fn execute_and_record(
    task: &mut Task,
    deps: &AgentDeps<'_>,
    tool_name: &str,
    args: Value,
) -> StepOutcome {
    // Key includes the task identity and retry round so a retried task
    // re-executes rather than replaying a cached outcome.
    let key = digest_str(&format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
        task.task_id,
        task.retry_count,
        task.tool_events.len(),
        tool_name,
        digest(&args)
    ));

    let registry = deps.registry;
    let tool_ctx = deps.tool_ctx.clone();
    let args_for_call = args.clone();
    let exec = deps
        .executor
        .invoke_with_key(key, move || {
            let tool_ctx = tool_ctx.clone();
            let args = args_for_call.clone();
            let name = tool_name.to_string();
            async move {
                registry
                    .execute(&name, args, &tool_ctx)
                    .await
                    .map_err(|e| InvokeError::permanent(e.to_string()))
            }
        })
        .await;

    let outcome = match exec.result {
        Some(outcome) => outcome,
        None => ToolOutcome::fail(
            -1,
            exec.error.unwrap_or_else(|| "tool execution failed".into()),
            ErrorCategory::Transport,
        ),
    };

    let event = ToolEvent {
        tool_name: tool_name.to_string(),
        args_digest: digest(&args),
        result_digest: digest_str(&format!("{}{}{}", outcome.rc, outcome.stdout, outcome.stderr)),
        args,
        rc: outcome.rc,
        stdout: outcome.stdout.clone(),
        stderr: outcome.stderr.clone(),
        duration_ms: exec.total_time_ms,
        idempotency_key: exec.idempotency_key,
        error_category: outcome.category,
    };
    task.tool_events.push(event);

    StepOutcome::Executed {
        tool_name: tool_name.to_string(),
        outcome,
    }
}

/// Provider calls with bounded retry on transient errors. Shared by agents
/// and the planner.
pub(crate) async fn chat_with_retry(
    gateway: &Gateway,
    retry: &drover_config::RetrySettings,
    spec: &CallSpec,
) -> Result<GatewayReply, String> {
    let mut attempt = 0u32;
    loop {
        match gateway.chat(spec).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                if e.is_retryable() && attempt < retry.max_retries {
                    attempt += 1;
                    let wait = e
                        .retry_after_ms()
                        .unwrap_or_else(|| {
                            retry
                                .base_backoff_ms
                                .saturating_mul(2u64.saturating_pow(attempt - 1))
                        })
                        .min(retry.max_backoff_ms);
                    tracing::debug!(attempt, wait_ms = wait, error = %e, "retrying provider call");
                    tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
                    continue;
                }
                return Err(e.to_string());
            }
        }
    }
}

/// Shared tail: translate a no-tool-call situation into bounded recovery
/// then final failure, per the common agent contract.
pub(crate) fn recovery_or_failure(task: &Task, deps: &AgentDeps<'_>, detail: String) -> AgentResult {
    if task.retry_count < deps.config.limits.max_recovery_attempts {
        AgentResult::RecoveryRequested {
            reason: ErrorCategory::MalformedResponse,
            detail,
        }
    } else {
        AgentResult::FinalFailure {
            reason: format!("no usable tool call after recovery attempts: {detail}"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_action_type() {
        let registry = AgentRegistry::with_defaults();
        for action in ActionType::ALL {
            assert!(
                registry.agent_for(action).is_some(),
                "no agent registered for {action}"
            );
        }
    }

    #[test]
    fn recovery_bound_escalates_to_final_failure() {
        let harness = test_support::Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let deps = harness.deps(dir.path());

        let mut task = Task::new(ActionType::Edit, "change file");
        let result = recovery_or_failure(&task, &deps, "prose only".into());
        assert!(matches!(result, AgentResult::RecoveryRequested { .. }));

        task.retry_count = deps.config.limits.max_recovery_attempts;
        let result = recovery_or_failure(&task, &deps, "prose only".into());
        assert!(matches!(result, AgentResult::FinalFailure { .. }));
    }
}
