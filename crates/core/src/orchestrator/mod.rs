pub mod analysis;
pub mod guardrails;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use drover_config::{Config, DodSource};
use drover_provider::{CallSpec, Gateway, Message, Provider};

use crate::agents::{chat_with_retry, AgentDeps, AgentRegistry, AgentResult};
use crate::cancel::CancelFlag;
use crate::context::{
    action_signature, AgentRequest, AgentRequestKind, RequestSink, RunContext,
};
use crate::dod;
use crate::error::ErrorCategory;
use crate::escalation;
use crate::frame::{Frame, DEFAULT_KEEP_RECENT, DEFAULT_MAX_MESSAGES};
use crate::judge::{CritJudge, GateVerdict};
use crate::prompt;
use crate::resilient::{IdempotencyCache, ResilientExecutor, RetryPolicy};
use crate::selector::SchemaSelector;
use crate::session::{save_summary, SessionSummary, SessionTracker};
use crate::task::{ActionType, Task, TaskStatus};
use crate::tools::{default_registry, ToolContext, ToolRegistry};
use crate::transaction::{TransactionManager, TxnRecord, TxnState};
use crate::verification::{VerificationPipeline, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    GoalAchieved,
    BudgetExhausted,
    Failed,
    Cancelled,
}

pub struct RunOutcome {
    pub status: RunStatus,
    pub summary: SessionSummary,
    pub summary_path: Option<PathBuf>,
}

/// What the planner answered when asked "what's next?".
#[derive(Debug, Clone, PartialEq)]
enum NextAction {
    GoalAchieved,
    Proposal {
        action: ActionType,
        description: String,
        targets: Vec<String>,
    },
}

/// Parse the strict ACTION/DESCRIPTION/TARGETS reply form.
fn parse_next_action(text: &str) -> Option<NextAction> {
    if text.lines().any(|l| l.trim() == "GOAL_ACHIEVED") {
        return Some(NextAction::GoalAchieved);
    }

    let mut action = None;
    let mut description = None;
    let mut targets = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("ACTION:") {
            action = rest.trim().parse::<ActionType>().ok();
        } else if let Some(rest) = line.strip_prefix("DESCRIPTION:") {
            description = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("TARGETS:") {
            targets = rest
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
    }

    Some(NextAction::Proposal {
        action: action?,
        description: description.filter(|d| !d.is_empty())?,
        targets,
    })
}

/// The top-level controller: drives a run from the user request to goal
/// achievement, one task at a time, with guardrails, verification,
/// transactions, and the judge between every step.
pub struct Orchestrator {
    config: Config,
    workspace_root: PathBuf,
    gateway: Gateway,
    registry: ToolRegistry,
    selector: SchemaSelector,
    executor: ResilientExecutor,
    agents: AgentRegistry,
    judge: CritJudge,
    pipeline: VerificationPipeline,
    cancel: CancelFlag,
}

impl Orchestrator {
    pub fn new(config: Config, provider: Arc<dyn Provider>, workspace_root: PathBuf) -> Self {
        let registry = default_registry();
        let gateway = Gateway::new(provider).with_default_tools(registry.definitions());
        let cache_path = workspace_root.join(".drover").join("idempotency.json");
        let executor = ResilientExecutor::new(
            RetryPolicy::from_settings(&config.retry),
            IdempotencyCache::persistent(cache_path),
        );
        let pipeline = VerificationPipeline::new(config.timeouts.run_tests_secs);
        let judge = CritJudge::new(config.judge.clone());

        Self {
            config,
            workspace_root,
            gateway,
            registry,
            selector: SchemaSelector,
            executor,
            agents: AgentRegistry::with_defaults(),
            judge,
            pipeline,
            cancel: CancelFlag::new(),
        }
    }

    /// In-memory variant for tests and one-shot runs.
    pub fn new_ephemeral(
        config: Config,
        provider: Arc<dyn Provider>,
        workspace_root: PathBuf,
    ) -> Self {
        let mut orchestrator = Self::new(config.clone(), provider, workspace_root);
        orchestrator.executor = ResilientExecutor::new(
            RetryPolicy::from_settings(&config.retry),
            IdempotencyCache::in_memory(),
        );
        orchestrator
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn run(&self, request: &str) -> Result<RunOutcome> {
        let mut ctx = RunContext::new(self.workspace_root.clone());
        let mut txn_manager = TransactionManager::new(self.workspace_root.clone());
        let mut tracker = SessionTracker::new(&ctx.run_id);
        let sink = RequestSink::new();

        // One-time request analysis: repo context and literal references.
        // No tasks are created here.
        let repo = analysis::analyze(&self.workspace_root, request);
        tracing::info!(run_id = %ctx.run_id, "run started");

        let mut planner_frame = Frame::new();
        planner_frame.push(Message::system(
            "You are the planning brain of an autonomous coding agent. You decide one \
             task at a time and never plan batches in advance.",
        ));

        let max_steps = self.config.limits.effective_max_steps();
        let iteration_ceiling = max_steps.saturating_mul(5);
        let mut iterations = 0u32;
        let mut planner_misfires = 0u32;
        let mut pending: VecDeque<Task> = VecDeque::new();
        let mut status = RunStatus::BudgetExhausted;

        while ctx.step < max_steps {
            iterations += 1;
            if iterations > iteration_ceiling {
                tracing::warn!("iteration ceiling hit; stopping run");
                status = RunStatus::Failed;
                break;
            }
            if self.cancel.check().is_err() {
                status = RunStatus::Cancelled;
                break;
            }

            // 1. Next task: injected follow-ups first, then the planner.
            let mut task = match pending.pop_front() {
                Some(task) => task,
                None => {
                    match self
                        .plan_next(request, &repo, &mut ctx, &mut planner_frame, &mut tracker)
                        .await
                    {
                        PlannerStep::Task(task) => {
                            planner_misfires = 0;
                            task
                        }
                        PlannerStep::GoalAchieved => {
                            status = RunStatus::GoalAchieved;
                            break;
                        }
                        PlannerStep::Misfire => {
                            planner_misfires += 1;
                            if planner_misfires >= 3 {
                                tracker.record_error("planner reply unparseable 3 times");
                                status = RunStatus::Failed;
                                break;
                            }
                            continue;
                        }
                        PlannerStep::Transport(detail) => {
                            tracker.record_error(detail);
                            status = RunStatus::Failed;
                            break;
                        }
                    }
                }
            };

            // 2. Guardrails. Refusals surface as agent requests and never
            // consume a step.
            let pending_snapshot: Vec<Task> = pending.iter().cloned().collect();
            if let Err(refusal) =
                guardrails::check(&task, &ctx, &self.config.limits, &pending_snapshot)
            {
                tracing::info!(kind = ?refusal.request.kind, "guardrail refused task");
                ctx.push_request(refusal.request);
                if let Some(signature) = refusal.block_signature {
                    ctx.blocked_action_signatures.insert(signature);
                }
                continue;
            }

            // 3. Destructive policy, then the plan gate.
            if task.action_type.is_destructive() && !self.config.auto_approve_destructive {
                ctx.push_request(AgentRequest::new(
                    AgentRequestKind::ActionBlocked,
                    "destructive operations are not auto-approved in this run; convert the \
                     step to a non-destructive alternative (e.g. copy instead of delete)",
                ));
                continue;
            }
            if task.action_type.is_destructive() && task.rollback_plan.is_none() {
                task.rollback_plan =
                    Some("abort the open transaction to restore the pre-task snapshot".into());
            }
            let plan_judgement = self.judge.review_plan(&task, &ctx);
            if !plan_judgement.approved() {
                tracing::info!(verdict = ?plan_judgement.verdict, "plan gate refused task");
                let questions = self
                    .judge
                    .socratic_questions(
                        &self.gateway,
                        &self.config.provider.model,
                        &task,
                        &plan_judgement,
                    )
                    .await;
                let mut detail = format!("plan rejected: {}", plan_judgement.concerns.join("; "));
                if !questions.is_empty() {
                    detail.push_str(&format!(" | consider: {}", questions.join(" ")));
                }
                ctx.push_request(AgentRequest::new(AgentRequestKind::ActionBlocked, detail));
                if plan_judgement.verdict == GateVerdict::Rejected {
                    ctx.blocked_action_signatures.insert(action_signature(
                        task.action_type,
                        task.primary_target().unwrap_or(""),
                        &task.description,
                    ));
                }
                continue;
            }

            // 4. Dispatch to the specialized agent inside a transaction.
            if task.status == TaskStatus::Pending {
                let _ = task.advance_status(TaskStatus::InProgress);
            }
            let txn = task
                .action_type
                .is_mutating()
                .then(|| txn_manager.begin(&task.task_id));

            let mut tool_ctx = ToolContext::new(self.workspace_root.clone());
            tool_ctx.cancel = self.cancel.clone();
            tool_ctx.run_cmd_timeout_secs = self.config.timeouts.run_cmd_secs;
            tool_ctx.run_tests_timeout_secs = self.config.timeouts.run_tests_secs;
            if let Some(txn) = &txn {
                tool_ctx = tool_ctx.with_txn(txn.clone());
            }

            let deps = AgentDeps {
                gateway: &self.gateway,
                registry: &self.registry,
                selector: &self.selector,
                executor: &self.executor,
                config: &self.config,
                sink: sink.clone(),
                tool_ctx,
            };

            let agent = self
                .agents
                .agent_for(task.action_type)
                .expect("registry covers every action type");
            let view = ctx.view();
            let result = agent.execute(&mut task, &view, &deps).await;

            for request in sink.drain() {
                ctx.push_request(request);
            }

            if self.cancel.is_cancelled() {
                if let Some(txn) = &txn {
                    let _ = txn_manager.abort(txn);
                }
                let _ = task.advance_status(TaskStatus::Failed);
                tracker.record_task(&task);
                ctx.plan.push(task);
                status = RunStatus::Cancelled;
                break;
            }

            // 5. React to the agent's tagged result.
            match result {
                AgentResult::Success => {
                    self.finish_dispatched_task(
                        task,
                        txn,
                        &mut ctx,
                        &mut txn_manager,
                        &mut tracker,
                        &mut pending,
                    )
                    .await;
                }
                AgentResult::RecoveryRequested { reason, detail } => {
                    if let Some(txn) = &txn {
                        let _ = txn_manager.abort(txn);
                    }
                    match reason {
                        ErrorCategory::MissingTarget | ErrorCategory::FileNotFound => {
                            // Pre-check failure: the planner must reword or
                            // re-route; re-dispatching as-is cannot help.
                            let kind = if reason == ErrorCategory::MissingTarget {
                                AgentRequestKind::MissingTargetFile
                            } else {
                                AgentRequestKind::FileNotFound
                            };
                            ctx.push_request(AgentRequest::new(kind, detail));
                            let _ = task.advance_status(TaskStatus::Failed);
                            tracker.record_task(&task);
                            ctx.plan.push(task);
                        }
                        _ => {
                            // Malformed response: retry the same task with a
                            // bumped counter, without consuming a step.
                            task.retry_count += 1;
                            tracing::debug!(retry = task.retry_count, "re-dispatching after recovery request");
                            pending.push_front(task);
                        }
                    }
                }
                AgentResult::FinalFailure { reason } => {
                    if let Some(txn) = &txn {
                        let _ = txn_manager.abort(txn);
                    }
                    tracker.record_error(reason.clone());
                    self.record_event_failures(&task, &mut ctx);
                    let _ = task.advance_status(TaskStatus::Failed);
                    ctx.consecutive_reads = if task.action_type.is_research() {
                        ctx.consecutive_reads + 1
                    } else {
                        0
                    };
                    tracker.record_task(&task);
                    ctx.plan.push(task);
                    ctx.step += 1;
                }
                AgentResult::PromptImproved { prompt } => {
                    if let Some(txn) = &txn {
                        let _ = txn_manager.abort(txn);
                    }
                    task.override_system_prompt = Some(prompt);
                    task.retry_count += 1;
                    ctx.push_request(AgentRequest::new(
                        AgentRequestKind::AdaptivePromptImproved,
                        format!("retrying `{}` with an improved prompt", task.description),
                    ));
                    pending.push_front(task);
                }
            }

            ctx.completed_work_summary = tracker.synthetic_summary();
        }

        if self.cancel.is_cancelled() {
            status = RunStatus::Cancelled;
        }

        let success = status == RunStatus::GoalAchieved;
        let summary = tracker.finalize(success);
        let summary_path = save_summary(&self.workspace_root, &summary)
            .map_err(|e| tracing::warn!(error = %e, "failed to persist session summary"))
            .ok();

        tracing::info!(?status, "run finished");
        Ok(RunOutcome {
            status,
            summary,
            summary_path,
        })
    }

    /// Ask the planner for the single next task, in text-only mode.
    async fn plan_next(
        &self,
        request: &str,
        repo: &analysis::RepoAnalysis,
        ctx: &mut RunContext,
        frame: &mut Frame,
        tracker: &mut SessionTracker,
    ) -> PlannerStep {
        let token_budget = (self.config.llm.context_window as usize / 4).max(2000);
        if frame.needs_compaction(DEFAULT_MAX_MESSAGES, token_budget) {
            frame.compact(&tracker.synthetic_summary(), DEFAULT_KEEP_RECENT);
        }

        let requests = ctx.take_requests();
        let user_prompt = prompt::planner_prompt(
            request,
            &repo.context,
            &ctx.completed_work_summary,
            &self.file_snapshot(ctx),
            &requests,
        );
        tracker.record_message(user_prompt.len());
        frame.push(Message::user(user_prompt));

        let mut spec = CallSpec::text_only(
            &self.config.provider.model,
            None,
            frame.messages().to_vec(),
        );
        spec.temperature = Some(self.config.llm.temperature);

        let reply = match chat_with_retry(&self.gateway, &self.config.retry, &spec).await {
            Ok(reply) => reply,
            Err(detail) => return PlannerStep::Transport(detail),
        };

        let text = reply.text.unwrap_or_default();
        frame.push(Message::assistant(text.clone()));
        tracker.record_message(text.len());

        match parse_next_action(&text) {
            Some(NextAction::GoalAchieved) => PlannerStep::GoalAchieved,
            Some(NextAction::Proposal {
                action,
                description,
                targets,
            }) => {
                let mut task = Task::new(action, description).with_targets(targets);
                task.dod = match self.config.dod.source {
                    DodSource::Heuristic => {
                        dod::heuristic_dod(action, &task.description, &task.target_files)
                    }
                    DodSource::Llm => dod::llm_dod(
                        &self.gateway,
                        &self.config.provider.model,
                        action,
                        &task.description,
                        &task.target_files,
                    )
                    .await
                    .unwrap_or_else(|_| {
                        dod::heuristic_dod(action, &task.description, &task.target_files)
                    }),
                };
                PlannerStep::Task(task)
            }
            None => {
                tracing::debug!(reply = %text, "planner reply unparseable");
                PlannerStep::Misfire
            }
        }
    }

    /// Current content of recently touched files, truncated, for the
    /// planner prompt.
    fn file_snapshot(&self, ctx: &RunContext) -> String {
        let mut sections = Vec::new();
        for path in ctx.recently_touched_files(3).into_iter().take(3) {
            let absolute = self.workspace_root.join(&path);
            let Ok(content) = std::fs::read_to_string(&absolute) else {
                continue;
            };
            let lines: Vec<&str> = content.lines().take(40).collect();
            sections.push(format!("--- {path} ---\n{}", lines.join("\n")));
        }
        sections.join("\n")
    }

    /// Success path: no-op detection, verification, the claim and merge
    /// gates, transaction finalization, bookkeeping.
    #[allow(clippy::too_many_arguments)]
    async fn finish_dispatched_task(
        &self,
        mut task: Task,
        txn: Option<crate::transaction::TransactionHandle>,
        ctx: &mut RunContext,
        txn_manager: &mut TransactionManager,
        tracker: &mut SessionTracker,
        pending: &mut VecDeque<Task>,
    ) {
        for event in &task.tool_events {
            tracker.record_event(event);
        }

        // A mutating task that never mutated anything is the adaptive
        // prompt optimizer's trigger, not a verification question.
        if task.action_type.is_mutating() && escalation::mutation_was_noop(&task) {
            if let Some(txn) = &txn {
                let _ = txn_manager.abort(txn);
            }
            let current_prompt = task.override_system_prompt.clone().unwrap_or_else(|| {
                prompt::role_system_prompt(task.action_type, self.config.llm.ultrathink)
            });
            let improved = escalation::improve_prompt(
                &self.gateway,
                &self.config.provider.model,
                ctx,
                &task,
                &current_prompt,
                self.config.limits.max_prompt_improvements,
            )
            .await;

            match improved {
                Some(new_prompt) => {
                    let _ = task.advance_status(TaskStatus::Failed);
                    task.reopen_for_escalation();
                    task.override_system_prompt = Some(new_prompt);
                    ctx.push_request(AgentRequest::new(
                        AgentRequestKind::AdaptivePromptImproved,
                        format!(
                            "`{}` performed no mutation; retrying with an improved prompt",
                            task.description
                        ),
                    ));
                    pending.push_front(task);
                    // No step advance: the improved retry replaces this one.
                }
                None => {
                    let _ = task.advance_status(TaskStatus::Failed);
                    self.record_event_failures(&task, ctx);
                    tracker.record_task(&task);
                    ctx.consecutive_reads = 0;
                    ctx.plan.push(task);
                    ctx.step += 1;
                }
            }
            return;
        }

        // Verification for mutating tasks.
        let verdict = if task.action_type.is_mutating() {
            let modified: Vec<String> = task
                .tool_events
                .iter()
                .filter(|e| e.is_mutation())
                .filter_map(|e| e.target_path().map(|p| p.to_string()))
                .collect();
            let report = self
                .pipeline
                .verify(&task, &modified, &self.workspace_root, &self.cancel)
                .await;
            tracing::debug!(overall = ?report.overall(), "verification finished");
            Some(report)
        } else {
            None
        };

        self.record_event_failures(&task, ctx);

        let overall = verdict.as_ref().map(|r| r.overall());
        let mut completed = false;

        match overall {
            Some(Verdict::Failed) => {
                if let Some(txn) = &txn {
                    let _ = txn_manager.abort(txn);
                }
                if let Some(report) = &verdict {
                    tracker.record_error(report.summary());
                }
                let _ = task.advance_status(TaskStatus::Failed);
            }
            Some(Verdict::Passed) | Some(Verdict::Inconclusive) => {
                let report = verdict.as_ref().expect("mutating verdict present");
                let claim = self.judge.review_claim(&task, report);
                let merge_ok = if claim.verdict == GateVerdict::Rejected {
                    ctx.push_request(AgentRequest::new(
                        AgentRequestKind::ActionBlocked,
                        format!("completion claim rejected: {}", claim.concerns.join("; ")),
                    ));
                    false
                } else if let Some(txn_handle) = &txn {
                    let provisional = TxnRecord {
                        task_id: task.task_id.clone(),
                        state: TxnState::Committed,
                        touched: txn_handle
                            .lock()
                            .expect("transaction lock")
                            .touched_paths(&self.workspace_root),
                    };
                    let merge = self.judge.review_merge(&task, report, &provisional, ctx);
                    if merge.verdict == GateVerdict::Rejected {
                        ctx.push_request(AgentRequest::new(
                            AgentRequestKind::ActionBlocked,
                            format!("merge rejected: {}", merge.concerns.join("; ")),
                        ));
                        false
                    } else {
                        for concern in &merge.concerns {
                            tracing::warn!(%concern, "merge gate concern");
                        }
                        true
                    }
                } else {
                    true
                };

                if merge_ok {
                    if let Some(txn) = &txn {
                        let _ = txn_manager.commit(txn);
                    }
                    let verification_passed = overall == Some(Verdict::Passed);
                    if task.mark_completed(Some(verification_passed)).is_ok() {
                        completed = true;
                    } else {
                        let _ = task.advance_status(TaskStatus::Failed);
                    }

                    // Inconclusive edit: inject a test task immediately; its
                    // outcome decides continue-vs-replan.
                    if overall == Some(Verdict::Inconclusive) && completed {
                        pending.push_front(self.synthesize_test_task(&task));
                    }
                } else {
                    if let Some(txn) = &txn {
                        let _ = txn_manager.abort(txn);
                    }
                    let _ = task.advance_status(TaskStatus::Failed);
                }
            }
            None => {
                // Research, test, and other non-mutating tasks: completion
                // requires clean tool events.
                if task.mark_completed(None).is_ok() {
                    completed = true;
                } else {
                    let _ = task.advance_status(TaskStatus::Failed);
                }
            }
        }

        // Bookkeeping: counters, agent state, plan, step.
        if task.action_type.is_research() {
            ctx.consecutive_reads += 1;
        } else {
            ctx.consecutive_reads = 0;
        }

        if task.action_type == ActionType::Test {
            if let Some(test_event) = task
                .tool_events
                .iter()
                .rev()
                .find(|e| matches!(e.tool_name.as_str(), "run_tests" | "run_cmd"))
            {
                ctx.agent_state.last_test_iteration = Some(ctx.step);
                ctx.agent_state.last_test_rc = Some(test_event.rc);
            }
        }
        if completed && task.tool_events.iter().any(|e| e.is_mutation()) {
            ctx.agent_state.last_code_change_iteration = Some(ctx.step);
        }

        tracker.record_task(&task);
        ctx.plan.push(task);
        ctx.step += 1;
    }

    /// Count failed tool events into failure signatures; a signature that
    /// reaches the cap emits a strategy escalation and resets.
    fn record_event_failures(&self, task: &Task, ctx: &mut RunContext) {
        let failures: Vec<(String, ErrorCategory)> = task
            .tool_events
            .iter()
            .filter(|e| e.rc != 0)
            .filter_map(|e| {
                e.error_category
                    .map(|c| (e.target_path().unwrap_or("").to_string(), c))
            })
            .collect();
        for (target, category) in failures {
            let escalated = escalation::record_failure(
                ctx,
                task.action_type,
                &target,
                category,
                self.config.limits.max_failure_signature_repeats,
            );
            if let Some(request) = escalated {
                ctx.push_request(request);
            }
        }
    }

    /// Follow-up test task for an inconclusive edit, with the command
    /// chosen by manifest heuristic at execution time.
    fn synthesize_test_task(&self, edit_task: &Task) -> Task {
        let command = crate::verification::detect_test_command(&self.workspace_root);
        let description = match &command {
            Some(command) => format!(
                "Run `{command}` to validate the change from: {}",
                edit_task.description
            ),
            None => format!("Run the test suite to validate: {}", edit_task.description),
        };
        let mut task = Task::new(ActionType::Test, description);
        task.dod = dod::heuristic_dod(ActionType::Test, &task.description, &[]);
        task
    }
}

enum PlannerStep {
    Task(Task),
    GoalAchieved,
    Misfire,
    Transport(String),
}
