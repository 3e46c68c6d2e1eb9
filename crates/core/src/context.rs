use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::task::{digest_str, ActionType, Task, TaskStatus};

/// Structured message surfaced to the next-action prompt to constrain or
/// redirect planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub kind: AgentRequestKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRequestKind {
    ResearchBudgetExhausted,
    RedundantFileRead,
    EditStrategyEscalation,
    AdaptivePromptImproved,
    MissingTargetFile,
    FileNotFound,
    DestructiveConflict,
    ActionBlocked,
    ImportWarning,
}

impl AgentRequest {
    pub fn new(kind: AgentRequestKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Rendering used inside the planner prompt, e.g.
    /// `RESEARCH_BUDGET_EXHAUSTED: propose an action-class task`.
    pub fn render(&self) -> String {
        let kind = serde_json::to_string(&self.kind).unwrap_or_default();
        format!("{}: {}", kind.trim_matches('"'), self.detail)
    }
}

/// Content hash of (action_type, target, normalized intent). Once blocked,
/// the orchestrator must never dispatch the same proposal again.
pub fn action_signature(action: ActionType, target: &str, intent: &str) -> String {
    let normalized: String = intent
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    digest_str(&format!("{action}\u{1f}{target}\u{1f}{normalized}"))
}

/// Narrow write handle agents receive instead of the whole context. The
/// orchestrator drains it after each dispatch, keeping RunContext
/// single-writer.
#[derive(Clone, Default)]
pub struct RequestSink(Arc<Mutex<Vec<AgentRequest>>>);

impl RequestSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: AgentRequest) {
        self.0.lock().expect("request sink lock").push(request);
    }

    pub fn drain(&self) -> Vec<AgentRequest> {
        std::mem::take(&mut *self.0.lock().expect("request sink lock"))
    }
}

/// Small key-value store feeding the test executor's skip heuristics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub last_test_iteration: Option<u32>,
    pub last_test_rc: Option<i32>,
    pub last_code_change_iteration: Option<u32>,
}

/// Process-wide state for one user request. Mutated by the orchestrator
/// thread only; agents see immutable [`ContextView`] snapshots.
pub struct RunContext {
    pub run_id: String,
    pub workspace_root: PathBuf,
    /// Append-only; tasks are appended as the orchestrator decides them.
    pub plan: Vec<Task>,
    pub completed_work_summary: String,
    pub consecutive_reads: u32,
    pub blocked_action_signatures: HashSet<String>,
    pub agent_requests: VecDeque<AgentRequest>,
    pub agent_state: AgentState,
    /// Failure signature -> repeat count, for escalation.
    pub failure_counts: HashMap<String, u32>,
    /// Failure signature -> adaptive prompt improvements spent.
    pub prompt_improvements: HashMap<String, u32>,
    pub step: u32,
}

impl RunContext {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            workspace_root,
            plan: Vec::new(),
            completed_work_summary: String::new(),
            consecutive_reads: 0,
            blocked_action_signatures: HashSet::new(),
            agent_requests: VecDeque::new(),
            agent_state: AgentState::default(),
            failure_counts: HashMap::new(),
            prompt_improvements: HashMap::new(),
            step: 0,
        }
    }

    /// Completed reads per relative path, derived from tool events. The
    /// authoritative source for the redundant-read guard.
    pub fn file_read_counts(&self) -> HashMap<String, u32> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for task in self
            .plan
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
        {
            for event in &task.tool_events {
                if event.is_read() {
                    if let Some(path) = event.target_path() {
                        *counts.entry(path.to_string()).or_default() += 1;
                    }
                }
            }
        }
        counts
    }

    pub fn reads_of(&self, path: &str) -> u32 {
        self.file_read_counts().get(path).copied().unwrap_or(0)
    }

    /// Successful mutations of a path across all tasks. A modified file may
    /// be read again without tripping the redundancy guard.
    pub fn modifications_of(&self, path: &str) -> u32 {
        self.plan
            .iter()
            .flat_map(|t| t.tool_events.iter())
            .filter(|e| e.is_mutation() && e.target_path() == Some(path))
            .count() as u32
    }

    /// Reads of a path that happened after its most recent mutation.
    pub fn reads_since_last_modification(&self, path: &str) -> u32 {
        let mut reads = 0u32;
        for task in &self.plan {
            for event in &task.tool_events {
                if event.target_path() != Some(path) {
                    continue;
                }
                if event.is_mutation() {
                    reads = 0;
                } else if event.is_read() && task.status == TaskStatus::Completed {
                    reads += 1;
                }
            }
        }
        reads
    }

    pub fn push_request(&mut self, request: AgentRequest) {
        tracing::debug!(kind = ?request.kind, detail = %request.detail, "agent request");
        self.agent_requests.push_back(request);
    }

    /// Drain pending requests for inclusion in the next planner prompt.
    pub fn take_requests(&mut self) -> Vec<AgentRequest> {
        self.agent_requests.drain(..).collect()
    }

    /// Paths touched by tasks within the last `window` steps, newest first.
    pub fn recently_touched_files(&self, window: usize) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for task in self.plan.iter().rev().take(window) {
            for event in task.tool_events.iter().rev() {
                if let Some(path) = event.target_path() {
                    if seen.insert(path.to_string()) {
                        files.push(path.to_string());
                    }
                }
            }
        }
        files
    }

    pub fn view(&self) -> ContextView {
        ContextView {
            workspace_root: self.workspace_root.clone(),
            completed_work_summary: self.completed_work_summary.clone(),
            agent_state: self.agent_state,
            step: self.step,
        }
    }
}

/// Read-only snapshot handed to agents.
#[derive(Debug, Clone)]
pub struct ContextView {
    pub workspace_root: PathBuf,
    pub completed_work_summary: String,
    pub agent_state: AgentState,
    pub step: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ToolEvent;
    use serde_json::json;

    fn read_event(path: &str) -> ToolEvent {
        ToolEvent {
            tool_name: "read_file".into(),
            args: json!({"path": path}),
            args_digest: String::new(),
            result_digest: String::new(),
            rc: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            idempotency_key: String::new(),
            error_category: None,
        }
    }

    fn write_event(path: &str) -> ToolEvent {
        ToolEvent {
            tool_name: "write_file".into(),
            args: json!({"path": path}),
            ..read_event(path)
        }
    }

    fn completed_task_with(events: Vec<ToolEvent>) -> Task {
        let mut task = Task::new(ActionType::Read, "look at file");
        task.advance_status(TaskStatus::InProgress).unwrap();
        task.tool_events = events;
        task.advance_status(TaskStatus::Completed).unwrap();
        task
    }

    #[test]
    fn read_counts_derive_from_completed_tasks_only() {
        let mut ctx = RunContext::new(PathBuf::from("/tmp/w"));
        ctx.plan
            .push(completed_task_with(vec![read_event("app.js")]));
        ctx.plan
            .push(completed_task_with(vec![read_event("app.js")]));

        let mut pending = Task::new(ActionType::Read, "another read");
        pending.tool_events.push(read_event("app.js"));
        ctx.plan.push(pending);

        assert_eq!(ctx.reads_of("app.js"), 2);
    }

    #[test]
    fn modification_resets_read_window() {
        let mut ctx = RunContext::new(PathBuf::from("/tmp/w"));
        ctx.plan
            .push(completed_task_with(vec![read_event("lib.rs")]));
        ctx.plan
            .push(completed_task_with(vec![read_event("lib.rs")]));
        ctx.plan
            .push(completed_task_with(vec![write_event("lib.rs")]));
        ctx.plan
            .push(completed_task_with(vec![read_event("lib.rs")]));

        assert_eq!(ctx.reads_of("lib.rs"), 3);
        assert_eq!(ctx.reads_since_last_modification("lib.rs"), 1);
    }

    #[test]
    fn action_signature_normalizes_intent() {
        let a = action_signature(ActionType::Read, "app.js", "Read   the FILE");
        let b = action_signature(ActionType::Read, "app.js", "read the file");
        let c = action_signature(ActionType::Edit, "app.js", "read the file");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sink_drains_in_order() {
        let sink = RequestSink::new();
        sink.push(AgentRequest::new(AgentRequestKind::FileNotFound, "a"));
        sink.push(AgentRequest::new(AgentRequestKind::ImportWarning, "b"));
        let drained = sink.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, AgentRequestKind::FileNotFound);
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn recently_touched_files_newest_first_deduped() {
        let mut ctx = RunContext::new(PathBuf::from("/tmp/w"));
        ctx.plan
            .push(completed_task_with(vec![read_event("a.rs"), read_event("b.rs")]));
        ctx.plan
            .push(completed_task_with(vec![read_event("b.rs"), read_event("c.rs")]));
        let files = ctx.recently_touched_files(5);
        assert_eq!(files, vec!["c.rs", "b.rs", "a.rs"]);
    }
}
