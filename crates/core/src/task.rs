use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dod::Dod;
use crate::error::ErrorCategory;

/// Closed vocabulary of task kinds. Each maps to exactly one specialized
/// agent in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Read,
    Research,
    Analyze,
    Review,
    Investigate,
    Edit,
    Add,
    Create,
    Refactor,
    Delete,
    Test,
    Debug,
    Fix,
    Document,
    Tool,
    Execute,
}

impl ActionType {
    pub const ALL: [ActionType; 16] = [
        ActionType::Read,
        ActionType::Research,
        ActionType::Analyze,
        ActionType::Review,
        ActionType::Investigate,
        ActionType::Edit,
        ActionType::Add,
        ActionType::Create,
        ActionType::Refactor,
        ActionType::Delete,
        ActionType::Test,
        ActionType::Debug,
        ActionType::Fix,
        ActionType::Document,
        ActionType::Tool,
        ActionType::Execute,
    ];

    /// Research-class actions count against the consecutive-read budget and
    /// may never mutate the workspace.
    pub fn is_research(&self) -> bool {
        matches!(
            self,
            ActionType::Read
                | ActionType::Research
                | ActionType::Analyze
                | ActionType::Review
                | ActionType::Investigate
        )
    }

    /// Actions whose tasks go through verification and a transaction.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            ActionType::Edit
                | ActionType::Add
                | ActionType::Create
                | ActionType::Refactor
                | ActionType::Delete
                | ActionType::Debug
                | ActionType::Fix
                | ActionType::Document
                | ActionType::Tool
                | ActionType::Execute
        )
    }

    /// Actions that remove or displace existing content outright.
    pub fn is_destructive(&self) -> bool {
        matches!(self, ActionType::Delete)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionType::Read => "read",
            ActionType::Research => "research",
            ActionType::Analyze => "analyze",
            ActionType::Review => "review",
            ActionType::Investigate => "investigate",
            ActionType::Edit => "edit",
            ActionType::Add => "add",
            ActionType::Create => "create",
            ActionType::Refactor => "refactor",
            ActionType::Delete => "delete",
            ActionType::Test => "test",
            ActionType::Debug => "debug",
            ActionType::Fix => "fix",
            ActionType::Document => "document",
            ActionType::Tool => "tool",
            ActionType::Execute => "execute",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "read" => Ok(ActionType::Read),
            "research" => Ok(ActionType::Research),
            "analyze" | "analyse" => Ok(ActionType::Analyze),
            "review" => Ok(ActionType::Review),
            "investigate" => Ok(ActionType::Investigate),
            "edit" => Ok(ActionType::Edit),
            "add" => Ok(ActionType::Add),
            "create" => Ok(ActionType::Create),
            "refactor" => Ok(ActionType::Refactor),
            "delete" => Ok(ActionType::Delete),
            "test" => Ok(ActionType::Test),
            "debug" => Ok(ActionType::Debug),
            "fix" => Ok(ActionType::Fix),
            "document" => Ok(ActionType::Document),
            "tool" => Ok(ActionType::Tool),
            "execute" => Ok(ActionType::Execute),
            other => Err(format!("unknown action type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::InProgress => 1,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked => 2,
        }
    }
}

/// Authoritative record of one tool invocation. Loop prevention and
/// file-read tracking read from these, never from parsed prose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    pub tool_name: String,
    pub args: serde_json::Value,
    pub args_digest: String,
    pub result_digest: String,
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
}

impl ToolEvent {
    /// Relative path this event targeted, when the tool takes one.
    pub fn target_path(&self) -> Option<&str> {
        self.args
            .get("path")
            .or_else(|| self.args.get("source"))
            .and_then(|v| v.as_str())
    }

    pub fn is_read(&self) -> bool {
        self.tool_name == "read_file" && self.rc == 0
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self.tool_name.as_str(),
            "write_file" | "replace_in_file" | "apply_patch" | "copy_file" | "move_file"
                | "delete_file"
        ) && self.rc == 0
    }
}

/// Stable short digest for args/results and action signatures.
pub fn digest(value: &serde_json::Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

pub fn digest_str(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Deterministic rendering: object keys sorted so logically equal argument
/// maps hash equally.
fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// The atomic unit of work. Created by the orchestrator's next-action
/// decision, executed by exactly one agent, finalized by verification and
/// the judge. Never shared across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    pub action_type: ActionType,
    pub status: TaskStatus,
    pub target_files: Vec<String>,
    pub tool_events: Vec<ToolEvent>,
    pub retry_count: u32,
    pub dod: Dod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_plan: Option<String>,
}

impl Task {
    pub fn new(action_type: ActionType, description: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            action_type,
            status: TaskStatus::Pending,
            target_files: Vec::new(),
            tool_events: Vec::new(),
            retry_count: 0,
            dod: Dod::default(),
            override_system_prompt: None,
            rollback_plan: None,
        }
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.target_files = targets;
        self
    }

    pub fn primary_target(&self) -> Option<&str> {
        self.target_files.first().map(|s| s.as_str())
    }

    /// Status moves forward only. The one sanctioned exception is
    /// [`Task::reopen_for_escalation`].
    pub fn advance_status(&mut self, next: TaskStatus) -> Result<(), String> {
        if next.rank() < self.status.rank() {
            return Err(format!(
                "illegal status transition {:?} -> {:?}",
                self.status, next
            ));
        }
        self.status = next;
        Ok(())
    }

    /// Escalation-driven rewrite: a failed task may be reopened once the
    /// orchestrator attaches a new strategy or prompt.
    pub fn reopen_for_escalation(&mut self) {
        if self.status == TaskStatus::Failed {
            self.status = TaskStatus::Pending;
            self.retry_count += 1;
        }
    }

    pub fn any_event_failed(&self) -> bool {
        self.tool_events.iter().any(|e| e.rc != 0)
    }

    /// Marking completed requires a passed verification whenever any tool
    /// event failed; read-only tasks with clean events need none.
    pub fn mark_completed(&mut self, verification_passed: Option<bool>) -> Result<(), String> {
        if self.any_event_failed() && verification_passed != Some(true) {
            return Err(format!(
                "task {} has failing tool events and no passing verification",
                self.task_id
            ));
        }
        self.advance_status(TaskStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_type_roundtrip() {
        for action in ActionType::ALL {
            let parsed: ActionType = action.to_string().parse().unwrap();
            assert_eq!(parsed, action);
        }
        assert!("summon".parse::<ActionType>().is_err());
    }

    #[test]
    fn research_and_mutating_partition() {
        assert!(ActionType::Read.is_research());
        assert!(ActionType::Investigate.is_research());
        assert!(!ActionType::Edit.is_research());
        assert!(ActionType::Edit.is_mutating());
        assert!(!ActionType::Test.is_mutating());
        assert!(ActionType::Delete.is_destructive());
        assert!(!ActionType::Edit.is_destructive());
    }

    #[test]
    fn digest_is_key_order_independent() {
        let a = json!({"path": "a.rs", "content": "x"});
        let b = json!({"content": "x", "path": "a.rs"});
        assert_eq!(digest(&a), digest(&b));
        assert_ne!(digest(&a), digest(&json!({"path": "b.rs", "content": "x"})));
    }

    #[test]
    fn status_is_monotonic() {
        let mut task = Task::new(ActionType::Edit, "change a thing");
        task.advance_status(TaskStatus::InProgress).unwrap();
        task.advance_status(TaskStatus::Failed).unwrap();
        assert!(task.advance_status(TaskStatus::Pending).is_err());
    }

    #[test]
    fn reopen_only_from_failed() {
        let mut task = Task::new(ActionType::Edit, "x");
        task.advance_status(TaskStatus::InProgress).unwrap();
        task.advance_status(TaskStatus::Failed).unwrap();
        task.reopen_for_escalation();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[test]
    fn completion_blocked_by_failing_events() {
        let mut task = Task::new(ActionType::Edit, "x");
        task.advance_status(TaskStatus::InProgress).unwrap();
        task.tool_events.push(ToolEvent {
            tool_name: "replace_in_file".into(),
            args: json!({"path": "a.rs"}),
            args_digest: "d".into(),
            result_digest: "d".into(),
            rc: 1,
            stdout: String::new(),
            stderr: "no match".into(),
            duration_ms: 1,
            idempotency_key: "k".into(),
            error_category: Some(ErrorCategory::PatchDoesNotApply),
        });
        assert!(task.mark_completed(None).is_err());
        assert!(task.mark_completed(Some(false)).is_err());
        assert!(task.mark_completed(Some(true)).is_ok());
    }

    #[test]
    fn event_target_path_extraction() {
        let event = ToolEvent {
            tool_name: "read_file".into(),
            args: json!({"path": "src/app.js"}),
            args_digest: String::new(),
            result_digest: String::new(),
            rc: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            idempotency_key: String::new(),
            error_category: None,
        };
        assert_eq!(event.target_path(), Some("src/app.js"));
        assert!(event.is_read());
    }
}
