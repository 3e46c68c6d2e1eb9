use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskStatus, ToolEvent};

/// One JSON file per completed run, written atomically under
/// `<workspace>/.drover/sessions/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: i64,
    pub tasks_completed: Vec<String>,
    pub tasks_failed: Vec<String>,
    pub tools_used: BTreeMap<String, u32>,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_deleted: Vec<String>,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub commits_made: Vec<String>,
    pub message_count: u32,
    pub tokens_estimated: u64,
    pub success: bool,
    pub error_messages: Vec<String>,
}

/// Accumulates what happened during one run. Everything here is derived
/// from tool events and task outcomes, never from model prose.
pub struct SessionTracker {
    session_id: String,
    start_time: DateTime<Utc>,
    tasks_completed: Vec<String>,
    tasks_failed: Vec<String>,
    tools_used: BTreeMap<String, u32>,
    files_created: BTreeSet<String>,
    files_modified: BTreeSet<String>,
    files_deleted: BTreeSet<String>,
    tests_run: u32,
    tests_passed: u32,
    tests_failed: u32,
    commits_made: Vec<String>,
    message_count: u32,
    tokens_estimated: u64,
    error_messages: Vec<String>,
}

impl SessionTracker {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            start_time: Utc::now(),
            tasks_completed: Vec::new(),
            tasks_failed: Vec::new(),
            tools_used: BTreeMap::new(),
            files_created: BTreeSet::new(),
            files_modified: BTreeSet::new(),
            files_deleted: BTreeSet::new(),
            tests_run: 0,
            tests_passed: 0,
            tests_failed: 0,
            commits_made: Vec::new(),
            message_count: 0,
            tokens_estimated: 0,
            error_messages: Vec::new(),
        }
    }

    pub fn record_event(&mut self, event: &ToolEvent) {
        *self.tools_used.entry(event.tool_name.clone()).or_default() += 1;

        if let Some(category) = &event.error_category {
            self.error_messages
                .push(format!("{}: {category}", event.tool_name));
        }

        if event.rc != 0 && !matches!(event.tool_name.as_str(), "run_tests") {
            return;
        }

        match event.tool_name.as_str() {
            "write_file" => {
                if let Some(path) = event.target_path() {
                    // The tool reports "Created ..." vs "Updated ..." in its
                    // stdout; that is tool output, not model prose.
                    if event.stdout.starts_with("Created") {
                        self.files_created.insert(path.to_string());
                    } else {
                        self.files_modified.insert(path.to_string());
                    }
                }
            }
            "replace_in_file" | "apply_patch" => {
                if let Some(path) = event.target_path() {
                    self.files_modified.insert(path.to_string());
                }
            }
            "delete_file" => {
                if let Some(path) = event.target_path() {
                    self.files_deleted.insert(path.to_string());
                }
            }
            "run_tests" => {
                self.tests_run += 1;
                if event.rc == 0 {
                    self.tests_passed += 1;
                } else {
                    self.tests_failed += 1;
                }
            }
            "git_commit" => {
                if let Some(message) = event.args.get("message").and_then(|v| v.as_str()) {
                    self.commits_made.push(message.to_string());
                }
            }
            _ => {}
        }
    }

    pub fn record_task(&mut self, task: &Task) {
        let label = format!("{}: {}", task.action_type, task.description);
        match task.status {
            TaskStatus::Completed => self.tasks_completed.push(label),
            TaskStatus::Failed | TaskStatus::Blocked => self.tasks_failed.push(label),
            _ => {}
        }
    }

    /// chars/4, accumulated per message sent to the provider. Approximate.
    pub fn record_message(&mut self, chars: usize) {
        self.message_count += 1;
        self.tokens_estimated += (chars / 4) as u64;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
    }

    /// Compact text used as the synthetic summary during frame compaction
    /// and as the rolling completed-work summary.
    pub fn synthetic_summary(&self) -> String {
        let tools: Vec<String> = self
            .tools_used
            .iter()
            .map(|(name, count)| format!("{name}x{count}"))
            .collect();
        let mut lines = vec![
            format!("Tasks completed ({}):", self.tasks_completed.len()),
        ];
        for task in self.tasks_completed.iter().rev().take(10).rev() {
            lines.push(format!("  - {task}"));
        }
        if !self.tasks_failed.is_empty() {
            lines.push(format!("Tasks failed ({}):", self.tasks_failed.len()));
            for task in &self.tasks_failed {
                lines.push(format!("  - {task}"));
            }
        }
        lines.push(format!("Tools used: {}", tools.join(", ")));
        if !self.files_modified.is_empty() || !self.files_created.is_empty() {
            let mut touched: Vec<&String> = self
                .files_created
                .iter()
                .chain(self.files_modified.iter())
                .collect();
            touched.sort();
            touched.dedup();
            lines.push(format!(
                "Files touched: {}",
                touched
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        lines.push(format!(
            "Tests run: {} ({} passed, {} failed)",
            self.tests_run, self.tests_passed, self.tests_failed
        ));
        if !self.error_messages.is_empty() {
            lines.push(format!("Recent errors: {}", self.error_messages.len()));
        }
        lines.join("\n")
    }

    pub fn finalize(&self, success: bool) -> SessionSummary {
        let end_time = Utc::now();
        SessionSummary {
            session_id: self.session_id.clone(),
            start_time: self.start_time,
            end_time,
            duration_seconds: (end_time - self.start_time).num_seconds(),
            tasks_completed: self.tasks_completed.clone(),
            tasks_failed: self.tasks_failed.clone(),
            tools_used: self.tools_used.clone(),
            files_created: self.files_created.iter().cloned().collect(),
            files_modified: self.files_modified.iter().cloned().collect(),
            files_deleted: self.files_deleted.iter().cloned().collect(),
            tests_run: self.tests_run,
            tests_passed: self.tests_passed,
            tests_failed: self.tests_failed,
            commits_made: self.commits_made.clone(),
            message_count: self.message_count,
            tokens_estimated: self.tokens_estimated,
            success,
            error_messages: self.error_messages.clone(),
        }
    }
}

/// Atomic write: temp file in the same directory, then rename.
pub fn save_summary(workspace_root: &Path, summary: &SessionSummary) -> Result<PathBuf> {
    let dir = workspace_root.join(".drover").join("sessions");
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let path = dir.join(format!("{}.json", summary.session_id));
    let tmp = dir.join(format!("{}.json.tmp", summary.session_id));
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("renaming to {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ActionType;
    use serde_json::json;

    fn event(tool: &str, args: serde_json::Value, rc: i32) -> ToolEvent {
        ToolEvent {
            tool_name: tool.to_string(),
            args,
            args_digest: String::new(),
            result_digest: String::new(),
            rc,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 5,
            idempotency_key: String::new(),
            error_category: None,
        }
    }

    #[test]
    fn tool_counts_and_file_sets_accumulate() {
        let mut tracker = SessionTracker::new("s1");
        tracker.record_event(&event("read_file", json!({"path": "a.rs"}), 0));
        tracker.record_event(&event("read_file", json!({"path": "b.rs"}), 0));
        tracker.record_event(&event("replace_in_file", json!({"path": "a.rs"}), 0));
        tracker.record_event(&event("delete_file", json!({"path": "old.rs"}), 0));

        let summary = tracker.finalize(true);
        assert_eq!(summary.tools_used["read_file"], 2);
        assert_eq!(summary.files_modified, vec!["a.rs"]);
        assert_eq!(summary.files_deleted, vec!["old.rs"]);
    }

    #[test]
    fn test_runs_split_by_exit_code() {
        let mut tracker = SessionTracker::new("s2");
        tracker.record_event(&event("run_tests", json!({"command": "cargo test"}), 0));
        tracker.record_event(&event("run_tests", json!({"command": "cargo test"}), 1));

        let summary = tracker.finalize(false);
        assert_eq!(summary.tests_run, 2);
        assert_eq!(summary.tests_passed, 1);
        assert_eq!(summary.tests_failed, 1);
    }

    #[test]
    fn tasks_partition_by_status() {
        let mut tracker = SessionTracker::new("s3");
        let mut done = Task::new(ActionType::Edit, "fix handler");
        done.advance_status(TaskStatus::InProgress).unwrap();
        done.advance_status(TaskStatus::Completed).unwrap();
        let mut failed = Task::new(ActionType::Test, "run suite");
        failed.advance_status(TaskStatus::InProgress).unwrap();
        failed.advance_status(TaskStatus::Failed).unwrap();

        tracker.record_task(&done);
        tracker.record_task(&failed);

        let summary = tracker.finalize(false);
        assert_eq!(summary.tasks_completed.len(), 1);
        assert_eq!(summary.tasks_failed.len(), 1);
        assert!(summary.tasks_completed[0].starts_with("edit:"));
    }

    #[test]
    fn summary_is_saved_atomically_and_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = SessionTracker::new("s4");
        tracker.record_message(400);
        let summary = tracker.finalize(true);

        let path = save_summary(dir.path(), &summary).unwrap();
        assert!(path.ends_with(".drover/sessions/s4.json"));
        assert!(!path.with_extension("json.tmp").exists());

        let loaded: SessionSummary =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.session_id, "s4");
        assert_eq!(loaded.message_count, 1);
        assert_eq!(loaded.tokens_estimated, 100);
        assert!(loaded.success);
    }

    #[test]
    fn synthetic_summary_mentions_tools_and_tests() {
        let mut tracker = SessionTracker::new("s5");
        tracker.record_event(&event("run_tests", json!({"command": "pytest"}), 0));
        let text = tracker.synthetic_summary();
        assert!(text.contains("run_testsx1"));
        assert!(text.contains("1 passed"));
    }
}
