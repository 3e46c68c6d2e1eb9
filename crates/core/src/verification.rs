use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelFlag;
use crate::error::ErrorCategory;
use crate::task::Task;
use crate::tools::diagnosis::diagnose_timeout;
use crate::tools::subprocess::run_shell;

/// Three-valued verdict. `Inconclusive` means "could not prove either way"
/// and drives test-task injection rather than failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Passed,
    Failed,
    Inconclusive,
}

impl Verdict {
    /// Severity for worst-of aggregation: Failed > Inconclusive > Passed.
    fn severity(&self) -> u8 {
        match self {
            Verdict::Passed => 0,
            Verdict::Inconclusive => 1,
            Verdict::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Syntax,
    Imports,
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub stages: Vec<StageResult>,
}

impl VerificationReport {
    pub fn overall(&self) -> Verdict {
        self.stages
            .iter()
            .max_by_key(|s| s.verdict.severity())
            .map(|s| s.verdict)
            .unwrap_or(Verdict::Inconclusive)
    }

    pub fn passed(&self) -> bool {
        self.overall() == Verdict::Passed
    }

    pub fn summary(&self) -> String {
        self.stages
            .iter()
            .map(|s| format!("[{:?}/{:?}] {}", s.stage, s.verdict, s.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct VerificationPipeline {
    pub run_tests_timeout_secs: u64,
}

impl VerificationPipeline {
    pub fn new(run_tests_timeout_secs: u64) -> Self {
        Self {
            run_tests_timeout_secs,
        }
    }

    /// Staged check: per-file syntax, relative-import resolution, then the
    /// test suite when the DoD demands it. Hard failures short-circuit.
    pub async fn verify(
        &self,
        task: &Task,
        modified_files: &[String],
        workspace_root: &Path,
        cancel: &CancelFlag,
    ) -> VerificationReport {
        let mut report = VerificationReport::default();

        // Per-file syntax checks are independent; run them concurrently and
        // still short-circuit on the first hard failure.
        let syntax_results = futures::future::join_all(
            modified_files.iter().map(|f| check_syntax(workspace_root, f)),
        )
        .await;
        for result in syntax_results {
            let failed = result.verdict == Verdict::Failed;
            report.stages.push(result);
            if failed {
                return report;
            }
        }

        for file in modified_files {
            if let Some(result) = check_relative_imports(workspace_root, file) {
                let failed = result.verdict == Verdict::Failed;
                report.stages.push(result);
                if failed {
                    return report;
                }
            }
        }

        if task.dod.wants_tests() {
            report.stages.push(self.run_test_stage(workspace_root, cancel).await);
        } else if task.action_type.is_mutating() {
            // A lone edit with clean syntax proves nothing by itself; the
            // orchestrator reacts to this by injecting a test task.
            report.stages.push(StageResult {
                stage: Stage::Test,
                verdict: Verdict::Inconclusive,
                category: Some(ErrorCategory::VerificationInconclusive),
                detail: "tests not run for this task".into(),
            });
        }

        report
    }

    async fn run_test_stage(&self, workspace_root: &Path, cancel: &CancelFlag) -> StageResult {
        let Some(command) = detect_test_command(workspace_root) else {
            return StageResult {
                stage: Stage::Test,
                verdict: Verdict::Inconclusive,
                category: Some(ErrorCategory::VerificationInconclusive),
                detail: "no test command detected".into(),
            };
        };

        let result = match run_shell(
            &command,
            workspace_root,
            Duration::from_secs(self.run_tests_timeout_secs),
            cancel,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                return StageResult {
                    stage: Stage::Test,
                    verdict: Verdict::Failed,
                    category: Some(ErrorCategory::VerificationFailed),
                    detail: e.to_string(),
                }
            }
        };

        if result.timed_out {
            let combined = format!("{}\n{}", result.stdout, result.stderr);
            let diagnosis = diagnose_timeout(&command, &combined);
            return StageResult {
                stage: Stage::Test,
                verdict: Verdict::Inconclusive,
                category: Some(ErrorCategory::TimeoutExceeded),
                detail: diagnosis
                    .suggested_fix
                    .unwrap_or_else(|| format!("`{command}` timed out")),
            };
        }

        let combined = format!("{}\n{}", result.stdout, result.stderr);
        let (verdict, category, detail) = interpret_test_result(&command, result.rc, &combined);
        StageResult {
            stage: Stage::Test,
            verdict,
            category,
            detail,
        }
    }
}

/// Per-file syntax check with a language-appropriate tool. Languages without
/// a cheap standalone checker come back inconclusive; the test stage is
/// their real gate.
pub async fn check_syntax(workspace_root: &Path, relative: &str) -> StageResult {
    let path = workspace_root.join(relative);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();

    let inconclusive = |detail: String| StageResult {
        stage: Stage::Syntax,
        verdict: Verdict::Inconclusive,
        category: None,
        detail,
    };

    if !path.is_file() {
        return StageResult {
            stage: Stage::Syntax,
            verdict: Verdict::Failed,
            category: Some(ErrorCategory::FileNotFound),
            detail: format!("{relative} does not exist"),
        };
    }

    match extension.as_str() {
        "json" => {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => return inconclusive(format!("{relative}: {e}")),
            };
            match serde_json::from_str::<serde_json::Value>(&content) {
                Ok(_) => StageResult {
                    stage: Stage::Syntax,
                    verdict: Verdict::Passed,
                    category: None,
                    detail: format!("{relative}: valid JSON"),
                },
                Err(e) => StageResult {
                    stage: Stage::Syntax,
                    verdict: Verdict::Failed,
                    category: Some(ErrorCategory::VerificationFailed),
                    detail: format!("{relative}: {e}"),
                },
            }
        }
        "py" => run_syntax_command(workspace_root, relative, "python3 -m py_compile").await,
        "js" | "mjs" | "cjs" => run_syntax_command(workspace_root, relative, "node --check").await,
        _ => inconclusive(format!("{relative}: no standalone syntax checker")),
    }
}

async fn run_syntax_command(workspace_root: &Path, relative: &str, checker: &str) -> StageResult {
    let command = format!("{checker} '{relative}'");
    let cancel = CancelFlag::new();
    match run_shell(&command, workspace_root, Duration::from_secs(30), &cancel).await {
        Ok(result) if result.rc == 0 => StageResult {
            stage: Stage::Syntax,
            verdict: Verdict::Passed,
            category: None,
            detail: format!("{relative}: syntax ok"),
        },
        Ok(result) if result.rc == 127 => StageResult {
            // Checker binary not installed; cannot prove either way.
            stage: Stage::Syntax,
            verdict: Verdict::Inconclusive,
            category: None,
            detail: format!("{checker} unavailable"),
        },
        Ok(result) => StageResult {
            stage: Stage::Syntax,
            verdict: Verdict::Failed,
            category: Some(ErrorCategory::VerificationFailed),
            detail: format!("{relative}: {}", result.stderr.lines().next().unwrap_or("syntax error")),
        },
        Err(e) => StageResult {
            stage: Stage::Syntax,
            verdict: Verdict::Inconclusive,
            category: None,
            detail: e.to_string(),
        },
    }
}

/// Check that `./`-style imports in a modified JS/TS/Python file point at
/// files that exist. Absent for file types without relative imports.
pub fn check_relative_imports(workspace_root: &Path, relative: &str) -> Option<StageResult> {
    let path = workspace_root.join(relative);
    let extension = path.extension().and_then(|e| e.to_str())?.to_lowercase();
    if !matches!(extension.as_str(), "js" | "mjs" | "cjs" | "ts" | "tsx" | "jsx") {
        return None;
    }
    let content = std::fs::read_to_string(&path).ok()?;
    let missing = missing_relative_imports(&content, &path);

    Some(if missing.is_empty() {
        StageResult {
            stage: Stage::Imports,
            verdict: Verdict::Passed,
            category: None,
            detail: format!("{relative}: relative imports resolve"),
        }
    } else {
        StageResult {
            stage: Stage::Imports,
            verdict: Verdict::Failed,
            category: Some(ErrorCategory::VerificationFailed),
            detail: format!("{relative}: unresolved imports: {}", missing.join(", ")),
        }
    })
}

/// Relative import specifiers in `content` that do not resolve to a file
/// next to `file_path`, trying the usual extension candidates.
pub fn missing_relative_imports(content: &str, file_path: &Path) -> Vec<String> {
    let import_re = regex::Regex::new(
        r#"(?:import\s+[^;]*?from\s+|require\()\s*['"](\.{1,2}/[^'"]+)['"]"#,
    )
    .expect("static regex");

    let dir = match file_path.parent() {
        Some(d) => d,
        None => return Vec::new(),
    };

    let mut missing = Vec::new();
    for capture in import_re.captures_iter(content) {
        let spec = &capture[1];
        let base = dir.join(spec);
        let candidates = [
            base.clone(),
            base.with_extension("js"),
            base.with_extension("mjs"),
            base.with_extension("ts"),
            base.with_extension("tsx"),
            base.with_extension("jsx"),
            base.with_extension("json"),
            base.join("index.js"),
            base.join("index.ts"),
        ];
        if !candidates.iter().any(|c| c.is_file()) {
            missing.push(spec.to_string());
        }
    }
    missing
}

/// Pick the test command from the manifests actually present. Checked in
/// order so a JS/Go/Rust project can never fall through to pytest.
pub fn detect_test_command(workspace_root: &Path) -> Option<String> {
    if workspace_root.join("package.json").exists()
        || workspace_root.join("yarn.lock").exists()
        || workspace_root.join("pnpm-lock.yaml").exists()
    {
        return Some("npm test".to_string());
    }
    if workspace_root.join("go.mod").exists() {
        return Some("go test ./...".to_string());
    }
    if workspace_root.join("Cargo.toml").exists() {
        return Some("cargo test".to_string());
    }
    if workspace_root.join("pyproject.toml").exists()
        || workspace_root.join("setup.py").exists()
        || workspace_root.join("requirements.txt").exists()
    {
        return Some("python -m pytest".to_string());
    }
    None
}

/// Exit-code interpretation per runner convention. Never success on a
/// nonzero rc; "no tests" is a failure, not a pass.
pub fn interpret_test_result(
    command: &str,
    rc: i32,
    output: &str,
) -> (Verdict, Option<ErrorCategory>, String) {
    let lower = output.to_lowercase();
    let no_tests_marker =
        lower.contains("no tests ran") || lower.contains("no test files") || lower.contains("0 tests");

    let is_pytest = command.contains("pytest") || command.contains("python");
    if is_pytest && (rc == 4 || rc == 5) {
        return (
            Verdict::Failed,
            Some(ErrorCategory::NoTestsFound),
            format!("`{command}`: no tests found (rc {rc})"),
        );
    }

    if rc == 0 {
        if no_tests_marker && !lower.contains("passed") && !lower.contains("test result: ok") {
            return (
                Verdict::Failed,
                Some(ErrorCategory::NoTestsFound),
                format!("`{command}`: output reports no tests ran"),
            );
        }
        return (Verdict::Passed, None, format!("`{command}`: tests passed"));
    }

    if no_tests_marker {
        return (
            Verdict::Failed,
            Some(ErrorCategory::NoTestsFound),
            format!("`{command}`: no tests found (rc {rc})"),
        );
    }

    (
        Verdict::Failed,
        Some(ErrorCategory::VerificationFailed),
        format!("`{command}`: tests failed (rc {rc})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dod::{Deliverable, ValidationStage};
    use crate::task::ActionType;

    #[test]
    fn worst_of_aggregation() {
        let mut report = VerificationReport::default();
        report.stages.push(StageResult {
            stage: Stage::Syntax,
            verdict: Verdict::Passed,
            category: None,
            detail: String::new(),
        });
        assert_eq!(report.overall(), Verdict::Passed);

        report.stages.push(StageResult {
            stage: Stage::Test,
            verdict: Verdict::Inconclusive,
            category: None,
            detail: String::new(),
        });
        assert_eq!(report.overall(), Verdict::Inconclusive);

        report.stages.push(StageResult {
            stage: Stage::Imports,
            verdict: Verdict::Failed,
            category: None,
            detail: String::new(),
        });
        assert_eq!(report.overall(), Verdict::Failed);
    }

    #[tokio::test]
    async fn json_syntax_check() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.json"), r#"{"a": 1}"#).unwrap();
        std::fs::write(dir.path().join("bad.json"), r#"{"a": }"#).unwrap();

        let good = check_syntax(dir.path(), "good.json").await;
        assert_eq!(good.verdict, Verdict::Passed);

        let bad = check_syntax(dir.path(), "bad.json").await;
        assert_eq!(bad.verdict, Verdict::Failed);
    }

    #[tokio::test]
    async fn unknown_extension_is_inconclusive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        let result = check_syntax(dir.path(), "main.rs").await;
        assert_eq!(result.verdict, Verdict::Inconclusive);
    }

    #[test]
    fn missing_relative_imports_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("util.js"), "export const x = 1;").unwrap();
        let file = dir.path().join("app.js");
        let content = "import { x } from './util';\nimport gone from './missing';\n";
        std::fs::write(&file, content).unwrap();

        let missing = missing_relative_imports(content, &file);
        assert_eq!(missing, vec!["./missing"]);
    }

    #[test]
    fn manifest_order_never_defaults_to_python_wrongly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        // A stray requirements.txt must not shadow the Rust manifest.
        std::fs::write(dir.path().join("requirements.txt"), "pytest").unwrap();
        assert_eq!(detect_test_command(dir.path()).unwrap(), "cargo test");

        let js = tempfile::tempdir().unwrap();
        std::fs::write(js.path().join("package.json"), "{}").unwrap();
        assert_eq!(detect_test_command(js.path()).unwrap(), "npm test");

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(detect_test_command(empty.path()), None);
    }

    #[test]
    fn rc_interpretation_per_runner() {
        let (v, c, _) = interpret_test_result("python -m pytest", 5, "");
        assert_eq!(v, Verdict::Failed);
        assert_eq!(c, Some(ErrorCategory::NoTestsFound));

        let (v, c, _) = interpret_test_result("python -m pytest", 1, "1 failed");
        assert_eq!(v, Verdict::Failed);
        assert_eq!(c, Some(ErrorCategory::VerificationFailed));

        let (v, _, _) = interpret_test_result("cargo test", 0, "test result: ok. 4 passed");
        assert_eq!(v, Verdict::Passed);

        let (v, c, _) = interpret_test_result("go test ./...", 0, "no test files");
        assert_eq!(v, Verdict::Failed);
        assert_eq!(c, Some(ErrorCategory::NoTestsFound));

        // Nonzero rc is never a pass, whatever the output says.
        let (v, _, _) = interpret_test_result("npm test", 1, "all tests passed");
        assert_eq!(v, Verdict::Failed);
    }

    #[tokio::test]
    async fn mutating_task_without_tests_is_inconclusive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"ok": true}"#).unwrap();

        let mut task = Task::new(ActionType::Edit, "tweak config");
        task.dod.deliverables.push(Deliverable::FileModified {
            path: "config.json".into(),
        });
        task.dod.validation_stages.push(ValidationStage::Syntax);

        let pipeline = VerificationPipeline::new(5);
        let report = pipeline
            .verify(&task, &["config.json".to_string()], dir.path(), &CancelFlag::new())
            .await;

        assert_eq!(report.overall(), Verdict::Inconclusive);
        assert!(report.stages.iter().any(|s| s.stage == Stage::Syntax
            && s.verdict == Verdict::Passed));
    }

    #[tokio::test]
    async fn syntax_failure_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{oops").unwrap();

        let task = Task::new(ActionType::Edit, "edit json");
        let pipeline = VerificationPipeline::new(5);
        let report = pipeline
            .verify(&task, &["broken.json".to_string()], dir.path(), &CancelFlag::new())
            .await;

        assert_eq!(report.overall(), Verdict::Failed);
        assert_eq!(report.stages.len(), 1);
    }
}
