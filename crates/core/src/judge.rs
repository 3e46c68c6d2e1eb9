use serde::{Deserialize, Serialize};

use drover_config::JudgeSettings;
use drover_provider::{CallSpec, Gateway, Message};

use crate::context::RunContext;
use crate::task::{Task, TaskStatus};
use crate::transaction::TxnRecord;
use crate::verification::{VerificationReport, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gate {
    Plan,
    Claim,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Approved,
    NeedsRevision,
    Rejected,
}

/// One gate's output: verdict plus the Socratic material backing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgement {
    pub gate: Gate,
    pub verdict: GateVerdict,
    pub confidence: f64,
    pub questions: Vec<String>,
    pub concerns: Vec<String>,
    pub recommendations: Vec<String>,
}

impl Judgement {
    pub fn approved(&self) -> bool {
        self.verdict == GateVerdict::Approved
    }
}

/// Socratic reviewer gating plan approval, completion claims, and the final
/// merge. Deterministic heuristics always run, so every gate works offline;
/// the LLM pass only adds questions.
pub struct CritJudge {
    settings: JudgeSettings,
}

impl CritJudge {
    pub fn new(settings: JudgeSettings) -> Self {
        Self { settings }
    }

    fn finish(
        &self,
        gate: Gate,
        mut confidence: f64,
        questions: Vec<String>,
        concerns: Vec<String>,
        recommendations: Vec<String>,
    ) -> Judgement {
        confidence = confidence.clamp(0.0, 1.0);
        let verdict = if confidence >= self.settings.approve_threshold {
            GateVerdict::Approved
        } else if confidence >= self.settings.revise_threshold {
            GateVerdict::NeedsRevision
        } else {
            GateVerdict::Rejected
        };
        Judgement {
            gate,
            verdict,
            confidence,
            questions,
            concerns,
            recommendations,
        }
    }

    /// Plan gate: logical consistency and safety of a proposed task before
    /// dispatch.
    pub fn review_plan(&self, task: &Task, ctx: &RunContext) -> Judgement {
        let mut confidence = 1.0;
        let mut questions = Vec::new();
        let mut concerns = Vec::new();
        let mut recommendations = Vec::new();

        if task.description.trim().len() < 8 {
            confidence -= 0.35;
            concerns.push("task description is too vague to execute".into());
            questions.push("What exactly should this task change?".into());
        }

        if task.action_type.is_destructive() && task.rollback_plan.is_none() {
            confidence -= 0.45;
            concerns.push("destructive task has no rollback plan".into());
            questions.push("How would this deletion be undone if it is wrong?".into());
            recommendations.push("attach a rollback plan before dispatching".into());
        }

        if task.action_type.is_mutating() && task.dod.deliverables.is_empty() {
            confidence -= 0.2;
            concerns.push("mutating task declares no deliverables".into());
            recommendations.push("derive a definition of done before dispatch".into());
        }

        // Circular-work check: the same task repeatedly failing and being
        // re-proposed verbatim is a loop, not a plan.
        let repeats = ctx
            .plan
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Failed
                    && t.action_type == task.action_type
                    && t.description == task.description
            })
            .count();
        if repeats >= 3 {
            confidence -= 0.5;
            concerns.push(format!(
                "identical task already failed {repeats} times; proposing it again is circular"
            ));
            recommendations.push("change strategy or target before retrying".into());
        }

        self.finish(Gate::Plan, confidence, questions, concerns, recommendations)
    }

    /// Claim gate: does the evidence in tool events and the verification
    /// report actually support calling this task done?
    pub fn review_claim(&self, task: &Task, report: &VerificationReport) -> Judgement {
        let mut confidence = 1.0;
        let mut questions = Vec::new();
        let mut concerns = Vec::new();
        let mut recommendations = Vec::new();

        if task.tool_events.is_empty() {
            confidence -= 0.6;
            concerns.push("completion claimed with no tool events as evidence".into());
            questions.push("What work was actually performed?".into());
        }

        let last_test = task
            .tool_events
            .iter()
            .rev()
            .find(|e| e.tool_name == "run_tests");
        if let Some(test_event) = last_test {
            if test_event.rc != 0 && report.overall() == Verdict::Passed {
                confidence -= 0.7;
                concerns.push(format!(
                    "claim says tests pass but the last run_tests exited with rc {}",
                    test_event.rc
                ));
            }
        }

        if task.any_event_failed() && report.overall() != Verdict::Passed {
            confidence -= 0.5;
            concerns.push("tool events contain failures and verification did not pass".into());
            recommendations.push("rerun verification or replan before completing".into());
        }

        if task.action_type.is_mutating()
            && !task.tool_events.iter().any(|e| e.is_mutation())
        {
            confidence -= 0.4;
            concerns.push("mutating task produced no mutation events".into());
            questions.push("Which tool call changed the workspace?".into());
            recommendations.push(
                "improve the agent prompt to require the mutating tool call".into(),
            );
        }

        self.finish(Gate::Claim, confidence, questions, concerns, recommendations)
    }

    /// Merge gate: immediately before commit. DoD satisfied, verification
    /// passed, nothing touched outside the declared deliverables.
    pub fn review_merge(
        &self,
        task: &Task,
        report: &VerificationReport,
        txn: &TxnRecord,
        ctx: &RunContext,
    ) -> Judgement {
        let mut confidence = 1.0;
        let mut questions = Vec::new();
        let mut concerns = Vec::new();
        let mut recommendations = Vec::new();

        if report.overall() == Verdict::Failed {
            confidence -= 0.8;
            concerns.push("verification failed".into());
        }

        for (deliverable, ok) in task.dod.check_files(&ctx.workspace_root) {
            if !ok {
                confidence -= 0.4;
                concerns.push(format!("unmet deliverable: {deliverable:?}"));
            }
        }

        let declared: Vec<&str> = task
            .dod
            .deliverables
            .iter()
            .filter_map(|d| d.declared_path())
            .chain(task.target_files.iter().map(|s| s.as_str()))
            .collect();
        for touched in &txn.touched {
            let expected = declared.iter().any(|d| touched == d)
                || touched.starts_with(".drover/");
            if !expected {
                confidence -= 0.3;
                concerns.push(format!("unexpected modification outside the DoD: {touched}"));
                questions.push(format!("Why was {touched} changed?"));
                recommendations.push("declare the file in the DoD or revert it".into());
            }
        }

        self.finish(Gate::Merge, confidence, questions, concerns, recommendations)
    }

    /// Optional LLM pass: ask for deeper Socratic questions. Failures are
    /// swallowed; the deterministic judgement stands on its own.
    pub async fn socratic_questions(
        &self,
        gateway: &Gateway,
        model: &str,
        task: &Task,
        judgement: &Judgement,
    ) -> Vec<String> {
        if !self.settings.use_llm {
            return Vec::new();
        }
        let prompt = format!(
            "You are a Socratic code reviewer. A coding agent proposes/claims:\n\
             task ({}): {}\n\
             gate: {:?}, heuristic concerns: {}\n\
             Ask up to 3 probing questions that would expose a flaw if one exists. \
             One question per line, nothing else.",
            task.action_type,
            task.description,
            judgement.gate,
            judgement.concerns.join("; "),
        );
        let spec = CallSpec::text_only(model, None, vec![Message::user(prompt)]);
        match gateway.chat(&spec).await {
            Ok(reply) => reply
                .text
                .unwrap_or_default()
                .lines()
                .map(|l| l.trim().trim_start_matches('-').trim().to_string())
                .filter(|l| !l.is_empty())
                .take(3)
                .collect(),
            Err(e) => {
                tracing::debug!(error = %e, "socratic pass skipped");
                Vec::new()
            }
        }
    }
}
