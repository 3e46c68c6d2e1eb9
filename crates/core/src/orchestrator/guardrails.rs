use drover_config::LimitSettings;

use crate::context::{action_signature, AgentRequest, AgentRequestKind, RunContext};
use crate::task::{ActionType, Task};

/// Why a proposed task was refused before dispatch. The requests are
/// surfaced to the next planner prompt; the signature (when present) joins
/// the permanent block list.
#[derive(Debug)]
pub struct Refusal {
    pub request: AgentRequest,
    pub block_signature: Option<String>,
}

/// Loop-prevention checks applied to every proposed task before dispatch.
/// Order matters: cheap universal checks first, then per-class rules.
pub fn check(
    task: &Task,
    ctx: &RunContext,
    limits: &LimitSettings,
    pending: &[Task],
) -> Result<(), Refusal> {
    check_signature_block(task, ctx)?;
    check_consecutive_research(task, ctx, limits)?;
    check_redundant_read(task, ctx, limits)?;
    check_edit_prevalidation(task, ctx)?;
    check_destructive_interdependency(task, pending)?;
    Ok(())
}

/// A content-hash already blocked must never dispatch again. Both the
/// intent-specific and target-only signatures are consulted so rewording
/// the description cannot sidestep the block.
fn check_signature_block(task: &Task, ctx: &RunContext) -> Result<(), Refusal> {
    let target = task.primary_target().unwrap_or("");
    let with_intent = action_signature(task.action_type, target, &task.description);
    let target_only = action_signature(task.action_type, target, "");

    if ctx.blocked_action_signatures.contains(&with_intent)
        || ctx.blocked_action_signatures.contains(&target_only)
    {
        return Err(Refusal {
            request: AgentRequest::new(
                AgentRequestKind::ActionBlocked,
                format!(
                    "`{} {}` matches a blocked action signature; choose a different action \
                     or target",
                    task.action_type, target
                ),
            ),
            block_signature: None,
        });
    }
    Ok(())
}

fn check_consecutive_research(
    task: &Task,
    ctx: &RunContext,
    limits: &LimitSettings,
) -> Result<(), Refusal> {
    if task.action_type.is_research() && ctx.consecutive_reads >= limits.max_consecutive_reads {
        return Err(Refusal {
            request: AgentRequest::new(
                AgentRequestKind::ResearchBudgetExhausted,
                format!(
                    "{} consecutive research tasks already ran; propose an action-class task \
                     (edit, add, test, ...) or GOAL_ACHIEVED",
                    ctx.consecutive_reads
                ),
            ),
            block_signature: None,
        });
    }
    Ok(())
}

fn check_redundant_read(
    task: &Task,
    ctx: &RunContext,
    limits: &LimitSettings,
) -> Result<(), Refusal> {
    if !task.action_type.is_research() {
        return Ok(());
    }
    let Some(target) = task.primary_target() else {
        return Ok(());
    };
    let reads = ctx.reads_since_last_modification(target);
    if reads >= limits.max_file_read_count {
        return Err(Refusal {
            request: AgentRequest::new(
                AgentRequestKind::RedundantFileRead,
                format!(
                    "{target} was already read {reads} times without modification; its \
                     content is in the work summary"
                ),
            ),
            block_signature: Some(action_signature(task.action_type, target, "")),
        });
    }
    Ok(())
}

/// An edit must name a readable target; otherwise the planner must either
/// name one or switch to add/create.
fn check_edit_prevalidation(task: &Task, ctx: &RunContext) -> Result<(), Refusal> {
    if task.action_type != ActionType::Edit {
        return Ok(());
    }
    let Some(target) = task.primary_target() else {
        return Err(Refusal {
            request: AgentRequest::new(
                AgentRequestKind::MissingTargetFile,
                "edit task names no target file; name one or use add/create instead",
            ),
            block_signature: None,
        });
    };
    if !ctx.workspace_root.join(target).is_file() {
        return Err(Refusal {
            request: AgentRequest::new(
                AgentRequestKind::FileNotFound,
                format!("edit target {target} does not exist; use add/create instead"),
            ),
            block_signature: None,
        });
    }
    Ok(())
}

/// A destructive task must not run while a queued task still reads from the
/// same file.
fn check_destructive_interdependency(task: &Task, pending: &[Task]) -> Result<(), Refusal> {
    if !is_destructive_proposal(task) {
        return Ok(());
    }
    for target in &task.target_files {
        let conflicting = pending.iter().find(|p| {
            p.target_files.iter().any(|t| t == target)
                && (p.action_type.is_research() || p.action_type == ActionType::Test)
        });
        if let Some(reader) = conflicting {
            return Err(Refusal {
                request: AgentRequest::new(
                    AgentRequestKind::DestructiveConflict,
                    format!(
                        "queued task `{}` still reads {target}; reorder the read before the \
                         destructive step, or convert extract-and-delete into a copy",
                        reader.description
                    ),
                ),
                block_signature: None,
            });
        }
    }
    Ok(())
}

fn is_destructive_proposal(task: &Task) -> bool {
    if task.action_type.is_destructive() {
        return true;
    }
    let lower = task.description.to_lowercase();
    task.action_type.is_mutating()
        && ["extract", "overwrite", "remove", "delete"]
            .iter()
            .any(|kw| lower.contains(kw))
}
