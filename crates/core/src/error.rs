use serde::{Deserialize, Serialize};

/// Machine-readable failure categories. These are values, not exceptions:
/// they ride inside tool events and verification reports, and the
/// orchestrator replans off the category alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    #[error("provider transport failure")]
    Transport,
    #[error("model response missing a usable tool call")]
    MalformedResponse,
    #[error("path resolves outside the workspace root")]
    PathEscapesRepo,
    #[error("file not found")]
    FileNotFound,
    #[error("no target file named")]
    MissingTarget,
    #[error("patch or substring does not apply")]
    PatchDoesNotApply,
    #[error("command timed out")]
    TimeoutExceeded,
    #[error("no tests found")]
    NoTestsFound,
    #[error("verification failed")]
    VerificationFailed,
    #[error("verification inconclusive")]
    VerificationInconclusive,
    #[error("resource budget exhausted")]
    BudgetExhausted,
    #[error("cancellation requested")]
    Cancelled,
}

impl ErrorCategory {
    /// Only transport failures are worth retrying blindly; everything else
    /// is either a caller bug or needs a strategy change.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCategory::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_is_transient() {
        assert!(ErrorCategory::Transport.is_transient());
        assert!(!ErrorCategory::PatchDoesNotApply.is_transient());
        assert!(!ErrorCategory::TimeoutExceeded.is_transient());
        assert!(!ErrorCategory::Cancelled.is_transient());
    }

    #[test]
    fn categories_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::PatchDoesNotApply).unwrap();
        assert_eq!(json, "\"patch_does_not_apply\"");
    }
}
